//! codescout CLI - binary entry point.
//!
//! `serve` runs the proxy in the foreground. Every other command is a
//! short-lived client: it makes sure a proxy answers on the configured port
//! (launching `codescout serve` in the background if needed) and prints the
//! proxy's JSON answer on stdout.
//!
//! ```text
//! codescout symbols Parser ──► ProxyMonitor::ensure_running ──► ProxyClient ──► proxy
//!                                                                                 │
//!                                                              ClientCache ◄──────┘
//!                                                         (one LSP session per ecosystem)
//! ```

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use codescout_config::CodescoutConfig;
use codescout_lsp::{ClientCache, ProcessLauncher};
use codescout_supervisor::{ClientError, ProxyClient, ProxyMonitor, ProxyState};
use codescout_types::Position;
use codescout_types::wire::{ReferenceSearchRequest, SymbolSearchRequest};

#[derive(Parser)]
#[command(name = "codescout")]
#[command(version, about = "Semantic symbol and reference search backed by language servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root (defaults to the current directory)
    #[arg(long, short, global = true)]
    workspace: Option<PathBuf>,

    /// Proxy port (overrides `proxy.port` from configuration)
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy in the foreground
    Serve,
    /// Search workspace symbols across ecosystems
    Symbols {
        query: String,
        /// Restrict the search to these ecosystems (repeatable)
        #[arg(long = "ecosystem", short)]
        ecosystems: Vec<String>,
    },
    /// Find references to the symbol at a position (0-based line and column)
    References {
        /// Document path, absolute or relative to the workspace
        document: String,
        line: u32,
        character: u32,
        #[arg(long)]
        include_declaration: bool,
    },
    /// Show proxy and per-ecosystem session status
    Status,
    /// Restart the proxy, clearing a permanent failure
    Restart,
    /// Stop a running proxy
    Stop,
    /// Keep a proxy running and restart it on failure until interrupted
    Supervise,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::debug!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries command output; without a log file, log nothing.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.codescout/logs/codescout.log
    if let Some(dir) = codescout_config::data_dir() {
        candidates.push(dir.join("logs").join("codescout.log"));
    }

    // Fallback: ./.codescout/logs/codescout.log
    candidates.push(PathBuf::from(".codescout").join("logs").join("codescout.log"));

    candidates
}

fn resolve_workspace(arg: Option<PathBuf>) -> Result<PathBuf> {
    let path = match arg {
        Some(path) => path,
        None => env::current_dir().context("current directory is not accessible")?,
    };
    fs::canonicalize(&path)
        .with_context(|| format!("workspace {} is not accessible", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let workspace = resolve_workspace(cli.workspace)?;
    let config = CodescoutConfig::load(&workspace).context("failed to load configuration")?;
    let port = cli.port.unwrap_or(config.proxy.port);

    match cli.command {
        Commands::Serve => serve(workspace, config, port).await,
        Commands::Supervise => supervise(workspace, &config, port).await,
        Commands::Status => status(port).await,
        Commands::Stop => {
            let client = ProxyClient::new(port)?;
            match client.shutdown().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_unreachable() => {
                    eprintln!("no proxy listening on port {port}");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Restart => {
            let monitor = ProxyMonitor::for_workspace(workspace, port, config.monitor)
                .context("failed to locate the codescout executable")?;
            monitor.force_restart().await?;
            print_json(&monitor.status())
        }
        Commands::Symbols { query, ecosystems } => {
            let client = connect(workspace, &config, port).await?;
            let response = client
                .symbols(&SymbolSearchRequest { query, ecosystems })
                .await?;
            print_json(&response)
        }
        Commands::References {
            document,
            line,
            character,
            include_declaration,
        } => {
            let client = connect(workspace, &config, port).await?;
            let response = client
                .references(&ReferenceSearchRequest {
                    document,
                    position: Position::new(line, character),
                    include_declaration,
                })
                .await?;
            print_json(&response)
        }
    }
}

/// Ensures a proxy is up and returns a client for it.
async fn connect(workspace: PathBuf, config: &CodescoutConfig, port: u16) -> Result<ProxyClient> {
    let monitor = ProxyMonitor::for_workspace(workspace.clone(), port, config.monitor)
        .context("failed to locate the codescout executable")?;
    monitor.ensure_running().await?;

    let client = ProxyClient::new(port)?;
    let health = client.health().await?;
    check_workspace(&health.workspace, &workspace)?;
    Ok(client)
}

fn check_workspace(served: &str, wanted: &Path) -> Result<()> {
    if Path::new(served) != wanted {
        bail!(
            "proxy on this port serves {served}, not {}; pass --port to use another instance",
            wanted.display()
        );
    }
    Ok(())
}

async fn serve(workspace: PathBuf, config: CodescoutConfig, port: u16) -> Result<()> {
    let CodescoutConfig {
        proxy, lsp, servers, ..
    } = config;
    tracing::info!(
        workspace = %workspace.display(),
        port,
        ecosystems = servers.len(),
        "Starting proxy"
    );

    let cache = Arc::new(ClientCache::new(servers, lsp, Arc::new(ProcessLauncher)));
    let state = ProxyState::new(workspace, cache, proxy.health_interval);

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            signal_state.request_shutdown();
        }
    });

    codescout_supervisor::serve(state, port)
        .await
        .with_context(|| format!("proxy failed on port {port}"))
}

async fn supervise(workspace: PathBuf, config: &CodescoutConfig, port: u16) -> Result<()> {
    let monitor = ProxyMonitor::for_workspace(workspace, port, config.monitor)
        .context("failed to locate the codescout executable")?;
    monitor.ensure_running().await?;
    monitor.start_monitoring();
    eprintln!("supervising proxy on port {port}; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    monitor.stop();
    print_json(&monitor.status())
}

async fn status(port: u16) -> Result<()> {
    let client = ProxyClient::new(port)?;
    match client.status().await {
        Ok(status) => print_json(&status),
        Err(ClientError::Transport(e)) => {
            tracing::debug!(error = %e, "status probe failed");
            bail!("no proxy listening on port {port}")
        }
        Err(e) => Err(e.into()),
    }
}
