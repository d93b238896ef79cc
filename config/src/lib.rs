//! Configuration for codescout.
//!
//! Two optional TOML layers are read: the global `~/.codescout/config.toml`
//! and `<workspace>/.codescout.toml`. The workspace layer wins key by key.
//! Built-in server definitions are used unless a `[servers.<name>]` table
//! overrides or disables them.
//!
//! ```toml
//! [proxy]
//! port = 7411
//!
//! [session]
//! request_timeout_ms = 5000
//!
//! [servers.python]
//! command = "${HOME}/.venv/bin/pyright-langserver"
//!
//! [servers.go]
//! enabled = false
//! ```

use std::collections::BTreeMap;
use std::io;
use std::iter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;

use codescout_lsp::{
    AdapterSettings, CacheSettings, FallbackSettings, LspSettings, ServerConfig, SessionSettings,
};
use codescout_types::EcosystemId;

pub const DEFAULT_PORT: u16 = 7411;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::Invalid(_) => None,
        }
    }
}

// ============================================================================
// File layout
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    proxy: ProxySection,
    monitor: MonitorSection,
    session: SessionSection,
    adapter: AdapterSection,
    cache: CacheSection,
    servers: BTreeMap<String, ServerSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProxySection {
    port: u16,
    health_interval_secs: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            health_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MonitorSection {
    restart_budget: u32,
    restart_cooldown_ms: u64,
    probe_interval_secs: u64,
    readiness_ttl_ms: u64,
    startup_timeout_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            restart_budget: 3,
            restart_cooldown_ms: 5_000,
            probe_interval_secs: 30,
            readiness_ttl_ms: 5_000,
            startup_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SessionSection {
    handshake_timeout_ms: u64,
    request_timeout_ms: u64,
    shutdown_timeout_ms: u64,
    degraded_after: u32,
    max_restarts: u32,
    restart_cooldown_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let d = SessionSettings::default();
        Self {
            handshake_timeout_ms: millis(d.handshake_timeout),
            request_timeout_ms: millis(d.request_timeout),
            shutdown_timeout_ms: millis(d.shutdown_timeout),
            degraded_after: d.degraded_after,
            max_restarts: d.max_restarts,
            restart_cooldown_ms: millis(d.restart_cooldown),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AdapterSection {
    settle_delay_ms: u64,
    cache_ttl_secs: u64,
    fallback_max_files: usize,
    fallback_max_file_bytes: u64,
}

impl Default for AdapterSection {
    fn default() -> Self {
        let d = AdapterSettings::default();
        Self {
            settle_delay_ms: millis(d.settle_delay),
            cache_ttl_secs: d.cache_ttl.as_secs(),
            fallback_max_files: d.fallback.max_files,
            fallback_max_file_bytes: d.fallback.max_file_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CacheSection {
    reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let d = CacheSettings::default();
        Self {
            reconnect_attempts: d.reconnect_attempts,
            reconnect_delay_ms: millis(d.reconnect_delay),
        }
    }
}

/// `[servers.<name>]`. Every field is optional so a table can patch a
/// built-in server.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    enabled: Option<bool>,
    command: Option<String>,
    args: Option<Vec<String>>,
    language_id: Option<String>,
    file_extensions: Option<Vec<String>>,
    readiness_notification: Option<String>,
}

impl ServerSection {
    fn overlay(self, mut base: ServerConfig) -> ServerConfig {
        if let Some(command) = self.command {
            base.command = command;
        }
        if let Some(args) = self.args {
            base.args = args;
        }
        if let Some(language_id) = self.language_id {
            base.language_id = language_id;
        }
        if let Some(exts) = self.file_extensions {
            base.file_extensions = exts;
        }
        if self.readiness_notification.is_some() {
            base.readiness_notification = self.readiness_notification;
        }
        base
    }

    fn into_config(self, name: &str) -> Result<ServerConfig, ConfigError> {
        let Some(command) = self.command else {
            return Err(ConfigError::Invalid(format!(
                "servers.{name}: `command` is required"
            )));
        };
        Ok(ServerConfig {
            command,
            args: self.args.unwrap_or_default(),
            language_id: self.language_id.unwrap_or_else(|| name.to_string()),
            file_extensions: self.file_extensions.unwrap_or_default(),
            readiness_notification: self.readiness_notification,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Resolved configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySettings {
    /// Loopback port of the control surface.
    pub port: u16,
    /// How often the proxy checks its language server sessions.
    pub health_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub restart_budget: u32,
    pub restart_cooldown: Duration,
    pub probe_interval: Duration,
    /// Lifetime of a positive readiness answer.
    pub readiness_ttl: Duration,
    /// Bound on waiting for a freshly launched proxy to answer `/health`.
    pub startup_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings::from_section(MonitorSection::default())
    }
}

impl MonitorSettings {
    fn from_section(s: MonitorSection) -> Self {
        Self {
            restart_budget: s.restart_budget,
            restart_cooldown: Duration::from_millis(s.restart_cooldown_ms),
            probe_interval: Duration::from_secs(s.probe_interval_secs),
            readiness_ttl: Duration::from_millis(s.readiness_ttl_ms),
            startup_timeout: Duration::from_millis(s.startup_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodescoutConfig {
    pub proxy: ProxySettings,
    pub monitor: MonitorSettings,
    pub lsp: LspSettings,
    pub servers: BTreeMap<EcosystemId, ServerConfig>,
}

impl Default for CodescoutConfig {
    fn default() -> Self {
        // Built-in defaults are always valid.
        resolve(ConfigFile::default()).unwrap_or_else(|_| Self {
            proxy: ProxySettings {
                port: DEFAULT_PORT,
                health_interval: Duration::from_secs(30),
            },
            monitor: MonitorSettings::default(),
            lsp: LspSettings::default(),
            servers: BTreeMap::new(),
        })
    }
}

/// Servers known out of the box.
#[must_use]
pub fn builtin_servers() -> BTreeMap<EcosystemId, ServerConfig> {
    let table: [(&str, &str, &[&str], &str, &[&str]); 4] = [
        ("rust", "rust-analyzer", &[], "rust", &["rs"]),
        (
            "python",
            "pyright-langserver",
            &["--stdio"],
            "python",
            &["py", "pyi"],
        ),
        (
            "typescript",
            "typescript-language-server",
            &["--stdio"],
            "typescript",
            &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
        ),
        ("go", "gopls", &[], "go", &["go"]),
    ];

    table
        .into_iter()
        .filter_map(|(name, command, args, language_id, exts)| {
            let id = EcosystemId::new(name).ok()?;
            let config = ServerConfig {
                command: command.to_string(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
                language_id: language_id.to_string(),
                file_extensions: exts.iter().map(|e| (*e).to_string()).collect(),
                readiness_notification: None,
            };
            Some((id, config))
        })
        .collect()
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to the
/// empty string; unterminated or empty references are kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            Some(end) => {
                // `${}`
                out.push_str(&rest[start..start + 3 + end]);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[must_use]
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codescout"))
}

#[must_use]
pub fn global_config_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("config.toml"))
}

#[must_use]
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".codescout.toml")
}

/// Read one layer. A missing file is not an error.
fn read_layer(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| {
        tracing::warn!("Failed to read config at {}: {source}", path.display());
        ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let table: toml::Table = toml::from_str(&content).map_err(|source| {
        tracing::warn!("Failed to parse config at {}: {source}", path.display());
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    // Type-check the layer on its own so errors name the file they are in.
    toml::Value::Table(table.clone())
        .try_into::<ConfigFile>()
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(table))
}

/// Deep merge: tables merge key by key, anything else is replaced.
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                merge(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn resolve(file: ConfigFile) -> Result<CodescoutConfig, ConfigError> {
    let mut servers = builtin_servers();
    for (name, section) in file.servers {
        let id = EcosystemId::new(name.as_str())
            .map_err(|e| ConfigError::Invalid(format!("servers.{name}: {e}")))?;
        if section.enabled == Some(false) {
            servers.remove(&id);
            continue;
        }
        let config = match servers.remove(&id) {
            Some(base) => section.overlay(base),
            None => section.into_config(&name)?,
        };
        servers.insert(id, config);
    }

    for (id, server) in &mut servers {
        server.command = expand_env_vars(&server.command);
        for arg in &mut server.args {
            *arg = expand_env_vars(arg);
        }
        if server.command.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "servers.{id}: command is empty after expansion"
            )));
        }
        if server.file_extensions.is_empty() {
            tracing::warn!("Server '{id}' has no file_extensions; it only serves explicit requests");
        }
    }

    if file.proxy.port == 0 {
        return Err(ConfigError::Invalid("proxy.port must be non-zero".into()));
    }
    let s = &file.session;
    if s.request_timeout_ms == 0 || s.handshake_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "session timeouts must be greater than zero".into(),
        ));
    }

    let lsp = LspSettings {
        session: SessionSettings {
            handshake_timeout: Duration::from_millis(s.handshake_timeout_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            shutdown_timeout: Duration::from_millis(s.shutdown_timeout_ms),
            degraded_after: s.degraded_after.max(1),
            max_restarts: s.max_restarts,
            restart_cooldown: Duration::from_millis(s.restart_cooldown_ms),
        },
        adapter: AdapterSettings {
            settle_delay: Duration::from_millis(file.adapter.settle_delay_ms),
            cache_ttl: Duration::from_secs(file.adapter.cache_ttl_secs),
            fallback: FallbackSettings {
                max_files: file.adapter.fallback_max_files,
                max_file_bytes: file.adapter.fallback_max_file_bytes,
            },
        },
        cache: CacheSettings {
            reconnect_attempts: file.cache.reconnect_attempts.max(1),
            reconnect_delay: Duration::from_millis(file.cache.reconnect_delay_ms),
        },
    };

    Ok(CodescoutConfig {
        proxy: ProxySettings {
            port: file.proxy.port,
            health_interval: Duration::from_secs(file.proxy.health_interval_secs.max(1)),
        },
        monitor: MonitorSettings::from_section(file.monitor),
        lsp,
        servers,
    })
}

impl CodescoutConfig {
    /// Load the global layer, then the workspace layer over it.
    pub fn load(workspace: &Path) -> Result<Self, ConfigError> {
        Self::load_layers(
            global_config_path().as_deref(),
            &workspace_config_path(workspace),
        )
    }

    /// Load from explicit layer paths. Missing files are skipped.
    pub fn load_layers(global: Option<&Path>, workspace: &Path) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in global.into_iter().chain(iter::once(workspace)) {
            if let Some(layer) = read_layer(path)? {
                tracing::debug!(path = %path.display(), "Loaded config layer");
                merge(&mut merged, layer);
            }
        }
        let file = toml::Value::Table(merged)
            .try_into::<ConfigFile>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        resolve(file)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        resolve(file)
    }

    /// Ecosystems that answer for `requested`, or all of them when empty.
    pub fn select_ecosystems(&self, requested: &[String]) -> Result<Vec<EcosystemId>, ConfigError> {
        if requested.is_empty() {
            return Ok(self.servers.keys().cloned().collect());
        }
        requested
            .iter()
            .map(|name| {
                EcosystemId::new(name.as_str())
                    .ok()
                    .filter(|id| self.servers.contains_key(id))
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown ecosystem {name:?}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> EcosystemId {
        EcosystemId::new(name).unwrap()
    }

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("rust-analyzer"), "rust-analyzer");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("CODESCOUT_TEST_BIN", "/opt/bin");
        }
        assert_eq!(
            expand_env_vars("${CODESCOUT_TEST_BIN}/gopls"),
            "/opt/bin/gopls"
        );
        unsafe {
            env::remove_var("CODESCOUT_TEST_BIN");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("CODESCOUT_MISSING_VAR");
        }
        assert_eq!(expand_env_vars("a${CODESCOUT_MISSING_VAR}b"), "ab");
    }

    #[test]
    fn expand_env_vars_malformed_references_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
        assert_eq!(expand_env_vars("x ${} y"), "x ${} y");
        assert_eq!(expand_env_vars("naïve ${"), "naïve ${");
    }

    #[test]
    fn empty_config_uses_builtins_and_defaults() {
        let config = CodescoutConfig::parse("").unwrap();
        assert_eq!(config.proxy.port, DEFAULT_PORT);
        assert_eq!(config.lsp, LspSettings::default());
        assert_eq!(config.monitor.restart_budget, 3);
        assert_eq!(config.monitor.restart_cooldown, Duration::from_secs(5));
        let names: Vec<&str> = config.servers.keys().map(EcosystemId::as_str).collect();
        assert_eq!(names, ["go", "python", "rust", "typescript"]);
        assert_eq!(config.servers[&id("python")].args, ["--stdio"]);
        assert_eq!(config, CodescoutConfig::default());
    }

    #[test]
    fn server_tables_patch_disable_and_add() {
        let config = CodescoutConfig::parse(
            r#"
            [servers.rust]
            args = ["--log-file", "/tmp/ra.log"]
            readiness_notification = "experimental/serverStatus"

            [servers.go]
            enabled = false

            [servers.zig]
            command = "zls"
            file_extensions = ["zig"]
            "#,
        )
        .unwrap();

        let rust = &config.servers[&id("rust")];
        assert_eq!(rust.command, "rust-analyzer");
        assert_eq!(rust.args, ["--log-file", "/tmp/ra.log"]);
        assert_eq!(
            rust.readiness_notification.as_deref(),
            Some("experimental/serverStatus")
        );
        assert!(!config.servers.contains_key(&id("go")));
        let zig = &config.servers[&id("zig")];
        assert_eq!(zig.language_id, "zig");
        assert_eq!(zig.file_extensions, ["zig"]);
    }

    #[test]
    fn new_server_without_command_is_invalid() {
        let err = CodescoutConfig::parse("[servers.zig]\nfile_extensions = [\"zig\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("command")));
    }

    #[test]
    fn invalid_ecosystem_name_is_rejected() {
        let err = CodescoutConfig::parse("[servers.\"c++\"]\ncommand = \"clangd\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn tunables_convert_units() {
        let config = CodescoutConfig::parse(
            r"
            [session]
            request_timeout_ms = 2500
            max_restarts = 5

            [adapter]
            settle_delay_ms = 0
            cache_ttl_secs = 60

            [cache]
            reconnect_attempts = 0

            [monitor]
            probe_interval_secs = 10
            ",
        )
        .unwrap();
        assert_eq!(config.lsp.session.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.lsp.session.max_restarts, 5);
        assert_eq!(config.lsp.adapter.settle_delay, Duration::ZERO);
        assert_eq!(config.lsp.adapter.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.lsp.cache.reconnect_attempts, 1);
        assert_eq!(config.monitor.probe_interval, Duration::from_secs(10));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let err = CodescoutConfig::parse("[session]\nrequest_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn workspace_layer_overrides_global_key_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        fs::write(
            &global,
            "[proxy]\nport = 9000\nhealth_interval_secs = 12\n\n[servers.python]\ncommand = \"pylsp\"\nargs = []\n",
        )
        .unwrap();
        let ws = dir.path().join("ws");
        fs::create_dir(&ws).unwrap();
        fs::write(
            workspace_config_path(&ws),
            "[proxy]\nport = 9100\n\n[servers.python]\nfile_extensions = [\"py\"]\n",
        )
        .unwrap();

        let config = CodescoutConfig::load_layers(Some(&global), &workspace_config_path(&ws)).unwrap();
        assert_eq!(config.proxy.port, 9100);
        assert_eq!(config.proxy.health_interval, Duration::from_secs(12));
        let python = &config.servers[&id("python")];
        assert_eq!(python.command, "pylsp");
        assert!(python.args.is_empty());
        assert_eq!(python.file_extensions, ["py"]);
    }

    #[test]
    fn missing_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = CodescoutConfig::load_layers(
            Some(&dir.path().join("absent.toml")),
            &dir.path().join(".codescout.toml"),
        )
        .unwrap();
        assert_eq!(config, CodescoutConfig::default());
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join(".codescout.toml");
        fs::write(&bad, "[proxy]\nport = \"high\"\n").unwrap();

        let err = CodescoutConfig::load_layers(None, &bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), Some(bad.as_path()));

        fs::write(&bad, "[proxy\n").unwrap();
        let err = CodescoutConfig::load_layers(None, &bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn select_ecosystems_validates_names() {
        let config = CodescoutConfig::default();
        assert_eq!(config.select_ecosystems(&[]).unwrap().len(), 4);
        assert_eq!(
            config.select_ecosystems(&["Rust".into()]).unwrap(),
            [id("rust")]
        );
        assert!(config.select_ecosystems(&["cobol".into()]).is_err());
    }
}
