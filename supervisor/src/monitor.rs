//! Owner-side supervision of the proxy process.
//!
//! The monitor starts `codescout serve` on demand, watches the child for
//! unexpected exit, and probes `/health` periodically. Both failure signals
//! go through one [`RestartGate`], so a burst of failures inside the cooldown
//! costs a single restart, and a spent budget turns into a reported permanent
//! failure instead of a restart loop.

use std::future::Future;
use std::{env, fmt, io};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use codescout_config::MonitorSettings;
use codescout_lsp::ttl::TtlCache;
use codescout_types::unix_millis;
use codescout_types::wire::HealthCheckRecord;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::ProxyClient;

const READY_POLL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to launch proxy: {0}")]
    Spawn(#[source] io::Error),
    #[error("proxy did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error(
        "proxy permanently failed after {restarts} restart(s); run `codescout restart` to recover"
    )]
    PermanentlyFailed { restarts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed { attempt: u32 },
    CoolingDown { remaining: Duration },
    Exhausted,
}

/// Restart budget with a fixed cooldown between restarts.
#[derive(Debug, Clone)]
pub struct RestartGate {
    budget: u32,
    cooldown: Duration,
    restarts: u32,
    last_restart: Option<Instant>,
}

impl RestartGate {
    #[must_use]
    pub fn new(budget: u32, cooldown: Duration) -> Self {
        Self {
            budget,
            cooldown,
            restarts: 0,
            last_restart: None,
        }
    }

    /// Consumes one restart if the cooldown has elapsed and budget remains.
    ///
    /// A failure reported inside the cooldown belongs to the restart that is
    /// already underway and is absorbed.
    pub fn try_acquire(&mut self, now: Instant) -> GateDecision {
        if let Some(last) = self.last_restart {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                return GateDecision::CoolingDown {
                    remaining: self.cooldown - elapsed,
                };
            }
        }
        if self.restarts >= self.budget {
            return GateDecision::Exhausted;
        }
        self.restarts += 1;
        self.last_restart = Some(now);
        GateDecision::Allowed {
            attempt: self.restarts,
        }
    }

    /// Operator override: clears the budget and starts a fresh cooldown.
    pub fn force(&mut self, now: Instant) {
        self.restarts = 0;
        self.last_restart = Some(now);
    }

    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// A launched proxy process.
pub struct ProxyHandle {
    /// Resolves when the process exits.
    pub exited: oneshot::Receiver<()>,
    /// Fired to terminate the process.
    pub kill: oneshot::Sender<()>,
}

pub type SpawnFut<'a> = Pin<Box<dyn Future<Output = Result<ProxyHandle, MonitorError>> + Send + 'a>>;
pub type EndpointFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ProxySpawner: Send + Sync {
    fn spawn(&self) -> SpawnFut<'_>;
}

/// The running proxy as seen over its control surface.
pub trait ProxyEndpoint: Send + Sync {
    /// True when a proxy answers `/health` as ready.
    fn probe(&self) -> EndpointFut<'_, bool>;
    /// Best-effort stop of whatever instance is listening.
    fn request_shutdown(&self) -> EndpointFut<'_, ()>;
}

/// Launches `<current exe> serve --workspace <root> --port <port>` detached
/// from the owner's stdio. The child outlives the owner when it is dropped.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    workspace: PathBuf,
    port: u16,
}

impl CommandSpawner {
    #[must_use]
    pub fn new(program: PathBuf, workspace: PathBuf, port: u16) -> Self {
        Self {
            program,
            workspace,
            port,
        }
    }

    pub fn current_exe(workspace: PathBuf, port: u16) -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?, workspace, port))
    }
}

impl ProxySpawner for CommandSpawner {
    fn spawn(&self) -> SpawnFut<'_> {
        Box::pin(async move {
            let mut child = Command::new(&self.program)
                .arg("serve")
                .arg("--workspace")
                .arg(&self.workspace)
                .arg("--port")
                .arg(self.port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(MonitorError::Spawn)?;
            tracing::info!(pid = ?child.id(), port = self.port, "launched proxy");

            let (exit_tx, exited) = oneshot::channel();
            let (kill, kill_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                let killed = tokio::select! {
                    status = child.wait() => {
                        tracing::debug!(?status, "proxy process exited");
                        false
                    }
                    Ok(()) = kill_rx => true,
                };
                if killed {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill proxy process");
                    }
                }
                let _ = exit_tx.send(());
            });

            Ok(ProxyHandle { exited, kill })
        })
    }
}

/// Probes the proxy through [`ProxyClient`] with a short timeout.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: ProxyClient,
}

impl HttpEndpoint {
    pub fn new(port: u16) -> Result<Self, crate::client::ClientError> {
        let base = url::Url::parse(&format!("http://127.0.0.1:{port}/"))?;
        Ok(Self {
            client: ProxyClient::with_timeout(base, PROBE_TIMEOUT)?,
        })
    }
}

impl ProxyEndpoint for HttpEndpoint {
    fn probe(&self) -> EndpointFut<'_, bool> {
        Box::pin(async move {
            match self.client.health().await {
                Ok(health) => health.ready,
                Err(e) => {
                    tracing::debug!(error = %e, "proxy health probe failed");
                    false
                }
            }
        })
    }

    fn request_shutdown(&self) -> EndpointFut<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.client.shutdown().await {
                tracing::debug!(error = %e, "proxy shutdown request failed");
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub running: bool,
    pub restarts: u32,
    pub permanently_failed: bool,
    pub last_health_check: Option<HealthCheckRecord>,
}

/// What a single health probe led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Restarted,
    /// Failure fell inside the cooldown of a previous restart.
    Absorbed { remaining: Duration },
}

struct ChildSlot {
    generation: u64,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    permanently_failed: bool,
    last_health_check: Option<HealthCheckRecord>,
    generation: u64,
    child: Option<ChildSlot>,
}

struct MonitorInner {
    settings: MonitorSettings,
    spawner: Arc<dyn ProxySpawner>,
    endpoint: Arc<dyn ProxyEndpoint>,
    /// Serializes launches and restarts.
    start_guard: tokio::sync::Mutex<()>,
    /// Positive readiness answers only.
    readiness: TtlCache<(), ()>,
    gate: Mutex<RestartGate>,
    state: Mutex<MonitorState>,
    probe_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, RestartGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a new child and returns its generation.
    fn adopt(&self, kill: oneshot::Sender<()>) -> u64 {
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;
        state.child = Some(ChildSlot { generation, kill });
        generation
    }

    /// Detaches the current child so its exit is no longer treated as a failure.
    fn retire_child(&self) -> Option<oneshot::Sender<()>> {
        let mut state = self.state();
        state.running = false;
        state.child.take().map(|slot| slot.kill)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state()
            .child
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }
}

/// Keeps one proxy instance alive for the owner. Cloning shares the monitor.
#[derive(Clone)]
pub struct ProxyMonitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for ProxyMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyMonitor")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ProxyMonitor {
    #[must_use]
    pub fn new(
        settings: MonitorSettings,
        spawner: Arc<dyn ProxySpawner>,
        endpoint: Arc<dyn ProxyEndpoint>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                readiness: TtlCache::new(settings.readiness_ttl),
                gate: Mutex::new(RestartGate::new(
                    settings.restart_budget,
                    settings.restart_cooldown,
                )),
                settings,
                spawner,
                endpoint,
                start_guard: tokio::sync::Mutex::new(()),
                state: Mutex::new(MonitorState::default()),
                probe_loop: Mutex::new(None),
            }),
        }
    }

    /// Monitor for `codescout serve` on `port`, launched from the current executable.
    pub fn for_workspace(
        workspace: PathBuf,
        port: u16,
        settings: MonitorSettings,
    ) -> Result<Self, io::Error> {
        let spawner = CommandSpawner::current_exe(workspace, port)?;
        let endpoint = HttpEndpoint::new(port).map_err(io::Error::other)?;
        Ok(Self::new(settings, Arc::new(spawner), Arc::new(endpoint)))
    }

    /// Makes sure a proxy answers, launching one if nothing does.
    pub async fn ensure_running(&self) -> Result<(), MonitorError> {
        self.check_not_failed()?;
        if self.inner.readiness.get(&()).is_some() {
            return Ok(());
        }

        let _guard = self.inner.start_guard.lock().await;
        self.check_not_failed()?;
        if self.inner.readiness.get(&()).is_some() {
            return Ok(());
        }

        if self.inner.endpoint.probe().await {
            tracing::debug!("proxy already running");
            self.mark_ready();
            return Ok(());
        }
        self.launch().await
    }

    /// Spawns the periodic health probe. Calling it again replaces the loop.
    pub fn start_monitoring(&self) {
        let monitor = self.clone();
        let period = self.inner.settings.probe_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match monitor.probe_once().await {
                    Ok(outcome) => tracing::trace!(?outcome, "proxy probe"),
                    Err(MonitorError::PermanentlyFailed { restarts }) => {
                        tracing::error!(restarts, "proxy permanently failed; probing stopped");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "proxy restart failed"),
                }
            }
        });
        let previous = self
            .inner
            .probe_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Probes the proxy once and routes a failure through the restart gate.
    pub async fn probe_once(&self) -> Result<ProbeOutcome, MonitorError> {
        self.check_not_failed()?;
        let ok = self.inner.endpoint.probe().await;
        self.inner.state().last_health_check = Some(HealthCheckRecord {
            at_ms: unix_millis(SystemTime::now()),
            ok,
            error: (!ok).then(|| "health probe failed".to_string()),
        });
        if ok {
            self.mark_ready();
            return Ok(ProbeOutcome::Healthy);
        }
        self.handle_failure("health probe failed").await
    }

    /// Restarts regardless of budget and cooldown, clearing a permanent failure.
    pub async fn force_restart(&self) -> Result<(), MonitorError> {
        self.inner.gate().force(Instant::now());
        self.inner.state().permanently_failed = false;
        tracing::info!("forcing proxy restart");
        self.relaunch().await
    }

    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let restarts = self.inner.gate().restarts();
        let state = self.inner.state();
        MonitorStatus {
            running: state.running,
            restarts,
            permanently_failed: state.permanently_failed,
            last_health_check: state.last_health_check.clone(),
        }
    }

    /// Stops probing and kills a proxy this monitor launched.
    pub fn stop(&self) {
        if let Some(task) = self
            .inner
            .probe_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.readiness.clear();
        if let Some(kill) = self.inner.retire_child() {
            let _ = kill.send(());
        }
    }

    fn check_not_failed(&self) -> Result<(), MonitorError> {
        if self.inner.state().permanently_failed {
            return Err(MonitorError::PermanentlyFailed {
                restarts: self.inner.gate().restarts(),
            });
        }
        Ok(())
    }

    fn mark_ready(&self) {
        self.inner.readiness.insert((), ());
        self.inner.state().running = true;
    }

    async fn handle_failure(&self, reason: &str) -> Result<ProbeOutcome, MonitorError> {
        self.inner.readiness.clear();
        self.inner.state().running = false;

        let decision = self.inner.gate().try_acquire(Instant::now());
        match decision {
            GateDecision::CoolingDown { remaining } => {
                tracing::debug!(reason, ?remaining, "proxy failure inside restart cooldown");
                Ok(ProbeOutcome::Absorbed { remaining })
            }
            GateDecision::Exhausted => {
                self.inner.state().permanently_failed = true;
                let restarts = self.inner.gate().restarts();
                tracing::error!(reason, restarts, "proxy restart budget exhausted");
                Err(MonitorError::PermanentlyFailed { restarts })
            }
            GateDecision::Allowed { attempt } => {
                tracing::warn!(reason, attempt, "restarting proxy");
                self.relaunch().await?;
                Ok(ProbeOutcome::Restarted)
            }
        }
    }

    async fn relaunch(&self) -> Result<(), MonitorError> {
        let _guard = self.inner.start_guard.lock().await;
        self.inner.readiness.clear();
        match self.inner.retire_child() {
            Some(kill) => {
                let _ = kill.send(());
            }
            None => self.inner.endpoint.request_shutdown().await,
        }
        self.wait_stopped().await;
        self.launch().await
    }

    /// Launches a child and waits for it to answer. Callers hold `start_guard`.
    async fn launch(&self) -> Result<(), MonitorError> {
        let handle = self.inner.spawner.spawn().await?;
        let generation = self.inner.adopt(handle.kill);
        self.watch(generation, handle.exited);

        let bound = self.inner.settings.startup_timeout;
        if tokio::time::timeout(bound, self.wait_ready()).await.is_err() {
            if self.inner.is_current(generation) {
                if let Some(kill) = self.inner.retire_child() {
                    let _ = kill.send(());
                }
            }
            return Err(MonitorError::StartupTimeout(bound));
        }
        self.mark_ready();
        tracing::info!(generation, "proxy ready");
        Ok(())
    }

    async fn wait_ready(&self) {
        while !self.inner.endpoint.probe().await {
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn wait_stopped(&self) {
        let deadline = Instant::now() + self.inner.settings.startup_timeout;
        while self.inner.endpoint.probe().await {
            if Instant::now() >= deadline {
                tracing::warn!("previous proxy still answering; launching anyway");
                return;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn watch(&self, generation: u64, exited: oneshot::Receiver<()>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let _ = exited.await;
            if !monitor.inner.is_current(generation) {
                return;
            }
            tracing::warn!(generation, "proxy exited unexpectedly");
            if let Err(e) = monitor.handle_failure("proxy process exited").await {
                tracing::warn!(error = %e, "proxy recovery failed");
            }
        });
    }
}
