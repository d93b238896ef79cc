//! Multi-workspace client cache.
//!
//! One [`EcosystemAdapter`] (and so one language server) per
//! `(ecosystem, canonical workspace root)`. Creation and reconnection for a
//! key are serialized by that key's slot guard; different keys never wait on
//! each other.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use codescout_types::EcosystemId;

use crate::adapter::EcosystemAdapter;
use crate::error::{CacheError, SessionError};
use crate::launcher::ServerLauncher;
use crate::session::{ClientSession, SessionStatus};
use crate::types::{LspSettings, ServerConfig, ServerDescriptor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build extension → ecosystem map. Servers are visited alphabetically and
/// the first claim on an extension wins.
fn build_extension_map(servers: &BTreeMap<EcosystemId, ServerConfig>) -> HashMap<String, EcosystemId> {
    let mut extension_map: HashMap<String, EcosystemId> = HashMap::new();
    for (ecosystem, config) in servers {
        for ext in &config.file_extensions {
            let ext = ext.trim_start_matches('.').to_ascii_lowercase();
            if let Some(existing) = extension_map.get(&ext) {
                tracing::warn!(
                    "Multiple language servers configured for extension '{ext}': '{existing}' and '{ecosystem}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext, ecosystem.clone());
        }
    }
    extension_map
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CacheKey {
    ecosystem: EcosystemId,
    root: PathBuf,
}

#[derive(Default)]
struct Slot {
    /// Held across creation and reconnection.
    guard: tokio::sync::Mutex<()>,
    adapter: Mutex<Option<EcosystemAdapter>>,
}

/// Snapshot of one cached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub ecosystem: EcosystemId,
    pub root: PathBuf,
    pub status: SessionStatus,
}

pub struct ClientCache {
    servers: BTreeMap<EcosystemId, ServerConfig>,
    extension_map: HashMap<String, EcosystemId>,
    settings: LspSettings,
    launcher: Arc<dyn ServerLauncher>,
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
}

impl fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("ecosystems", &self.servers.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ClientCache {
    #[must_use]
    pub fn new(
        servers: BTreeMap<EcosystemId, ServerConfig>,
        settings: LspSettings,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        let extension_map = build_extension_map(&servers);
        Self {
            servers,
            extension_map,
            settings,
            launcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Configured ecosystems, sorted.
    #[must_use]
    pub fn ecosystems(&self) -> Vec<EcosystemId> {
        self.servers.keys().cloned().collect()
    }

    /// Ecosystem that owns `path`, by file extension.
    #[must_use]
    pub fn ecosystem_for_path(&self, path: &Path) -> Option<&EcosystemId> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.extension_map.get(&ext)
    }

    /// Cached or new adapter for the key. Never spawns a server.
    pub async fn adapter(
        &self,
        ecosystem: &EcosystemId,
        workspace: &Path,
    ) -> Result<EcosystemAdapter, CacheError> {
        let (key, config) = self.key(ecosystem, workspace).await?;
        let slot = self.slot(&key);
        let _guard = slot.guard.lock().await;
        Ok(self.adapter_in(&key, config, &slot))
    }

    pub async fn adapter_for_file(
        &self,
        workspace: &Path,
        path: &Path,
    ) -> Result<EcosystemAdapter, CacheError> {
        let ecosystem = self
            .ecosystem_for_path(path)
            .cloned()
            .ok_or_else(|| CacheError::UnmanagedFile(path.to_path_buf()))?;
        self.adapter(&ecosystem, workspace).await
    }

    /// Adapter with a Ready (or Degraded) session.
    ///
    /// Retries up to `reconnect_attempts` times. Exhausted restart budgets
    /// return at once. Configuration errors and exhausted reconnects shut
    /// the session down and evict it.
    pub async fn ensure_session(
        &self,
        ecosystem: &EcosystemId,
        workspace: &Path,
    ) -> Result<EcosystemAdapter, CacheError> {
        let (key, config) = self.key(ecosystem, workspace).await?;
        let slot = self.slot(&key);
        let _guard = slot.guard.lock().await;

        let attempts = self.settings.cache.reconnect_attempts.max(1);
        let mut attempt = 0;
        loop {
            let adapter = self.adapter_in(&key, config, &slot);
            let session = adapter.session();
            let restarts_before = session.status().restarts;

            let failure = match session.ensure_ready().await {
                Ok(()) if session.is_alive().await => {
                    if session.status().restarts != restarts_before {
                        adapter.invalidate();
                    }
                    return Ok(adapter);
                }
                Ok(()) => SessionError::ProcessExit,
                Err(e @ SessionError::RestartBudgetExhausted { .. }) => {
                    tracing::warn!(ecosystem = %key.ecosystem, root = %key.root.display(), "{e}");
                    return Err(CacheError::Session {
                        ecosystem: key.ecosystem.clone(),
                        source: e,
                    });
                }
                Err(e) if e.is_configuration() => {
                    self.evict(&slot).await;
                    self.release(&key, &slot);
                    return Err(CacheError::Session {
                        ecosystem: key.ecosystem.clone(),
                        source: e,
                    });
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= attempts {
                tracing::warn!(
                    ecosystem = %key.ecosystem,
                    root = %key.root.display(),
                    attempts = attempt,
                    error = %failure,
                    "Giving up on language server; evicting session"
                );
                self.evict(&slot).await;
                self.release(&key, &slot);
                return Err(CacheError::ReconnectFailed {
                    ecosystem: key.ecosystem.clone(),
                    attempts: attempt,
                });
            }
            tracing::info!(
                ecosystem = %key.ecosystem,
                attempt,
                max = attempts,
                error = %failure,
                "Language server unavailable, retrying"
            );
            tokio::time::sleep(self.settings.cache.reconnect_delay).await;
        }
    }

    /// Operator reset of a crashed or permanently failed session.
    pub async fn reset(&self, ecosystem: &EcosystemId, workspace: &Path) -> Result<bool, CacheError> {
        let (key, _) = self.key(ecosystem, workspace).await?;
        let slot = self.slot(&key);
        let _guard = slot.guard.lock().await;
        let adapter = lock(&slot.adapter).clone();
        match adapter {
            Some(adapter) => {
                adapter.invalidate();
                Ok(adapter.session().reset().await)
            }
            None => Ok(false),
        }
    }

    /// Shut down every session rooted at `workspace`.
    pub async fn disconnect_workspace(&self, workspace: &Path) -> usize {
        let root = tokio::fs::canonicalize(workspace)
            .await
            .unwrap_or_else(|_| workspace.to_path_buf());
        let slots: Vec<(CacheKey, Arc<Slot>)> = lock(&self.slots)
            .iter()
            .filter(|(k, _)| k.root == root)
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        self.close_all(slots).await
    }

    /// Shut down every cached session.
    pub async fn disconnect_all(&self) -> usize {
        let slots: Vec<(CacheKey, Arc<Slot>)> = lock(&self.slots)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        self.close_all(slots).await
    }

    /// Status of every cached session, ordered by ecosystem then root.
    #[must_use]
    pub fn statuses(&self) -> Vec<CachedSession> {
        let slots: Vec<(CacheKey, Arc<Slot>)> = lock(&self.slots)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        let mut out: Vec<CachedSession> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let adapter = lock(&slot.adapter).clone()?;
                Some(CachedSession {
                    status: adapter.session().status(),
                    ecosystem: key.ecosystem,
                    root: key.root,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.ecosystem, &a.root).cmp(&(&b.ecosystem, &b.root)));
        out
    }

    async fn key(
        &self,
        ecosystem: &EcosystemId,
        workspace: &Path,
    ) -> Result<(CacheKey, &ServerConfig), CacheError> {
        let config = self
            .servers
            .get(ecosystem)
            .ok_or_else(|| CacheError::UnknownEcosystem(ecosystem.to_string()))?;
        let root = tokio::fs::canonicalize(workspace)
            .await
            .map_err(|source| CacheError::WorkspaceUnreadable {
                path: workspace.to_path_buf(),
                source,
            })?;
        let key = CacheKey {
            ecosystem: ecosystem.clone(),
            root,
        };
        Ok((key, config))
    }

    fn slot(&self, key: &CacheKey) -> Arc<Slot> {
        Arc::clone(lock(&self.slots).entry(key.clone()).or_default())
    }

    /// Caller must hold the slot guard.
    fn adapter_in(&self, key: &CacheKey, config: &ServerConfig, slot: &Slot) -> EcosystemAdapter {
        let mut current = lock(&slot.adapter);
        if let Some(adapter) = current.as_ref() {
            return adapter.clone();
        }
        let descriptor =
            ServerDescriptor::new(key.ecosystem.clone(), config.clone(), key.root.clone());
        let session = ClientSession::new(
            descriptor,
            self.settings.session,
            Arc::clone(&self.launcher),
        );
        let adapter = EcosystemAdapter::new(session, self.settings.adapter);
        tracing::debug!(ecosystem = %key.ecosystem, root = %key.root.display(), "Created session");
        *current = Some(adapter.clone());
        adapter
    }

    /// Empties the slot. Caller must hold the slot guard.
    async fn evict(&self, slot: &Slot) {
        let adapter = lock(&slot.adapter).take();
        if let Some(adapter) = adapter {
            adapter.session().shutdown().await;
        }
    }

    async fn close_all(&self, slots: Vec<(CacheKey, Arc<Slot>)>) -> usize {
        let mut closed = 0;
        for (key, slot) in slots {
            let _guard = slot.guard.lock().await;
            let adapter = lock(&slot.adapter).take();
            if let Some(adapter) = adapter {
                tracing::debug!(ecosystem = %key.ecosystem, root = %key.root.display(), "Disconnecting");
                adapter.session().shutdown().await;
                closed += 1;
            }
            self.release(&key, &slot);
        }
        closed
    }

    /// Unmaps an emptied slot unless another caller holds it. Waiters keep
    /// the slot alive, so they never end up on an unmapped copy. Caller must
    /// hold the slot guard.
    fn release(&self, key: &CacheKey, slot: &Arc<Slot>) {
        let mut slots = lock(&self.slots);
        let unshared = slots
            .get(key)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, slot) && Arc::strong_count(slot) == 2);
        if unshared && lock(&slot.adapter).is_none() {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn mapped_slots(&self) -> usize {
        lock(&self.slots).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use codescout_types::SessionState;

    use crate::testing::{FakeAction, FakeLauncher, default_actions};
    use crate::types::{CacheSettings, SessionSettings};

    fn eco(name: &str) -> EcosystemId {
        EcosystemId::new(name).unwrap()
    }

    fn server(ext: &[&str]) -> ServerConfig {
        ServerConfig {
            command: "fake-ls".into(),
            args: vec![],
            language_id: "rust".into(),
            file_extensions: ext.iter().map(|e| (*e).to_string()).collect(),
            readiness_notification: None,
        }
    }

    fn settings() -> LspSettings {
        LspSettings {
            session: SessionSettings {
                handshake_timeout: Duration::from_secs(2),
                restart_cooldown: Duration::from_millis(10),
                max_restarts: 3,
                ..SessionSettings::default()
            },
            cache: CacheSettings {
                reconnect_attempts: 3,
                reconnect_delay: Duration::from_millis(10),
            },
            ..LspSettings::default()
        }
    }

    fn cache_with(launcher: &FakeLauncher, settings: LspSettings) -> ClientCache {
        let mut servers = BTreeMap::new();
        servers.insert(eco("rust"), server(&["rs"]));
        ClientCache::new(servers, settings, Arc::new(launcher.clone()))
    }

    #[test]
    fn extension_overlap_prefers_alphabetical_first() {
        let mut servers = BTreeMap::new();
        servers.insert(eco("typescript"), server(&["ts", "tsx"]));
        servers.insert(eco("deno"), server(&[".ts"]));
        let cache = ClientCache::new(servers, LspSettings::default(), Arc::new(FakeLauncher::responsive()));

        assert_eq!(cache.ecosystem_for_path(Path::new("a/b.ts")), Some(&eco("deno")));
        assert_eq!(
            cache.ecosystem_for_path(Path::new("a/b.TSX")),
            Some(&eco("typescript"))
        );
        assert_eq!(cache.ecosystem_for_path(Path::new("Makefile")), None);
    }

    #[tokio::test]
    async fn adapter_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        let cache = cache_with(&launcher, settings());

        let adapter = cache.adapter(&eco("rust"), dir.path()).await.unwrap();
        assert_eq!(adapter.session().state(), SessionState::Idle);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn unknown_ecosystem_and_unreadable_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(&FakeLauncher::responsive(), settings());

        let err = cache.adapter(&eco("cobol"), dir.path()).await.unwrap_err();
        assert!(matches!(err, CacheError::UnknownEcosystem(_)));
        assert!(err.is_configuration());

        let missing = dir.path().join("nope");
        let err = cache.adapter(&eco("rust"), &missing).await.unwrap_err();
        assert!(matches!(err, CacheError::WorkspaceUnreadable { .. }));

        let err = cache
            .adapter_for_file(dir.path(), Path::new("notes.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnmanagedFile(_)));
    }

    #[tokio::test]
    async fn same_key_shares_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        let cache = cache_with(&launcher, settings());

        let nested = dir.path().join("src");
        fs::create_dir(&nested).unwrap();
        let via_dotdot = nested.join("..");

        let rust = eco("rust");
        let (a, b) = tokio::join!(
            cache.ensure_session(&rust, dir.path()),
            cache.ensure_session(&rust, &via_dotdot),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.session().same_session(b.session()));
        assert_eq!(launcher.launches(), 1);
        assert_eq!(cache.statuses().len(), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_permanent_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(|method, _| match method {
            "initialize" => vec![FakeAction::Hangup],
            other => default_actions(other),
        });
        let mut settings = settings();
        settings.session.max_restarts = 2;
        settings.cache.reconnect_attempts = 10;
        let cache = cache_with(&launcher, settings);

        let err = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap_err();
        assert!(err.is_permanent(), "{err}");
        assert_eq!(launcher.launches(), 3, "initial launch plus two restarts");

        // Stays failed without spawning again.
        let err = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(launcher.launches(), 3);

        let statuses = cache.statuses();
        assert_eq!(statuses[0].status.state, SessionState::Crashed);
        assert_eq!(statuses[0].status.restarts, 2);

        assert!(cache.reset(&eco("rust"), dir.path()).await.unwrap());
        assert_eq!(cache.statuses()[0].status.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn exhausted_reconnects_evict_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(|method, _| match method {
            "initialize" => vec![FakeAction::Hangup],
            other => default_actions(other),
        });
        let mut settings = settings();
        settings.cache.reconnect_attempts = 2;
        let cache = cache_with(&launcher, settings);

        let err = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap_err();
        assert!(matches!(err, CacheError::ReconnectFailed { attempts: 2, .. }), "{err}");
        assert!(!err.is_permanent());
        assert!(cache.statuses().is_empty());
        assert_eq!(launcher.launches(), 2);

        // A fresh session is built on the next request.
        let _ = cache.ensure_session(&eco("rust"), dir.path()).await;
        assert_eq!(launcher.launches(), 4);
    }

    #[tokio::test]
    async fn missing_command_evicts_as_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        launcher.fail_launches_with_not_found(true);
        let cache = cache_with(&launcher, settings());

        let err = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap_err();
        assert!(err.is_configuration(), "{err}");
        assert!(cache.statuses().is_empty());
    }

    #[tokio::test]
    async fn crashed_session_reconnects_on_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        let cache = cache_with(&launcher, settings());

        let first = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap();
        launcher.hangup_all();
        let mut state = first.session().watch_state();
        state
            .wait_for(|s| *s == SessionState::Crashed)
            .await
            .unwrap();

        let second = cache.ensure_session(&eco("rust"), dir.path()).await.unwrap();
        assert!(first.session().same_session(second.session()));
        assert_eq!(second.session().state(), SessionState::Ready);
        assert_eq!(second.session().status().restarts, 1);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn disconnect_all_closes_every_session() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        let cache = cache_with(&launcher, settings());

        let sa = cache.ensure_session(&eco("rust"), a.path()).await.unwrap();
        cache.ensure_session(&eco("rust"), b.path()).await.unwrap();
        assert_eq!(cache.disconnect_all().await, 2);
        assert_eq!(sa.session().state(), SessionState::Closed);
        assert!(cache.statuses().is_empty());
        assert_eq!(cache.mapped_slots(), 0);
        assert_eq!(cache.disconnect_all().await, 0);
    }

    #[tokio::test]
    async fn disconnect_workspace_unmaps_only_that_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        let cache = cache_with(&launcher, settings());
        let rust = eco("rust");

        for _ in 0..3 {
            cache.ensure_session(&rust, a.path()).await.unwrap();
            cache.ensure_session(&rust, b.path()).await.unwrap();
            assert_eq!(cache.disconnect_workspace(a.path()).await, 1);
            assert_eq!(cache.mapped_slots(), 1);
            assert_eq!(cache.statuses().len(), 1);
        }
        assert_eq!(launcher.launches(), 4);
    }

    #[tokio::test]
    async fn evicted_keys_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::responsive();
        launcher.fail_launches_with_not_found(true);
        let cache = cache_with(&launcher, settings());
        let rust = eco("rust");

        for _ in 0..3 {
            let err = cache.ensure_session(&rust, dir.path()).await.unwrap_err();
            assert!(err.is_configuration(), "{err}");
        }
        assert_eq!(cache.mapped_slots(), 0);
    }
}
