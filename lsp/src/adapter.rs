//! Per-ecosystem query layer over one client session.
//!
//! Every answer is tagged with where it came from. Session errors are
//! absorbed here: the caller gets a text-scan answer tagged `fallback`
//! instead of an error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;

use codescout_types::{EcosystemId, Location, Position, ResultSource, SymbolRecord};

use crate::error::SessionError;
use crate::fallback::TextScanner;
use crate::protocol::{self, METHOD_NOT_FOUND};
use crate::session::ClientSession;
use crate::ttl::TtlCache;
use crate::types::AdapterSettings;

/// Items plus the path that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub items: Vec<T>,
    pub source: ResultSource,
}

impl<T> Sourced<T> {
    fn semantic(items: Vec<T>) -> Self {
        Self {
            items,
            source: ResultSource::Semantic,
        }
    }

    fn fallback(items: Vec<T>, reason: &SessionError) -> Self {
        Self {
            items,
            source: ResultSource::fallback(reason),
        }
    }
}

/// (document URI, query detail). Workspace queries use an empty URI.
type QueryKey = (String, String);

struct AdapterInner {
    session: ClientSession,
    scanner: TextScanner,
    settings: AdapterSettings,
    symbols: TtlCache<QueryKey, Vec<SymbolRecord>>,
    references: TtlCache<QueryKey, Vec<Location>>,
    /// One lock per URI currently inside an open/close bracket.
    open_documents: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct EcosystemAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for EcosystemAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcosystemAdapter")
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

fn unsupported(method: &str) -> SessionError {
    SessionError::Protocol {
        code: METHOD_NOT_FOUND,
        message: format!("server does not provide {method}"),
    }
}

impl EcosystemAdapter {
    #[must_use]
    pub fn new(session: ClientSession, settings: AdapterSettings) -> Self {
        let descriptor = session.descriptor();
        let scanner = TextScanner::new(
            descriptor.root(),
            descriptor.language_id(),
            descriptor.file_extensions(),
            settings.fallback,
        );
        Self {
            inner: Arc::new(AdapterInner {
                scanner,
                settings,
                symbols: TtlCache::new(settings.cache_ttl),
                references: TtlCache::new(settings.cache_ttl),
                open_documents: Mutex::new(HashMap::new()),
                session,
            }),
        }
    }

    #[must_use]
    pub fn session(&self) -> &ClientSession {
        &self.inner.session
    }

    #[must_use]
    pub fn ecosystem(&self) -> &EcosystemId {
        self.inner.session.descriptor().ecosystem()
    }

    /// Drop memoized answers, e.g. after a restart.
    pub fn invalidate(&self) {
        self.inner.symbols.clear();
        self.inner.references.clear();
    }

    pub async fn document_symbols(&self, path: &Path) -> Sourced<SymbolRecord> {
        let result = match protocol::path_to_file_uri(path) {
            Ok(uri) => self.semantic_document_symbols(path, uri.as_str()).await,
            Err(e) => Err(SessionError::Transport(e.to_string())),
        };
        match result {
            Ok(items) => Sourced::semantic(items),
            Err(e) => {
                tracing::debug!(ecosystem = %self.ecosystem(), error = %e, "documentSymbol falling back");
                let items = self.inner.scanner.document_symbols(path.to_path_buf()).await;
                Sourced::fallback(items, &e)
            }
        }
    }

    pub async fn find_references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Sourced<Location> {
        let result = match protocol::path_to_file_uri(path) {
            Ok(uri) => {
                self.semantic_references(path, uri.as_str(), position, include_declaration)
                    .await
            }
            Err(e) => Err(SessionError::Transport(e.to_string())),
        };
        match result {
            Ok(items) => Sourced::semantic(items),
            Err(e) => {
                tracing::debug!(ecosystem = %self.ecosystem(), error = %e, "references falling back");
                let items = self
                    .inner
                    .scanner
                    .references(path.to_path_buf(), position, include_declaration)
                    .await;
                Sourced::fallback(items, &e)
            }
        }
    }

    pub async fn workspace_symbols(&self, query: &str) -> Sourced<SymbolRecord> {
        match self.semantic_workspace_symbols(query).await {
            Ok(items) => Sourced::semantic(items),
            Err(e) => {
                tracing::debug!(ecosystem = %self.ecosystem(), error = %e, "workspace/symbol falling back");
                let items = self.inner.scanner.workspace_symbols(query.to_string()).await;
                Sourced::fallback(items, &e)
            }
        }
    }

    async fn semantic_document_symbols(
        &self,
        path: &Path,
        uri: &str,
    ) -> Result<Vec<SymbolRecord>, SessionError> {
        let key = (uri.to_string(), String::new());
        if let Some(hit) = self.inner.symbols.get(&key) {
            return Ok(hit);
        }
        let session = &self.inner.session;
        if !session.state().accepts_requests() {
            return Err(SessionError::NotReady(session.state()));
        }
        if !session.capabilities().document_symbols() {
            return Err(unsupported("textDocument/documentSymbol"));
        }
        let text = tokio::fs::read_to_string(path).await?;
        let records = self
            .with_open_document(uri, &text, || session.document_symbols(uri))
            .await?;
        self.inner.symbols.insert(key, records.clone());
        Ok(records)
    }

    async fn semantic_references(
        &self,
        path: &Path,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> Result<Vec<Location>, SessionError> {
        let key = (
            uri.to_string(),
            format!(
                "{}:{}:{include_declaration}",
                position.line, position.character
            ),
        );
        if let Some(hit) = self.inner.references.get(&key) {
            return Ok(hit);
        }
        let session = &self.inner.session;
        if !session.state().accepts_requests() {
            return Err(SessionError::NotReady(session.state()));
        }
        if !session.capabilities().references() {
            return Err(unsupported("textDocument/references"));
        }
        let text = tokio::fs::read_to_string(path).await?;
        let locations = self
            .with_open_document(uri, &text, || {
                session.find_references(uri, position, include_declaration)
            })
            .await?;
        self.inner.references.insert(key, locations.clone());
        Ok(locations)
    }

    async fn semantic_workspace_symbols(
        &self,
        query: &str,
    ) -> Result<Vec<SymbolRecord>, SessionError> {
        let key = (String::new(), query.to_string());
        if let Some(hit) = self.inner.symbols.get(&key) {
            return Ok(hit);
        }
        let session = &self.inner.session;
        if !session.state().accepts_requests() {
            return Err(SessionError::NotReady(session.state()));
        }
        if !session.capabilities().workspace_symbols() {
            return Err(unsupported("workspace/symbol"));
        }
        let records = session.workspace_symbol_search(query).await?;
        self.inner.symbols.insert(key, records.clone());
        Ok(records)
    }

    /// `didOpen`, settle, run `query`, then `didClose` whatever the outcome.
    ///
    /// Brackets on the same URI run one at a time: a document is never
    /// opened twice, nor closed under another query.
    async fn with_open_document<T, F, Fut>(
        &self,
        uri: &str,
        text: &str,
        query: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let document_lock = Arc::clone(
            self.inner
                .open_documents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(uri.to_string())
                .or_default(),
        );
        let guard = document_lock.lock().await;
        let result = self.open_query_close(uri, text, query).await;
        drop(guard);

        let mut open = self
            .inner
            .open_documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call still hold the lock: nobody is waiting.
        if Arc::strong_count(&document_lock) == 2 {
            open.remove(uri);
        }
        result
    }

    async fn open_query_close<T, F, Fut>(
        &self,
        uri: &str,
        text: &str,
        query: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let session = &self.inner.session;
        let readiness = session
            .descriptor()
            .readiness_notification()
            .map(|method| session.subscribe(method));

        session
            .did_open(uri, session.descriptor().language_id(), text)
            .await?;
        self.settle(readiness).await;
        let result = query().await;
        if let Err(e) = session.did_close(uri).await {
            tracing::debug!(ecosystem = %self.ecosystem(), uri, "didClose failed: {e}");
        }
        result
    }

    /// Wait out the settle delay, or less if the server signals readiness.
    async fn settle(&self, readiness: Option<broadcast::Receiver<Value>>) {
        let delay = self.inner.settings.settle_delay;
        match readiness {
            Some(mut rx) => {
                if tokio::time::timeout(delay, rx.recv()).await.is_err() {
                    tracing::trace!(ecosystem = %self.ecosystem(), "No readiness signal within settle delay");
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use codescout_types::{Range, SessionState};

    use crate::testing::{FakeAction, FakeLauncher, default_actions, symbol_information};
    use crate::types::{ServerConfig, ServerDescriptor, SessionSettings};

    fn config(readiness: Option<&str>) -> ServerConfig {
        ServerConfig {
            command: "fake-ls".into(),
            args: vec![],
            language_id: "rust".into(),
            file_extensions: vec!["rs".into()],
            readiness_notification: readiness.map(str::to_string),
        }
    }

    fn settings() -> AdapterSettings {
        AdapterSettings {
            settle_delay: Duration::from_millis(10),
            ..AdapterSettings::default()
        }
    }

    fn adapter(root: &Path, launcher: &FakeLauncher, readiness: Option<&str>) -> EcosystemAdapter {
        let descriptor =
            ServerDescriptor::new(EcosystemId::new("rust").unwrap(), config(readiness), root);
        let session = ClientSession::new(
            descriptor,
            SessionSettings {
                request_timeout: Duration::from_millis(200),
                degraded_after: 1,
                ..SessionSettings::default()
            },
            Arc::new(launcher.clone()),
        );
        EcosystemAdapter::new(session, settings())
    }

    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.rs");
        fs::write(&file, "pub struct Parser;\npub fn parse() {}\n").unwrap();
        (dir, file)
    }

    #[tokio::test]
    async fn idle_session_falls_back_without_spawning() {
        let (dir, _) = workspace();
        let launcher = FakeLauncher::responsive();
        let adapter = adapter(dir.path(), &launcher, None);

        let result = adapter.workspace_symbols("PARS").await;
        assert!(result.source.is_fallback());
        let names: Vec<&str> = result.items.iter().map(SymbolRecord::name).collect();
        assert_eq!(names, ["Parser", "parse"], "case-insensitive substring match");
        assert_eq!(launcher.launches(), 0);
        match result.source {
            ResultSource::Fallback { reason } => assert!(reason.contains("idle"), "{reason}"),
            ResultSource::Semantic => unreachable!(),
        }
    }

    #[tokio::test]
    async fn semantic_results_are_cached() {
        let (dir, _) = workspace();
        let launcher = FakeLauncher::new(|method, params| match method {
            "workspace/symbol" => vec![FakeAction::Respond(serde_json::json!([
                symbol_information(params["query"].as_str().unwrap_or(""), 12, "file:///w/lib.rs", 1, 7)
            ]))],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let first = adapter.workspace_symbols("parse").await;
        assert_eq!(first.source, ResultSource::Semantic);
        assert_eq!(first.items[0].name(), "parse");
        let second = adapter.workspace_symbols("parse").await;
        assert_eq!(second, first);

        let calls = launcher
            .received_methods()
            .iter()
            .filter(|m| *m == "workspace/symbol")
            .count();
        assert_eq!(calls, 1, "second query must hit the cache");

        adapter.invalidate();
        adapter.workspace_symbols("parse").await;
        let calls = launcher
            .received_methods()
            .iter()
            .filter(|m| *m == "workspace/symbol")
            .count();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn document_symbols_open_query_close() {
        let (dir, file) = workspace();
        let launcher = FakeLauncher::new(|method, _| match method {
            "textDocument/documentSymbol" => vec![FakeAction::Respond(serde_json::json!([{
                "name": "Parser",
                "kind": 23,
                "range": { "start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 18} },
                "selectionRange": { "start": {"line": 0, "character": 11}, "end": {"line": 0, "character": 17} }
            }]))],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let result = adapter.document_symbols(&file).await;
        assert_eq!(result.source, ResultSource::Semantic);
        assert_eq!(result.items[0].location().range, Range::on_line(0, 11, 6));

        let methods = launcher.wait_for_method("textDocument/didClose").await;
        let tail: Vec<&str> = methods.iter().skip(2).map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "textDocument/didOpen",
                "textDocument/documentSymbol",
                "textDocument/didClose"
            ]
        );
    }

    #[tokio::test]
    async fn did_close_is_sent_when_query_fails() {
        let (dir, file) = workspace();
        let launcher = FakeLauncher::new(|method, _| match method {
            "textDocument/references" => vec![FakeAction::RespondError {
                code: -32603,
                message: "index not ready".into(),
            }],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let result = adapter
            .find_references(&file, Position::new(1, 8), true)
            .await;
        match &result.source {
            ResultSource::Fallback { reason } => assert!(reason.contains("index not ready")),
            ResultSource::Semantic => panic!("expected fallback"),
        }
        assert_eq!(result.items.len(), 1, "text scan finds the one `parse`");

        let methods = launcher.wait_for_method("textDocument/didClose").await;
        assert!(methods.iter().any(|m| m == "textDocument/didClose"));
    }

    #[tokio::test]
    async fn concurrent_queries_on_one_document_do_not_interleave() {
        let (dir, file) = workspace();
        let launcher = FakeLauncher::new(|method, _| match method {
            "textDocument/documentSymbol" | "textDocument/references" => vec![
                FakeAction::RespondAfter(Duration::from_millis(50), serde_json::json!([])),
            ],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let (symbols, references) = tokio::join!(
            adapter.document_symbols(&file),
            adapter.find_references(&file, Position::new(1, 8), false),
        );
        assert_eq!(symbols.source, ResultSource::Semantic);
        assert_eq!(references.source, ResultSource::Semantic);

        let brackets = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let brackets: Vec<String> = launcher
                    .received_methods()
                    .into_iter()
                    .filter(|m| m.starts_with("textDocument/did"))
                    .collect();
                if brackets.len() == 4 {
                    return brackets;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            brackets,
            [
                "textDocument/didOpen",
                "textDocument/didClose",
                "textDocument/didOpen",
                "textDocument/didClose"
            ]
        );
        assert!(adapter.inner.open_documents.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn degraded_session_still_tries_semantic_then_falls_back() {
        let (dir, _) = workspace();
        let launcher = FakeLauncher::new(|method, params| match method {
            "workspace/symbol" if params["query"] == "hang" => vec![],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let result = adapter.workspace_symbols("hang").await;
        assert!(result.source.is_fallback());
        assert_eq!(adapter.session().state(), SessionState::Degraded);

        let result = adapter.workspace_symbols("Parser").await;
        assert_eq!(result.source, ResultSource::Semantic);
        assert_eq!(adapter.session().state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn readiness_notification_shortcuts_settle_delay() {
        let (dir, file) = workspace();
        let launcher = FakeLauncher::new(|method, _| match method {
            "textDocument/didOpen" => vec![FakeAction::Notify {
                method: "experimental/serverStatus".into(),
                params: serde_json::json!({"quiescent": true}),
            }],
            other => default_actions(other),
        });
        let descriptor = ServerDescriptor::new(
            EcosystemId::new("rust").unwrap(),
            config(Some("experimental/serverStatus")),
            dir.path(),
        );
        let session = ClientSession::new(
            descriptor,
            SessionSettings::default(),
            Arc::new(launcher.clone()),
        );
        let adapter = EcosystemAdapter::new(
            session,
            AdapterSettings {
                settle_delay: Duration::from_secs(30),
                ..AdapterSettings::default()
            },
        );
        adapter.session().ensure_ready().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), adapter.document_symbols(&file))
            .await
            .expect("readiness signal must end the settle wait");
        assert_eq!(result.source, ResultSource::Semantic);
    }

    #[tokio::test]
    async fn missing_capability_falls_back() {
        let (dir, _) = workspace();
        let launcher = FakeLauncher::new(|method, _| match method {
            "initialize" => vec![FakeAction::Respond(serde_json::json!({"capabilities": {}}))],
            other => default_actions(other),
        });
        let adapter = adapter(dir.path(), &launcher, None);
        adapter.session().ensure_ready().await.unwrap();

        let result = adapter.workspace_symbols("Parser").await;
        assert!(result.source.is_fallback());
        assert!(
            !launcher
                .received_methods()
                .iter()
                .any(|m| m == "workspace/symbol")
        );
    }
}
