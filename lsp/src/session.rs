//! Client session: one language server process and its protocol state.
//!
//! A session starts `Idle` and is spawned lazily by [`ClientSession::ensure_ready`].
//! The state lives in a `watch` channel so the supervisor can observe it; the
//! connection slot doubles as the spawn guard, so at most one spawn or
//! handshake runs per session.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use codescout_types::{Location, Position, SessionState, SymbolRecord, unix_millis};

use crate::codec::{self, DecodeEvent, FrameError, FrameReader, FrameWriter};
use crate::error::SessionError;
use crate::launcher::{BoxedReader, ServerLauncher};
use crate::pending::PendingTable;
use crate::protocol::{
    self, DidCloseTextDocument, DidCloseTextDocumentParams, DidOpenTextDocument,
    DidOpenTextDocumentParams, DocumentSymbolParams, DocumentSymbolRequest, Exit, Initialize,
    InitializeParams, Initialized, InitializedParams, LspNotification, LspRequest, Message,
    OutgoingNotification, OutgoingRequest, OutgoingResponse, ReferenceContext, ReferenceParams,
    References, RequestId, ServerCapabilities, Shutdown, TextDocumentIdentifier, TextDocumentItem,
    WorkspaceSymbolParams, WorkspaceSymbolRequest,
};
use crate::types::{ServerDescriptor, SessionSettings};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const LISTENER_CAPACITY: usize = 16;

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub restarts: u32,
    pub consecutive_failures: u32,
    /// Unix millis of the last inbound frame.
    pub last_activity_ms: Option<u64>,
}

struct Connection {
    child: Option<Child>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    /// Wait for the child to exit on its own, then kill it.
    async fn close(mut self, wait: Duration) {
        if let Some(child) = self.child.as_mut() {
            if tokio::time::timeout(wait, child.wait()).await.is_err() {
                tracing::debug!("Language server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        }
        if tokio::time::timeout(wait, &mut self.writer_handle)
            .await
            .is_err()
        {
            self.writer_handle.abort();
        }
        self.reader_handle.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

struct SessionInner {
    descriptor: ServerDescriptor,
    settings: SessionSettings,
    launcher: Arc<dyn ServerLauncher>,
    state: watch::Sender<SessionState>,
    /// Spawn guard and owner of the live connection.
    connection: tokio::sync::Mutex<Option<Connection>>,
    writer_tx: Mutex<Option<mpsc::Sender<WriterCommand>>>,
    pending: PendingTable,
    next_id: AtomicU64,
    generation: AtomicU64,
    failures: AtomicU32,
    restarts: AtomicU32,
    last_activity_ms: AtomicU64,
    crashed_at: Mutex<Option<Instant>>,
    capabilities: Mutex<ServerCapabilities>,
    listeners: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one client session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("ecosystem", self.inner.descriptor.ecosystem())
            .field("root", &self.inner.descriptor.root())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Create an idle session. Nothing is spawned until [`Self::ensure_ready`].
    pub fn new(
        descriptor: ServerDescriptor,
        settings: SessionSettings,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                descriptor,
                settings,
                launcher,
                state,
                connection: tokio::sync::Mutex::new(None),
                writer_tx: Mutex::new(None),
                pending: PendingTable::default(),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                failures: AtomicU32::new(0),
                restarts: AtomicU32::new(0),
                last_activity_ms: AtomicU64::new(0),
                crashed_at: Mutex::new(None),
                capabilities: Mutex::new(ServerCapabilities::default()),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.inner.descriptor
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn capabilities(&self) -> ServerCapabilities {
        lock(&self.inner.capabilities).clone()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let last = self.inner.last_activity_ms.load(Ordering::Relaxed);
        SessionStatus {
            state: self.state(),
            restarts: self.inner.restarts.load(Ordering::Relaxed),
            consecutive_failures: self.inner.failures.load(Ordering::Relaxed),
            last_activity_ms: (last > 0).then_some(last),
        }
    }

    /// Requests in flight.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether both handles point at the same session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Listen for server notifications with the given method.
    pub fn subscribe(&self, method: &str) -> broadcast::Receiver<Value> {
        lock(&self.inner.listeners)
            .entry(method.to_string())
            .or_insert_with(|| broadcast::channel(LISTENER_CAPACITY).0)
            .subscribe()
    }

    /// Ready or Degraded, and the server process has not exited.
    pub async fn is_alive(&self) -> bool {
        if !self.state().accepts_requests() {
            return false;
        }
        let mut conn = self.inner.connection.lock().await;
        match conn.as_mut() {
            Some(Connection {
                child: Some(child),
                ..
            }) => matches!(child.try_wait(), Ok(None)),
            Some(_) => true,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring the session to Ready, spawning or respawning as needed.
    ///
    /// The restart cooldown is waited out without holding the spawn guard, so
    /// status checks stay responsive; the state is re-read afterwards.
    pub async fn ensure_ready(&self) -> Result<(), SessionError> {
        loop {
            let mut conn = self.inner.connection.lock().await;
            return match self.state() {
                SessionState::Ready | SessionState::Degraded => Ok(()),
                SessionState::Closing | SessionState::Closed => Err(SessionError::Closed),
                SessionState::Idle => self.start(&mut conn).await,
                SessionState::Crashed => {
                    let restarts = self.inner.restarts.load(Ordering::Relaxed);
                    if restarts >= self.inner.settings.max_restarts {
                        return Err(SessionError::RestartBudgetExhausted { restarts });
                    }
                    let crashed_at = *lock(&self.inner.crashed_at);
                    let resume_at = crashed_at.map(|at| at + self.inner.settings.restart_cooldown);
                    if let Some(resume_at) = resume_at
                        && Instant::now() < resume_at
                    {
                        drop(conn);
                        tokio::time::sleep_until(resume_at).await;
                        continue;
                    }
                    let attempt = self.inner.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(
                        ecosystem = %self.inner.descriptor.ecosystem(),
                        attempt,
                        max = self.inner.settings.max_restarts,
                        "Restarting crashed language server"
                    );
                    self.start(&mut conn).await
                }
                state @ (SessionState::Spawning | SessionState::Handshaking) => {
                    Err(SessionError::NotReady(state))
                }
            };
        }
    }

    async fn start(&self, conn: &mut Option<Connection>) -> Result<(), SessionError> {
        let inner = &self.inner;
        // Tear down whatever is left of a crashed connection.
        *conn = None;
        inner.set_state(SessionState::Spawning);

        let io = match inner.launcher.launch(&inner.descriptor).await {
            Ok(io) => io,
            Err(e) => {
                tracing::warn!(
                    ecosystem = %inner.descriptor.ecosystem(),
                    error = %e,
                    "Failed to launch language server"
                );
                inner.mark_crashed();
                return Err(e);
            }
        };

        let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let mut stdin = FrameWriter::new(io.stdin);
        let writer_handle = tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(bytes) => {
                        if let Err(e) = stdin.write_encoded(&bytes).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = stdin.shutdown().await;
                        break;
                    }
                }
            }
        });

        let reader_handle = tokio::spawn(read_loop(
            Arc::downgrade(inner),
            generation,
            FrameReader::new(io.stdout),
            writer_tx.clone(),
        ));

        *lock(&inner.writer_tx) = Some(writer_tx);
        *conn = Some(Connection {
            child: io.child,
            reader_handle,
            writer_handle,
        });
        inner.set_state(SessionState::Handshaking);

        let timeout = inner.settings.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake(timeout)).await {
            Ok(Ok(capabilities)) => {
                *lock(&inner.capabilities) = capabilities;
                inner.failures.store(0, Ordering::Relaxed);
                inner.set_state(SessionState::Ready);
                tracing::info!(
                    ecosystem = %inner.descriptor.ecosystem(),
                    root = %inner.descriptor.root().display(),
                    "Language server ready"
                );
                Ok(())
            }
            Ok(Err(e)) if !matches!(e, SessionError::RequestTimeout { .. }) => {
                tracing::warn!(ecosystem = %inner.descriptor.ecosystem(), error = %e, "Handshake failed");
                inner.mark_crashed();
                *conn = None;
                Err(SessionError::HandshakeFailed(e.to_string()))
            }
            // The initialize request shares the handshake deadline, so its
            // own timeout is the handshake timing out.
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(ecosystem = %inner.descriptor.ecosystem(), ?timeout, "Handshake timed out");
                inner.mark_crashed();
                *conn = None;
                Err(SessionError::HandshakeTimeout(timeout))
            }
        }
    }

    async fn handshake(&self, timeout: Duration) -> Result<ServerCapabilities, SessionError> {
        let root = self.inner.descriptor.root();
        let root_uri = protocol::path_to_file_uri(root)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let name = root
            .file_name()
            .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());

        let result = self
            .call::<Initialize>(&InitializeParams::new(root_uri.as_str(), &name), timeout)
            .await?;
        if let Some(info) = &result.server_info {
            tracing::debug!(
                server = %info.name,
                version = info.version.as_deref().unwrap_or("unknown"),
                "Initialize succeeded"
            );
        }
        self.send_notification::<Initialized>(&InitializedParams::default())
            .await?;
        Ok(result.capabilities)
    }

    /// Deliberate shutdown. Always ends `Closed`, even when steps fail.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut conn = inner.connection.lock().await;
        let state = self.state();
        if state == SessionState::Closed {
            return;
        }
        inner.set_state(SessionState::Closing);

        if state.accepts_requests() {
            if let Err(e) = self
                .call::<Shutdown>(&(), inner.settings.shutdown_timeout)
                .await
            {
                tracing::debug!(ecosystem = %inner.descriptor.ecosystem(), error = %e, "Shutdown request failed");
            }
            // Best effort: a server that ignored `shutdown` may still honor `exit`.
            let _ = self.send_notification::<Exit>(&()).await;
        }

        let writer_tx = lock(&inner.writer_tx).take();
        if let Some(tx) = writer_tx {
            let _ = tx.send(WriterCommand::Shutdown).await;
        }
        if let Some(connection) = conn.take() {
            connection.close(inner.settings.shutdown_timeout).await;
        }
        inner.pending.fail_all();
        inner.set_state(SessionState::Closed);
        tracing::info!(ecosystem = %inner.descriptor.ecosystem(), "Session closed");
    }

    /// Return a crashed or closed session to `Idle` with a fresh restart budget.
    pub async fn reset(&self) -> bool {
        let inner = &self.inner;
        let mut conn = inner.connection.lock().await;
        if !matches!(self.state(), SessionState::Crashed | SessionState::Closed) {
            return false;
        }
        *conn = None;
        *lock(&inner.writer_tx) = None;
        *lock(&inner.crashed_at) = None;
        inner.restarts.store(0, Ordering::Relaxed);
        inner.failures.store(0, Ordering::Relaxed);
        inner.set_state(SessionState::Idle);
        tracing::info!(ecosystem = %inner.descriptor.ecosystem(), "Session reset");
        true
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Issue a typed request. Fails fast unless Ready or Degraded.
    pub async fn request<R: LspRequest>(&self, params: &R::Params) -> Result<R::Result, SessionError> {
        self.check_ready()?;
        let result = self
            .call::<R>(params, self.inner.settings.request_timeout)
            .await;
        match &result {
            Ok(_) => self.inner.record_success(),
            Err(e) if e.counts_as_failure() => self.inner.record_failure(),
            Err(_) => {}
        }
        result
    }

    pub async fn notify<N: LspNotification>(&self, params: &N::Params) -> Result<(), SessionError> {
        self.check_ready()?;
        self.send_notification::<N>(params).await
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Vec<SymbolRecord>, SessionError> {
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier {
                uri: uri.to_string(),
            },
        };
        let response = self.request::<DocumentSymbolRequest>(&params).await?;
        Ok(response.map(|r| r.into_records(uri)).unwrap_or_default())
    }

    pub async fn find_references(
        &self,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> Result<Vec<Location>, SessionError> {
        let params = ReferenceParams {
            text_document: TextDocumentIdentifier {
                uri: uri.to_string(),
            },
            position,
            context: ReferenceContext {
                include_declaration,
            },
        };
        Ok(self
            .request::<References>(&params)
            .await?
            .unwrap_or_default())
    }

    pub async fn workspace_symbol_search(
        &self,
        query: &str,
    ) -> Result<Vec<SymbolRecord>, SessionError> {
        let params = WorkspaceSymbolParams {
            query: query.to_string(),
        };
        let response = self.request::<WorkspaceSymbolRequest>(&params).await?;
        Ok(response.map(|r| r.into_records()).unwrap_or_default())
    }

    pub async fn did_open(&self, uri: &str, language_id: &str, text: &str) -> Result<(), SessionError> {
        self.notify::<DidOpenTextDocument>(&DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.to_string(),
                language_id: language_id.to_string(),
                version: 1,
                text: text.to_string(),
            },
        })
        .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), SessionError> {
        self.notify::<DidCloseTextDocument>(&DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: uri.to_string(),
            },
        })
        .await
    }

    fn check_ready(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(SessionError::NotReady(state))
        }
    }

    fn writer(&self) -> Result<mpsc::Sender<WriterCommand>, SessionError> {
        lock(&self.inner.writer_tx)
            .clone()
            .ok_or(SessionError::ProcessExit)
    }

    /// Send a request without the state gate or failure accounting.
    async fn call<R: LspRequest>(
        &self,
        params: &R::Params,
        timeout: Duration,
    ) -> Result<R::Result, SessionError> {
        let writer = self.writer()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let params = protocol::params_value(params)
            .map_err(|e| SessionError::Transport(format!("serializing {}: {e}", R::METHOD)))?;
        let bytes = codec::encode(&OutgoingRequest::new(id, R::METHOD, params))
            .map_err(|e| SessionError::Transport(format!("encoding {}: {e}", R::METHOD)))?;

        // Registered before the frame is queued so a fast reply always finds it.
        let reply = self.inner.pending.register(id, R::METHOD, timeout);
        if writer.send(WriterCommand::Send(bytes)).await.is_err() {
            return Err(SessionError::ProcessExit);
        }
        tracing::trace!(id, method = R::METHOD, "Sent LSP request");

        let value = reply.wait().await?;
        serde_json::from_value(value).map_err(|e| SessionError::InvalidResult {
            method: R::METHOD.to_string(),
            message: e.to_string(),
        })
    }

    async fn send_notification<N: LspNotification>(
        &self,
        params: &N::Params,
    ) -> Result<(), SessionError> {
        let writer = self.writer()?;
        let params = protocol::params_value(params)
            .map_err(|e| SessionError::Transport(format!("serializing {}: {e}", N::METHOD)))?;
        let bytes = codec::encode(&OutgoingNotification::new(N::METHOD, params))
            .map_err(|e| SessionError::Transport(format!("encoding {}: {e}", N::METHOD)))?;
        writer
            .send(WriterCommand::Send(bytes))
            .await
            .map_err(|_| SessionError::ProcessExit)
    }
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                ecosystem = %self.descriptor.ecosystem(),
                from = %previous,
                to = %next,
                "Session state changed"
            );
        }
    }

    fn mark_crashed(&self) {
        *lock(&self.writer_tx) = None;
        *lock(&self.crashed_at) = Some(Instant::now());
        let dropped = self.pending.fail_all();
        if dropped > 0 {
            tracing::debug!(ecosystem = %self.descriptor.ecosystem(), dropped, "Failed pending requests");
        }
        self.set_state(SessionState::Crashed);
    }

    /// Stdout closed or failed. Ignored for superseded connections and
    /// deliberate shutdowns.
    fn on_transport_closed(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::Relaxed) != generation {
            return;
        }
        let state = *self.state.borrow();
        if matches!(
            state,
            SessionState::Spawning
                | SessionState::Handshaking
                | SessionState::Ready
                | SessionState::Degraded
        ) {
            tracing::warn!(
                ecosystem = %self.descriptor.ecosystem(),
                reason,
                "Language server connection lost"
            );
            self.mark_crashed();
        }
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.settings.degraded_after {
            let degraded = self.state.send_if_modified(|state| {
                if *state == SessionState::Ready {
                    *state = SessionState::Degraded;
                    true
                } else {
                    false
                }
            });
            if degraded {
                tracing::warn!(
                    ecosystem = %self.descriptor.ecosystem(),
                    failures,
                    "Session degraded"
                );
            }
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        let recovered = self.state.send_if_modified(|state| {
            if *state == SessionState::Degraded {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if recovered {
            tracing::info!(ecosystem = %self.descriptor.ecosystem(), "Session recovered");
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(unix_millis(SystemTime::now()), Ordering::Relaxed);
    }

    async fn dispatch(&self, message: Message, writer_tx: &mpsc::Sender<WriterCommand>) {
        match message {
            Message::Response { id, outcome } => {
                let delivered = id.as_u64().is_some_and(|n| self.pending.resolve(n, outcome));
                if !delivered {
                    tracing::debug!(?id, "Dropping response for unknown or abandoned request");
                }
            }
            Message::Request { id, method, params } => {
                let response = server_request_reply(id, &method, params.as_ref());
                match codec::encode(&response) {
                    Ok(bytes) => {
                        let _ = writer_tx.send(WriterCommand::Send(bytes)).await;
                    }
                    Err(e) => tracing::warn!(%method, "Failed to encode reply: {e}"),
                }
            }
            Message::Notification { method, params } => {
                self.handle_notification(&method, params.unwrap_or(Value::Null));
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        let ecosystem = self.descriptor.ecosystem();
        if matches!(method, "window/logMessage" | "window/showMessage") {
            let text = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match params.get("type").and_then(Value::as_u64) {
                Some(1) => tracing::warn!(%ecosystem, "[server error] {text}"),
                Some(2) => tracing::warn!(%ecosystem, "[server] {text}"),
                _ => tracing::debug!(%ecosystem, "[server] {text}"),
            }
        }

        let listener = lock(&self.listeners).get(method).cloned();
        match listener {
            Some(tx) => {
                let _ = tx.send(params);
            }
            None => tracing::trace!(%ecosystem, method, "Ignoring notification"),
        }
    }
}

/// Reply to a server-to-client request.
///
/// Registration and progress requests are acknowledged; configuration
/// requests get one `null` per requested item.
fn server_request_reply(id: RequestId, method: &str, params: Option<&Value>) -> OutgoingResponse {
    match method {
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => OutgoingResponse::result(id, Value::Null),
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            OutgoingResponse::result(id, Value::Array(vec![Value::Null; items]))
        }
        other => {
            tracing::debug!(method = other, "Unsupported server request, replying method not found");
            OutgoingResponse::method_not_found(id, other)
        }
    }
}

async fn read_loop(
    inner: Weak<SessionInner>,
    generation: u64,
    mut reader: FrameReader<BoxedReader>,
    writer_tx: mpsc::Sender<WriterCommand>,
) {
    let reason = loop {
        let event = reader.next_event().await;
        let Some(session) = inner.upgrade() else {
            return;
        };
        match event {
            Ok(Some(DecodeEvent::Frame(frame))) => {
                session.touch();
                match frame.message() {
                    Ok(message) => session.dispatch(message, &writer_tx).await,
                    Err(e) => {
                        tracing::warn!(ecosystem = %session.descriptor.ecosystem(), "Unroutable frame: {e}");
                        session.record_failure();
                    }
                }
            }
            Ok(Some(DecodeEvent::Error(FrameError::UnexpectedEof))) => {
                break "stream ended mid-frame".to_string();
            }
            Ok(Some(DecodeEvent::Error(e))) => {
                tracing::warn!(ecosystem = %session.descriptor.ecosystem(), "Malformed frame: {e}");
                session.record_failure();
            }
            Ok(None) => break "server closed stdout".to_string(),
            Err(e) => break format!("read error: {e}"),
        }
    };

    if let Some(session) = inner.upgrade() {
        session.on_transport_closed(generation, &reason);
    }
}
