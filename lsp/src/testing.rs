//! Scriptable in-memory language server for tests.
//!
//! [`FakeLauncher`] implements [`ServerLauncher`] over `tokio::io::duplex`
//! pipes. Every inbound request or notification is passed to a handler that
//! returns the [`FakeAction`]s to perform.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Notify, mpsc};

use crate::codec::{self, DecodeEvent, FrameReader};
use crate::error::SessionError;
use crate::launcher::{LaunchFut, ServerIo, ServerLauncher};
use crate::types::ServerDescriptor;

const PIPE_CAPACITY: usize = 64 * 1024;

const WAIT_LIMIT: Duration = Duration::from_secs(2);

/// What the fake does in response to one inbound message.
#[derive(Debug, Clone)]
pub enum FakeAction {
    Respond(Value),
    RespondError { code: i64, message: String },
    /// Respond after a delay; later messages are handled meanwhile.
    RespondAfter(Duration, Value),
    Notify { method: String, params: Value },
    ServerRequest { method: String, params: Value },
    /// Write raw bytes to the client, framed or not.
    RawBytes(Vec<u8>),
    /// Close the pipes as if the process died.
    Hangup,
}

type Handler = dyn Fn(&str, &Value) -> Vec<FakeAction> + Send + Sync;

struct FakeState {
    handler: Box<Handler>,
    received: Mutex<Vec<Value>>,
    launches: AtomicUsize,
    not_found: AtomicBool,
    hangups: Mutex<Vec<Arc<Notify>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct FakeLauncher {
    state: Arc<FakeState>,
}

/// Replies of a well-behaved server with every capability and no symbols.
#[must_use]
pub fn default_actions(method: &str) -> Vec<FakeAction> {
    match method {
        "initialize" => vec![FakeAction::Respond(json!({
            "capabilities": {
                "documentSymbolProvider": true,
                "referencesProvider": true,
                "workspaceSymbolProvider": true
            },
            "serverInfo": { "name": "fake-ls", "version": "0.0.0" }
        }))],
        "shutdown" => vec![FakeAction::Respond(Value::Null)],
        "textDocument/documentSymbol" | "textDocument/references" | "workspace/symbol" => {
            vec![FakeAction::Respond(json!([]))]
        }
        _ => Vec::new(),
    }
}

/// A flat `SymbolInformation` as servers send it.
#[must_use]
pub fn symbol_information(name: &str, kind: u8, uri: &str, line: u32, character: u32) -> Value {
    let end = character + u32::try_from(name.len()).unwrap_or(0);
    json!({
        "name": name,
        "kind": kind,
        "location": {
            "uri": uri,
            "range": {
                "start": { "line": line, "character": character },
                "end": { "line": line, "character": end }
            }
        }
    })
}

impl FakeLauncher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<FakeAction> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(FakeState {
                handler: Box::new(handler),
                received: Mutex::new(Vec::new()),
                launches: AtomicUsize::new(0),
                not_found: AtomicBool::new(false),
                hangups: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn responsive() -> Self {
        Self::new(|method, _| default_actions(method))
    }

    /// Successful launches so far.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Make every launch fail as if the command were missing from PATH.
    pub fn fail_launches_with_not_found(&self, fail: bool) {
        self.state.not_found.store(fail, Ordering::SeqCst);
    }

    /// Drop every live connection.
    pub fn hangup_all(&self) {
        for hangup in lock(&self.state.hangups).drain(..) {
            hangup.notify_one();
        }
    }

    /// Every message received from clients, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<Value> {
        lock(&self.state.received).clone()
    }

    #[must_use]
    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Poll until `method` has arrived (or the wait limit passes) and return
    /// all methods received.
    pub async fn wait_for_method(&self, method: &str) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let methods = self.received_methods();
            if methods.iter().any(|m| m == method) || tokio::time::Instant::now() >= deadline {
                return methods;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until `count` client replies to server requests have arrived.
    pub async fn wait_for_client_replies(&self, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let replies: Vec<Value> = self
                .received()
                .into_iter()
                .filter(|m| m.get("method").is_none() && m.get("id").is_some())
                .collect();
            if replies.len() >= count || tokio::time::Instant::now() >= deadline {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch<'a>(&'a self, descriptor: &'a ServerDescriptor) -> LaunchFut<'a> {
        Box::pin(async move {
            if self.state.not_found.load(Ordering::SeqCst) {
                return Err(SessionError::LaunchCommandNotFound {
                    command: descriptor.command().to_string(),
                });
            }
            self.state.launches.fetch_add(1, Ordering::SeqCst);

            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let (stdout, stdin) = tokio::io::split(client);
            let hangup = Arc::new(Notify::new());
            lock(&self.state.hangups).push(Arc::clone(&hangup));
            tokio::spawn(serve(Arc::clone(&self.state), server, hangup));

            Ok(ServerIo {
                stdout: Box::new(stdout),
                stdin: Box::new(stdin),
                child: None,
            })
        })
    }
}

fn frame(value: &Value) -> Vec<u8> {
    codec::encode(value).unwrap_or_default()
}

async fn serve(state: Arc<FakeState>, stream: DuplexStream, hangup: Arc<Notify>) {
    let (read, mut write) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FrameReader::new(read);
    let mut next_server_id = 1000u64;

    'serve: loop {
        let event = tokio::select! {
            () = hangup.notified() => break,
            event = reader.next_event() => event,
        };
        let Ok(Some(DecodeEvent::Frame(frame_in))) = event else {
            break;
        };
        let message = frame_in.value().clone();
        lock(&state.received).push(message.clone());

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let id = message.get("id").cloned();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        for action in (state.handler)(method, &params) {
            match action {
                FakeAction::Respond(result) => {
                    if let Some(id) = &id {
                        let _ = out_tx.send(frame(&json!({"jsonrpc": "2.0", "id": id, "result": result})));
                    }
                }
                FakeAction::RespondError { code, message } => {
                    if let Some(id) = &id {
                        let _ = out_tx.send(frame(&json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": code, "message": message }
                        })));
                    }
                }
                FakeAction::RespondAfter(delay, result) => {
                    if let Some(id) = id.clone() {
                        let tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(frame(&json!({"jsonrpc": "2.0", "id": id, "result": result})));
                        });
                    }
                }
                FakeAction::Notify { method, params } => {
                    let _ = out_tx.send(frame(&json!({"jsonrpc": "2.0", "method": method, "params": params})));
                }
                FakeAction::ServerRequest { method, params } => {
                    let _ = out_tx.send(frame(&json!({
                        "jsonrpc": "2.0",
                        "id": next_server_id,
                        "method": method,
                        "params": params
                    })));
                    next_server_id += 1;
                }
                FakeAction::RawBytes(bytes) => {
                    let _ = out_tx.send(bytes);
                }
                FakeAction::Hangup => break 'serve,
            }
        }
    }

    writer.abort();
}
