//! In-flight request table.
//!
//! Each entry is removed exactly once: by the response path or by the waiter
//! when its deadline passes. The response path sends while still holding the
//! table lock, so a waiter that times out and finds its entry gone is
//! guaranteed to find the reply already in its channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::protocol::ResponseError;

pub(crate) type Reply = Result<Value, ResponseError>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Reply>,
}

#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    inner: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

/// Receiving half of one registered request.
///
/// Dropping it unanswered removes the entry, so cancelled callers do not leak.
pub(crate) struct PendingReply {
    id: u64,
    method: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
    table: PendingTable,
    settled: bool,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: u64, method: &str, timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );
        PendingReply {
            id,
            method: method.to_string(),
            timeout,
            deadline,
            rx,
            table: self.clone(),
            settled: false,
        }
    }

    /// Deliver a response. Returns false for unknown or already-abandoned ids.
    pub fn resolve(&self, id: u64, reply: Reply) -> bool {
        let mut table = self.lock();
        match table.remove(&id) {
            Some(entry) => {
                if entry.tx.send(reply).is_err() {
                    tracing::debug!(id, method = %entry.method, "Waiter gone before response");
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Drop every entry; their waiters observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl PendingReply {
    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<Value, SessionError> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::ProcessExit),
            Err(_) => {
                if self.table.remove(self.id) {
                    Err(SessionError::RequestTimeout {
                        method: self.method.clone(),
                        after: self.timeout,
                    })
                } else {
                    // The response path won the race.
                    self.rx.try_recv().map_err(|_| SessionError::ProcessExit)
                }
            }
        };
        self.settled = true;

        outcome?.map_err(|e| SessionError::Protocol {
            code: e.code,
            message: e.message,
        })
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.table.remove(self.id);
        }
    }
}
