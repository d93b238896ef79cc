use std::io;
use std::path::PathBuf;
use std::time::Duration;

use codescout_types::{EcosystemId, SessionState};

/// Errors from one client session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("{method} timed out after {after:?}")]
    RequestTimeout { method: String, after: Duration },
    #[error("server error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("language server process exited")]
    ProcessExit,
    #[error("session is {0}, not ready for requests")]
    NotReady(SessionState),
    #[error("restart budget exhausted after {restarts} restarts")]
    RestartBudgetExhausted { restarts: u32 },
    #[error("launch command {command:?} not found in PATH")]
    LaunchCommandNotFound { command: String },
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected result shape for {method}: {message}")]
    InvalidResult { method: String, message: String },
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Failures that count toward the Degraded threshold.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::Protocol { .. } | Self::InvalidResult { .. }
        )
    }

    /// Configuration problems that no restart can fix.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::LaunchCommandNotFound { .. })
    }
}

/// Errors from the multi-workspace client cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown ecosystem {0:?}")]
    UnknownEcosystem(String),
    #[error("no configured language server handles {}", .0.display())]
    UnmanagedFile(PathBuf),
    #[error("workspace {} is unreadable: {source}", path.display())]
    WorkspaceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{ecosystem}: {source}")]
    Session {
        ecosystem: EcosystemId,
        #[source]
        source: SessionError,
    },
    #[error("{ecosystem}: reconnect failed after {attempts} attempts")]
    ReconnectFailed { ecosystem: EcosystemId, attempts: u32 },
}

impl CacheError {
    /// Budget exhausted: the session stays down until an operator reset.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Session {
                source: SessionError::RestartBudgetExhausted { .. },
                ..
            }
        )
    }

    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnknownEcosystem(_) | Self::UnmanagedFile(_) | Self::WorkspaceUnreadable { .. } => {
                true
            }
            Self::Session { source, .. } => source.is_configuration(),
            Self::ReconnectFailed { .. } => false,
        }
    }
}
