//! Core domain types for codescout.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The LSP core produces these types; the supervisor's control surface serializes them.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod symbol;
pub mod wire;

pub use symbol::{Location, Position, Range, ResultSource, SymbolKind, SymbolRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ============================================================================
// Ecosystem identity
// ============================================================================

/// Identifier of one managed language toolchain (e.g. `rust`, `python`).
///
/// Always non-empty, lowercase ASCII alphanumerics plus `-` and `_`. Validated at
/// construction so every map keyed by ecosystem compares canonical values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EcosystemId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EcosystemIdError {
    #[error("ecosystem name must not be empty")]
    Empty,
    #[error("invalid character {ch:?} in ecosystem name {name:?}")]
    InvalidChar { name: String, ch: char },
}

impl EcosystemId {
    pub fn new(value: impl Into<String>) -> Result<Self, EcosystemIdError> {
        let value = value.into().trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(EcosystemIdError::Empty);
        }
        if let Some(ch) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(EcosystemIdError::InvalidChar { name: value, ch });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EcosystemId {
    type Error = EcosystemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EcosystemId {
    type Error = EcosystemIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EcosystemId> for String {
    fn from(value: EcosystemId) -> Self {
        value.0
    }
}

impl fmt::Display for EcosystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EcosystemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Connection state of one client session.
///
/// `Crashed` is terminal once the restart budget is spent; only an explicit
/// reset moves it back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Spawning,
    Handshaking,
    Ready,
    Degraded,
    Crashed,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether requests may be issued in this state.
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Time helpers
// ============================================================================

/// Milliseconds since the Unix epoch, saturating at zero for clocks set before 1970.
#[must_use]
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ecosystem_id_is_normalized() {
        let id = EcosystemId::new("  Rust ").unwrap();
        assert_eq!(id.as_str(), "rust");
    }

    #[test]
    fn ecosystem_id_rejects_empty() {
        assert_eq!(EcosystemId::new("   "), Err(EcosystemIdError::Empty));
    }

    #[test]
    fn ecosystem_id_rejects_path_characters() {
        let err = EcosystemId::new("rust/../x").unwrap_err();
        assert!(matches!(err, EcosystemIdError::InvalidChar { ch: '/', .. }));
    }

    #[test]
    fn ecosystem_id_serde_validates() {
        let ok: EcosystemId = serde_json::from_str("\"typescript\"").unwrap();
        assert_eq!(ok.as_str(), "typescript");
        assert!(serde_json::from_str::<EcosystemId>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"typescript\"");
    }

    #[test]
    fn session_state_request_gate() {
        assert!(SessionState::Ready.accepts_requests());
        assert!(SessionState::Degraded.accepts_requests());
        for state in [
            SessionState::Idle,
            SessionState::Spawning,
            SessionState::Handshaking,
            SessionState::Crashed,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert!(!state.accepts_requests(), "{state} must not accept requests");
        }
    }

    #[test]
    fn session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn unix_millis_before_epoch_is_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(unix_millis(before), 0);
    }
}
