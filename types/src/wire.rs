//! Payloads of the supervisor's control surface.
//!
//! Requests and responses are camelCase JSON. The proxy validates requests
//! once at the HTTP boundary; everything behind it works on these types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EcosystemId, Location, Position, ResultSource, SessionState, SymbolRecord};

/// Readiness probe answer (`GET /health`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub workspace: String,
    #[serde(default)]
    pub available: Vec<EcosystemId>,
}

/// `POST /symbols` body. An empty `ecosystems` list means every configured one.
///
/// Ecosystem names stay raw strings here so an unknown or malformed name is a
/// client error reported by the handler, not a body-decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSearchRequest {
    pub query: String,
    #[serde(default)]
    pub ecosystems: Vec<String>,
}

/// One symbol in a fanned-out search, tagged with the ecosystem that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolHit {
    pub ecosystem: EcosystemId,
    #[serde(flatten)]
    pub symbol: SymbolRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSearchResponse {
    pub query: String,
    pub ecosystems: Vec<EcosystemOutcome>,
    pub total: usize,
    pub symbols: Vec<SymbolHit>,
}

/// Per-ecosystem result of a fanned-out request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcosystemOutcome {
    pub ecosystem: EcosystemId,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl EcosystemOutcome {
    #[must_use]
    pub fn ok(ecosystem: EcosystemId, source: ResultSource, count: usize) -> Self {
        Self {
            ecosystem,
            status: OutcomeStatus::Ok { source, count },
        }
    }

    #[must_use]
    pub fn failed(ecosystem: EcosystemId, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            ecosystem,
            status: OutcomeStatus::Failed {
                kind,
                error: error.into(),
            },
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, OutcomeStatus::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok { source: ResultSource, count: usize },
    Failed { kind: FailureKind, error: String },
}

/// Why an ecosystem produced no answer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Launch command missing, workspace unreadable, or similar setup problem.
    Configuration,
    /// The restart budget is spent; the session stays down until reset.
    Permanent,
    /// The session could not be brought up and no fallback was possible.
    Session,
}

/// `POST /references` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSearchRequest {
    /// Path of the document, absolute or relative to the workspace root.
    pub document: String,
    pub position: Position,
    #[serde(default)]
    pub include_declaration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSearchResponse {
    pub document: String,
    pub position: Position,
    pub ecosystem: EcosystemId,
    pub source: ResultSource,
    pub references: Vec<Location>,
}

/// Result of the most recent health check of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRecord {
    pub at_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcosystemStatus {
    pub state: SessionState,
    pub restarts: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_health_check: Option<HealthCheckRecord>,
}

/// `GET /status` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub available: Vec<EcosystemId>,
    pub per_ecosystem: BTreeMap<EcosystemId, EcosystemStatus>,
}

/// Error body returned with every non-2xx control-surface response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
}
