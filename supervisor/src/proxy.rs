//! The proxy process: an HTTP control surface over one workspace's
//! [`ClientCache`].
//!
//! Language servers talk over the proxy's stdio pipes, so callers reach them
//! through loopback HTTP instead of sharing a process with them.

use std::collections::BTreeMap;
use std::{fmt, io};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use codescout_lsp::{CacheError, ClientCache, EcosystemAdapter};
use codescout_types::wire::{
    EcosystemOutcome, EcosystemStatus, FailureKind, HealthCheckRecord, ReadinessResponse,
    ReferenceSearchRequest, ReferenceSearchResponse, StatusResponse, SymbolHit,
    SymbolSearchRequest, SymbolSearchResponse,
};
use codescout_types::{EcosystemId, SessionState};

use crate::error::ApiError;
use crate::health;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the handlers share.
pub struct ProxyState {
    workspace: PathBuf,
    cache: Arc<ClientCache>,
    health_interval: Duration,
    health: Mutex<BTreeMap<EcosystemId, HealthCheckRecord>>,
    shutdown: Notify,
}

impl fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("workspace", &self.workspace)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ProxyState {
    /// `workspace` must already be canonical; it is compared against the
    /// cache's canonical roots.
    #[must_use]
    pub fn new(workspace: PathBuf, cache: Arc<ClientCache>, health_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            workspace,
            cache,
            health_interval,
            health: Mutex::new(BTreeMap::new()),
            shutdown: Notify::new(),
        })
    }

    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    #[must_use]
    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn record_health(&self, ecosystem: EcosystemId, record: HealthCheckRecord) {
        lock(&self.health).insert(ecosystem, record);
    }

    #[must_use]
    pub fn last_health_check(&self, ecosystem: &EcosystemId) -> Option<HealthCheckRecord> {
        lock(&self.health).get(ecosystem).cloned()
    }

    /// Ask [`serve`] to stop. Safe to call before it starts waiting.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Per-ecosystem snapshot for this workspace. Ecosystems without a
    /// session yet report `idle`; `available` lists those that accept
    /// requests right now.
    #[must_use]
    pub fn status(&self) -> StatusResponse {
        let mut per_ecosystem: BTreeMap<EcosystemId, EcosystemStatus> = self
            .cache
            .ecosystems()
            .iter()
            .map(|eco| {
                let status = EcosystemStatus {
                    state: SessionState::Idle,
                    restarts: 0,
                    consecutive_failures: 0,
                    last_health_check: self.last_health_check(eco),
                };
                (eco.clone(), status)
            })
            .collect();

        for cached in self.cache.statuses() {
            if cached.root != self.workspace {
                continue;
            }
            if let Some(entry) = per_ecosystem.get_mut(&cached.ecosystem) {
                entry.state = cached.status.state;
                entry.restarts = cached.status.restarts;
                entry.consecutive_failures = cached.status.consecutive_failures;
            }
        }

        let available = per_ecosystem
            .iter()
            .filter(|(_, status)| status.state.accepts_requests())
            .map(|(eco, _)| eco.clone())
            .collect();

        StatusResponse {
            available,
            per_ecosystem,
        }
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/symbols", post(search_symbols))
        .route("/references", post(find_references))
        .route("/status", get(status))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Bind the loopback port and serve until shutdown is requested.
pub async fn serve(state: Arc<ProxyState>, port: u16) -> io::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already bound listener. Closes every session on the way out.
pub async fn serve_on(listener: TcpListener, state: Arc<ProxyState>) -> io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, workspace = %state.workspace.display(), "Proxy listening");

    let health_task = tokio::spawn(health::run(Arc::clone(&state), state.health_interval));
    let app = router(Arc::clone(&state));
    let result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let state = Arc::clone(&state);
            async move {
                state.shutdown.notified().await;
                tracing::info!("Proxy shutting down");
            }
        })
        .await;

    health_task.abort();
    let closed = state.cache.disconnect_all().await;
    tracing::info!(closed, "Proxy stopped");
    result
}

async fn health_check(State(state): State<Arc<ProxyState>>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        ready: true,
        workspace: state.workspace.display().to_string(),
        available: state.cache.ecosystems(),
    })
}

async fn status(State(state): State<Arc<ProxyState>>) -> Json<StatusResponse> {
    Json(state.status())
}

async fn shutdown(State(state): State<Arc<ProxyState>>) -> StatusCode {
    state.request_shutdown();
    StatusCode::ACCEPTED
}

async fn search_symbols(
    State(state): State<Arc<ProxyState>>,
    payload: Result<Json<SymbolSearchRequest>, JsonRejection>,
) -> Result<Json<SymbolSearchResponse>, ApiError> {
    let Json(request) = payload?;
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let ecosystems = select_ecosystems(&state, &request.ecosystems)?;

    let results = join_all(
        ecosystems
            .into_iter()
            .map(|eco| search_ecosystem(&state, eco, query)),
    )
    .await;

    let mut outcomes = Vec::with_capacity(results.len());
    let mut symbols = Vec::new();
    for (outcome, hits) in results {
        outcomes.push(outcome);
        symbols.extend(hits);
    }
    tracing::debug!(query, total = symbols.len(), "Symbol search");

    Ok(Json(SymbolSearchResponse {
        query: query.to_string(),
        ecosystems: outcomes,
        total: symbols.len(),
        symbols,
    }))
}

fn select_ecosystems(state: &ProxyState, requested: &[String]) -> Result<Vec<EcosystemId>, ApiError> {
    let configured = state.cache.ecosystems();
    if requested.is_empty() {
        return Ok(configured);
    }
    let mut selected = Vec::with_capacity(requested.len());
    for name in requested {
        let id = EcosystemId::new(name.as_str())
            .ok()
            .filter(|id| configured.contains(id))
            .ok_or_else(|| ApiError::bad_request(format!("unknown ecosystem {name:?}")))?;
        if !selected.contains(&id) {
            selected.push(id);
        }
    }
    Ok(selected)
}

/// Adapter to query for one ecosystem, or the outcome explaining why there
/// is none. A session that cannot be brought up still yields an adapter,
/// which answers from the text fallback.
async fn adapter_or_outcome(
    state: &ProxyState,
    ecosystem: &EcosystemId,
) -> Result<EcosystemAdapter, EcosystemOutcome> {
    let cache = &state.cache;
    match cache.ensure_session(ecosystem, &state.workspace).await {
        Ok(adapter) => Ok(adapter),
        Err(e) if e.is_permanent() => Err(EcosystemOutcome::failed(
            ecosystem.clone(),
            FailureKind::Permanent,
            e.to_string(),
        )),
        Err(e) if e.is_configuration() => Err(EcosystemOutcome::failed(
            ecosystem.clone(),
            FailureKind::Configuration,
            e.to_string(),
        )),
        Err(e) => {
            tracing::debug!(%ecosystem, error = %e, "Session unavailable, using fallback");
            cache
                .adapter(ecosystem, &state.workspace)
                .await
                .map_err(|e: CacheError| {
                    EcosystemOutcome::failed(ecosystem.clone(), FailureKind::Session, e.to_string())
                })
        }
    }
}

async fn search_ecosystem(
    state: &ProxyState,
    ecosystem: EcosystemId,
    query: &str,
) -> (EcosystemOutcome, Vec<SymbolHit>) {
    let adapter = match adapter_or_outcome(state, &ecosystem).await {
        Ok(adapter) => adapter,
        Err(outcome) => {
            tracing::warn!(%ecosystem, ?outcome, "Ecosystem failed in fan-out");
            return (outcome, Vec::new());
        }
    };
    let result = adapter.workspace_symbols(query).await;
    let hits: Vec<SymbolHit> = result
        .items
        .into_iter()
        .map(|symbol| SymbolHit {
            ecosystem: ecosystem.clone(),
            symbol,
        })
        .collect();
    (
        EcosystemOutcome::ok(ecosystem, result.source, hits.len()),
        hits,
    )
}

async fn find_references(
    State(state): State<Arc<ProxyState>>,
    payload: Result<Json<ReferenceSearchRequest>, JsonRejection>,
) -> Result<Json<ReferenceSearchResponse>, ApiError> {
    let Json(request) = payload?;
    if request.document.trim().is_empty() {
        return Err(ApiError::bad_request("document must not be empty"));
    }
    let path = tokio::fs::canonicalize(state.workspace.join(&request.document))
        .await
        .ok()
        .filter(|path| path.is_file() && path.starts_with(&state.workspace))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "document {:?} is not a file inside the workspace",
                request.document
            ))
        })?;
    let ecosystem = state
        .cache
        .ecosystem_for_path(&path)
        .cloned()
        .ok_or_else(|| ApiError::from(CacheError::UnmanagedFile(path.clone())))?;

    let adapter = match state.cache.ensure_session(&ecosystem, &state.workspace).await {
        Ok(adapter) => adapter,
        Err(e) if e.is_permanent() || e.is_configuration() => return Err(e.into()),
        Err(e) => {
            tracing::debug!(%ecosystem, error = %e, "Session unavailable, using fallback");
            state.cache.adapter(&ecosystem, &state.workspace).await?
        }
    };

    let result = adapter
        .find_references(&path, request.position, request.include_declaration)
        .await;
    Ok(Json(ReferenceSearchResponse {
        document: request.document,
        position: request.position,
        ecosystem,
        source: result.source,
        references: result.items,
    }))
}
