//! Periodic session health checks inside the proxy.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;

use codescout_types::wire::HealthCheckRecord;
use codescout_types::{SessionState, unix_millis};

use codescout_lsp::{EcosystemAdapter, SessionError};

use crate::proxy::ProxyState;

/// Budget for the request that proves a live session still answers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Check every `interval` until the task is aborted. The first check runs
/// one interval after start.
pub async fn run(state: Arc<ProxyState>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let checked = check_sessions(&state).await;
        tracing::trace!(checked, "Health check pass");
    }
}

/// One pass over this workspace's cached sessions. Live sessions must
/// answer a cheap request, crashed ones are restarted through the cache
/// while their budget lasts. Idle and closed sessions are skipped.
pub async fn check_sessions(state: &ProxyState) -> usize {
    check_sessions_within(state, REQUEST_TIMEOUT).await
}

async fn check_sessions_within(state: &ProxyState, request_timeout: Duration) -> usize {
    let mut checked = 0;
    for cached in state.cache().statuses() {
        if cached.root != state.workspace() {
            continue;
        }
        if !matches!(
            cached.status.state,
            SessionState::Ready | SessionState::Degraded | SessionState::Crashed
        ) {
            continue;
        }

        let result = match state
            .cache()
            .ensure_session(&cached.ecosystem, state.workspace())
            .await
        {
            Ok(adapter) => answers(&adapter, request_timeout).await,
            Err(e) => Err(e.to_string()),
        };
        let record = match result {
            Ok(_) => {
                if cached.status.state == SessionState::Crashed {
                    tracing::info!(ecosystem = %cached.ecosystem, "Health check restarted session");
                }
                HealthCheckRecord {
                    at_ms: unix_millis(SystemTime::now()),
                    ok: true,
                    error: None,
                }
            }
            Err(error) => {
                tracing::warn!(ecosystem = %cached.ecosystem, %error, "Health check failed");
                HealthCheckRecord {
                    at_ms: unix_millis(SystemTime::now()),
                    ok: false,
                    error: Some(error),
                }
            }
        };
        state.record_health(cached.ecosystem, record);
        checked += 1;
    }
    checked
}

/// A workspace symbol query for nothing. An error reply still proves the
/// server reads its input; silence or a dead pipe does not.
async fn answers(adapter: &EcosystemAdapter, request_timeout: Duration) -> Result<(), String> {
    let session = adapter.session();
    if !session.capabilities().workspace_symbols() {
        return Ok(());
    }
    match tokio::time::timeout(request_timeout, session.workspace_symbol_search("")).await {
        Ok(Ok(_) | Err(SessionError::Protocol { .. })) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!(
            "no reply to workspace/symbol within {}ms",
            request_timeout.as_millis()
        )),
    }
}
