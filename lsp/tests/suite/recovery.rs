//! Bounded restart behaviour.

use std::time::Duration;

use codescout_lsp::testing::{FakeAction, FakeLauncher, default_actions};
use codescout_lsp::{SessionError, SessionSettings};
use codescout_types::SessionState;

use crate::common::session;

fn settings(max_restarts: u32) -> SessionSettings {
    SessionSettings {
        max_restarts,
        restart_cooldown: Duration::from_millis(20),
        ..SessionSettings::default()
    }
}

#[tokio::test]
async fn restarts_never_exceed_budget() {
    let dir = tempfile::tempdir().unwrap();
    // Every query kills the server.
    let launcher = FakeLauncher::new(|method, _| match method {
        "workspace/symbol" => vec![FakeAction::Hangup],
        other => default_actions(other),
    });
    let session = session(dir.path(), &launcher, settings(3));

    let mut exhausted = false;
    for _ in 0..10 {
        match session.ensure_ready().await {
            Ok(()) => {
                let err = session.workspace_symbol_search("boom").await.unwrap_err();
                assert!(matches!(err, SessionError::ProcessExit), "{err}");
                assert!(session.status().restarts <= 3);
            }
            Err(SessionError::RestartBudgetExhausted { restarts }) => {
                assert_eq!(restarts, 3);
                exhausted = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(exhausted);
    assert_eq!(launcher.launches(), 4, "initial launch plus three restarts");
    assert_eq!(session.state(), SessionState::Crashed);
}

#[tokio::test]
async fn restart_waits_out_the_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::responsive();
    let session = session(
        dir.path(),
        &launcher,
        SessionSettings {
            restart_cooldown: Duration::from_millis(300),
            ..SessionSettings::default()
        },
    );
    session.ensure_ready().await.unwrap();

    launcher.hangup_all();
    let mut state = session.watch_state();
    state
        .wait_for(|s| *s == SessionState::Crashed)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    session.ensure_ready().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(session.status().restarts, 1);
}

#[tokio::test]
async fn reset_restores_the_budget() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(|method, _| match method {
        "initialize" => vec![FakeAction::Hangup],
        other => default_actions(other),
    });
    let session = session(dir.path(), &launcher, settings(1));

    assert!(session.ensure_ready().await.is_err());
    assert!(session.ensure_ready().await.is_err());
    assert!(matches!(
        session.ensure_ready().await,
        Err(SessionError::RestartBudgetExhausted { restarts: 1 })
    ));
    assert_eq!(launcher.launches(), 2);

    assert!(session.reset().await);
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.ensure_ready().await.is_err());
    assert_eq!(launcher.launches(), 3);
    assert_eq!(session.status().restarts, 0);
}
