//! Response correlation under out-of-order replies.

use std::time::Duration;

use codescout_lsp::{SessionError, SessionSettings};

use crate::common::{delayed_echo_launcher, session};

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let session = session(dir.path(), &launcher, SessionSettings::default());
    session.ensure_ready().await.unwrap();

    // The first request is answered last.
    let (slow, fast) = tokio::join!(
        session.workspace_symbol_search("slow@200"),
        session.workspace_symbol_search("fast@10"),
    );
    let slow = slow.unwrap();
    let fast = fast.unwrap();
    assert_eq!(slow[0].name(), "slow@200");
    assert_eq!(fast[0].name(), "fast@10");
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn many_concurrent_requests_each_get_their_own_reply() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let session = session(dir.path(), &launcher, SessionSettings::default());
    session.ensure_ready().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let session = session.clone();
        // Later requests reply sooner.
        let query = format!("q{i}@{}", (16 - i) * 5);
        handles.push(tokio::spawn(async move {
            let records = session.workspace_symbol_search(&query).await.unwrap();
            (query, records)
        }));
    }
    for handle in handles {
        let (query, records) = handle.await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), query);
    }
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let settings = SessionSettings {
        request_timeout: Duration::from_millis(50),
        ..SessionSettings::default()
    };
    let session = session(dir.path(), &launcher, settings);
    session.ensure_ready().await.unwrap();

    let err = session.workspace_symbol_search("late@150").await.unwrap_err();
    assert!(matches!(err, SessionError::RequestTimeout { .. }), "{err}");
    assert_eq!(session.pending_requests(), 0);

    // Let the orphaned reply arrive, then confirm the session is unaffected.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let records = session.workspace_symbol_search("next@0").await.unwrap();
    assert_eq!(records[0].name(), "next@0");
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn crash_fails_every_in_flight_request() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let session = session(dir.path(), &launcher, SessionSettings::default());
    session.ensure_ready().await.unwrap();

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::join!(
                session.workspace_symbol_search("a@5000"),
                session.workspace_symbol_search("b@5000"),
            )
        })
    };
    while session.pending_requests() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    launcher.hangup_all();

    let (a, b) = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("crash must settle pending requests")
        .unwrap();
    assert!(matches!(a, Err(SessionError::ProcessExit)));
    assert!(matches!(b, Err(SessionError::ProcessExit)));
    assert_eq!(session.pending_requests(), 0);
}
