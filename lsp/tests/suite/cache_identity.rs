//! One session per (ecosystem, workspace) and independent teardown.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codescout_lsp::testing::FakeLauncher;
use codescout_lsp::{CacheSettings, ClientCache, LspSettings, SessionSettings};
use codescout_types::{ResultSource, SessionState};

use crate::common::{delayed_echo_launcher, rust_id, rust_server, write_workspace};

fn cache(launcher: &FakeLauncher) -> ClientCache {
    let mut servers = BTreeMap::new();
    servers.insert(rust_id(), rust_server());
    let settings = LspSettings {
        session: SessionSettings {
            restart_cooldown: Duration::from_millis(10),
            ..SessionSettings::default()
        },
        cache: CacheSettings {
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
        },
        ..LspSettings::default()
    };
    ClientCache::new(servers, settings, Arc::new(launcher.clone()))
}

#[tokio::test]
async fn concurrent_workspaces_get_distinct_sessions() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let cache = cache(&launcher);

    let rust = rust_id();
    let (a1, a2, b1, b2) = tokio::join!(
        cache.ensure_session(&rust, a.path()),
        cache.ensure_session(&rust, a.path()),
        cache.ensure_session(&rust, b.path()),
        cache.ensure_session(&rust, b.path()),
    );
    let (a1, a2, b1, b2) = (a1.unwrap(), a2.unwrap(), b1.unwrap(), b2.unwrap());

    assert!(a1.session().same_session(a2.session()));
    assert!(b1.session().same_session(b2.session()));
    assert!(!a1.session().same_session(b1.session()));
    assert_eq!(launcher.launches(), 2);

    let statuses = cache.statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.status.state == SessionState::Ready));
}

#[tokio::test]
async fn disconnecting_one_workspace_leaves_the_other_running() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let launcher = delayed_echo_launcher();
    let cache = cache(&launcher);

    let sa = cache.ensure_session(&rust_id(), a.path()).await.unwrap();
    let sb = cache.ensure_session(&rust_id(), b.path()).await.unwrap();

    assert_eq!(cache.disconnect_workspace(a.path()).await, 1);
    assert_eq!(sa.session().state(), SessionState::Closed);
    assert_eq!(sb.session().state(), SessionState::Ready);

    let result = sb.workspace_symbols("still@0").await;
    assert_eq!(result.source, ResultSource::Semantic);
    assert_eq!(result.items[0].name(), "still@0");

    // Workspace `a` gets a fresh session on demand.
    let again = cache.ensure_session(&rust_id(), a.path()).await.unwrap();
    assert!(!again.session().same_session(sa.session()));
    assert_eq!(launcher.launches(), 3);
}

#[tokio::test]
async fn files_route_by_extension_and_fall_back_when_down() {
    let ws = tempfile::tempdir().unwrap();
    write_workspace(
        ws.path(),
        &[("src/lib.rs", "pub struct Config;\npub fn load() -> Config { Config }\n")],
    );
    let launcher = FakeLauncher::responsive();
    launcher.fail_launches_with_not_found(true);
    let cache = cache(&launcher);

    let file = ws.path().join("src/lib.rs");
    let adapter = cache.adapter_for_file(ws.path(), &file).await.unwrap();
    assert_eq!(adapter.ecosystem(), &rust_id());

    let err = cache.ensure_session(&rust_id(), ws.path()).await.unwrap_err();
    assert!(err.is_configuration());

    // The evicted key hands out an idle adapter, which answers from text.
    let adapter = cache.adapter_for_file(ws.path(), &file).await.unwrap();
    let symbols = adapter.document_symbols(&file).await;
    assert!(symbols.source.is_fallback());
    let names: Vec<&str> = symbols.items.iter().map(|s| s.name()).collect();
    assert_eq!(names, ["Config", "load"]);

    assert!(
        cache
            .adapter_for_file(ws.path(), Path::new("README.md"))
            .await
            .is_err()
    );
}
