//! Shared fixtures for the LSP integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codescout_lsp::testing::{FakeAction, FakeLauncher, default_actions, symbol_information};
use codescout_lsp::{ClientSession, ServerConfig, ServerDescriptor, SessionSettings};
use codescout_types::EcosystemId;
use serde_json::{Value, json};

pub fn rust_id() -> EcosystemId {
    EcosystemId::new("rust").unwrap()
}

pub fn rust_server() -> ServerConfig {
    ServerConfig {
        command: "fake-rust-analyzer".into(),
        args: vec![],
        language_id: "rust".into(),
        file_extensions: vec!["rs".into()],
        readiness_notification: None,
    }
}

pub fn session(root: &Path, launcher: &FakeLauncher, settings: SessionSettings) -> ClientSession {
    let descriptor = ServerDescriptor::new(rust_id(), rust_server(), root);
    ClientSession::new(descriptor, settings, Arc::new(launcher.clone()))
}

/// A workspace/symbol answer naming the query, so callers can tell whose
/// reply they got.
pub fn echo_symbol(params: &Value) -> Value {
    let query = params["query"].as_str().unwrap_or_default();
    json!([symbol_information(query, 12, "file:///ws/lib.rs", 0, 0)])
}

/// Server that answers `workspace/symbol` after a delay encoded in the
/// query as `name@millis`.
pub fn delayed_echo_launcher() -> FakeLauncher {
    FakeLauncher::new(|method, params| match method {
        "workspace/symbol" => {
            let query = params["query"].as_str().unwrap_or_default();
            let delay = query
                .split_once('@')
                .and_then(|(_, ms)| ms.parse().ok())
                .unwrap_or(0);
            vec![FakeAction::RespondAfter(
                Duration::from_millis(delay),
                echo_symbol(params),
            )]
        }
        other => default_actions(other),
    })
}

pub fn write_workspace(root: &Path, files: &[(&str, &str)]) {
    for (name, body) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }
}
