//! Proxy process and its owner-side monitor.
//!
//! The proxy (`codescout serve`) holds the language-server sessions for one
//! workspace and serves them over loopback HTTP. Short-lived callers reach it
//! through [`ProxyClient`] and keep it alive with [`ProxyMonitor`].

pub mod client;
pub mod error;
pub mod health;
pub mod monitor;
pub mod proxy;

pub use client::{ClientError, ProxyClient};
pub use error::ApiError;
pub use monitor::{
    CommandSpawner, GateDecision, HttpEndpoint, MonitorError, MonitorStatus, ProbeOutcome,
    ProxyEndpoint, ProxyHandle, ProxyMonitor, ProxySpawner, RestartGate,
};
pub use proxy::{ProxyState, router, serve, serve_on};
