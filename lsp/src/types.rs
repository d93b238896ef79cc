//! Public configuration types consumed by the supervisor.
//!
//! The config crate deserializes [`ServerConfig`] from TOML and converts its
//! tunables into [`LspSettings`]. A [`ServerDescriptor`] binds one server
//! config to one workspace root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use codescout_types::EcosystemId;

/// Configuration for a single language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier (e.g. "rust", "python").
    pub language_id: String,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Server notification that signals indexing has finished, if it sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_notification: Option<String>,
}

/// A server config bound to one workspace root. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    ecosystem: EcosystemId,
    config: ServerConfig,
    root: PathBuf,
}

impl ServerDescriptor {
    #[must_use]
    pub fn new(ecosystem: EcosystemId, config: ServerConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            ecosystem,
            config,
            root: root.into(),
        }
    }

    #[must_use]
    pub fn ecosystem(&self) -> &EcosystemId {
        &self.ecosystem
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.config.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.config.args
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.config.language_id
    }

    #[must_use]
    pub fn file_extensions(&self) -> &[String] {
        &self.config.file_extensions
    }

    #[must_use]
    pub fn readiness_notification(&self) -> Option<&str> {
        self.config.readiness_notification.as_deref()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Timeouts and thresholds for one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Consecutive failures after which a Ready session becomes Degraded.
    pub degraded_after: u32,
    pub max_restarts: u32,
    /// Minimum time between a crash and the next respawn.
    pub restart_cooldown: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
            degraded_after: 3,
            max_restarts: 3,
            restart_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSettings {
    pub max_files: usize,
    pub max_file_bytes: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            max_files: 2000,
            max_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Wait after `didOpen` before querying. A workaround for servers that
    /// answer before they have indexed the document, not a guarantee.
    pub settle_delay: Duration,
    pub cache_ttl: Duration,
    pub fallback: FallbackSettings,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            cache_ttl: Duration::from_secs(30),
            fallback: FallbackSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Every tunable of the LSP layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LspSettings {
    pub session: SessionSettings,
    pub adapter: AdapterSettings,
    pub cache: CacheSettings,
}
