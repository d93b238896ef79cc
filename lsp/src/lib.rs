//! LSP client core for codescout.
//!
//! Content-Length framing ([`codec`]), typed JSON-RPC messages
//! ([`protocol`]), one client session per language server ([`session`]),
//! per-ecosystem query adapters with a text-scan fallback ([`adapter`]), and
//! the multi-workspace cache that owns them ([`cache`]).

pub mod adapter;
pub mod cache;
pub mod codec;
pub mod error;
pub mod fallback;
pub mod launcher;
pub mod protocol;
pub mod session;
pub mod ttl;
pub mod types;

pub(crate) mod pending;

/// In-memory language server used by this crate's tests and its dependents'.
#[doc(hidden)]
pub mod testing;

pub use adapter::{EcosystemAdapter, Sourced};
pub use cache::{CachedSession, ClientCache};
pub use error::{CacheError, SessionError};
pub use launcher::{ProcessLauncher, ServerLauncher};
pub use session::{ClientSession, SessionStatus};
pub use types::{
    AdapterSettings, CacheSettings, FallbackSettings, LspSettings, ServerConfig,
    ServerDescriptor, SessionSettings,
};
