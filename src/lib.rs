//! Authenticated access layer for the portal backend.
//!
//! The crate is organized by concern:
//! - `credentials`: the shared credential store and its persistence.
//! - `api`: HTTP client that attaches credentials and recovers from expiry.
//! - `refresh`: single-flight credential refresh.
//! - `stream`: realtime websocket client with heartbeat and pub/sub.
//! - `redact`: masking of sensitive fields before logging.
//! - `retry`: shared retry and timeout utilities.

/// Request client with transparent refresh-and-replay.
pub mod api;
/// Credential set, store and session storage backends.
pub mod credentials;
/// Log redaction helpers.
pub mod redact;
/// Refresh operation, coordinator and session boundary.
pub mod refresh;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Realtime event stream client, protocol types and status handling.
pub mod stream;

mod sync;

pub use api::{ApiClient, ApiClientOptions, ApiError, ApiRequest, ApiResponse};
pub use credentials::{CredentialSet, CredentialStore, FileStorage, MemoryStorage, SessionStorage};
pub use refresh::{
    HttpRefresher, RefreshCoordinator, RefreshError, RefreshOperation, SessionBoundary,
};
pub use stream::{EventStreamClient, StreamOptions, StreamStatus};
