//! Realtime event stream modules.
//!
//! - `client`: websocket lifecycle, heartbeat replies and event routing.
//! - `proto`: wire messages shared with the stream endpoint.
//! - `registry`: per-event-type subscriber lists.
//! - `status`: connection states and close-code classification.

/// Websocket connection owner and subscription surface.
pub mod client;
/// Stream protocol messages.
pub mod proto;
/// Subscriber bookkeeping keyed by event type.
pub mod registry;
/// Connection states, status notifications and close handling.
pub mod status;

pub use client::{EventStreamClient, StreamClientError, StreamOptions};
pub use status::{CloseReason, ConnectionState, StreamFault, StreamStatus};
