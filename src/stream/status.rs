//! Connection state, status notifications and close-code classification.

use std::sync::Arc;

use crate::stream::proto::ServerMessage;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TLS_HANDSHAKE: u16 = 1015;

/// Why a physical connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport did not open within the establishment window.
    Timeout,
    /// `disconnect` was called.
    UserInitiated,
    /// The transport closed, or failed, with a close code.
    Remote { code: u16, reason: String },
}

/// Lifecycle of the single connection owned by a stream client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed(CloseReason),
}

/// Describes a closure that the caller should surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFault {
    pub message: String,
    /// Fatal faults need re-authentication before reconnecting.
    pub fatal: bool,
    pub code: Option<u16>,
}

/// Notification delivered to status listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(StreamFault),
}

impl StreamStatus {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Error(fault) if fault.fatal)
    }
}

pub type StatusCallback = Arc<dyn Fn(&StreamStatus) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Maps a close code and reason to the status reported to listeners.
pub fn classify_close(code: u16, reason: &str) -> StreamStatus {
    match code {
        CLOSE_NORMAL => StreamStatus::Disconnected,
        CLOSE_POLICY_VIOLATION => StreamStatus::Error(StreamFault {
            message: "Authorization was denied by the server. Please sign in again.".to_string(),
            fatal: true,
            code: Some(code),
        }),
        CLOSE_ABNORMAL => StreamStatus::Error(StreamFault {
            message: "Connection lost. The server may be unreachable.".to_string(),
            fatal: false,
            code: Some(code),
        }),
        _ => {
            let message = if reason.is_empty() {
                format!("Connection closed unexpectedly (code {code}).")
            } else {
                format!("Connection closed unexpectedly (code {code}: {reason}).")
            };
            StreamStatus::Error(StreamFault {
                message,
                fatal: false,
                code: Some(code),
            })
        }
    }
}

/// Status reported when a connection ends for `reason`.
pub fn status_for(reason: &CloseReason) -> Option<StreamStatus> {
    match reason {
        CloseReason::UserInitiated => None,
        CloseReason::Timeout => Some(StreamStatus::Error(StreamFault {
            message: "Timed out connecting to the event stream.".to_string(),
            fatal: false,
            code: None,
        })),
        CloseReason::Remote { code, reason } => Some(classify_close(*code, reason)),
    }
}
