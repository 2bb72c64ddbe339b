//! Wire messages exchanged with the event-stream endpoint.
//!
//! Inbound frames are decoded once into [`ServerMessage`]; domain payloads
//! stay as raw JSON and are only routed by their `event_type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type of a heartbeat probe sent by the server.
pub const PING_TYPE: &str = "ping";
/// Message type of a routable domain event.
pub const EVENT_TYPE: &str = "event";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Heartbeat probe; answered with [`ClientMessage::Pong`].
    Ping,
    /// Domain event routed to subscribers of `event_type`.
    Event {
        event_type: Option<String>,
        data: Value,
    },
    /// Any other message, kept verbatim for raw listeners.
    Other { kind: String, payload: Value },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Decodes a text frame. Only malformed JSON is an error; well-formed
    /// messages of unknown shape become [`ServerMessage::Other`].
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let Ok(envelope) = Envelope::deserialize(&value) else {
            return Self::Other {
                kind: String::new(),
                payload: value,
            };
        };

        match envelope.kind.as_str() {
            PING_TYPE => Self::Ping,
            EVENT_TYPE => Self::Event {
                event_type: envelope.event_type,
                data: envelope.data.unwrap_or(Value::Null),
            },
            _ => Self::Other {
                kind: envelope.kind,
                payload: value,
            },
        }
    }

    /// The envelope `type` of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Ping => PING_TYPE,
            Self::Event { .. } => EVENT_TYPE,
            Self::Other { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ClientMessage, ServerMessage};

    #[test]
    fn pong_encodes_as_typed_envelope() {
        let text = ClientMessage::Pong.to_text().expect("encode");
        assert_eq!(text, r#"{"type":"pong"}"#);
        assert_eq!(
            ClientMessage::from_text(&text).expect("decode"),
            ClientMessage::Pong
        );
    }

    #[test]
    fn decodes_ping() {
        let msg = ServerMessage::from_text(r#"{"type":"ping","ts":1}"#).expect("decode");
        assert_eq!(msg, ServerMessage::Ping);
        assert_eq!(msg.kind(), "ping");
    }

    #[test]
    fn decodes_event_with_data() {
        let msg = ServerMessage::from_text(
            r#"{"type":"event","event_type":"booking.created","data":{"id":7}}"#,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ServerMessage::Event {
                event_type: Some("booking.created".to_string()),
                data: json!({"id": 7}),
            }
        );
    }

    #[test]
    fn event_without_type_or_data_still_decodes() {
        let msg = ServerMessage::from_text(r#"{"type":"event"}"#).expect("decode");
        assert_eq!(
            msg,
            ServerMessage::Event {
                event_type: None,
                data: serde_json::Value::Null,
            }
        );
    }

    #[test]
    fn unknown_and_untyped_messages_are_kept_verbatim() {
        let msg = ServerMessage::from_text(r#"{"type":"welcome","user":3}"#).expect("decode");
        assert_eq!(msg.kind(), "welcome");
        let expected = json!({"type": "welcome", "user": 3});
        assert!(matches!(msg, ServerMessage::Other { payload, .. } if payload == expected));

        let msg = ServerMessage::from_text("[1,2]").expect("decode");
        assert!(matches!(msg, ServerMessage::Other { ref kind, .. } if kind.is_empty()));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ServerMessage::from_text("{not json").is_err());
    }
}
