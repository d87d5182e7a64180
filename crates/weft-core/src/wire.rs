//! Wire envelope for all channel traffic.
//!
//! Every frame on a peer or proxy connection is a UTF-8 JSON text frame
//! carrying this envelope. Empty fields are omitted on the wire; a receiver
//! treats an absent field as the empty string. Malformed frames are dropped
//! silently; they are never fatal for the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Timers ────────────────────────────────────────────────────────────────────

/// Time allowed to complete a single write on any connection.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between received pongs before a connection is considered
/// dead. Only a pong refreshes the deadline; a healthy connection stays
/// inside it through the peer's ping ticker.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval. Must be less than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound frame size in bytes. Larger frames terminate the connection.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Capacity of a channel's broadcast buffer. A producer that finds the buffer
/// full blocks until the dispatcher drains it.
pub const BROADCAST_BUFFER: usize = 512;

/// Subprotocol token required on every federated proxy connection.
pub const PROXY_SUBPROTOCOL: &str = "nws-proxy-draft-01";

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The five actions a frame can carry.
///
/// `connect` and `disconnect` are server-to-client membership notifications on
/// peer connections; on proxy connections they mirror the remote roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireAction {
    Status,
    Connect,
    Disconnect,
    Message,
    Broadcast,
}

/// One wire frame. `from_proxy` never crosses the wire. It records whether
/// the frame arrived via a proxy connection so the dispatcher can suppress
/// remote re-broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub action: WireAction,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,

    #[serde(skip)]
    pub from_proxy: bool,
}

impl WireMessage {
    pub fn new(action: WireAction, source: &str, target: &str, data: &str) -> Self {
        Self {
            action,
            source: source.to_string(),
            target: target.to_string(),
            data: data.to_string(),
            from_proxy: false,
        }
    }
}

/// Encode a frame for the wire.
pub fn encode(
    action: WireAction,
    source: &str,
    target: &str,
    data: &str,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireMessage::new(action, source, target, data))
}

/// Decode a frame from the wire. Malformed input yields `None`.
pub fn decode(buf: &str) -> Option<WireMessage> {
    serde_json::from_str(buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_omits_empty_fields() {
        let json = encode(WireAction::Broadcast, "123", "", "hello").unwrap();
        assert!(json.contains("\"action\":\"broadcast\""));
        assert!(json.contains("\"source\":\"123\""));
        assert!(json.contains("\"data\":\"hello\""));
        assert!(!json.contains("target"));
    }

    #[test]
    fn decode_fills_absent_fields_with_empty() {
        let message = decode(r#"{"action":"status"}"#).unwrap();
        assert_eq!(message.action, WireAction::Status);
        assert_eq!(message.source, "");
        assert_eq!(message.target, "");
        assert_eq!(message.data, "");
        assert!(!message.from_proxy);
    }

    #[test]
    fn decode_round_trip() {
        let json = encode(WireAction::Message, "1", "2", "hi").unwrap();
        let message = decode(&json).unwrap();
        assert_eq!(message.action, WireAction::Message);
        assert_eq!(message.source, "1");
        assert_eq!(message.target, "2");
        assert_eq!(message.data, "hi");
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(decode("not json").is_none());
        assert!(decode(r#"{"action":"subscribe"}"#).is_none());
        assert!(decode(r#"{"source":"1"}"#).is_none());
    }

    #[test]
    fn from_proxy_never_serializes() {
        let mut message = WireMessage::new(WireAction::Broadcast, "1", "", "x");
        message.from_proxy = true;
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("from_proxy"));
        assert!(!json.contains("fromProxy"));
    }

    #[test]
    fn ping_period_is_inside_pong_wait() {
        assert!(PING_PERIOD < PONG_WAIT);
    }
}
