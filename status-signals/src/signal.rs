//! Signal frames
//!
//! Types for the JSON frames pushed by the backend on its `/signals`
//! WebSocket endpoint, and the names of the signal types the suite awaits.

use serde_json::Value;
use std::fmt::Display;

pub const NODE_READY: &str = "node.ready";
pub const NODE_STARTED: &str = "node.started";
pub const NODE_STOPPED: &str = "node.stopped";
pub const NODE_LOGIN: &str = "node.login";
pub const MEDIASERVER_STARTED: &str = "mediaserver.started";
pub const MESSAGES_NEW: &str = "messages.new";
pub const MESSAGE_DELIVERED: &str = "message.delivered";
pub const WALLET: &str = "wallet";
pub const WALLET_SUGGESTED_ROUTES: &str = "wallet.suggested.routes";
pub const WALLET_ROUTER_SIGN_TRANSACTIONS: &str = "wallet.router.sign-transactions";
pub const WALLET_ROUTER_SENDING_TRANSACTIONS_STARTED: &str =
    "wallet.router.sending-transactions-started";
pub const WALLET_TRANSACTION_STATUS_CHANGED: &str = "wallet.transaction.status-changed";
pub const WALLET_ROUTER_TRANSACTIONS_SENT: &str = "wallet.router.transactions-sent";

/// Values of `event.type` carried by `wallet` signals.
pub mod wallet_event {
    pub const ACTIVITY_FILTERING_DONE: &str = "wallet-activity-filtering-done";
    pub const ACTIVITY_FILTERING_ENTRIES_UPDATED: &str =
        "wallet-activity-filtering-entries-updated";
    pub const ACTIVITY_SESSION_UPDATED: &str = "wallet-activity-session-updated";
    pub const OWNED_COLLECTIBLES_FILTERING_DONE: &str =
        "wallet-owned-collectibles-filtering-done";
}

/// One classified signal as received from the backend.
///
/// The whole decoded frame is kept, so callers can reach both the `type` tag
/// and the `event` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    frame: Value,
}

impl Signal {
    /// Parse a raw text frame. The frame must be a JSON object with a string
    /// `type` field; everything else is left untouched.
    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let frame: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        Self::from_value(frame)
    }

    pub fn from_value(frame: Value) -> Result<Self, FrameError> {
        match frame.get("type") {
            Some(Value::String(_)) => Ok(Self { frame }),
            Some(_) => Err(FrameError::InvalidType),
            None => Err(FrameError::MissingType),
        }
    }

    pub fn signal_type(&self) -> &str {
        self.frame["type"]
            .as_str()
            .expect("checked at construction")
    }

    /// The `event` payload, or `Value::Null` when the frame has none.
    pub fn event(&self) -> &Value {
        &self.frame["event"]
    }

    /// The `event.type` tag, used by `wallet` signals.
    pub fn event_type(&self) -> Option<&str> {
        self.event().get("type").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.frame
    }

    pub fn into_value(self) -> Value {
        self.frame
    }

    /// Whether the serialized frame contains `pattern` verbatim.
    pub fn contains(&self, pattern: &str) -> bool {
        self.frame.to_string().contains(pattern)
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.frame)
    }
}

/// Reasons a frame cannot be classified. These never reach waiters: the
/// classifier logs them and drops the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    InvalidJson(String),
    MissingType,
    InvalidType,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidJson(msg) => write!(f, "Frame is not valid JSON: {}", msg),
            FrameError::MissingType => write!(f, "Frame has no `type` field"),
            FrameError::InvalidType => write!(f, "Frame `type` field is not a string"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_login_frame() {
        let text = r#"{"type":"node.login","event":{"account":{"key-uid":"abc"}}}"#;
        let signal = Signal::from_frame(text).unwrap();
        assert_eq!(signal.signal_type(), NODE_LOGIN);
        assert_eq!(signal.event()["account"]["key-uid"], "abc");
        assert_eq!(signal.event_type(), None);
    }

    #[test]
    fn parse_frame_without_event() {
        let signal = Signal::from_frame(r#"{"type":"node.ready"}"#).unwrap();
        assert_eq!(signal.signal_type(), NODE_READY);
        assert!(signal.event().is_null());
    }

    #[test]
    fn unknown_fields_are_kept() {
        let signal = Signal::from_value(json!({
            "type": "wallet",
            "event": {"type": wallet_event::ACTIVITY_FILTERING_DONE, "requestId": 3},
            "extra": true,
        }))
        .unwrap();
        assert_eq!(signal.event_type(), Some(wallet_event::ACTIVITY_FILTERING_DONE));
        assert_eq!(signal.as_value()["extra"], true);
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(
            Signal::from_frame("not json"),
            Err(FrameError::InvalidJson(_))
        ));
        assert_eq!(
            Signal::from_frame(r#"{"event":{}}"#),
            Err(FrameError::MissingType)
        );
        assert_eq!(
            Signal::from_frame(r#"{"type":42}"#),
            Err(FrameError::InvalidType)
        );
        assert_eq!(Signal::from_frame("[1,2]"), Err(FrameError::MissingType));
    }

    #[test]
    fn contains_searches_serialized_frame() {
        let signal = Signal::from_value(json!({
            "type": "messages.new",
            "event": {"messages": [{"id": "0x01", "text": "test_message_1"}]},
        }))
        .unwrap();
        assert!(signal.contains("test_message_1"));
        assert!(signal.contains("\"id\":\"0x01\""));
        assert!(!signal.contains("test_message_2"));
    }
}
