//! Message envelope codec.
//!
//! Envelopes travel as a JSON string holding a single-key object
//! `{"__window_messaging__": {...}}`, so that any other script posting
//! through the same channel is recognized and ignored.

use core_types::{ErrorKind, MessageError, MessageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use web_platform::WindowType;

/// Key wrapping every envelope on the wire.
pub const WIRE_KEY: &str = "__window_messaging__";

/// Announces that a window's messenger is listening.
pub const READY_MESSAGE: &str = "__window_messaging_ready__";

/// Asks an opener to accept a tunnel to one of its popups.
pub const OPEN_TUNNEL_MESSAGE: &str = "__window_messaging_open_tunnel__";

/// Carries a tunneled message from an opener to its bridge frame.
pub const BRIDGE_TO_CHILD_MESSAGE: &str = "__window_messaging_bridge_to_child__";

/// Carries a tunneled message from a bridge frame to its parent.
pub const BRIDGE_TO_PARENT_MESSAGE: &str = "__window_messaging_bridge_to_parent__";

/// The three envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Asks the receiver to run a handler
    Request,
    /// Carries a handler's outcome
    Response,
    /// Confirms a request arrived
    Ack,
}

/// Outcome carried by a RESPONSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// The handler succeeded; `data` holds its value
    Success,
    /// The handler failed; `error` holds the message
    Error,
}

/// A message exchanged between windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per delivery attempt; receivers process each id once
    pub id: String,
    /// Correlates a REQUEST with its ACK and RESPONSE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Envelope type
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Message name handlers are registered under
    pub name: String,
    /// Payload
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Domain the sender addressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// The sender's own domain, or a mock marker
    pub source_domain: String,
    /// How the sender's window was created
    pub window_type: WindowType,
    /// Outcome of a RESPONSE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckStatus>,
    /// Error message of a failed RESPONSE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error kind of a failed RESPONSE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// The sender waits for neither ACK nor RESPONSE
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fire_and_forget: bool,
}

/// Sender-side fields stamped onto every envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Value of `sourceDomain`
    pub source_domain: String,
    /// Value of `windowType`
    pub window_type: WindowType,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Builds a correlation hash for a request named `name`.
pub fn new_hash(name: &str) -> String {
    format!("{}_{}", name, uuid::Uuid::new_v4().simple())
}

impl Envelope {
    fn build(kind: MessageType, name: &str, stamp: &Stamp) -> Self {
        Self {
            id: new_id(),
            hash: None,
            kind,
            name: name.to_string(),
            data: Value::Null,
            domain: None,
            source_domain: stamp.source_domain.clone(),
            window_type: stamp.window_type,
            ack: None,
            error: None,
            error_kind: None,
            fire_and_forget: false,
        }
    }

    /// Builds a REQUEST.
    pub fn request(
        stamp: &Stamp,
        name: &str,
        hash: &str,
        data: Value,
        domain: &str,
        fire_and_forget: bool,
    ) -> Self {
        Self {
            hash: Some(hash.to_string()),
            data,
            domain: Some(domain.to_string()),
            fire_and_forget,
            ..Self::build(MessageType::Request, name, stamp)
        }
    }

    /// Builds the ACK of `request`.
    pub fn ack_for(stamp: &Stamp, request: &Envelope, origin: &str) -> Self {
        Self {
            hash: request.hash.clone(),
            domain: Some(origin.to_string()),
            ..Self::build(MessageType::Ack, &request.name, stamp)
        }
    }

    /// Builds the RESPONSE of `request` carrying `outcome`.
    pub fn response_for(
        stamp: &Stamp,
        request: &Envelope,
        origin: &str,
        outcome: MessageResult<Value>,
    ) -> Self {
        let base = Self {
            hash: request.hash.clone(),
            domain: Some(origin.to_string()),
            ..Self::build(MessageType::Response, &request.name, stamp)
        };
        match outcome {
            Ok(data) => Self {
                ack: Some(AckStatus::Success),
                data,
                ..base
            },
            Err(error) => Self {
                ack: Some(AckStatus::Error),
                error: Some(error.message),
                error_kind: Some(error.kind),
                ..base
            },
        }
    }

    /// Converts a failed RESPONSE into the error it carries.
    pub fn to_error(&self) -> MessageError {
        MessageError::new(
            self.error_kind.unwrap_or(ErrorKind::HandlerError),
            self.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
        )
    }

    /// Serializes the envelope into its wire form.
    pub fn to_wire(&self) -> Value {
        let mut wrapper = serde_json::Map::new();
        match serde_json::to_value(self) {
            Ok(envelope) => {
                wrapper.insert(WIRE_KEY.to_string(), envelope);
            }
            Err(error) => {
                tracing::error!(%error, name = %self.name, "failed to serialize envelope");
            }
        }
        Value::String(Value::Object(wrapper).to_string())
    }
}

/// Parses a posted payload.
///
/// Returns `None` for anything that is not an envelope: other scripts'
/// messages, malformed JSON, missing or unknown `type`.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use window_messaging::envelope::{parse, MessageType};
///
/// let raw = json!({"__window_messaging__": {
///     "id": "1",
///     "type": "ACK",
///     "name": "ping",
///     "sourceDomain": "https://a.com",
///     "windowType": "iframe"
/// }});
/// assert_eq!(parse(&raw).map(|e| e.kind), Some(MessageType::Ack));
///
/// assert!(parse(&json!("hello")).is_none());
/// assert!(parse(&json!({"type": "ACK"})).is_none());
/// ```
pub fn parse(raw: &Value) -> Option<Envelope> {
    let decoded;
    let wrapper = match raw {
        Value::String(text) => {
            decoded = serde_json::from_str::<Value>(text).ok()?;
            &decoded
        }
        Value::Object(_) => raw,
        _ => return None,
    };
    let inner = wrapper.as_object()?.get(WIRE_KEY)?;
    serde_json::from_value(inner.clone()).ok()
}
