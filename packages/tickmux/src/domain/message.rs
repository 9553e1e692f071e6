//! Wire Message Envelope
//!
//! The engine treats payloads as opaque JSON. It only interprets four
//! envelope fields on inbound messages:
//!
//! - `msg_type`: names the logical request/event kind; the domain payload
//!   lives under the same key
//! - `req_id`: echoes the correlation id of the originating request
//! - `error`: a `{code, message}` object when the call failed remotely
//! - `subscription`: the remote-assigned subscription id for streaming
//!   events
//!
//! Outbound requests are plain `serde_json::Value` objects supplied by the
//! caller; the engine stamps `req_id` (and `subscribe` for streaming calls)
//! before serializing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream kinds recognized by default, in lookup order. The first key of a
/// request that appears in this list determines the request's kind.
///
/// The set is configurable per connection via
/// [`ConnectionConfigBuilder::stream_kinds`](crate::infrastructure::config::ConnectionConfigBuilder::stream_kinds).
pub const DEFAULT_STREAM_KINDS: &[&str] = &[
    "ticks",
    "candles",
    "proposal",
    "proposal_open_contract",
    "balance",
    "transaction",
    "buy",
];

/// Field carrying the derived entity id on buy-style confirmations and on
/// follow-up subscribe requests that should attach to the originating
/// source.
pub const ENTITY_ID_FIELD: &str = "contract_id";

/// Remote error object carried on failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Remote-assigned subscription identity on streaming messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// The remote subscription id, used for explicit cancellation.
    pub id: String,
}

/// One inbound message, decoded only as far as the envelope.
///
/// Everything that is not an envelope field stays in `payload`, keyed
/// exactly as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical kind of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,

    /// Correlation id echoed from the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,

    /// Remote error object, present when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteErrorBody>,

    /// Remote subscription identity, present on streaming messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionInfo>,

    /// Everything else, untouched.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl InboundMessage {
    /// The domain payload: the value stored under the `msg_type` key.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.msg_type.as_ref().and_then(|t| self.payload.get(t))
    }

    /// Look up an arbitrary payload field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Whether the message carries a remote error object.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The remote subscription id, if any.
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }
}

/// Determine a request's stream kind: the first configured kind that
/// appears as a key of the request, in configuration order.
#[must_use]
pub fn stream_kind_of<'a>(request: &Value, kinds: &'a [String]) -> Option<&'a str> {
    let object = request.as_object()?;
    kinds
        .iter()
        .find(|kind| object.contains_key(kind.as_str()))
        .map(String::as_str)
}

/// Extract the entity id a request refers to, normalized to a string.
/// Numeric ids are rendered in decimal so `123` and `"123"` collide.
#[must_use]
pub fn entity_id_of(request: &Value) -> Option<String> {
    entity_string(request.get(ENTITY_ID_FIELD)?)
}

/// Normalize an entity id value to its string form.
#[must_use]
pub fn entity_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
