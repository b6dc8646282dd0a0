//! JSON-RPC message shape shared by the child pipes and the HTTP surface.
//!
//! Messages are kept as raw JSON objects. The bridge only looks at `id`,
//! `method`, `result` and `error` to classify them; every other field passes
//! through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC "internal error" code used for every caller-visible failure.
pub const INTERNAL_ERROR: i64 = -32603;

/// Shape-derived kind of a [`ProtocolMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `id` and `method`; expects a reply.
    Request,
    /// Has `method` but no `id`.
    Notification,
    /// Has `id` and one of `result`/`error`.
    Response,
    /// Any other object.
    Unknown,
}

/// A JSON-RPC shaped object: request, notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolMessage(Map<String, Value>);

impl ProtocolMessage {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Correlation id. `None` when the key is absent; an explicit `null`
    /// still counts as present.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("id")
    }

    pub fn has_id(&self) -> bool {
        self.0.contains_key("id")
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn kind(&self) -> MessageKind {
        let has_method = self.0.contains_key("method");
        let has_outcome = self.0.contains_key("result") || self.0.contains_key("error");
        match (self.has_id(), has_method) {
            (true, true) => MessageKind::Request,
            (false, true) => MessageKind::Notification,
            (true, false) if has_outcome => MessageKind::Response,
            _ => MessageKind::Unknown,
        }
    }

    pub fn is_notification(&self) -> bool {
        !self.has_id()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Error response paired with `id` (or `null` when unknown).
    pub fn error_envelope(id: Option<Value>, message: impl Into<String>) -> Self {
        let mut error = Map::new();
        error.insert("code".to_string(), Value::from(INTERNAL_ERROR));
        error.insert("message".to_string(), Value::String(message.into()));

        let mut fields = Map::new();
        fields.insert("jsonrpc".to_string(), Value::from("2.0"));
        fields.insert("id".to_string(), id.unwrap_or(Value::Null));
        fields.insert("error".to_string(), Value::Object(error));
        Self(fields)
    }
}

impl From<ProtocolMessage> for Value {
    fn from(message: ProtocolMessage) -> Self {
        message.into_value()
    }
}

/// Result of decoding one line read from the child.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(ProtocolMessage),
    /// Diagnostic text, blank lines, or JSON that is not an object.
    NotProtocol(String),
}

/// Serialize `message` as one newline-terminated line.
pub fn encode(message: &ProtocolMessage) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Classify one line of child output.
pub fn decode(line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::NotProtocol(String::new());
    }
    match serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(ProtocolMessage::from_value)
    {
        Some(message) => Decoded::Message(message),
        None => Decoded::NotProtocol(trimmed.to_string()),
    }
}
