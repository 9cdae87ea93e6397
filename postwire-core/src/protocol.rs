//! postwire wire protocol: message types and built-in message names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error reason carried in a response when the receiving peer has no listener.
pub const NO_HANDLER: &str = "no_handler";

/// Built-in request answered by every peer with its instance id.
pub const INSTANCE_ID_MESSAGE_NAME: &str = "postwire_get_instance_id";

/// Built-in request used to invoke a capability on an exported window.
pub const METHOD_MESSAGE_NAME: &str = "postwire_method";

/// All wire message types. Serialized as JSON objects tagged by `type`:
/// `{ type, ack?, hash, name, data?, error?, fireAndForget? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Ask the peer to run the listener registered under `name`.
    Request(RequestMessage),
    /// Liveness: the peer received the request and is processing it.
    Ack(AckMessage),
    /// Final outcome of a request.
    Response(ResponseMessage),
}

impl Message {
    /// Correlation key of the message.
    pub fn hash(&self) -> &str {
        match self {
            Message::Request(m) => &m.hash,
            Message::Ack(m) => &m.hash,
            Message::Response(m) => &m.hash,
        }
    }

    /// Logical operation name.
    pub fn name(&self) -> &str {
        match self {
            Message::Request(m) => &m.name,
            Message::Ack(m) => &m.name,
            Message::Response(m) => &m.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub hash: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fire_and_forget: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub hash: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub hash: String,
    pub name: String,
    pub ack: ResponseAck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseMessage {
    /// Response for a request, from the handler outcome.
    pub fn from_outcome(request: &RequestMessage, outcome: Result<Value, Value>) -> Self {
        let (ack, data, error) = match outcome {
            Ok(data) => (ResponseAck::Success, Some(data), None),
            Err(error) => (ResponseAck::Error, None, Some(error)),
        };
        Self {
            hash: request.hash.clone(),
            name: request.name.clone(),
            ack,
            data,
            error,
        }
    }
}

/// `ack` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAck {
    Success,
    Error,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Name used in diagnostics. Window method calls are logged as `method()`.
pub fn log_name(name: &str, data: Option<&Value>) -> String {
    if name == METHOD_MESSAGE_NAME {
        if let Some(method) = data.and_then(|d| d.get("name")).and_then(Value::as_str) {
            return format!("{method}()");
        }
    }
    name.to_string()
}
