//! JSON-RPC 2.0 message model for the bridge wire protocol.
//!
//! Every payload exchanged over the bridge socket is one of four message
//! shapes sharing the `"jsonrpc":"2.0"` tag:
//!
//! - [`Request`] — has both `method` and `id`, expects exactly one response
//! - [`Notification`] — has `method` but no `id`, never answered
//! - [`SuccessResponse`] — has `id` and `result`
//! - [`ErrorResponse`] — has `id` and `error`
//!
//! [`Message`] is the untagged union of the four; classification follows
//! from which fields are present, so decoding an incoming payload picks the
//! right variant without an explicit discriminator.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Reserved JSON-RPC error codes, reproduced verbatim for compatibility.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    // Application-specific codes
    pub const NO_ACTIVE_EDITOR: i64 = -32001;
    pub const FILE_NOT_FOUND: i64 = -32002;
    pub const PERMISSION_DENIED: i64 = -32003;
    pub const TIMEOUT: i64 = -32004;
}

/// The literal `"2.0"` protocol tag.
///
/// Zero-sized; serializes as the string `"2.0"` and rejects any other value
/// on deserialization, so a non-2.0 payload fails to decode as a [`Message`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == "2.0" {
            Ok(Version)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version: {tag}"
            )))
        }
    }
}

/// Request identifier, generated by the client and echoed by the server.
///
/// Unique for the lifetime of one client connection. The server never
/// interprets it beyond echoing it back in the matching response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

/// The JSON-RPC error object carried by an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code: {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach the optional `data` member.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {detail}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// Incidental handler failures become INTERNAL_ERROR responses carrying the
/// error's message only; no backtrace crosses the wire.
impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// A request: carries `method` and `id`, answered exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id,
            method: method.into(),
            params,
        }
    }
}

/// A one-way message: carries `method` but no `id`, never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub result: Value,
}

impl SuccessResponse {
    pub fn new(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub error: RpcError,
}

impl ErrorResponse {
    pub fn new(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: Version,
            id,
            error,
        }
    }
}

/// Any message that can cross the bridge socket.
///
/// Variant order matters for untagged deserialization: `Request` requires
/// `id` + `method`, the responses require `id` + `result`/`error`, and
/// `Notification` (method only) is tried last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Success(SuccessResponse),
    Error(ErrorResponse),
    Notification(Notification),
}

impl Message {
    /// Build a success response echoing the request id.
    pub fn success(id: RequestId, result: Value) -> Self {
        Message::Success(SuccessResponse::new(id, result))
    }

    /// Build an error response echoing the request id.
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Message::Error(ErrorResponse::new(id, error))
    }
}

/// Payload of the built-in `ping` method.
///
/// Answered by the server itself so liveness checks never depend on
/// user-registered handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub pong: bool,
    /// Epoch milliseconds at the time the server handled the ping.
    pub timestamp: i64,
    pub version: String,
}

/// Decode `params` into a concrete type, treating a missing `params` member
/// as JSON `null` so parameterless methods can take `Option<T>` or `()`.
pub fn params_from_value<P: DeserializeOwned>(params: Option<Value>) -> Result<P, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(RpcError::invalid_params)
}
