//! JSON-RPC 2.0 message codec.
//!
//! A [`Message`] is exactly one of a request, a response or a notification.
//! The variant is decided by which of `method` and `id` are present, so the
//! decoder works on a raw [`serde_json::Value`] instead of relying on an
//! untagged serde enum, which would accept ambiguous shapes.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// The only JSON-RPC version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes plus the MCP-specific ones.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// MCP: the requested resource does not exist.
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
    /// The request was cancelled before it produced a result.
    pub const REQUEST_CANCELLED: i64 = -32800;
}

/// A request id: a string or an integer, chosen by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::String(s) => Ok(Self::String(s)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| DecodeError::InvalidId(n.to_string())),
            other => Err(DecodeError::InvalidId(other.to_string())),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(codes::RESOURCE_NOT_FOUND, format!("Resource not found: {uri}"))
            .with_data(serde_json::json!({ "uri": uri }))
    }
}

/// A call expecting exactly one [`Response`] with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// The reply to a [`Request`]: a result (possibly `null`) or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Result<Value, JsonRpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// A one-way message with no id and no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Why a byte sequence is not a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid id {0}: must be a string or an integer")]
    InvalidId(String),
    #[error("method must be a string")]
    InvalidMethod,
    #[error("message has neither method nor id")]
    MissingDiscriminator,
    #[error("response carries both result and error")]
    ResultAndError,
    #[error("response carries neither result nor error")]
    NoResultOrError,
    #[error("invalid error object: {0}")]
    InvalidErrorObject(String),
}

/// A JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Decode one message from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Encode the message as compact JSON.
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject);
        };

        match obj.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(DecodeError::UnsupportedVersion(other.to_string())),
            None => return Err(DecodeError::UnsupportedVersion("<missing>".to_string())),
        }

        let id = obj.remove("id").map(RequestId::from_value).transpose()?;
        let method = match obj.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err(DecodeError::InvalidMethod),
        };
        let params = obj.remove("params");

        match (method, id) {
            (Some(method), Some(id)) => Ok(Self::Request(Request { id, method, params })),
            (Some(method), None) => Ok(Self::Notification(Notification { method, params })),
            (None, Some(id)) => {
                let result = match (obj.remove("result"), obj.remove("error")) {
                    (Some(result), None) => Ok(result),
                    (None, Some(error)) => Err(serde_json::from_value::<JsonRpcError>(error)
                        .map_err(|e| DecodeError::InvalidErrorObject(e.to_string()))?),
                    (Some(_), Some(_)) => return Err(DecodeError::ResultAndError),
                    (None, None) => return Err(DecodeError::NoResultOrError),
                };
                Ok(Self::Response(Response { id, result }))
            }
            (None, None) => Err(DecodeError::MissingDiscriminator),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(req) => {
                obj.insert("id".to_string(), req.id.to_value());
                obj.insert("method".to_string(), Value::from(req.method.as_str()));
                if let Some(params) = &req.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Self::Notification(n) => {
                obj.insert("method".to_string(), Value::from(n.method.as_str()));
                if let Some(params) = &n.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Self::Response(resp) => {
                obj.insert("id".to_string(), resp.id.to_value());
                match &resp.result {
                    Ok(result) => {
                        obj.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        obj.insert(
                            "error".to_string(),
                            serde_json::to_value(error).unwrap_or(Value::Null),
                        );
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// The id for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
            Self::Notification(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}
