//! RPC envelope types.
//!
//! Both client transports carry the same JSON envelope:
//!
//! ```text
//! Request:  { "id": <id>, "method": <method>, "params": {...} }
//! Response: { "id": <id>, "result": {...} }
//!         | { "id": <id>, "error": { "code": <int>, "message": <string> } }
//! ```
//!
//! Requests may carry `"jsonrpc": "2.0"`; any other value is rejected.
//! Responses always carry it.
//!
//! # Constraints
//!
//! - Request IDs must be strings or integers (never `null`)
//! - Request IDs must be unique among the calls in flight on a session
//! - A response has `"id": null` only when the request id could not be read

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::CallError;

/// Server name reported by `initialize`.
pub const SERVER_NAME: &str = "dcc-bridge";

/// Server version reported by `initialize`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A request ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// The protocol methods a session understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Opens the session.
    Initialize,
    /// Closes the session.
    Shutdown,
    /// Lists registered tools.
    ListTools,
    /// Runs a tool on the host thread.
    CallTool,
    /// Liveness and statistics check; valid in any open state.
    Ping,
}

impl Method {
    /// Looks up a method by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Self::Initialize),
            "shutdown" => Some(Self::Shutdown),
            "listTools" => Some(Self::ListTools),
            "callTool" => Some(Self::CallTool),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }
}

/// A parsed request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen request identifier.
    pub id: RequestId,

    /// The method to invoke.
    pub method: String,

    /// Method parameters; an empty object when the request omitted them.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl Request {
    /// Builds a request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid request, or arrived in the wrong state.
    InvalidRequest,
    /// The method does not exist.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal error.
    InternalError,
    /// Generic server error (timeouts, busy, bridge loss).
    ServerError,
    /// The requested tool is not registered.
    ToolNotFound,
    /// The tool handler failed.
    ToolExecution,
    /// The host application reported a failure.
    HostOperation,
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::ToolNotFound => -32001,
            Self::ToolExecution => -32002,
            Self::HostOperation => -32003,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "parse error",
            Self::InvalidRequest => "invalid request",
            Self::MethodNotFound => "method not found",
            Self::InvalidParams => "invalid params",
            Self::InternalError => "internal error",
            Self::ServerError => "server error",
            Self::ToolNotFound => "tool not found",
            Self::ToolExecution => "tool execution error",
            Self::HostOperation => "host operation error",
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }
}

impl From<CallError> for ErrorObject {
    fn from(err: CallError) -> Self {
        let data = err.kind.map(|kind| serde_json::json!({ "kind": kind }));
        Self {
            code: err.code,
            message: err.message,
            data,
        }
    }
}

/// A response envelope: exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Always "2.0".
    pub jsonrpc: &'static str,

    /// The request ID this response corresponds to, `null` if unknown.
    pub id: Option<RequestId>,

    /// The result of the method call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// The error details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Creates a new success response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Creates a new error response.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // ErrorObject contains String
    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::error(None, ErrorObject::from_code(ErrorCode::ParseError))
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::error(
            id,
            ErrorObject::with_message(ErrorCode::InvalidRequest, message),
        )
    }

    /// Creates a method not found error response.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::error(
            Some(id),
            ErrorObject::with_message(
                ErrorCode::MethodNotFound,
                format!("method not found: {method}"),
            ),
        )
    }

    /// Creates an invalid params error response.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::error(
            Some(id),
            ErrorObject::with_message(ErrorCode::InvalidParams, message),
        )
    }
}

/// Parses a JSON string into a request.
///
/// # Errors
///
/// Returns the error `Response` to send back if the JSON is malformed or is
/// not a valid request envelope.
pub fn parse_request(json: &str) -> Result<Request, Response> {
    let value: Value = serde_json::from_str(json).map_err(|_| Response::parse_error())?;

    let Value::Object(mut obj) = value else {
        return Err(Response::invalid_request(
            None,
            "request must be a JSON object",
        ));
    };

    let id = match obj.remove("id") {
        Some(raw) => serde_json::from_value::<RequestId>(raw)
            .map_err(|_| Response::invalid_request(None, "id must be a string or an integer"))?,
        None => return Err(Response::invalid_request(None, "missing id")),
    };

    if let Some(version) = obj.get("jsonrpc") {
        if version.as_str() != Some("2.0") {
            return Err(Response::invalid_request(
                Some(id),
                "jsonrpc field must be \"2.0\"",
            ));
        }
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        Some(Value::String(_)) => {
            return Err(Response::invalid_request(
                Some(id),
                "method field cannot be empty",
            ))
        }
        _ => return Err(Response::invalid_request(Some(id), "missing method")),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => empty_params(),
        Some(p) => p,
    };

    Ok(Request { id, method, params })
}
