//! JSON-RPC 2.0 wire types and response helpers.
//!
//! The tool surface is served as newline-delimited JSON-RPC 2.0: one request
//! object per line in, one response object per line out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// An incoming JSON-RPC 2.0 message.
///
/// Requests carry an `id`; notifications do not and never get a response.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl IncomingMessage {
    /// Whether this message is a notification (no `id`).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// An outgoing JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn error(id: Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Serializes the response as a single line without the trailing newline.
    pub fn to_line(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build a success response.
pub fn success_response(id: Value, result: Value) -> Response {
    Response {
        jsonrpc: JSONRPC_VERSION,
        result: Some(result),
        error: None,
        id,
    }
}

/// Build a method-not-found error response.
pub fn method_not_found(id: Value, method: &str) -> Response {
    Response::error(
        id,
        codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
    )
}

/// Build an invalid-params error response.
pub fn invalid_params(id: Value, message: impl Into<String>) -> Response {
    Response::error(id, codes::INVALID_PARAMS, message.into())
}

/// Build an invalid-request error response (e.g. a request without a method).
pub fn invalid_request(id: Value) -> Response {
    Response::error(id, codes::INVALID_REQUEST, "Invalid request".to_string())
}

/// Build an internal-error response.
pub fn internal_error(id: Value, message: impl Into<String>) -> Response {
    Response::error(id, codes::INTERNAL_ERROR, message.into())
}

/// Build a parse error response.
pub fn parse_error() -> Response {
    Response::error(Value::Null, codes::PARSE_ERROR, "Parse error".to_string())
}
