//! JSON-RPC 2.0 message codec
//!
//! Envelope types for the wire protocol shared by all transports:
//! - Requests, notifications, responses and error responses as a closed union
//! - Standard error codes (-32700 .. -32603)
//! - Decoding with a parse-error / invalid-request distinction so transports
//!   can answer `-32700` for broken JSON and `-32600` for well-formed JSON
//!   that is not a JSON-RPC envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};

/// Protocol version string carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A JSON-RPC request (carries an `id` the response must echo)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,

    /// Method name (`initialize`, `message`, `run`, `terminate`)
    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Request id; string, number or null per the JSON-RPC spec
    pub id: Value,
}

/// A JSON-RPC notification (no `id`, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    pub result: Value,

    pub id: Value,
}

/// A failed JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,

    pub error: JsonRpcError,

    pub id: Value,
}

/// Error object carried by an error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error with an arbitrary code
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700` parse error
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(error_codes::PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    /// `-32600` invalid request
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid request: {}", detail.into()),
        )
    }

    /// `-32601` method not found
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// `-32602` invalid params
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {}", detail.into()),
        )
    }

    /// `-32603` internal error with a generic message (no internal detail leaked)
    pub fn internal_error() -> Self {
        Self::new(error_codes::INTERNAL_ERROR, "Internal error")
    }
}

impl From<&ProtocolError> for JsonRpcError {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Parse(detail) => Self::parse_error(detail.clone()),
            ProtocolError::InvalidRequest(detail) => Self::invalid_request(detail.clone()),
            ProtocolError::MethodNotFound { method } => Self::method_not_found(method),
            ProtocolError::InvalidParams(detail) => Self::invalid_params(detail.clone()),
        }
    }
}

/// Closed union over the four JSON-RPC message kinds
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Build a request envelope
    pub fn request(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        })
    }

    /// Build a notification envelope
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        })
    }

    /// Build a success response envelope
    pub fn response(result: Value, id: Value) -> Self {
        Self::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        })
    }

    /// Build an error response envelope
    pub fn error(error: JsonRpcError, id: Value) -> Self {
        Self::Error(JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
            id,
        })
    }

    /// The envelope's id, if it carries one
    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
            Self::Error(err) => Some(&err.id),
            Self::Notification(_) => None,
        }
    }

    /// The envelope's method name, if it carries one
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(note) => Some(&note.method),
            _ => None,
        }
    }
}

/// Serialize a message to its canonical JSON string (no trailing newline;
/// framing is the transport's job)
pub fn encode(message: &JsonRpcMessage) -> String {
    // The envelope types only contain JSON-representable fields, so
    // serialization cannot fail.
    serde_json::to_string(message).unwrap_or_else(|_| {
        serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "error": {"code": error_codes::INTERNAL_ERROR, "message": "Internal error"},
            "id": null,
        })
        .to_string()
    })
}

/// Decode one JSON-RPC message from raw text.
///
/// Returns `ProtocolError::Parse` when the text is not JSON at all and
/// `ProtocolError::InvalidRequest` when it is JSON but not a valid envelope.
pub fn decode(raw: &str) -> ProtocolResult<JsonRpcMessage> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::parse(e.to_string()))?;
    decode_value(value)
}

/// Decode a message from an already-parsed JSON value
pub fn decode_value(value: Value) -> ProtocolResult<JsonRpcMessage> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::invalid_request("envelope must be a JSON object"))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(ProtocolError::invalid_request(format!(
                "unsupported jsonrpc version '{other}'"
            )))
        }
        None => return Err(ProtocolError::invalid_request("missing 'jsonrpc' field")),
    }

    if let Some(method) = obj.get("method") {
        let method = method
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_request("'method' must be a string"))?
            .to_string();
        let params = obj.get("params").cloned();
        return Ok(match obj.get("id") {
            Some(id) => JsonRpcMessage::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
                id: id.clone(),
            }),
            None => JsonRpcMessage::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            }),
        });
    }

    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    if let Some(result) = obj.get("result") {
        return Ok(JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: result.clone(),
            id,
        }));
    }
    if let Some(error) = obj.get("error") {
        let error: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| ProtocolError::invalid_request(format!("malformed error object: {e}")))?;
        return Ok(JsonRpcMessage::Error(JsonRpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error,
            id,
        }));
    }

    Err(ProtocolError::invalid_request(
        "envelope has neither 'method', 'result' nor 'error'",
    ))
}

/// Best-effort id extraction from raw text that failed full decoding,
/// so invalid-request responses can still echo the caller's id
pub fn extract_id(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}
