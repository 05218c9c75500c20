//! JSON-RPC 2.0 message types.
//!
//! Requests and responses exchanged between the daemon and the CLI, plus one
//! application error code for lookups that find nothing.
//! See: https://www.jsonrpc.org/specification

use serde::{Deserialize, Serialize};
use serde_json::Value;

const VERSION: &str = "2.0";

/// JSON-RPC 2.0 request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be exactly "2.0"
    pub jsonrpc: String,
    /// Method name to invoke, e.g. `sessions.list`
    pub method: String,
    /// Optional parameters (object or array)
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications, which get no response.
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Result on success (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Echoed from the request
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// One of the codes below
    pub code: i32,
    /// Short description, shown as-is by the CLI
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Application range: a session or device that does not exist.
pub const NOT_FOUND: i32 = -32000;

impl Request {
    /// Build a request with a numeric id, as the client sends them.
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(id.into())),
        }
    }

    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validate the request conforms to JSON-RPC 2.0.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

impl Response {
    /// Success response. A result that cannot be encoded becomes an internal error.
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: VERSION.to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("Failed to encode result: {}", e)),
        }
    }

    /// Create an error response.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Used when the request id could not be read.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request response.
    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    /// Create a method not found response.
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Create an invalid params response.
    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details)
    }

    /// Create an internal error response.
    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details)
    }

    /// The session or device named in the params does not exist.
    pub fn not_found(id: Value, what: impl Into<String>) -> Self {
        Self::error(id, NOT_FOUND, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = r#"{"jsonrpc":"2.0","method":"sessions.list","params":{"limit":10},"id":1}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "sessions.list");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(Value::Number(1.into())));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_parse_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"daemon.status"}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut req = Request::new("daemon.status", None, 7);
        assert!(req.validate().is_ok());

        req.jsonrpc = "1.0".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_serialize_success_response() {
        let resp = Response::success(Value::Number(1.into()), "ok");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""result":"ok""#));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_serialize_not_found() {
        let resp = Response::not_found(Value::String("abc".into()), "Session not found: x");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains(r#""code":-32000"#));
        assert!(json.contains("Session not found"));
        assert!(!json.contains("result"));
    }
}
