//! JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method does not exist or has no live route.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Params failed to decode.
pub const INVALID_PARAMS: i32 = -32602;
/// Handler failed.
pub const INTERNAL_ERROR: i32 = -32603;
/// The request was cancelled before it could be answered.
pub const REQUEST_CANCELLED: i32 = -32800;

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response. A `null` result is sent explicitly.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the result value or the remote error.
    ///
    /// # Errors
    /// Returns the error object if the peer reported one.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unhandled method {method}"))
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(REQUEST_CANCELLED, message)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// JSON-RPC notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    #[must_use]
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classify a raw message by the presence of `method` and `id`.
    ///
    /// # Errors
    /// Returns error if the text is not a JSON-RPC message.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());
        Ok(match (has_method, has_id) {
            (true, true) => Self::Request(serde_json::from_value(value)?),
            (true, false) => Self::Notification(serde_json::from_value(value)?),
            (false, _) => Self::Response(serde_json::from_value(value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_classify_messages() {
        let req = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":7,"method":"chat_a1_request_chat","params":{"messages":[]}}"#,
        )
        .unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(r) if r.id == json!(7)));

        let note = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","method":"chat_a1_send_update","params":{"msg":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(n) if n.method == "chat_a1_send_update"));

        let resp = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"result":{"id":"a1"}}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(r) if r.result == Some(json!({"id": "a1"}))));
    }

    #[test]
    fn test_null_result_collapses_to_null() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(3),
            result: None,
            error: None,
        };
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_error_response() {
        let resp = JsonRpcResponse::failure(json!(1), JsonRpcError::method_not_found("x"));
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_request_serialization_skips_missing_params() {
        let request = JsonRpcRequest::new(1, "listAgents", None);
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"listAgents"}"#);
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(JsonRpcMessage::parse("not json").is_err());
    }
}
