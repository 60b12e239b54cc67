// MCP protocol types and definitions (JSON-RPC 2.0)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{ClientInfo, SessionId};

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this server speaks
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Standard JSON-RPC and server-range error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Unknown or closed session; the client must initialize again
    pub const SESSION_NOT_FOUND: i64 = -32001;
    pub const UNAUTHORIZED: i64 = -32002;

    pub const TOOL_EXECUTION_FAILED: i64 = 1001;
    pub const TOOL_TIMEOUT: i64 = 1002;
}

/// JSON-RPC request id: a string or an integer, never null
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{}", s),
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

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Notification (a request without an id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Response. `id` is null only when the request id could not be
/// determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into the result value or the error object
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
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

    /// Parse error; the parser's complaint goes in `data.detail`
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(error_codes::PARSE_ERROR, "Parse error")
            .with_data(serde_json::json!({ "detail": detail.into() }))
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid Request: {}", message.into()),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn session_not_found(session_id: &SessionId) -> Self {
        Self::new(
            error_codes::SESSION_NOT_FOUND,
            format!("Session not found: {}", session_id),
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(error_codes::UNAUTHORIZED, "Unauthorized")
    }
}

/// A message that could not be turned into a request, notification or
/// response. Carries the request id when one was recoverable.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl MessageError {
    fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self { id, error }
    }

    pub fn into_response(self) -> JsonRpcResponse {
        JsonRpcResponse::error(self.id, self.error)
    }
}

/// Any inbound protocol message, classified by the presence of `id` and `method`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse a single message from its JSON text
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MessageError::new(None, JsonRpcError::parse_error(e.to_string())))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(map) = &value else {
            return Err(MessageError::new(
                None,
                JsonRpcError::invalid_request("message must be a JSON object"),
            ));
        };

        let id = match map.get("id") {
            None => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw.clone()).ok()),
        };

        if map.contains_key("method") {
            return match id {
                None => serde_json::from_value(value)
                    .map(Self::Notification)
                    .map_err(|e| MessageError::new(None, JsonRpcError::invalid_request(e.to_string()))),
                Some(None) => Err(MessageError::new(
                    None,
                    JsonRpcError::invalid_request("id must be a string or an integer"),
                )),
                Some(Some(id)) => serde_json::from_value(value)
                    .map(Self::Request)
                    .map_err(|e| {
                        MessageError::new(Some(id), JsonRpcError::invalid_request(e.to_string()))
                    }),
            };
        }

        if map.contains_key("result") || map.contains_key("error") {
            return serde_json::from_value(value)
                .map(Self::Response)
                .map_err(|e| MessageError::new(None, JsonRpcError::invalid_request(e.to_string())));
        }

        Err(MessageError::new(
            id.flatten(),
            JsonRpcError::invalid_request("message has neither a method nor a result"),
        ))
    }
}

// MCP-specific protocol messages

/// Tool definition for MCP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// List tools response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
}

/// Call tool request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Initialize request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub client_info: ClientInfo,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            capabilities: Value::Object(Default::default()),
            client_info: ClientInfo::default(),
        }
    }
}

/// Initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: ToolsCapability,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_messages() {
        let request = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(ref r) if r.id == RequestId::Number(7)));

        let notification =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let response =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(ref r) if r.id == Some("a".into())));

        let error_response = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        )
        .unwrap();
        assert!(matches!(error_response, JsonRpcMessage::Response(ref r) if r.id.is_none()));
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let err = JsonRpcMessage::parse("{ invalid json }").unwrap_err();
        let text = serde_json::to_string(&err.into_response()).unwrap();

        assert!(text.contains(r#""code":-32700"#));
        assert!(text.contains(r#""message":"Parse error""#));
        assert!(text.contains(r#""id":null"#));
    }

    #[test]
    fn test_invalid_request_keeps_recoverable_id() {
        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":3,"method":42}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(3)));
        assert_eq!(err.error.code, error_codes::INVALID_REQUEST);

        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#)
            .unwrap_err();
        assert_eq!(err.id, None);

        let err = JsonRpcMessage::parse("[1,2]").unwrap_err();
        assert_eq!(err.error.code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_response_serialization_shape() {
        let response = JsonRpcResponse::success("1".into(), json!({"text": "hi"}));
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"jsonrpc":"2.0","id":"1","result":{"text":"hi"}}"#
        );
    }

    #[test]
    fn test_into_result() {
        let ok = JsonRpcResponse::success(1.into(), json!(5));
        assert_eq!(ok.into_result().unwrap(), json!(5));

        let err = JsonRpcResponse::error(Some(1.into()), JsonRpcError::method_not_found("x"));
        assert_eq!(err.into_result().unwrap_err().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_params_defaults() {
        let params: InitializeParams =
            serde_json::from_value(json!({"clientInfo": {"name": "cli", "version": "1.0"}}))
                .unwrap();
        assert_eq!(params.protocol_version, PROTOCOL_VERSION);
        assert_eq!(params.client_info.name, "cli");
    }
}
