//! Tool definitions, the registry that dispatches calls to them, and handler
//! decorators.

mod echo;
mod middleware;
mod registry;
mod schema;

pub use echo::echo_tool;
pub use middleware::{with_retry, with_timeout};
pub use registry::ToolRegistry;
pub use schema::{
    json_schema_array, json_schema_boolean, json_schema_number, json_schema_object,
    json_schema_string,
};

use crate::outbound::OutboundClient;
use crate::protocol::{error_codes, JsonRpcError, RequestId, ToolSchema};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::SessionId;
use tokio_util::sync::CancellationToken;

/// Per-call information handed to a tool handler
#[derive(Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<SessionId>,
    pub request_id: Option<RequestId>,
    pub transport: Option<String>,
    /// Cancelled when the call times out or the caller gives up
    pub cancellation: CancellationToken,
    /// Pooled client for calls to the configured upstream peer
    pub outbound: Option<OutboundClient>,
}

/// Executes one tool call
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. Returning a [`ToolError`] (directly or inside the
    /// `anyhow::Error`) controls the error code reported to the caller.
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value>;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value> {
        (self.0)(arguments, context).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A named, schema-described operation exposed to callers
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
    /// Overrides the registry's default call timeout
    pub timeout: Option<Duration>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
            timeout: None,
        }
    }

    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(name, description, input_schema, handler_fn(f))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wire description returned by `tools/list`
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Failure of a tool call, carried to the caller as a JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolError {
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

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(error_codes::TOOL_EXECUTION_FAILED, message)
    }

    pub fn timeout(tool: &str, timeout: Duration) -> Self {
        Self::new(
            error_codes::TOOL_TIMEOUT,
            format!("Tool {} timed out after {}ms", tool, timeout.as_millis()),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }
}

impl From<ToolError> for JsonRpcError {
    fn from(err: ToolError) -> Self {
        JsonRpcError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Outcome of [`ToolRegistry::call`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolCallResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ToolError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Rejected tool registration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid tool name {0:?}: use 1-128 ASCII letters, digits, '_', '-', '.' or '/'")]
    InvalidName(String),

    #[error("Invalid input schema for tool {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_error_converts_to_rpc_error() {
        let err: JsonRpcError = ToolError::execution_failed("boom")
            .with_data(json!({ "step": 2 }))
            .into();
        assert_eq!(err.code, 1001);
        assert_eq!(err.message, "boom");
        assert_eq!(err.data, Some(json!({ "step": 2 })));
    }

    #[tokio::test]
    async fn test_fn_handler_receives_context() {
        let tool = Tool::from_fn("ctx", "", json!({ "type": "object" }), |_args, ctx| async move {
            Ok(json!({ "transport": ctx.transport }))
        });
        let context = ToolContext {
            transport: Some("stdio".to_string()),
            ..Default::default()
        };

        let result = tool.handler.call(json!({}), context).await.unwrap();
        assert_eq!(result, json!({ "transport": "stdio" }));
        assert_eq!(tool.schema().name, "ctx");
    }
}
