use super::schema::{compile, validate};
use super::{RegistryError, Tool, ToolCallResult, ToolContext, ToolError};
use crate::protocol::ToolSchema;
use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_NAME_LEN: usize = 128;
const SLOW_REGISTRATION: Duration = Duration::from_millis(10);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered tool with its compiled input schema
#[derive(Clone)]
struct Entry {
    tool: Arc<Tool>,
    validator: Arc<Validator>,
}

/// Tool registry for managing available tools
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Entry>>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a tool, replacing any tool with the same name. Returns the
    /// replaced tool.
    pub fn register(&self, tool: Tool) -> Result<Option<Arc<Tool>>, RegistryError> {
        let started = Instant::now();

        if !valid_name(&tool.name) {
            return Err(RegistryError::InvalidName(tool.name));
        }
        let validator = compile(&tool.input_schema).map_err(|reason| RegistryError::InvalidSchema {
            tool: tool.name.clone(),
            reason,
        })?;

        let name = tool.name.clone();
        let entry = Entry {
            tool: Arc::new(tool),
            validator: Arc::new(validator),
        };
        let previous = self
            .tools
            .write()
            .insert(name.clone(), entry)
            .map(|entry| entry.tool);

        let elapsed = started.elapsed();
        if elapsed >= SLOW_REGISTRATION {
            tracing::warn!(
                tool = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow tool registration"
            );
        }
        if previous.is_some() {
            tracing::info!(tool = %name, "Replaced tool");
        } else {
            tracing::debug!(tool = %name, "Registered tool");
        }
        Ok(previous)
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.read().get(name).map(|entry| entry.tool.clone())
    }

    /// All tool schemas, sorted by name
    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.read().values().map(|e| e.tool.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Validate arguments and run the named tool under its timeout.
    ///
    /// Never fails: unknown tools, invalid arguments, handler errors, panics
    /// and timeouts all come back as an unsuccessful [`ToolCallResult`].
    pub async fn call(&self, name: &str, arguments: Value, context: ToolContext) -> ToolCallResult {
        let entry = self.tools.read().get(name).cloned();
        let Some(Entry { tool, validator }) = entry else {
            return ToolCallResult::err(ToolError::invalid_params(format!("Unknown tool: {}", name)));
        };

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        if let Err(errors) = validate(&validator, &arguments) {
            tracing::debug!(tool = %name, errors = ?errors, "Rejected tool arguments");
            return ToolCallResult::err(
                ToolError::invalid_params(format!("Invalid arguments for tool {}", name))
                    .with_data(json!({ "errors": errors })),
            );
        }

        let timeout = tool.timeout.unwrap_or(self.default_timeout);
        let cancellation = context.cancellation.clone();
        let handler = tool.handler.clone();
        let mut task = tokio::spawn(async move { handler.call(arguments, context).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(data))) => ToolCallResult::ok(data),
            Ok(Ok(Err(err))) => {
                let error = match err.downcast::<ToolError>() {
                    Ok(tool_error) => tool_error,
                    Err(err) => ToolError::execution_failed(format!("{:#}", err)),
                };
                tracing::warn!(tool = %name, code = error.code, error = %error.message, "Tool call failed");
                ToolCallResult::err(error)
            }
            Ok(Err(join_error)) => {
                tracing::error!(tool = %name, error = %join_error, "Tool handler panicked");
                ToolCallResult::err(ToolError::execution_failed(format!(
                    "Tool {} panicked",
                    name
                )))
            }
            Err(_) => {
                cancellation.cancel();
                task.abort();
                tracing::warn!(tool = %name, timeout_ms = timeout.as_millis() as u64, "Tool call timed out");
                ToolCallResult::err(ToolError::timeout(name, timeout))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error_codes;
    use crate::tools::{echo_tool, json_schema_object, json_schema_string};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn constant_tool(name: &str, value: Value) -> Tool {
        Tool::from_fn(name, "constant", json!({ "type": "object" }), move |_args, _ctx| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[test]
    fn test_register_same_name_keeps_latest() {
        let registry = ToolRegistry::default();
        assert!(registry.register(constant_tool("dup", json!(1))).unwrap().is_none());
        let replaced = registry.register(constant_tool("dup", json!(2))).unwrap();

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_replaced_tool_serves_calls() {
        let registry = ToolRegistry::default();
        registry.register(constant_tool("dup", json!("first"))).unwrap();
        registry.register(constant_tool("dup", json!("second"))).unwrap();

        let result = registry.call("dup", json!({}), ToolContext::default()).await;
        assert_eq!(result.data, Some(json!("second")));
    }

    #[test]
    fn test_rejects_invalid_names_and_schemas() {
        let registry = ToolRegistry::default();
        assert!(matches!(
            registry.register(constant_tool("", json!(null))),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            registry.register(constant_tool("has space", json!(null))),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            registry.register(constant_tool(&"x".repeat(129), json!(null))),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(registry.register(constant_tool("fs/read.v2-beta_1", json!(null))).is_ok());

        let bad_schema = Tool::from_fn("bad", "", json!({ "type": "decimal" }), |_a, _c| async {
            Ok(json!(null))
        });
        assert!(matches!(
            registry.register(bad_schema),
            Err(RegistryError::InvalidSchema { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_sorted_by_name() {
        let registry = ToolRegistry::default();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(constant_tool(name, json!(null))).unwrap();
        }
        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(registry.contains("mid"));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let registry = ToolRegistry::default();
        let result = registry.call("nope", json!({}), ToolContext::default()).await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_handler() {
        let registry = ToolRegistry::default();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        registry
            .register(Tool::from_fn(
                "greet",
                "Greets",
                json_schema_object(json!({ "name": json_schema_string("Name") }), vec!["name"]),
                move |_args, _ctx| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(json!("hello")) }
                },
            ))
            .unwrap();

        let result = registry.call("greet", json!({ "name": 5 }), ToolContext::default()).await;
        let error = result.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert!(error.data.unwrap()["errors"].as_array().unwrap().len() == 1);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pattern_and_combinator_violations_skip_handler() {
        let registry = ToolRegistry::default();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        registry
            .register(Tool::from_fn(
                "lookup",
                "Looks up codes",
                json!({
                    "type": "object",
                    "properties": {
                        "code": { "type": "string", "pattern": "^[A-Z]+$" },
                        "ids": { "type": "array", "items": { "type": "integer" }, "minItems": 1 },
                        "mode": { "oneOf": [{ "const": "fast" }, { "const": "full" }] }
                    }
                }),
                move |_args, _ctx| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(json!("found")) }
                },
            ))
            .unwrap();

        let result = registry
            .call(
                "lookup",
                json!({ "code": "abc", "ids": [], "mode": "zzz" }),
                ToolContext::default(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, error_codes::INVALID_PARAMS);
        assert!(!invoked.load(Ordering::SeqCst));

        let result = registry
            .call(
                "lookup",
                json!({ "code": "ABC", "ids": [3.0], "mode": "full" }),
                ToolContext::default(),
            )
            .await;
        assert!(result.success);
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_null_arguments_treated_as_empty_object() {
        let registry = ToolRegistry::default();
        registry
            .register(Tool::from_fn(
                "args",
                "",
                json!({ "type": "object" }),
                |args, _ctx| async move { Ok(args) },
            ))
            .unwrap();

        let result = registry.call("args", Value::Null, ToolContext::default()).await;
        assert_eq!(result.data, Some(json!({})));
    }

    #[tokio::test]
    async fn test_success_iff_handler_completes() {
        let registry = ToolRegistry::default();
        registry.register(echo_tool()).unwrap();
        registry
            .register(Tool::from_fn("fails", "", json!({}), |_a, _c| async {
                Err(anyhow::anyhow!("disk full"))
            }))
            .unwrap();
        registry
            .register(Tool::from_fn("custom", "", json!({}), |_a, _c| async {
                Err(ToolError::new(4040, "not here").into())
            }))
            .unwrap();
        registry
            .register(Tool::from_fn("panics", "", json!({}), |_a, _c| async {
                if true {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }))
            .unwrap();

        let ok = registry.call("echo", json!({ "text": "hi" }), ToolContext::default()).await;
        assert!(ok.success);
        assert_eq!(ok.data, Some(json!({ "text": "hi" })));

        let failed = registry.call("fails", json!({}), ToolContext::default()).await;
        assert!(!failed.success);
        let error = failed.error.unwrap();
        assert_eq!(error.code, error_codes::TOOL_EXECUTION_FAILED);
        assert!(error.message.contains("disk full"));

        let custom = registry.call("custom", json!({}), ToolContext::default()).await;
        assert_eq!(custom.error.unwrap().code, 4040);

        let panicked = registry.call("panics", json!({}), ToolContext::default()).await;
        assert!(!panicked.success);
        assert_eq!(panicked.error.unwrap().code, error_codes::TOOL_EXECUTION_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_handler() {
        let registry = ToolRegistry::new(Duration::from_millis(100));
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        registry
            .register(Tool::from_fn("slow", "", json!({}), move |_a, _c| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }))
            .unwrap();

        let context = ToolContext::default();
        let token = context.cancellation.clone();
        let result = registry.call("slow", json!({}), context).await;

        assert_eq!(result.error.unwrap().code, error_codes::TOOL_TIMEOUT);
        assert!(token.is_cancelled());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_tool_timeout_overrides_default() {
        let registry = ToolRegistry::new(Duration::from_secs(60));
        registry
            .register(
                Tool::from_fn("quick", "", json!({}), |_a, _c| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                })
                .with_timeout(Duration::from_secs(1)),
            )
            .unwrap();

        let result = registry.call("quick", json!({}), ToolContext::default()).await;
        assert_eq!(result.error.unwrap().code, error_codes::TOOL_TIMEOUT);
    }
}
