// Built-in echo tool, useful for smoke-testing a transport end to end

use super::{json_schema_object, json_schema_string, Tool, ToolError};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct EchoArgs {
    text: String,
}

/// `echo {text}` returns `{text}` unchanged
pub fn echo_tool() -> Tool {
    Tool::from_fn(
        "echo",
        "Return the given text unchanged",
        json_schema_object(
            json!({ "text": json_schema_string("Text to echo back") }),
            vec!["text"],
        ),
        |arguments, _context| async move {
            let args: EchoArgs = serde_json::from_value(arguments)
                .map_err(|e| ToolError::invalid_params(e.to_string()))?;
            Ok::<_, anyhow::Error>(json!({ "text": args.text }))
        },
    )
}
