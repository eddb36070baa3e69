use async_trait::async_trait;
use serde_json::Value;

use crate::types::ToolSpec;

/// Result of one tool execution: JSON on success, an error message otherwise.
pub type ToolOutcome = Result<Value, String>;

/// Executes tool calls on behalf of the agent loop. The loop calls it once
/// per tool call, in the order the model issued them.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome;
}

/// A tool's execution handler. Consumers implement this for each tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> ToolOutcome;
}

/// A tool definition: catalog entry for the LLM + handler for execution.
pub struct ToolDef {
    pub spec: ToolSpec,
    pub(crate) handler: Box<dyn ToolHandler>,
}
