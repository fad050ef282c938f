pub mod bash;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use parley_core::tools::{Tool, ToolContext, ToolDefinition, ToolExecutionError, ToolExecutor, ToolOutput};

use crate::truncate;

/// Registry of available tools. Acts as the session's tool collaborator:
/// dispatches by name and caps each result at the tool's output limit.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolExecutionError> {
        let tool = self
            .get(tool_name)
            .ok_or_else(|| ToolExecutionError::UnknownTool(tool_name.to_string()))?;

        let mut output = tool.execute(arguments, ctx).await?;
        let max = tool.max_output_bytes();
        if output.result_text.len() > max {
            debug!(tool = tool_name, bytes = output.result_text.len(), max, "truncating tool output");
            output.result_text = truncate::truncate_output(&output.result_text, max);
        }
        Ok(output)
    }
}

/// Create a ToolRegistry with the built-in tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(bash::BashTool::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::{SessionId, ToolCallId};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct EchoTool {
        name: String,
        limit: usize,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn max_output_bytes(&self) -> usize {
            self.limit
        }
        async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolExecutionError> {
            let text = args["text"]
                .as_str()
                .ok_or_else(|| ToolExecutionError::InvalidArguments("text is required".into()))?;
            Ok(ToolOutput::text(text))
        }
    }

    fn echo(name: &str, limit: usize) -> Arc<dyn Tool> {
        Arc::new(EchoTool { name: name.into(), limit })
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            call_id: ToolCallId::new(),
            working_directory: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("sqlite", 100));
        registry.register(echo("bash", 100));

        assert!(registry.contains("bash"));
        assert!(!registry.contains("ipython"));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.names(), vec!["bash", "sqlite"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "bash");
        assert_eq!(defs[1].description, "Echo the text argument");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({}), &ctx()).await.unwrap_err();
        assert_eq!(err, ToolExecutionError::UnknownTool("nope".into()));
    }

    #[tokio::test]
    async fn output_is_capped_per_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("small", 10));
        let out = registry
            .execute("small", json!({"text": "x".repeat(50)}), &ctx())
            .await
            .unwrap();
        assert!(out.result_text.starts_with("xxxxxxxxxx\n\n[truncated: 50 bytes -> 10 bytes]"));
    }

    #[test]
    fn default_registry_has_bash() {
        let registry = create_default_registry();
        assert!(registry.contains("bash"));
        assert_eq!(registry.get("bash").unwrap().max_output_bytes(), truncate::BASH_MAX_OUTPUT);
    }
}
