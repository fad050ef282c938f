use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{SessionId, ToolCallId};

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub call_id: ToolCallId,
    pub working_directory: PathBuf,
    pub cancel: CancellationToken,
}

/// What a tool hands back on success.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub result_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result_text: text.into(),
            artifacts: Vec::new(),
        }
    }
}

/// Binary or rich output (plots, images) produced alongside the text result.
/// `data` is base64 for binary media types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub media_type: String,
    pub data: String,
}

/// Tool definition sent to the model as part of the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// The collaborator that runs confirmed tool calls. Invoked exactly once per
/// confirmed call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn execute(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolExecutionError>;
}

/// Trait implemented by each individual tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Upper bound on the result text handed back to the model.
    fn max_output_bytes(&self) -> usize {
        256 * 1024
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolExecutionError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Code preview shown to the user before a call runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolPreview {
    pub code: Option<String>,
    pub language: Option<String>,
}

impl ToolPreview {
    pub fn for_call(tool_name: &str, arguments: &serde_json::Value) -> Self {
        let (field, language) = match tool_name {
            "bash" => ("command", "bash"),
            "ipython" => ("code", "python"),
            "sqlite" => ("query", "sql"),
            _ => return Self::default(),
        };
        Self {
            code: arguments.get(field).and_then(|v| v.as_str()).map(str::to_owned),
            language: Some(language.to_string()),
        }
    }
}
