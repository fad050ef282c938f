use std::time::Duration;

use async_trait::async_trait;
use parley_core::tools::{Tool, ToolContext, ToolExecutionError, ToolOutput};

use crate::truncate::BASH_MAX_OUTPUT;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Runs a command with `bash -c` in the session's working directory.
pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 3600)"
                }
            }
        })
    }

    fn max_output_bytes(&self) -> usize {
        BASH_MAX_OUTPUT
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolExecutionError> {
        let command = args["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolExecutionError::InvalidArguments("command is required".into()))?;

        let timeout = args["timeout"]
            .as_u64()
            .map(|secs| Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECS)))
            .unwrap_or(self.timeout);

        let child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_directory)
            .kill_on_drop(true)
            .output();

        // Dropping the future kills the child.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolExecutionError::Cancelled),
            res = tokio::time::timeout(timeout, child) => res
                .map_err(|_| ToolExecutionError::Timeout(timeout))?
                .map_err(|e| ToolExecutionError::Failed(format!("Failed to execute command: {e}")))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str("STDERR:\n");
            result.push_str(&stderr);
        }
        if result.is_empty() {
            result = "(no output)".to_string();
        }
        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            result = format!("Exit code: {exit_code}\n{result}");
        }

        Ok(ToolOutput::text(result))
    }
}
