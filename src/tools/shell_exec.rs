use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{schema_object, Tool, ToolResult};
use crate::llm_types::ToolDefinition;
use crate::text::floor_char_boundary;

const MAX_OUTPUT_BYTES: usize = 32 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct ShellExecTool {
    workspace: PathBuf,
}

impl ShellExecTool {
    pub fn new(workspace: &Path) -> Self {
        ShellExecTool {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell_exec"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell_exec".into(),
            description: "Run a shell command in the workspace and return its output".into(),
            input_schema: schema_object(
                json!({
                    "command": {"type": "string", "description": "Shell command to run"},
                    "timeout_secs": {"type": "integer", "description": "Optional timeout in seconds"}
                }),
                &["command"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let command = match input.get("command").and_then(|c| c.as_str()) {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return ToolResult::error("missing 'command'".into()),
        };
        let timeout_secs = input
            .get("timeout_secs")
            .and_then(|t| t.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.workspace)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::error(format!("failed to spawn: {e}")),
            Err(_) => {
                return ToolResult::error(format!("command timed out after {timeout_secs}s"))
                    .with_error_type("timeout")
            }
        };

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr] ");
            text.push_str(&stderr);
        }
        if text.len() > MAX_OUTPUT_BYTES {
            let cut = floor_char_boundary(&text, MAX_OUTPUT_BYTES);
            text.truncate(cut);
            text.push_str("\n... (output truncated)");
        }

        if output.status.success() {
            ToolResult::success(if text.is_empty() { "(no output)".into() } else { text })
        } else {
            let code = output.status.code().unwrap_or(-1);
            ToolResult::error(format!("exit code {code}\n{text}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellExecTool {
        let dir = std::env::temp_dir().join("wisp_shell_tool");
        std::fs::create_dir_all(&dir).unwrap();
        ShellExecTool::new(&dir)
    }

    #[tokio::test]
    async fn test_runs_command() {
        let result = tool().execute(json!({"command": "echo hi"})).await;
        assert!(!result.is_error);
        assert_eq!(result.content.trim(), "hi");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let result = tool().execute(json!({"command": "exit 3"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let result = tool().execute(json!({})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = tool()
            .execute(json!({"command": "sleep 5", "timeout_secs": 1}))
            .await;
        assert!(result.is_error);
        assert_eq!(result.error_type.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let result = tool().execute(json!({"command": "echo oops >&2"})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("[stderr] oops"));
    }
}
