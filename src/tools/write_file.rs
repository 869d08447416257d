use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use super::{resolve_tool_path, schema_object, Tool, ToolResult};
use crate::llm_types::ToolDefinition;

pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: &Path) -> Self {
        WriteFileTool {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            description: "Write content to a file, creating parent directories".into(),
            input_schema: schema_object(
                json!({
                    "path": {"type": "string", "description": "File path"},
                    "content": {"type": "string", "description": "Content to write"}
                }),
                &["path", "content"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let path = match input.get("path").and_then(|p| p.as_str()) {
            Some(p) if !p.trim().is_empty() => resolve_tool_path(&self.workspace, p),
            _ => return ToolResult::error("missing 'path'".into()),
        };
        let content = input
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!("cannot create {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::success(format!(
                "wrote {} bytes to {}",
                content.len(),
                path.display()
            )),
            Err(e) => ToolResult::error(format!("cannot write {}: {e}", path.display())),
        }
    }
}
