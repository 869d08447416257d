use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use super::{resolve_tool_path, schema_object, Tool, ToolResult};
use crate::llm_types::ToolDefinition;

pub struct ListDirTool {
    workspace: PathBuf,
}

impl ListDirTool {
    pub fn new(workspace: &Path) -> Self {
        ListDirTool {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_dir".into(),
            description: "List directory entries (defaults to the workspace root)".into(),
            input_schema: schema_object(
                json!({"path": {"type": "string", "description": "Directory path, optional"}}),
                &[],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let path = match input.get("path").and_then(|p| p.as_str()) {
            Some(p) if !p.trim().is_empty() => resolve_tool_path(&self.workspace, p),
            _ => self.workspace.clone(),
        };

        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) => return ToolResult::error(format!("cannot list {}: {e}", path.display())),
        };

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            ToolResult::success("(empty directory)".into())
        } else {
            ToolResult::success(names.join("\n"))
        }
    }
}
