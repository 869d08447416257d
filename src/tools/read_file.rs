use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use super::{resolve_tool_path, schema_object, Tool, ToolResult};
use crate::llm_types::ToolDefinition;
use crate::text::floor_char_boundary;

const MAX_READ_BYTES: usize = 64 * 1024;

pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: &Path) -> Self {
        ReadFileTool {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a text file (relative paths resolve inside the workspace)".into(),
            input_schema: schema_object(
                json!({"path": {"type": "string", "description": "File path"}}),
                &["path"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let path = match input.get("path").and_then(|p| p.as_str()) {
            Some(p) if !p.trim().is_empty() => resolve_tool_path(&self.workspace, p),
            _ => return ToolResult::error("missing 'path'".into()),
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(mut content) => {
                if content.len() > MAX_READ_BYTES {
                    let cut = floor_char_boundary(&content, MAX_READ_BYTES);
                    content.truncate(cut);
                    content.push_str("\n... (file truncated)");
                }
                ToolResult::success(content)
            }
            Err(e) => ToolResult::error(format!("cannot read {}: {e}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wisp_read_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reads_relative_path() {
        let dir = workspace();
        std::fs::write(dir.join("note.txt"), "hello wisp").unwrap();
        let tool = ReadFileTool::new(&dir);
        let result = tool.execute(json!({"path": "note.txt"})).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hello wisp");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = workspace();
        let tool = ReadFileTool::new(&dir);
        let result = tool.execute(json!({"path": "absent.txt"})).await;
        assert!(result.is_error);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_path_argument() {
        let dir = workspace();
        let tool = ReadFileTool::new(&dir);
        let result = tool.execute(json!({})).await;
        assert!(result.is_error);
        let _ = std::fs::remove_dir_all(dir);
    }
}
