pub mod list_dir;
pub mod read_file;
pub mod shell_exec;
pub mod web_fetch;
pub mod write_file;

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::llm_types::ToolDefinition;

pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
    pub bytes: usize,
    pub duration_ms: Option<u128>,
    pub error_type: Option<String>,
}

impl ToolResult {
    pub fn success(content: String) -> Self {
        let bytes = content.len();
        ToolResult {
            content,
            is_error: false,
            bytes,
            duration_ms: None,
            error_type: None,
        }
    }

    pub fn error(content: String) -> Self {
        let bytes = content.len();
        ToolResult {
            content,
            is_error: true,
            bytes,
            duration_ms: None,
            error_type: Some("tool_error".to_string()),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

pub fn schema_object(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Resolve a tool path argument: absolute paths pass through, relative
/// ones land under the workspace.
pub fn resolve_tool_path(workspace: &Path, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        workspace.join(candidate)
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: Vec::new() }
    }

    /// The built-in set. Tool implementations beyond these arrive through
    /// `add_tool`.
    pub fn with_builtins(workspace: &Path) -> Self {
        let mut registry = ToolRegistry::new();
        registry.add_tool(Box::new(shell_exec::ShellExecTool::new(workspace)));
        registry.add_tool(Box::new(read_file::ReadFileTool::new(workspace)));
        registry.add_tool(Box::new(write_file::WriteFileTool::new(workspace)));
        registry.add_tool(Box::new(list_dir::ListDirTool::new(workspace)));
        registry.add_tool(Box::new(web_fetch::WebFetchTool::new(15)));
        registry
    }

    pub fn add_tool(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub async fn execute(&self, name: &str, input: serde_json::Value) -> ToolResult {
        for tool in &self.tools {
            if tool.name() == name {
                let started = Instant::now();
                let mut result = tool.execute(input).await;
                result.duration_ms = Some(started.elapsed().as_millis());
                result.bytes = result.content.len();
                return result;
            }
        }
        ToolResult::error(format!("Unknown tool: {name}")).with_error_type("unknown_tool")
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        ToolRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echo the input back".into(),
                input_schema: schema_object(json!({"text": {"type": "string"}}), &["text"]),
            }
        }

        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn test_schema_object() {
        let schema = schema_object(
            json!({"path": {"type": "string"}, "limit": {"type": "integer"}}),
            &["path"],
        );
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "path");
        assert!(schema["properties"]["limit"].is_object());
    }

    #[test]
    fn test_resolve_tool_path() {
        let workspace = Path::new("/work");
        assert_eq!(
            resolve_tool_path(workspace, "notes.txt"),
            PathBuf::from("/work/notes.txt")
        );
        assert_eq!(
            resolve_tool_path(workspace, "/etc/hosts"),
            PathBuf::from("/etc/hosts")
        );
    }

    #[tokio::test]
    async fn test_registry_executes_and_stamps() {
        let mut registry = ToolRegistry::new();
        registry.add_tool(Box::new(EchoTool));

        let result = registry.execute("echo", json!({"text": "hello"})).await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hello");
        assert_eq!(result.bytes, 5);
        assert!(result.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_registry_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("missing", json!({})).await;
        assert!(result.is_error);
        assert_eq!(result.error_type.as_deref(), Some("unknown_tool"));
    }

    #[test]
    fn test_builtins_present() {
        let workspace = std::env::temp_dir().join("wisp_tools_builtin");
        std::fs::create_dir_all(&workspace).unwrap();
        let registry = ToolRegistry::with_builtins(&workspace);
        let names = registry.names();
        for expected in ["shell_exec", "read_file", "write_file", "list_dir", "web_fetch"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(registry.definitions().len(), names.len());
    }

    #[test]
    fn test_tool_result_constructors() {
        let ok = ToolResult::success("done".into());
        assert!(!ok.is_error);
        assert_eq!(ok.bytes, 4);
        let err = ToolResult::error("boom".into()).with_error_type("timeout");
        assert!(err.is_error);
        assert_eq!(err.error_type.as_deref(), Some("timeout"));
    }
}
