use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{schema_object, Tool, ToolResult};
use crate::llm_types::ToolDefinition;
use crate::text::floor_char_boundary;

const MAX_BODY_BYTES: usize = 100 * 1024;

pub struct WebFetchTool {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl WebFetchTool {
    pub fn new(timeout_secs: u64) -> Self {
        WebFetchTool {
            client: reqwest::Client::new(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_fetch".into(),
            description: "Fetch a web page over HTTP(S) and return its text".into(),
            input_schema: schema_object(
                json!({"url": {"type": "string", "description": "http(s) URL to fetch"}}),
                &["url"],
            ),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let url = match input.get("url").and_then(|u| u.as_str()) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(u) => return ToolResult::error(format!("unsupported URL scheme: {u}")),
            None => return ToolResult::error("missing 'url'".into()),
        };

        let response = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("fetch failed: {e}")),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let mut body = body;
        if body.len() > MAX_BODY_BYTES {
            let cut = floor_char_boundary(&body, MAX_BODY_BYTES);
            body.truncate(cut);
            body.push_str("\n... (body truncated)");
        }

        if status.is_success() {
            ToolResult::success(body)
        } else {
            ToolResult::error(format!("HTTP {status}: {body}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let tool = WebFetchTool::new(5);
        let result = tool.execute(json!({"url": "file:///etc/passwd"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("unsupported URL scheme"));
    }

    #[tokio::test]
    async fn test_missing_url() {
        let tool = WebFetchTool::new(5);
        let result = tool.execute(json!({})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let tool = WebFetchTool::new(1);
        let result = tool
            .execute(json!({"url": "http://127.0.0.1:1/unreachable"}))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("fetch failed"));
    }
}
