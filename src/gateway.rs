use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::WispError;
use crate::llm_types::{
    ChatMessage, ChatResponse, GenParams, ToolCallRequest, ToolDefinition, Usage,
};
use crate::router::ModelCapability;

/// One upstream OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Served model patterns; `"*"` is a catch-all, a trailing `*` is a
    /// prefix match.
    pub patterns: Vec<String>,
    /// Lower is more preferred when failing over.
    pub priority: i32,
}

pub fn pattern_matches(pattern: &str, model_id: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return model_id.to_lowercase().starts_with(&prefix.to_lowercase());
    }
    pattern.eq_ignore_ascii_case(model_id)
}

/// Registry of providers plus the capability table. `chat` resolves a
/// `"<provider>/<id>"` key and fails over to the next matching provider
/// on transport errors, timeouts, and 5xx responses.
pub struct LlmGateway {
    providers: Vec<ProviderEntry>,
    capabilities: HashMap<String, ModelCapability>,
    http: reqwest::Client,
}

impl LlmGateway {
    pub fn new(mut providers: Vec<ProviderEntry>, pool: &[ModelCapability]) -> Self {
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        let capabilities = pool
            .iter()
            .map(|c| (c.model_key(), c.clone()))
            .collect::<HashMap<_, _>>();
        LlmGateway {
            providers,
            capabilities,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn capability(&self, model_key: &str) -> Option<&ModelCapability> {
        self.capabilities.get(model_key)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Providers to try for a model key: the named one first, then every
    /// other provider whose patterns cover the model id, in priority
    /// order.
    fn candidates(&self, provider_name: &str, model_id: &str) -> Vec<&ProviderEntry> {
        let mut out: Vec<&ProviderEntry> = Vec::new();
        if let Some(named) = self.provider(provider_name) {
            out.push(named);
        }
        for p in &self.providers {
            if p.name == provider_name {
                continue;
            }
            if p.patterns.iter().any(|pat| pattern_matches(pat, model_id)) {
                out.push(p);
            }
        }
        out
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model_key: &str,
        gen: &GenParams,
    ) -> Result<ChatResponse, WispError> {
        let (provider_name, model_id) = model_key
            .split_once('/')
            .ok_or_else(|| WispError::LlmApi(format!("invalid model key '{model_key}'")))?;

        let capability = self.capabilities.get(model_key);
        let send_tools = !tools.is_empty() && capability.map(|c| c.tool).unwrap_or(false);
        let body = build_request_body(model_id, messages, gen, if send_tools { tools } else { &[] });

        let candidates = self.candidates(provider_name, model_id);
        if candidates.is_empty() {
            return Err(WispError::NoProvider(model_key.to_string()));
        }

        let mut last_error: Option<WispError> = None;
        for provider in candidates {
            match self.chat_via(provider, &body).await {
                Ok(raw) => {
                    let mut response = translate_response(raw);
                    response.used_provider = provider.name.clone();
                    response.used_model = model_id.to_string();
                    response.used_level = capability.map(|c| c.level.as_str().to_string());
                    return Ok(response);
                }
                Err(e) if is_retriable(&e) => {
                    warn!(
                        "provider '{}' failed for {model_key}: {e}; trying next",
                        provider.name
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| WispError::NoProvider(model_key.to_string())))
    }

    async fn chat_via(
        &self,
        provider: &ProviderEntry,
        body: &serde_json::Value,
    ) -> Result<OaiResponse, WispError> {
        let url = format!(
            "{}/chat/completions",
            provider.base_url.trim_end_matches('/')
        );

        let mut retries = 0u32;
        let max_retries = 3;

        loop {
            let mut req = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = provider.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
                req = req.header("Authorization", format!("Bearer {key}"));
            }
            let response = req.send().await?;
            let status = response.status();

            if status.is_success() {
                let text = response.text().await?;
                let parsed: OaiResponse = serde_json::from_str(&text).map_err(|e| {
                    WispError::LlmApi(format!("Failed to parse response: {e}\nBody: {text}"))
                })?;
                return Ok(parsed);
            }

            if status.as_u16() == 429 && retries < max_retries {
                retries += 1;
                let delay = Duration::from_secs(2u64.pow(retries));
                warn!(
                    "Rate limited by '{}', retrying in {:?} (attempt {retries}/{max_retries})",
                    provider.name, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(WispError::LlmApi(format!("upstream HTTP {status}: {text}")));
            }
            if let Ok(err) = serde_json::from_str::<OaiErrorResponse>(&text) {
                return Err(WispError::LlmApi(err.error.message));
            }
            return Err(WispError::LlmApi(format!("HTTP {status}: {text}")));
        }
    }

    /// `GET {base}/models` discovery for one provider.
    pub async fn list_models(&self, provider_name: &str) -> Result<Vec<String>, WispError> {
        let provider = self
            .provider(provider_name)
            .ok_or_else(|| WispError::NoProvider(provider_name.to_string()))?;
        let url = format!("{}/models", provider.base_url.trim_end_matches('/'));

        let mut req = self.http.get(&url);
        if let Some(key) = provider.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WispError::LlmApi(format!("HTTP {status}: {text}")));
        }

        let listing: OaiModelListing = response.json().await?;
        Ok(listing.data.into_iter().map(|m| m.id).collect())
    }
}

fn is_retriable(e: &WispError) -> bool {
    match e {
        WispError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        WispError::LlmApi(msg) => msg.starts_with("upstream HTTP 5"),
        _ => false,
    }
}

pub(crate) fn build_request_body(
    model_id: &str,
    messages: &[ChatMessage],
    gen: &GenParams,
    tools: &[ToolDefinition],
) -> serde_json::Value {
    let mut body = json!({
        "model": model_id,
        "messages": messages,
    });

    if let Some(max_tokens) = gen.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = gen.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = gen.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(top_k) = gen.top_k {
        body["top_k"] = json!(top_k);
    }
    if let Some(frequency_penalty) = gen.frequency_penalty {
        body["frequency_penalty"] = json!(frequency_penalty);
    }

    if !tools.is_empty() {
        let tool_list: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tool_list);
        body["tool_choice"] = json!("auto");
    }

    body
}

// --- OpenAI-compatible response types ---

#[derive(Debug, Deserialize)]
pub(crate) struct OaiResponse {
    choices: Vec<OaiChoice>,
    usage: Option<OaiUsage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCall {
    id: String,
    function: OaiFunction,
}

#[derive(Debug, Deserialize)]
struct OaiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OaiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OaiModelListing {
    data: Vec<OaiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OaiModelEntry {
    id: String,
}

pub(crate) fn translate_response(oai: OaiResponse) -> ChatResponse {
    let (content, tool_calls) = match oai.choices.into_iter().next() {
        Some(choice) => {
            let content = choice.message.content.unwrap_or_default();
            let calls: Vec<ToolCallRequest> = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCallRequest {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
                })
                .collect();
            (content, calls)
        }
        None => (String::new(), Vec::new()),
    };

    let usage = oai.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u
            .total_tokens
            .unwrap_or(u.prompt_tokens + u.completion_tokens),
    });

    let has_tool_calls = !tool_calls.is_empty();
    ChatResponse {
        content,
        tool_calls,
        used_provider: String::new(),
        used_model: String::new(),
        used_level: None,
        usage,
        has_tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ModelLevel;
    use serde_json::json;

    fn provider(name: &str, priority: i32, patterns: &[&str]) -> ProviderEntry {
        ProviderEntry {
            name: name.into(),
            base_url: format!("http://127.0.0.1:1/{name}"),
            api_key: None,
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            priority,
        }
    }

    fn cap(provider: &str, id: &str, tool: bool) -> ModelCapability {
        let mut c = ModelCapability::plain(provider, id);
        c.tool = tool;
        c.level = ModelLevel::Medium;
        c
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("gpt-*", "gpt-4.1"));
        assert!(pattern_matches("GPT-*", "gpt-4.1"));
        assert!(pattern_matches("qwen-max", "Qwen-Max"));
        assert!(!pattern_matches("gpt-*", "claude-3"));
        assert!(!pattern_matches("qwen-max", "qwen-plus"));
    }

    #[test]
    fn test_candidates_named_first_then_priority() {
        let gw = LlmGateway::new(
            vec![
                provider("backup", 10, &["*"]),
                provider("primary", 0, &["gpt-*"]),
                provider("named", 5, &["gpt-4"]),
            ],
            &[],
        );
        let c = gw.candidates("named", "gpt-4");
        let names: Vec<&str> = c.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["named", "primary", "backup"]);
    }

    #[test]
    fn test_candidates_skip_non_matching() {
        let gw = LlmGateway::new(
            vec![
                provider("a", 0, &["claude-*"]),
                provider("b", 1, &["gpt-*"]),
            ],
            &[],
        );
        let c = gw.candidates("a", "claude-x");
        let names: Vec<&str> = c.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_build_request_body_gen_params() {
        let gen = GenParams {
            max_tokens: Some(1024),
            temperature: Some(0.3),
            top_k: Some(50),
            top_p: Some(0.95),
            frequency_penalty: Some(0.1),
        };
        let body = build_request_body("gpt-4", &[ChatMessage::user("hi")], &gen, &[]);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_k"], 50);
        assert_eq!(body["top_p"], 0.95);
        assert_eq!(body["frequency_penalty"], 0.1);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_request_body_omits_unset_params() {
        let body = build_request_body("m", &[], &GenParams::default(), &[]);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_build_request_body_with_tools() {
        let tools = vec![ToolDefinition {
            name: "read_file".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = build_request_body("m", &[], &GenParams::default(), &tools);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn test_translate_response_text() {
        let oai: OaiResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "Hello!"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4}
        }))
        .unwrap();
        let resp = translate_response(oai);
        assert_eq!(resp.content, "Hello!");
        assert!(!resp.has_tool_calls);
        let usage = resp.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 4);
        assert_eq!(usage.total_tokens, 16);
    }

    #[test]
    fn test_translate_response_tool_calls() {
        let oai: OaiResponse = serde_json::from_value(json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "shell_exec", "arguments": "{\"command\":\"ls\"}"}
                }]
            }}]
        }))
        .unwrap();
        let resp = translate_response(oai);
        assert!(resp.has_tool_calls);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "shell_exec");
        assert_eq!(resp.tool_calls[0].arguments["command"], "ls");
    }

    #[test]
    fn test_translate_response_empty_choices() {
        let oai: OaiResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        let resp = translate_response(oai);
        assert_eq!(resp.content, "");
        assert!(!resp.has_tool_calls);
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_capability_lookup_by_key() {
        let gw = LlmGateway::new(
            vec![provider("openai", 0, &["*"])],
            &[cap("openai", "gpt-4", true)],
        );
        assert!(gw.capability("openai/gpt-4").is_some());
        assert!(gw.capability("openai/unknown").is_none());
    }

    #[tokio::test]
    async fn test_chat_rejects_bad_model_key() {
        let gw = LlmGateway::new(vec![provider("openai", 0, &["*"])], &[]);
        let err = gw
            .chat(&[], &[], "no-slash-here", &GenParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid model key"));
    }

    #[tokio::test]
    async fn test_chat_no_matching_provider() {
        let gw = LlmGateway::new(vec![provider("a", 0, &["claude-*"])], &[]);
        let err = gw
            .chat(&[], &[], "missing/gpt-4", &GenParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WispError::NoProvider(_)));
    }

    #[test]
    fn test_is_retriable_upstream_5xx() {
        assert!(is_retriable(&WispError::LlmApi(
            "upstream HTTP 503 Service Unavailable: busy".into()
        )));
        assert!(!is_retriable(&WispError::LlmApi("bad request".into())));
        assert!(!is_retriable(&WispError::Config("x".into())));
    }
}
