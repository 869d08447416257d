use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".into(),
            content: MessageContent::Text(content.into()),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: MessageContent::Text(content.into()),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".into(),
            content: MessageContent::Text(content.into()),
            tool_call_id: None,
        }
    }

    /// Flat text view of the message, with image parts rendered as a
    /// placeholder.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.as_str(),
                    ContentPart::ImageUrl { .. } => "[image]",
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(&self.content, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })))
    }
}

/// Fold media references into a user message. Vision-capable targets get
/// multipart content; everything else gets a textual placeholder per
/// attachment.
pub fn fold_media(content: &str, media: &[String], vision: bool) -> ChatMessage {
    if media.is_empty() {
        return ChatMessage::user(content);
    }

    if vision {
        let mut parts: Vec<ContentPart> = media
            .iter()
            .map(|url| ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.clone() },
            })
            .collect();
        if !content.is_empty() {
            parts.push(ContentPart::Text {
                text: content.to_string(),
            });
        }
        ChatMessage {
            role: "user".into(),
            content: MessageContent::Parts(parts),
            tool_call_id: None,
        }
    } else {
        let placeholder = format!("{content}\n[{} attachment(s) omitted]", media.len());
        ChatMessage::user(placeholder.trim().to_string())
    }
}

/// Replace image parts with placeholders across a message sequence, for
/// models without vision capability.
pub fn strip_image_parts(messages: &mut [ChatMessage]) {
    for msg in messages.iter_mut() {
        if let MessageContent::Parts(parts) = &mut msg.content {
            for part in parts.iter_mut() {
                if matches!(part, ContentPart::ImageUrl { .. }) {
                    *part = ContentPart::Text {
                        text: "[image omitted]".into(),
                    };
                }
            }
        }
    }
}

/// Generation parameters. Per-model capability values are merged over the
/// global defaults before each gateway call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
}

impl GenParams {
    /// Overlay `self` on top of `defaults`: any field set here wins.
    pub fn merged_over(&self, defaults: &GenParams) -> GenParams {
        GenParams {
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            temperature: self.temperature.or(defaults.temperature),
            top_k: self.top_k.or(defaults.top_k),
            top_p: self.top_p.or(defaults.top_p),
            frequency_penalty: self.frequency_penalty.or(defaults.frequency_penalty),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub used_provider: String,
    pub used_model: String,
    pub used_level: Option<String>,
    pub usage: Option<Usage>,
    pub has_tool_calls: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_serialization() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn test_message_parts_serialization() {
        let msg = fold_media("describe", &["data:image/png;base64,AAAA".into()], true);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["content"].is_array());
        assert_eq!(json["content"][0]["type"], "image_url");
        assert!(json["content"][0]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(json["content"][1]["type"], "text");
        assert_eq!(json["content"][1]["text"], "describe");
    }

    #[test]
    fn test_fold_media_without_vision_uses_placeholder() {
        let msg = fold_media("what is this", &["data:image/png;base64,AAAA".into()], false);
        match &msg.content {
            MessageContent::Text(t) => {
                assert!(t.contains("what is this"));
                assert!(t.contains("attachment(s) omitted"));
            }
            _ => panic!("expected text content"),
        }
        assert!(!msg.has_images());
    }

    #[test]
    fn test_fold_media_empty_media_is_plain_text() {
        let msg = fold_media("hi", &[], true);
        assert!(matches!(msg.content, MessageContent::Text(_)));
    }

    #[test]
    fn test_has_images() {
        let msg = fold_media("x", &["data:image/png;base64,AA".into()], true);
        assert!(msg.has_images());
        assert!(!ChatMessage::user("x").has_images());
    }

    #[test]
    fn test_strip_image_parts() {
        let mut msgs = vec![fold_media("caption", &["data:image/png;base64,AA".into()], true)];
        strip_image_parts(&mut msgs);
        assert!(!msgs[0].has_images());
        assert!(msgs[0].text().contains("[image omitted]"));
        assert!(msgs[0].text().contains("caption"));
    }

    #[test]
    fn test_gen_params_merge() {
        let defaults = GenParams {
            max_tokens: Some(8192),
            temperature: Some(0.7),
            top_k: None,
            top_p: Some(0.9),
            frequency_penalty: None,
        };
        let per_model = GenParams {
            max_tokens: Some(2048),
            temperature: None,
            top_k: Some(40),
            top_p: None,
            frequency_penalty: None,
        };
        let merged = per_model.merged_over(&defaults);
        assert_eq!(merged.max_tokens, Some(2048));
        assert_eq!(merged.temperature, Some(0.7));
        assert_eq!(merged.top_k, Some(40));
        assert_eq!(merged.top_p, Some(0.9));
        assert_eq!(merged.frequency_penalty, None);
    }

    #[test]
    fn test_message_content_untagged_roundtrip() {
        let json = serde_json::json!({"role": "user", "content": "plain"});
        let msg: ChatMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(msg.content, MessageContent::Text(_)));

        let json = serde_json::json!({
            "role": "user",
            "content": [{"type": "text", "text": "part"}]
        });
        let msg: ChatMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(msg.content, MessageContent::Parts(_)));
    }
}
