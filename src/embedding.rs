use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::Config;
use crate::error::WispError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, WispError>;
    /// Fully-qualified model key (`provider/id`).
    fn model_key(&self) -> &str;
    /// Fixed output dimension, probed on first use.
    async fn dimension(&self) -> Result<usize, WispError>;
}

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model_key: String,
    model_id: String,
    dim: OnceCell<usize>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(base_url: String, api_key: Option<String>, model_key: String) -> Self {
        let model_id = model_key
            .split_once('/')
            .map(|(_, id)| id.to_string())
            .unwrap_or_else(|| model_key.clone());
        OpenAiEmbeddingProvider {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model_key,
            model_id,
            dim: OnceCell::new(),
        }
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>, WispError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(url).json(&EmbeddingRequest {
            model: &self.model_id,
            input: text,
        });
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WispError::Embedding(format!("HTTP {status}: {body}")));
        }

        let body: EmbeddingResponse = response.json().await?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| WispError::Embedding("empty embedding response".into()))?;
        if embedding.is_empty() {
            return Err(WispError::Embedding("zero-length embedding".into()));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, WispError> {
        self.request(text).await
    }

    fn model_key(&self) -> &str {
        &self.model_key
    }

    async fn dimension(&self) -> Result<usize, WispError> {
        let dim = self
            .dim
            .get_or_try_init(|| async {
                let probe = self.request("test").await?;
                info!(
                    "embedding model {} dimension detected: {}",
                    self.model_key,
                    probe.len()
                );
                Ok::<usize, WispError>(probe.len())
            })
            .await?;
        Ok(*dim)
    }
}

/// Build the embedding provider from config; `None` when no embed model
/// is configured or its provider is unknown (memory degrades to
/// fulltext-only).
pub fn create_provider(config: &Config) -> Option<Arc<dyn EmbeddingProvider>> {
    let model_key = config.agents.models.embed.clone()?;
    let provider_name = model_key.split_once('/')?.0;
    let provider = config.providers.get(provider_name)?;
    Some(Arc::new(OpenAiEmbeddingProvider::new(
        provider.base_url.clone(),
        provider.api_key.clone(),
        model_key,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_none_without_embed_model() {
        let mut config = Config::test_defaults();
        config.agents.models.embed = None;
        assert!(create_provider(&config).is_none());
    }

    #[test]
    fn test_create_provider_none_for_unknown_provider() {
        let mut config = Config::test_defaults();
        config.agents.models.embed = Some("nowhere/embed".into());
        assert!(create_provider(&config).is_none());
    }

    #[test]
    fn test_create_provider_when_configured() {
        let config = Config::test_defaults();
        let provider = create_provider(&config).expect("provider");
        assert_eq!(provider.model_key(), "openai/text-embed");
    }

    #[test]
    fn test_model_id_strips_provider_prefix() {
        let p = OpenAiEmbeddingProvider::new(
            "http://127.0.0.1:9/v1".into(),
            None,
            "openai/text-embedding-3-small".into(),
        );
        assert_eq!(p.model_id, "text-embedding-3-small");
        assert_eq!(p.model_key(), "openai/text-embedding-3-small");
    }
}
