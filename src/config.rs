use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WispError;
use crate::gateway::ProviderEntry;
use crate::llm_types::GenParams;
use crate::router::{ComplexityWeights, ModelCapability, RoutingRule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub chat: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub vision: Option<String>,
    #[serde(default)]
    pub embed: Option<String>,
    #[serde(default)]
    pub coder: Option<String>,
}

fn default_workspace() -> String {
    "./wisp.workspace".into()
}

fn default_max_tool_iterations() -> usize {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub models: ModelsConfig,
    #[serde(flatten)]
    pub gen: GenParams,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Enable the adaptive router; off means every turn uses the chat model.
    #[serde(default = "default_true")]
    pub auto: bool,
    /// Prefer the highest capability tier when routing.
    #[serde(default)]
    pub max: bool,
}

/// A provider's served model: either a bare name/pattern or a full
/// capability block. Bare entries containing `*` are treated as patterns
/// only and never join the routing pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelEntry {
    Name(String),
    Capability(ModelCapability),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(flatten)]
    pub weights: ComplexityWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            enabled: true,
            rules: vec![],
            weights: ComplexityWeights::default(),
        }
    }
}

fn default_storage_path() -> String {
    "./wisp.data/memory".into()
}

fn default_search_limit() -> usize {
    5
}

fn default_retention_days() -> u32 {
    7
}

fn default_summarize_threshold() -> usize {
    20
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_max_models() -> usize {
    3
}

fn default_batch_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiEmbedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Coexisting embedding columns to retain, 1–10.
    #[serde(default = "default_max_models")]
    pub max_models: usize,
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed inter-batch sleep in ms; 0 means adaptive pacing.
    #[serde(default)]
    pub migrate_interval_ms: u64,
}

impl Default for MultiEmbedConfig {
    fn default() -> Self {
        MultiEmbedConfig {
            enabled: true,
            max_models: default_max_models(),
            auto_migrate: true,
            batch_size: default_batch_size(),
            migrate_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_retention_days")]
    pub short_term_retention_days: u32,
    #[serde(default = "default_true")]
    pub auto_summarize: bool,
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub multi_embed: MultiEmbedConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            enabled: true,
            storage_path: default_storage_path(),
            search_limit: default_search_limit(),
            short_term_retention_days: default_retention_days(),
            auto_summarize: true,
            summarize_threshold: default_summarize_threshold(),
            idle_timeout_ms: default_idle_timeout_ms(),
            multi_embed: MultiEmbedConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agents: AgentsConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Config {
    /// Load `wisp.config.yaml` (override path with `WISP_CONFIG`),
    /// expanding `${VAR}` from the environment. Validation is fail-fast.
    pub fn load() -> Result<Self, WispError> {
        dotenvy::dotenv().ok();

        let path = std::env::var("WISP_CONFIG").unwrap_or_else(|_| {
            if Path::new("wisp.config.yml").exists() {
                "wisp.config.yml".into()
            } else {
                "wisp.config.yaml".into()
            }
        });

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| WispError::Config(format!("cannot read {path}: {e}")))?;
        Self::from_yaml(&expand_env(&raw))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, WispError> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| WispError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WispError> {
        for (label, key) in [
            ("agents.models.chat", Some(&self.agents.models.chat)),
            ("agents.models.intent", self.agents.models.intent.as_ref()),
            ("agents.models.vision", self.agents.models.vision.as_ref()),
            ("agents.models.embed", self.agents.models.embed.as_ref()),
            ("agents.models.coder", self.agents.models.coder.as_ref()),
        ] {
            if let Some(key) = key {
                if !key.contains('/') {
                    return Err(WispError::Config(format!(
                        "{label} must be '<provider>/<model>', got '{key}'"
                    )));
                }
            }
        }

        let max_models = self.memory.multi_embed.max_models;
        if !(1..=10).contains(&max_models) {
            return Err(WispError::Config(format!(
                "memory.multi_embed.max_models must be in 1..=10, got {max_models}"
            )));
        }

        // Workspace access is checked at startup so tool dispatch never
        // discovers a missing directory at runtime.
        std::fs::create_dir_all(&self.agents.workspace).map_err(|e| {
            WispError::Config(format!(
                "workspace '{}' is not accessible: {e}",
                self.agents.workspace
            ))
        })?;

        Ok(())
    }

    /// Routing pool: every non-pattern model entry, ordered by provider
    /// priority, provider name, then the order models are listed.
    pub fn model_pool(&self) -> Vec<ModelCapability> {
        let mut providers: Vec<(&String, &ProviderConfig)> = self.providers.iter().collect();
        providers.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(b.0)));

        let mut pool = Vec::new();
        for (name, provider) in providers {
            for entry in &provider.models {
                match entry {
                    ModelEntry::Name(id) if !id.contains('*') => {
                        pool.push(ModelCapability::plain(name, id));
                    }
                    ModelEntry::Name(_) => {}
                    ModelEntry::Capability(cap) => {
                        let mut cap = cap.clone();
                        cap.provider = name.clone();
                        pool.push(cap);
                    }
                }
            }
        }
        pool
    }

    pub fn provider_entries(&self) -> Vec<ProviderEntry> {
        self.providers
            .iter()
            .map(|(name, p)| ProviderEntry {
                name: name.clone(),
                base_url: p.base_url.clone(),
                api_key: p.api_key.clone(),
                patterns: p
                    .models
                    .iter()
                    .map(|entry| match entry {
                        ModelEntry::Name(id) => id.clone(),
                        ModelEntry::Capability(cap) => cap.id.clone(),
                    })
                    .collect(),
                priority: p.priority,
            })
            .collect()
    }

    pub fn gen_defaults(&self) -> GenParams {
        self.agents.gen.clone()
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        let yaml = r#"
agents:
  workspace: "./tmp/wisp-test-workspace"
  models:
    chat: "openai/gpt-chat"
    intent: "openai/gpt-fast"
    embed: "openai/text-embed"
  max_tokens: 8192
  max_tool_iterations: 20
  auto: true
providers:
  openai:
    base_url: "http://127.0.0.1:9/v1"
    api_key: "test-key"
    models:
      - id: gpt-fast
        level: fast
      - id: gpt-chat
        level: medium
      - id: text-embed
routing:
  enabled: true
memory:
  enabled: true
  storage_path: "./tmp/wisp-test-memory"
"#;
        Config::from_yaml(yaml).expect("test config must parse")
    }
}

/// Replace `${VAR}` with the environment value; unset vars become empty.
fn expand_env(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env regex");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
