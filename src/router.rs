use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::LlmGateway;
use crate::llm_types::{ChatMessage, GenParams};
use crate::react::extract_json_block;

/// Discrete capability tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLevel {
    Fast,
    Low,
    Medium,
    High,
    Ultra,
}

impl ModelLevel {
    pub fn priority(self) -> u8 {
        match self {
            ModelLevel::Fast => 1,
            ModelLevel::Low => 2,
            ModelLevel::Medium => 3,
            ModelLevel::High => 4,
            ModelLevel::Ultra => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelLevel::Fast => "fast",
            ModelLevel::Low => "low",
            ModelLevel::Medium => "medium",
            ModelLevel::High => "high",
            ModelLevel::Ultra => "ultra",
        }
    }

    /// Map a complexity score in [0,100] to a level band.
    pub fn from_complexity(score: u8) -> Self {
        match score {
            0..=19 => ModelLevel::Fast,
            20..=39 => ModelLevel::Low,
            40..=59 => ModelLevel::Medium,
            60..=79 => ModelLevel::High,
            _ => ModelLevel::Ultra,
        }
    }
}

impl std::fmt::Display for ModelLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_tool() -> bool {
    true
}

fn default_level() -> ModelLevel {
    ModelLevel::Medium
}

/// Capability tags for one model in the pool. Deserialized from the
/// `providers.<name>.models` config list; `provider` is filled in from
/// the section key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapability {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_level")]
    pub level: ModelLevel,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub think: bool,
    #[serde(default = "default_tool")]
    pub tool: bool,
    #[serde(flatten)]
    pub gen: GenParams,
}

impl ModelCapability {
    pub fn plain(provider: &str, id: &str) -> Self {
        ModelCapability {
            id: id.to_string(),
            provider: provider.to_string(),
            level: ModelLevel::Medium,
            vision: false,
            think: false,
            tool: true,
            gen: GenParams::default(),
        }
    }

    pub fn model_key(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    pub level: ModelLevel,
    #[serde(default)]
    pub priority: i32,
}

impl RoutingRule {
    fn matches(&self, content: &str) -> bool {
        let len = content.chars().count();
        if self.min_length.is_some_and(|min| len < min) {
            return false;
        }
        if self.max_length.is_some_and(|max| len > max) {
            return false;
        }
        let lower = content.to_lowercase();
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }
}

fn default_base_score() -> u32 {
    10
}

fn default_length_weight() -> u32 {
    5
}

fn default_code_block_score() -> u32 {
    30
}

fn default_tool_call_score() -> u32 {
    20
}

fn default_multi_turn_score() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityWeights {
    #[serde(default = "default_base_score")]
    pub base_score: u32,
    #[serde(default = "default_length_weight")]
    pub length_weight: u32,
    #[serde(default = "default_code_block_score")]
    pub code_block_score: u32,
    #[serde(default = "default_tool_call_score")]
    pub tool_call_score: u32,
    #[serde(default = "default_multi_turn_score")]
    pub multi_turn_score: u32,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        ComplexityWeights {
            base_score: default_base_score(),
            length_weight: default_length_weight(),
            code_block_score: default_code_block_score(),
            tool_call_score: default_tool_call_score(),
            multi_turn_score: default_multi_turn_score(),
        }
    }
}

/// Phrases that flag a turn as likely to need tool calls.
const TOOL_NEED_KEYWORDS: &[&str] = &[
    "搜索", "查一下", "查询", "打开文件", "读取", "运行", "执行", "帮我找", "下载", "抓取",
    "访问", "安装", "search", "look up", "fetch", "download", "run ", "execute", "open file",
    "read file", "write file", "list file", "browse", "install",
];

pub fn needs_tools(content: &str) -> bool {
    let lower = content.to_lowercase();
    TOOL_NEED_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub model: String,
    pub capability: ModelCapability,
    pub complexity: u8,
    pub reason: String,
}

pub struct RouterOptions {
    pub auto: bool,
    pub max: bool,
    pub default_chat: String,
    pub intent_model: Option<String>,
}

/// Picks a concrete model for each executor iteration. The pool keeps
/// registration order (provider priority, then provider name, then model
/// order) so selection is stable.
pub struct ModelRouter {
    pool: Vec<ModelCapability>,
    rules: Vec<RoutingRule>,
    weights: ComplexityWeights,
    options: RouterOptions,
}

impl ModelRouter {
    pub fn new(
        pool: Vec<ModelCapability>,
        mut rules: Vec<RoutingRule>,
        weights: ComplexityWeights,
        options: RouterOptions,
    ) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        ModelRouter {
            pool,
            rules,
            weights,
            options,
        }
    }

    pub fn pool(&self) -> &[ModelCapability] {
        &self.pool
    }

    fn capability_for_key(&self, key: &str) -> ModelCapability {
        self.pool
            .iter()
            .find(|c| c.model_key() == key)
            .cloned()
            .unwrap_or_else(|| {
                let (provider, id) = key.split_once('/').unwrap_or(("", key));
                ModelCapability::plain(provider, id)
            })
    }

    fn decision_for(&self, cap: &ModelCapability, complexity: u8, reason: String) -> RouteDecision {
        RouteDecision {
            model: cap.model_key(),
            capability: cap.clone(),
            complexity,
            reason,
        }
    }

    pub fn complexity_score(&self, content: &str, num_turns: usize) -> u8 {
        let w = &self.weights;
        let len = content.chars().count() as u32;
        let mut score = w.base_score as i64;
        score += ((len / 100) * w.length_weight).min(20) as i64;
        if content.contains('`') {
            score += w.code_block_score as i64;
        }
        if needs_tools(content) {
            score += w.tool_call_score as i64;
        }
        score += ((num_turns as u32) * w.multi_turn_score).min(10) as i64;
        score.clamp(0, 100) as u8
    }

    /// Full routing entry point. Iteration 1 in auto mode may consult the
    /// intent model; later iterations are deterministic.
    pub async fn route(
        &self,
        gateway: &LlmGateway,
        messages: &[ChatMessage],
        has_images: bool,
        iteration: usize,
    ) -> RouteDecision {
        let content = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.text())
            .unwrap_or_default();
        let num_turns = messages.len();

        if !self.options.auto {
            let cap = self.capability_for_key(&self.options.default_chat);
            return self.decision_for(&cap, 0, "routing disabled → default chat model".into());
        }

        if iteration <= 1 {
            if let Some(intent_model) = self.options.intent_model.clone() {
                if let Some(decision) = self
                    .intent_prepass(gateway, &intent_model, &content, has_images)
                    .await
                {
                    return decision;
                }
                debug!("intent pre-pass inconclusive, using deterministic routing");
            }
        }

        self.route_deterministic(&content, num_turns, has_images)
    }

    /// Deterministic routing: vision override, max mode, rules, then
    /// complexity bands, with a tool-need capability gate.
    pub fn route_deterministic(
        &self,
        content: &str,
        num_turns: usize,
        has_images: bool,
    ) -> RouteDecision {
        let complexity = self.complexity_score(content, num_turns);

        if self.pool.is_empty() {
            let cap = self.capability_for_key(&self.options.default_chat);
            return self.decision_for(
                &cap,
                complexity,
                "empty model pool → default chat model".into(),
            );
        }

        if has_images {
            if let Some(cap) = self.pick_vision(ModelLevel::from_complexity(complexity)) {
                let reason = format!(
                    "图片消息 → vision model {} (complexity {})",
                    cap.model_key(),
                    complexity
                );
                return self.decision_for(&cap.clone(), complexity, reason);
            }
            warn!("image attached but no vision-capable model in the pool");
        }

        let (target, why) = if self.options.max {
            (ModelLevel::Ultra, "max mode → ultra tier".to_string())
        } else if let Some(rule) = self.rules.iter().find(|r| r.matches(content)) {
            let keyword = rule.keywords.first().cloned().unwrap_or_default();
            (rule.level, format!("rule '{keyword}' → {}", rule.level))
        } else {
            let level = ModelLevel::from_complexity(complexity);
            (level, format!("complexity {complexity} → {level}"))
        };

        let require_tool = needs_tools(content);
        let (cap, adjusted) = self.select(target, require_tool);
        let reason = if adjusted {
            format!("{why} (nearest available: {})", cap.level)
        } else {
            why
        };
        self.decision_for(&cap.clone(), complexity, reason)
    }

    /// Vision override: among vision-capable models, the level closest to
    /// the complexity-derived target wins; ties go up in max mode, down
    /// otherwise.
    fn pick_vision(&self, target: ModelLevel) -> Option<&ModelCapability> {
        self.pool
            .iter()
            .filter(|c| c.vision)
            .min_by_key(|c| {
                let diff = c.level.priority() as i16 - target.priority() as i16;
                let tie_break = if self.options.max { -diff } else { diff };
                (diff.abs(), tie_break)
            })
    }

    /// Pick a model for the target level. The tool-need gate filters to
    /// `tool=true` first and relaxes when that empties the pool. Returns
    /// the capability and whether the level had to be adjusted.
    fn select(&self, target: ModelLevel, require_tool: bool) -> (&ModelCapability, bool) {
        let filtered: Vec<&ModelCapability> = {
            let gated: Vec<&ModelCapability> = self
                .pool
                .iter()
                .filter(|c| !require_tool || c.tool)
                .collect();
            if gated.is_empty() {
                self.pool.iter().collect()
            } else {
                gated
            }
        };

        for &cap in &filtered {
            if cap.level == target {
                return (cap, false);
            }
        }

        (self.nearest_level(&filtered, target), true)
    }

    fn nearest_level<'a>(
        &self,
        candidates: &[&'a ModelCapability],
        target: ModelLevel,
    ) -> &'a ModelCapability {
        let tp = target.priority() as i16;

        // Preferred side: at-or-above for max mode, at-or-below otherwise.
        // Among the preferred subset, the smallest |diff| wins; first in
        // pool order breaks ties. Failing that, the global extreme.
        let mut preferred: Option<&'a ModelCapability> = None;
        let mut extreme: Option<&'a ModelCapability> = None;

        for &cap in candidates {
            let diff = cap.level.priority() as i16 - tp;
            let on_preferred_side = if self.options.max { diff >= 0 } else { diff <= 0 };

            if on_preferred_side {
                let better = match preferred {
                    Some(cur) => {
                        let cur_diff = (cur.level.priority() as i16 - tp).abs();
                        diff.abs() < cur_diff
                    }
                    None => true,
                };
                if better {
                    preferred = Some(cap);
                }
            }

            let more_extreme = match extreme {
                Some(cur) => {
                    if self.options.max {
                        cap.level.priority() > cur.level.priority()
                    } else {
                        cap.level.priority() < cur.level.priority()
                    }
                }
                None => true,
            };
            if more_extreme {
                extreme = Some(cap);
            }
        }

        preferred
            .or(extreme)
            .expect("nearest_level called with empty candidate set")
    }

    /// Intent pre-pass: a cheap LLM call proposing a concrete model from
    /// the catalogue. Any inconsistency falls back to deterministic
    /// routing.
    async fn intent_prepass(
        &self,
        gateway: &LlmGateway,
        intent_model: &str,
        content: &str,
        has_images: bool,
    ) -> Option<RouteDecision> {
        let catalogue: Vec<&ModelCapability> = self
            .pool
            .iter()
            .filter(|c| !has_images || c.vision)
            .collect();
        if catalogue.is_empty() {
            return None;
        }

        let listing = catalogue
            .iter()
            .map(|c| {
                format!(
                    "- {} (level={}, vision={}, tool={})",
                    c.model_key(),
                    c.level,
                    c.vision,
                    c.tool
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system = "You route user requests to the best model. Reply with one JSON object: {\"model\": \"<provider/id>\", \"reason\": \"...\"}. Pick only from the catalogue.";
        let user = format!("Catalogue:\n{listing}\n\nUser request:\n{content}");

        let gen = GenParams {
            max_tokens: Some(200),
            temperature: Some(0.0),
            ..GenParams::default()
        };
        let reply = match gateway
            .chat(
                &[ChatMessage::system(system), ChatMessage::user(user)],
                &[],
                intent_model,
                &gen,
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("intent pre-pass failed: {e}");
                return None;
            }
        };

        let cap = parse_intent_reply(&reply.content, &catalogue)?;
        if has_images && !cap.vision {
            return None;
        }
        let complexity = self.complexity_score(content, 1);
        let reason = format!("intent → {}", cap.model_key());
        Some(self.decision_for(&cap.clone(), complexity, reason))
    }
}

/// Parse the intent model's `{model, reason}` reply against a catalogue.
/// Accepts a fully-qualified key or a bare model id.
pub(crate) fn parse_intent_reply<'a>(
    reply: &str,
    catalogue: &[&'a ModelCapability],
) -> Option<&'a ModelCapability> {
    #[derive(Deserialize)]
    struct IntentPick {
        model: String,
    }

    let block = extract_json_block(reply)?;
    let pick: IntentPick = serde_json::from_str(block).ok()?;
    let name = pick.model.trim();
    catalogue
        .iter()
        .find(|c| c.model_key() == name || c.id == name)
        .copied()
}
