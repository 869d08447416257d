use serde::Deserialize;

/// One step of the ReAct protocol as emitted by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ReactStep {
    #[serde(default)]
    pub thought: String,
    pub action: String,
    #[serde(default)]
    pub action_input: serde_json::Value,
}

/// Where an action name resolves to after alias lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    Finish,
    Tool(String),
    Unknown(String),
}

/// Canonical alias table. Lookup is case-insensitive; the right-hand side
/// is either a registered tool name or the reserved `finish` action.
const ACTION_ALIASES: &[(&str, &str)] = &[
    ("exec", "shell_exec"),
    ("run", "shell_exec"),
    ("bash", "shell_exec"),
    ("sh", "shell_exec"),
    ("shell", "shell_exec"),
    ("done", "finish"),
    ("answer", "finish"),
    ("final", "finish"),
    ("final_answer", "finish"),
    ("ls", "list_dir"),
    ("dir", "list_dir"),
    ("cat", "read_file"),
    ("read", "read_file"),
    ("write", "write_file"),
    ("save", "write_file"),
    ("fetch", "web_fetch"),
    ("curl", "web_fetch"),
    ("browse", "web_fetch"),
];

/// Resolve a model-emitted action name to a tool. Aliases first, then a
/// direct case-insensitive match against the registry.
pub fn resolve_action(action: &str, tool_names: &[String]) -> ResolvedAction {
    let normalized = action.trim().to_lowercase();
    if normalized == "finish" {
        return ResolvedAction::Finish;
    }

    let canonical = ACTION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, target)| *target)
        .unwrap_or(normalized.as_str());

    if canonical == "finish" {
        return ResolvedAction::Finish;
    }

    if let Some(name) = tool_names
        .iter()
        .find(|n| n.eq_ignore_ascii_case(canonical))
    {
        return ResolvedAction::Tool(name.clone());
    }

    ResolvedAction::Unknown(action.trim().to_string())
}

/// Extract the first top-level `{...}` block from free text. Handles
/// fenced ```json blocks, nested braces, and braces inside string
/// literals.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a model reply as a ReAct step. Returns `None` when the reply
/// carries no parseable action object, in which case the caller treats
/// the raw content as the final answer.
pub fn parse_react(text: &str) -> Option<ReactStep> {
    let block = extract_json_block(text)?;
    let step: ReactStep = serde_json::from_str(block).ok()?;
    if step.action.trim().is_empty() {
        return None;
    }
    Some(step)
}

/// Canonical text form for an action input: strings pass through, other
/// JSON values are serialized.
pub fn stringify_input(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
