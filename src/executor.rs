use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::InboundMessage;
use crate::error::WispError;
use crate::llm_types::{fold_media, strip_image_parts, ChatMessage};
use crate::memory::{SearchMode, SearchOptions};
use crate::memory_store::MemoryKind;
use crate::react::{parse_react, resolve_action, stringify_input, ResolvedAction};
use crate::runtime::AppState;
use crate::sessions::Turn;
use crate::skills::Skill;
use crate::text::redact_sensitive;

const APOLOGY: &str =
    "Sorry, something went wrong while handling your message. Please try again.";
const LOOP_EXHAUSTED: &str =
    "I hit the reasoning step limit before finishing. Please try breaking your request into \
     smaller steps.";

/// Entry point for one inbound message: runs the turn and converts any
/// escaped failure into a single user-visible apology.
pub async fn process_message(state: &AppState, msg: &InboundMessage) -> String {
    match run_turn(state, msg).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("turn failed for {}: {e}", msg.session_key());
            APOLOGY.to_string()
        }
    }
}

async fn run_turn(state: &AppState, msg: &InboundMessage) -> Result<String, WispError> {
    let session_key = msg.session_key();
    let history = state.sessions.history(&session_key);

    // Retrieved memories for the current turn.
    let memory_context = match &state.memory {
        Some(memory) => {
            let opts = SearchOptions {
                mode: SearchMode::Auto,
                limit: Some(state.config.memory.search_limit),
                ..SearchOptions::default()
            };
            match memory.search(&msg.content, &opts).await {
                Ok(hits) if !hits.is_empty() => {
                    let mut block = String::from("<memories>\n");
                    for hit in hits {
                        block.push_str(&format!("[{}] {}\n", hit.kind.as_str(), hit.content));
                    }
                    block.push_str("</memories>");
                    block
                }
                Ok(_) => String::new(),
                Err(e) => {
                    warn!("memory retrieval failed: {e}");
                    String::new()
                }
            }
        }
        None => String::new(),
    };

    let always = state.skills.always_skills();
    let catalog = state.skills.build_catalog();
    let prompt_files = load_prompt_files(&state.config.agents.workspace);
    let tool_names = state.tools.names();
    let system = build_system_prompt(
        &prompt_files,
        &always,
        &catalog,
        &memory_context,
        &tool_names,
    );

    // Working sequence: system + recent history + current turn with media
    // folded in (vision form; stripped per iteration as needed).
    let mut working: Vec<ChatMessage> = Vec::with_capacity(history.len() + 2);
    working.push(ChatMessage::system(system));
    working.extend(history_to_messages(&history));
    working.push(fold_media(&msg.content, &msg.media, true));
    let has_images = !msg.media.is_empty();

    let max_iterations = state.config.agents.max_tool_iterations.max(1);
    let gen_defaults = state.config.gen_defaults();

    let mut final_reply: Option<String> = None;
    for iteration in 1..=max_iterations {
        let decision = state
            .router
            .route(&state.gateway, &working, has_images, iteration)
            .await;
        info!(
            model = decision.model.as_str(),
            complexity = decision.complexity,
            iteration,
            "routed: {}",
            decision.reason
        );

        let gen = decision.capability.gen.merged_over(&gen_defaults);
        let mut outbound = working.clone();
        if !decision.capability.vision {
            strip_image_parts(&mut outbound);
        }

        // ReAct is text-only: the tool catalog travels in the prompt, not
        // the tools parameter.
        let response = state
            .gateway
            .chat(&outbound, &[], &decision.model, &gen)
            .await?;

        let Some(step) = parse_react(&response.content) else {
            // Malformed protocol reply: the raw content is the answer.
            final_reply = Some(response.content);
            break;
        };

        match resolve_action(&step.action, &tool_names) {
            ResolvedAction::Finish => {
                final_reply = Some(stringify_input(&step.action_input));
                break;
            }
            ResolvedAction::Tool(tool_name) => {
                info!("executing tool {tool_name} (iteration {iteration})");
                let result = state.tools.execute(&tool_name, step.action_input.clone()).await;
                let observation = if result.is_error {
                    json!({
                        "error": true,
                        "message": redact_sensitive(&result.content),
                        "tool": tool_name,
                    })
                    .to_string()
                } else {
                    result.content
                };
                working.push(ChatMessage::assistant(response.content.clone()));
                working.push(ChatMessage::user(format!("Observation: {observation}")));
            }
            ResolvedAction::Unknown(action) => {
                warn!("unknown ReAct action '{action}'");
                let observation = json!({
                    "error": format!("unknown action '{action}'"),
                    "resolved_tool": serde_json::Value::Null,
                    "action": action,
                })
                .to_string();
                working.push(ChatMessage::assistant(response.content.clone()));
                working.push(ChatMessage::user(format!("Observation: {observation}")));
            }
        }
    }

    // Loop exhaustion: the notice goes out but the session history stays
    // untouched for this turn.
    let Some(reply) = final_reply else {
        warn!("iteration limit reached for {session_key}");
        return Ok(LOOP_EXHAUSTED.to_string());
    };

    // Persist the completed exchange: session history first, then
    // long-term memory.
    let user_turn_text = if msg.media.is_empty() {
        msg.content.clone()
    } else {
        format!("{}\n[{} attachment(s)]", msg.content, msg.media.len())
    };
    state.sessions.append_exchange(
        &session_key,
        Turn::user(user_turn_text),
        Turn::assistant(reply.clone()),
    );

    if let Some(memory) = &state.memory {
        let meta = json!({"channel": msg.channel, "sender": msg.sender_id});
        if let Err(e) = memory
            .remember(&session_key, MemoryKind::Conversation, &msg.content, meta.clone())
            .await
        {
            warn!("failed to store user memory: {e}");
        }
        if let Err(e) = memory
            .remember(&session_key, MemoryKind::Conversation, &reply, meta)
            .await
        {
            warn!("failed to store assistant memory: {e}");
        }
    }

    Ok(reply)
}

/// Identity / user / behavior prompt files from the workspace, in that
/// order, skipping absent ones.
pub(crate) fn load_prompt_files(workspace: &str) -> String {
    let mut out = String::new();
    for file in ["identity.md", "user.md", "behavior.md"] {
        let path = std::path::Path::new(workspace).join(file);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if !content.trim().is_empty() {
                out.push_str(content.trim());
                out.push_str("\n\n");
            }
        }
    }
    out
}

pub(crate) fn build_system_prompt(
    prompt_files: &str,
    always_skills: &[Skill],
    skills_catalog: &str,
    memory_context: &str,
    tool_names: &[String],
) -> String {
    let mut prompt = String::from(
        "You are Wisp, a personal AI assistant reachable through chat channels.\n\n",
    );

    if !prompt_files.trim().is_empty() {
        prompt.push_str(prompt_files.trim());
        prompt.push_str("\n\n");
    }

    for skill in always_skills {
        prompt.push_str(&format!("# Skill: {}\n\n{}\n\n", skill.name, skill.body));
    }

    if !skills_catalog.trim().is_empty() {
        prompt.push_str(
            "# Available skills\n\nAsk for a skill by following its instructions when the task matches:\n\n",
        );
        prompt.push_str(skills_catalog.trim());
        prompt.push_str("\n\n");
    }

    if !memory_context.trim().is_empty() {
        prompt.push_str("# Memories\n\n");
        prompt.push_str(memory_context.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&react_prompt(tool_names));
    prompt
}

/// The ReAct protocol instructions, templated with the tool catalog.
pub(crate) fn react_prompt(tool_names: &[String]) -> String {
    let tools = if tool_names.is_empty() {
        "(no tools available)".to_string()
    } else {
        tool_names.join(", ")
    };
    format!(
        r#"# How to act

Respond with exactly one JSON object per turn:

{{"thought": "<your reasoning>", "action": "<tool name or finish>", "action_input": <string or object>}}

Available actions: {tools}, finish.
Use "finish" with your final answer as action_input once the task is done.
After each tool call you will receive an "Observation:" message with the result.
Reply with plain JSON only, no surrounding prose."#
    )
}

pub(crate) fn history_to_messages(history: &[Turn]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|turn| ChatMessage {
            role: turn.role.clone(),
            content: crate::llm_types::MessageContent::Text(turn.content.clone()),
            tool_call_id: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_react_prompt_lists_tools() {
        let prompt = react_prompt(&["shell_exec".into(), "read_file".into()]);
        assert!(prompt.contains("shell_exec, read_file, finish"));
        assert!(prompt.contains("action_input"));
    }

    #[test]
    fn test_react_prompt_without_tools() {
        let prompt = react_prompt(&[]);
        assert!(prompt.contains("(no tools available)"));
    }

    #[test]
    fn test_build_system_prompt_sections() {
        let always = vec![Skill {
            name: "tone".into(),
            description: "How to speak".into(),
            always: true,
            body: "Be concise.".into(),
        }];
        let prompt = build_system_prompt(
            "I am identity text.",
            &always,
            "- weather: check the weather",
            "<memories>\n[summary] user likes rust\n</memories>",
            &["shell_exec".into()],
        );
        assert!(prompt.contains("I am identity text."));
        assert!(prompt.contains("# Skill: tone"));
        assert!(prompt.contains("Be concise."));
        assert!(prompt.contains("- weather: check the weather"));
        assert!(prompt.contains("user likes rust"));
        assert!(prompt.contains("\"action\""));
    }

    #[test]
    fn test_build_system_prompt_skips_empty_sections() {
        let prompt = build_system_prompt("", &[], "", "", &[]);
        assert!(!prompt.contains("# Memories"));
        assert!(!prompt.contains("# Available skills"));
        assert!(prompt.contains("# How to act"));
    }

    #[test]
    fn test_history_to_messages_roles() {
        let history = vec![Turn::user("hi"), Turn::assistant("hello")];
        let messages = history_to_messages(&history);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].text(), "hello");
    }

    #[test]
    fn test_load_prompt_files_order_and_absence() {
        let dir = std::env::temp_dir().join(format!("wisp_prompts_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("identity.md"), "IDENTITY").unwrap();
        std::fs::write(dir.join("behavior.md"), "BEHAVIOR").unwrap();

        let out = load_prompt_files(dir.to_str().unwrap());
        let identity_pos = out.find("IDENTITY").unwrap();
        let behavior_pos = out.find("BEHAVIOR").unwrap();
        assert!(identity_pos < behavior_pos);
        let _ = std::fs::remove_dir_all(dir);
    }
}
