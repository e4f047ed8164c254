//! Prompt assembly: system prompt, history and tool schemas.

use std::collections::HashMap;

use agora_core::context::ContextInjector;
use agora_core::model::{Agent, Message, RegisteredTool, Swarm};
use agora_providers::{ChatMessage, ToolSchema};
use tracing::warn;

/// Agent persona, swarm role, then injected profile context.
pub fn system_prompt(agent: &Agent, swarm: Option<&Swarm>, context: &dyn ContextInjector) -> String {
    let mut base = agent.system_prompt.trim().to_string();
    if base.is_empty() {
        base = format!("You are {}, a helpful assistant.", agent.name);
    }
    if let Some(swarm) = swarm {
        base.push_str(&format!(
            "\n\nYou lead the '{}' swarm of {} agents and answer on its behalf.",
            swarm.name,
            swarm.agent_ids.len()
        ));
    }
    context.build_system_prompt(&base)
}

/// Conversation history for the model, oldest first.
///
/// Only finished messages are replayed; placeholders from failed or aborted
/// requests are skipped.
pub fn history(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| m.is_complete && !m.content.trim().is_empty())
        .map(|m| ChatMessage::new(m.role, m.content.clone()))
        .collect()
}

/// Tools the model may call, keyed by the name it will use.
pub struct ToolIndex {
    by_name: HashMap<String, RegisteredTool>,
}

impl ToolIndex {
    /// When two servers advertise the same name, the first one wins.
    pub fn new(tools: Vec<RegisteredTool>) -> Self {
        let mut by_name = HashMap::new();
        for tool in tools {
            if by_name.contains_key(&tool.name) {
                warn!(tool = %tool.name, server_id = %tool.server_id, "Duplicate tool name, ignoring");
                continue;
            }
            by_name.insert(tool.name.clone(), tool);
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.by_name.get(name)
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .by_name
            .values()
            .map(|t| ToolSchema {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::context::StaticContext;
    use agora_core::model::MessageRole;
    use serde_json::json;

    fn agent(prompt: &str) -> Agent {
        Agent {
            id: "a1".into(),
            name: "Sage".into(),
            system_prompt: prompt.into(),
            model: "llama3.2".into(),
            provider: None,
            temperature: None,
            tool_ids: vec![],
            usage_count: 0,
            last_used_at: None,
        }
    }

    fn tool(server: &str, name: &str) -> RegisteredTool {
        RegisteredTool {
            id: format!("{server}-{name}"),
            server_id: server.into(),
            name: name.into(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object"}),
            usage_count: 0,
            last_used_at: None,
        }
    }

    #[test]
    fn test_system_prompt_with_profile() {
        let ctx = StaticContext::new(Some("Lives in Oslo.".into()));
        let prompt = system_prompt(&agent("You are terse."), None, &ctx);
        assert_eq!(prompt, "You are terse.\n\n## Profile\nLives in Oslo.");
    }

    #[test]
    fn test_empty_persona_falls_back_to_name() {
        let prompt = system_prompt(&agent("  "), None, &StaticContext::default());
        assert!(prompt.contains("Sage"));
    }

    #[test]
    fn test_swarm_role_is_mentioned() {
        let swarm = Swarm {
            id: "w1".into(),
            name: "Research".into(),
            agent_ids: vec!["a1".into(), "a2".into()],
            lead_agent_id: "a1".into(),
        };
        let prompt = system_prompt(&agent("You are terse."), Some(&swarm), &StaticContext::default());
        assert!(prompt.contains("'Research' swarm of 2 agents"));
    }

    #[test]
    fn test_history_skips_unfinished_messages() {
        let user = Message::new("S1", MessageRole::User, "hi");
        let mut placeholder = Message::new("S1", MessageRole::Assistant, "");
        placeholder.is_complete = false;
        let reply = Message::new("S1", MessageRole::Assistant, "hello");
        let history = history(&[user, placeholder, reply]);
        assert_eq!(
            history,
            vec![
                ChatMessage::new(MessageRole::User, "hi"),
                ChatMessage::new(MessageRole::Assistant, "hello"),
            ]
        );
    }

    #[test]
    fn test_tool_index_first_name_wins() {
        let index = ToolIndex::new(vec![tool("s1", "search"), tool("s2", "search"), tool("s2", "fetch")]);
        assert_eq!(index.get("search").unwrap().server_id, "s1");
        let names: Vec<_> = index.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["fetch", "search"]);
    }
}
