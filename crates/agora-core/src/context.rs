//! System prompt assembly.

/// Builds the system prompt sent ahead of the conversation history.
pub trait ContextInjector: Send + Sync {
    fn build_system_prompt(&self, base_prompt: &str) -> String;
}

/// Appends a fixed profile block to the agent persona.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    profile: Option<String>,
}

impl StaticContext {
    pub fn new(profile: Option<String>) -> Self {
        let profile = profile.filter(|p| !p.trim().is_empty());
        Self { profile }
    }
}

impl ContextInjector for StaticContext {
    fn build_system_prompt(&self, base_prompt: &str) -> String {
        match &self.profile {
            Some(profile) => format!("{}\n\n## Profile\n{}", base_prompt.trim_end(), profile.trim()),
            None => base_prompt.to_string(),
        }
    }
}
