use async_trait::async_trait;
use parley_core::{AgentConfig, ChatMessage, CompletionClient, CompletionError, Role};

/// Offline completion that repeats the latest user message.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProvider;

#[async_trait]
impl CompletionClient for EchoProvider {
    async fn complete(
        &self,
        context: &[ChatMessage],
        config: &AgentConfig,
    ) -> Result<String, CompletionError> {
        let last = context
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| CompletionError::Permanent("no user message in context".to_string()))?;

        Ok(format!("[{}] {}", config.persona, last.content))
    }
}
