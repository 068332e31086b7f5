use parley_core::PersistenceClient;
use uuid::Uuid;

use super::init_common_components;

/// Input parameters for the History command strategy.
#[derive(Debug, Clone, Copy)]
pub struct HistoryInput {
    /// Conversation to print; lists all conversations when absent
    pub conversation_id: Option<Uuid>,
}

/// Strategy for inspecting stored conversations without opening a live channel.
#[derive(Debug, Clone, Copy)]
pub struct HistoryStrategy;

impl super::CommandStrategy for HistoryStrategy {
    type Input = HistoryInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let common = init_common_components().await?;

        let Some(conversation_id) = input.conversation_id else {
            let conversations = common.backend.list_conversations().await?;
            if conversations.is_empty() {
                println!("No conversations yet. Run 'parley chat' to start one.");
                return Ok(());
            }
            println!("=== Conversations ({}) ===", conversations.len());
            for id in conversations {
                println!("  {id}");
            }
            return Ok(());
        };

        let messages = common.backend.list_ordered(conversation_id).await?;
        println!(
            "=== Conversation: {conversation_id} ({} messages) ===",
            messages.len()
        );
        for message in &messages {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%Y-%m-%d %H:%M:%S"),
                message.role,
                message.content
            );
        }

        Ok(())
    }
}
