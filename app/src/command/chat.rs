//! Multi-turn conversation command.
//!
//! Opens a conversation, renders its log as it changes (including writes
//! from other participants), and submits each line of input as a turn.

use parley_conversation::{ConversationManager, ConversationServices, TurnError};
use parley_core::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use uuid::Uuid;

use super::{build_completion, ensure_agent, init_common_components};

/// Input parameters for the Chat command strategy.
#[derive(Debug, Clone)]
pub struct ChatInput {
    /// Conversation to resume (creates new if not provided)
    pub conversation_id: Option<Uuid>,
    /// Optional single message to send (non-interactive mode)
    pub message: Option<String>,
    /// Persona for the agent, overriding the stored one
    pub persona: Option<String>,
    /// Answer with the echo provider instead of calling the API
    pub offline: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatStrategy;

fn render(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.role,
        message.content
    )
}

fn report_turn_error(error: &TurnError) {
    eprintln!("Error: {error}");
    if let TurnError::PersistAssistant { content, .. } = error {
        eprintln!("Unsaved reply:\n{content}");
    }
}

impl super::CommandStrategy for ChatStrategy {
    type Input = ChatInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let common = init_common_components().await?;
        let conversation_id = input.conversation_id.unwrap_or_else(Uuid::now_v7);

        let agent = ensure_agent(
            &common.backend,
            conversation_id,
            input.persona,
            &common.config.agent.persona,
        )
        .await?;

        let services = ConversationServices::new(
            common.backend.clone(),
            build_completion(&common.config, input.offline)?,
            common.backend.clone(),
        );
        let manager = ConversationManager::open(
            conversation_id,
            services,
            common.config.conversation_config(),
        )
        .await?;

        info!(
            "Starting conversation {} with {} agent",
            conversation_id, agent.persona
        );

        if let Some(msg) = input.message {
            let result = manager.send(&msg).await;
            manager.close().await;
            match result {
                Ok(outcome) => println!("{}", outcome.assistant.content),
                Err(e) => {
                    report_turn_error(&e);
                    return Err(e.into());
                }
            }
            return Ok(());
        }

        println!("=== Conversation: {conversation_id} ({}) ===", agent.persona);
        println!("Type 'exit', 'quit', or Ctrl+D to end the session.\n");
        for message in &manager.snapshot() {
            println!("{}", render(message));
        }

        let printer = manager.store().subscribe(|message: &Message| {
            println!("{}", render(message));
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();

            if matches!(line, "exit" | "quit" | "q") {
                break;
            }
            if line.is_empty() {
                continue;
            }

            if let Err(e) = manager.send(line).await {
                report_turn_error(&e);
            }
        }

        manager.store().unsubscribe(printer);
        let stats = manager.stats();
        println!(
            "\nSession ended. {} messages ({} from you, {} replies).",
            stats.total_messages, stats.user_messages, stats.assistant_messages
        );
        manager.close().await;

        Ok(())
    }
}
