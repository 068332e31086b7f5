#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

mod command;

use clap::{Parser, Subcommand};
use command::{
    ChatInput, ChatStrategy, CommandStrategy, HistoryInput, HistoryStrategy, InfoStrategy,
    InitStrategy, VersionStrategy,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "parley conversation client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a conversation
    Chat {
        /// Conversation to resume
        #[arg(short = 'c', long = "conversation")]
        conversation_id: Option<Uuid>,

        /// Single message to send
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Agent persona for this conversation
        #[arg(short = 'p', long)]
        persona: Option<String>,

        /// Reply with the local echo provider
        #[arg(long)]
        offline: bool,
    },
    /// List conversations, or print one conversation's log
    History {
        /// Conversation to print
        #[arg(short = 'c', long = "conversation")]
        conversation_id: Option<Uuid>,
    },
    /// Show configuration
    Info,
    /// Initialize configuration
    Init,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            conversation_id,
            message,
            persona,
            offline,
        } => {
            ChatStrategy
                .execute(ChatInput {
                    conversation_id,
                    message,
                    persona,
                    offline,
                })
                .await
        }
        Commands::History { conversation_id } => {
            HistoryStrategy
                .execute(HistoryInput { conversation_id })
                .await
        }
        Commands::Info => InfoStrategy.execute(()).await,
        Commands::Init => InitStrategy.execute(()).await,
        Commands::Version => VersionStrategy.execute(()).await,
    }
}
