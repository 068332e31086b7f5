//! Static strategy pattern for CLI commands.
//!
//! Each command is a separate strategy with its own input type, dispatched
//! statically from `main`.

use parley_config::Config;
use parley_core::{AgentConfig, AgentDirectory, CompletionClient, PersistenceError};
use parley_persistence::SqlBackend;
use parley_providers::{EchoProvider, OpenAiProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

mod chat;
mod history;
mod info;
mod init;
mod version;

pub use chat::{ChatInput, ChatStrategy};
pub use history::{HistoryInput, HistoryStrategy};
pub use info::InfoStrategy;
pub use init::InitStrategy;
pub use version::VersionStrategy;

/// Core trait defining the contract for all command strategies.
pub trait CommandStrategy: Send + Sync + 'static {
    /// The input type this strategy accepts.
    type Input;

    /// Execute the command with the given input.
    async fn execute(&self, input: Self::Input) -> anyhow::Result<()>;
}

/// Components every conversation command needs.
struct CommonComponents {
    config: Config,
    backend: Arc<SqlBackend>,
}

async fn init_common_components() -> anyhow::Result<CommonComponents> {
    let config = Config::load()?;

    info!("Connecting to database");
    let backend = Arc::new(SqlBackend::connect(&config.database.url).await?);

    Ok(CommonComponents { config, backend })
}

fn build_completion(config: &Config, offline: bool) -> anyhow::Result<Arc<dyn CompletionClient>> {
    if offline {
        info!("Using offline echo provider");
        return Ok(Arc::new(EchoProvider));
    }

    let provider = OpenAiProvider::new(
        config.provider.api_key.clone(),
        config.provider.model.clone(),
        Duration::from_secs(config.provider.timeout_secs),
    )?
    .with_base_url(config.provider.base_url.clone())
    .with_config_field(config.provider.config_field.clone());

    Ok(Arc::new(provider))
}

/// Load the agent for `conversation_id`, creating it on first use.
async fn ensure_agent(
    backend: &SqlBackend,
    conversation_id: Uuid,
    persona: Option<String>,
    default_persona: &str,
) -> anyhow::Result<AgentConfig> {
    match backend.fetch_agent(conversation_id).await {
        Ok(agent) => match persona {
            Some(persona) if persona != agent.persona => {
                let agent = AgentConfig { persona, ..agent };
                backend.upsert_agent(&agent).await?;
                Ok(agent)
            }
            _ => Ok(agent),
        },
        Err(PersistenceError::AgentNotFound(_)) => {
            let agent = AgentConfig::new(
                conversation_id,
                persona.unwrap_or_else(|| default_persona.to_string()),
            );
            backend.upsert_agent(&agent).await?;
            info!("Created agent {} ({})", agent.id, agent.persona);
            Ok(agent)
        }
        Err(e) => Err(e.into()),
    }
}
