use parley_conversation::{ConversationConfig, HistoryConfig, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const CONFIG_DIR: &str = "parley";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentDefaults,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncOptions,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentDefaults {
    /// Persona used when a conversation has no stored agent yet
    #[serde(default = "AgentDefaults::default_persona")]
    pub persona: String,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            persona: Self::default_persona(),
            history: HistoryConfig::default(),
        }
    }
}

impl AgentDefaults {
    fn default_persona() -> String {
        "Assistant".to_string()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "ProviderConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "ProviderConfig::default_model")]
    pub model: String,
    #[serde(default = "ProviderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Request field for the opaque agent configuration; `null` omits it
    #[serde(default = "ProviderConfig::default_config_field")]
    pub config_field: Option<String>,
}

impl ProviderConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        60
    }

    #[allow(clippy::unnecessary_wraps)]
    fn default_config_field() -> Option<String> {
        Some("agent_config".to_string())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

impl DatabaseConfig {
    fn default_url() -> String {
        Config::config_dir().map_or_else(
            |_| "sqlite://parley.db?mode=rwc".to_string(),
            |dir| format!("sqlite://{}?mode=rwc", dir.join("parley.db").display()),
        )
    }
}

impl Config {
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Please run 'parley init' to create config.",
                config_path.display()
            );
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Settings for opening a conversation.
    #[must_use]
    pub fn conversation_config(&self) -> ConversationConfig {
        ConversationConfig::default()
            .with_history(self.agent.history.clone())
            .with_sync(self.sync.clone())
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn create_config() -> anyhow::Result<PathBuf> {
        let config_dir = Self::ensure_config_dir()?;
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                config_path.display()
            );
        }

        std::fs::write(&config_path, CONFIG_TEMPLATE)?;
        Ok(config_path)
    }
}

const CONFIG_TEMPLATE: &str = r#"{
  "agent": {
    "persona": "Assistant",
    "history": {
      "max_messages": null,
      "max_chars": null
    }
  },
  "provider": {
    "api_key": "your-api-key-here",
    "base_url": "https://api.openai.com/v1",
    "model": "gpt-4o-mini",
    "timeout_secs": 60,
    "config_field": "agent_config"
  },
  "sync": {
    "backoff": {
      "initial_ms": 1000,
      "max_ms": 30000,
      "jitter": 0.2
    }
  }
}"#;
