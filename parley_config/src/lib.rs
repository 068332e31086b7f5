//! Application configuration loaded from `~/parley/config.json`.

mod schema;

pub use schema::{AgentDefaults, Config, DatabaseConfig, ProviderConfig};
