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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod error;

pub use error::{CompletionError, PersistenceError, SyncFeedError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(PersistenceError::InvalidRecord(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

/// A persisted message. Identity and timestamp are assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Render order: `(created_at, id)` ascending.
    #[must_use]
    pub const fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    #[must_use]
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// One entry of the context handed to a completion backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Agent configuration for a conversation, consumed by value at turn start.
///
/// `memory_state` and `tool_blocks` are opaque to this crate and passed
/// through to the completion backend unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: Uuid,
    pub persona: String,
    #[serde(default)]
    pub memory_state: serde_json::Value,
    #[serde(default)]
    pub tool_blocks: Vec<String>,
}

impl AgentConfig {
    #[must_use]
    pub fn new(id: Uuid, persona: impl Into<String>) -> Self {
        Self {
            id,
            persona: persona.into(),
            memory_state: serde_json::Value::Null,
            tool_blocks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_memory_state(mut self, memory_state: serde_json::Value) -> Self {
        self.memory_state = memory_state;
        self
    }

    #[must_use]
    pub fn with_tool_blocks(mut self, tool_blocks: Vec<String>) -> Self {
        self.tool_blocks = tool_blocks;
        self
    }
}

/// Live feed of newly inserted records for one conversation.
///
/// Records arrive loosely typed and must be validated by the consumer.
/// Dropping the feed releases the producer side.
#[derive(Debug)]
pub struct InsertFeed {
    rx: mpsc::Receiver<serde_json::Value>,
}

impl InsertFeed {
    /// Create a feed together with the sender a backend pushes into.
    #[must_use]
    pub fn channel(buffer: usize) -> (mpsc::Sender<serde_json::Value>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Next pushed record, or `None` once the backend closed the feed.
    pub async fn next(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Durably append a message; storage assigns `id` and `created_at`.
    async fn insert(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError>;

    /// Full history of a conversation, oldest first.
    async fn list_ordered(&self, conversation_id: Uuid) -> Result<Vec<Message>, PersistenceError>;

    /// Open a push feed of inserts scoped to one conversation.
    /// Delivery is at-least-once.
    async fn subscribe_inserts(&self, conversation_id: Uuid) -> Result<InsertFeed, SyncFeedError>;
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn fetch_agent(&self, agent_id: Uuid) -> Result<AgentConfig, PersistenceError>;
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        context: &[ChatMessage],
        config: &AgentConfig,
    ) -> Result<String, CompletionError>;
}
