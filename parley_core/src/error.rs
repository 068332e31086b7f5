//! Error types shared by the persistence, completion and sync boundaries.

use thiserror::Error;
use uuid::Uuid;

/// Failure talking to durable storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("write failed: {0}")]
    Write(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Failure reported by a completion backend.
///
/// The distinction is informational: callers surface it unchanged and
/// never retry on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// Rate limiting, timeouts, upstream 5xx.
    #[error("transient completion failure: {0}")]
    Transient(String),

    /// Malformed requests, auth failures, unusable responses.
    #[error("permanent completion failure: {0}")]
    Permanent(String),
}

impl CompletionError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure of the push feed of inserted messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncFeedError {
    #[error("subscription refused: {0}")]
    Subscribe(String),

    #[error("feed closed")]
    Closed,

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("record belongs to conversation {actual}, expected {expected}")]
    WrongConversation { expected: Uuid, actual: Uuid },
}
