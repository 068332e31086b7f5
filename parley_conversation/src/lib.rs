#![warn(
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

//! Conversation synchronization and turn orchestration.
//!
//! # Key Features
//! - Append-only message store, idempotent by message id
//! - Sync channel that merges a live insert feed into the store and
//!   reconnects with backoff
//! - One-turn-at-a-time orchestrator: persist user message, build context,
//!   request completion, persist reply
//! - Cooperative cancellation tied to the conversation lifetime

mod backoff;
mod history;
mod manager;
mod orchestrator;
mod store;
mod sync;

pub use backoff::{Backoff, BackoffPolicy};
pub use history::{HistoryConfig, HistoryStats, HistoryWindow};
pub use manager::{ConversationConfig, ConversationManager, ConversationServices};
pub use orchestrator::{
    TurnError, TurnEvent, TurnHandle, TurnOrchestrator, TurnOutcome, TurnState, ValidationError,
};
pub use store::{ListenerId, MessageStore, Snapshot};
pub use sync::{SyncChannel, SyncOptions, SyncStatus, decode_record};
