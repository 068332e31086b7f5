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

//! Persistence backends for conversations.
//!
//! Both backends implement `PersistenceClient` (messages and the insert
//! feed) and `AgentDirectory` (agent configuration lookups).

mod convert;
mod memory;
mod sql;

pub use memory::InMemoryBackend;
pub use sql::SqlBackend;
