//! Database entities for durable conversation storage.

pub mod agents;
pub mod messages;
