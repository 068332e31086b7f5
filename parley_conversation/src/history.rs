//! Context assembly for completion requests.
//!
//! This module turns the ordered message log into the role/content pairs a
//! completion backend expects, optionally bounded by a sliding window.

use parley_core::{ChatMessage, Message, Role};
use serde::{Deserialize, Serialize};

/// Limits applied to the context of one turn. `None` means unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Maximum number of messages to send
    #[serde(default)]
    pub max_messages: Option<usize>,
    /// Maximum characters across all messages (approximate token limit)
    #[serde(default)]
    pub max_chars: Option<usize>,
}

impl HistoryConfig {
    #[must_use]
    pub const fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    #[must_use]
    pub const fn with_max_chars(mut self, max: usize) -> Self {
        self.max_chars = Some(max);
        self
    }
}

/// A sliding window over conversation history.
///
/// Oldest messages are dropped first; the newest message is always kept so
/// the turn being answered is never cut from its own context.
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    config: HistoryConfig,
}

impl HistoryWindow {
    #[must_use]
    pub const fn with_config(config: HistoryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Map the log to context entries and apply the window.
    #[must_use]
    pub fn build_context<'a, I>(&self, messages: I) -> Vec<ChatMessage>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut context: Vec<ChatMessage> = messages.into_iter().map(Message::to_chat).collect();

        if let Some(max) = self.config.max_messages {
            let excess = context.len().saturating_sub(max.max(1));
            context.drain(..excess);
        }

        if let Some(max_chars) = self.config.max_chars {
            let mut total: usize = context.iter().map(|m| m.content.chars().count()).sum();
            let mut cut = 0;
            while context.len() - cut > 1 && total > max_chars {
                total -= context[cut].content.chars().count();
                cut += 1;
            }
            context.drain(..cut);
        }

        context
    }
}

/// Statistics about conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_characters: usize,
}

impl HistoryStats {
    pub fn collect<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut stats = Self {
            total_messages: 0,
            user_messages: 0,
            assistant_messages: 0,
            total_characters: 0,
        };
        for m in messages {
            stats.total_messages += 1;
            stats.total_characters += m.content.chars().count();
            match m.role {
                Role::User => stats.user_messages += 1,
                Role::Assistant => stats.assistant_messages += 1,
            }
        }
        stats
    }
}
