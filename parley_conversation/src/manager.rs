//! Conversation lifetime management.
//!
//! The `ConversationManager` is the main entry point: it wires a message
//! store, a sync channel and a turn orchestrator for one conversation to
//! explicitly injected services, and tears all three down together.

use std::sync::Arc;

use parley_core::{
    AgentDirectory, CompletionClient, PersistenceClient, PersistenceError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::history::{HistoryConfig, HistoryStats};
use crate::orchestrator::{TurnError, TurnEvent, TurnHandle, TurnOrchestrator, TurnOutcome};
use crate::store::{MessageStore, Snapshot};
use crate::sync::{SyncChannel, SyncOptions, SyncStatus};

/// Backend handles used by one conversation.
#[derive(Clone)]
pub struct ConversationServices {
    pub persistence: Arc<dyn PersistenceClient>,
    pub completion: Arc<dyn CompletionClient>,
    pub agents: Arc<dyn AgentDirectory>,
}

impl ConversationServices {
    #[must_use]
    pub fn new(
        persistence: Arc<dyn PersistenceClient>,
        completion: Arc<dyn CompletionClient>,
        agents: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            persistence,
            completion,
            agents,
        }
    }
}

/// Configuration for conversation management.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Push feed reconnection settings
    #[serde(default)]
    pub sync: SyncOptions,
    /// Context window sent to the completion backend
    #[serde(default)]
    pub history: HistoryConfig,
}

impl ConversationConfig {
    #[must_use]
    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }
}

/// One open conversation.
pub struct ConversationManager {
    conversation_id: Uuid,
    store: Arc<MessageStore>,
    sync: Option<SyncChannel>,
    orchestrator: Arc<TurnOrchestrator>,
    cancel: CancellationToken,
}

impl ConversationManager {
    /// Load the history and start live synchronization.
    pub async fn open(
        conversation_id: Uuid,
        services: ConversationServices,
        config: ConversationConfig,
    ) -> Result<Self, PersistenceError> {
        info!("Opening conversation {conversation_id}");

        let cancel = CancellationToken::new();
        let store = Arc::new(MessageStore::new(conversation_id));

        let sync = SyncChannel::start_with_token(
            conversation_id,
            Arc::clone(&services.persistence),
            Arc::clone(&store),
            config.sync,
            cancel.child_token(),
        )
        .await?;

        let orchestrator = Arc::new(
            TurnOrchestrator::new(Arc::clone(&store), services)
                .with_history(config.history)
                .with_cancellation(cancel.child_token()),
        );

        Ok(Self {
            conversation_id,
            store,
            sync: Some(sync),
            orchestrator,
            cancel,
        })
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> HistoryStats {
        HistoryStats::collect(&self.store.snapshot())
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<TurnOrchestrator> {
        &self.orchestrator
    }

    pub fn submit(&self, content: &str) -> Result<TurnHandle, TurnError> {
        self.orchestrator.submit(content)
    }

    pub async fn send(&self, content: &str) -> Result<TurnOutcome, TurnError> {
        self.orchestrator.send(content).await
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<TurnEvent> {
        self.orchestrator.subscribe_events()
    }

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync.as_ref().map_or(SyncStatus::Closed, SyncChannel::status)
    }

    #[must_use]
    pub fn watch_sync_status(&self) -> Option<watch::Receiver<SyncStatus>> {
        self.sync.as_ref().map(SyncChannel::watch_status)
    }

    /// Abort any in-flight turn, stop the feed and close the store.
    ///
    /// Once this returns nothing mutates the store any more.
    pub async fn close(mut self) {
        self.orchestrator.abort();
        self.cancel.cancel();
        if let Some(sync) = self.sync.take() {
            sync.shutdown().await;
        }
        self.store.close();
        info!("Closed conversation {}", self.conversation_id);
    }
}

impl Drop for ConversationManager {
    fn drop(&mut self) {
        self.orchestrator.abort();
        self.cancel.cancel();
        self.store.close();
    }
}

impl std::fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationManager")
            .field("conversation_id", &self.conversation_id)
            .field("store", &self.store)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
