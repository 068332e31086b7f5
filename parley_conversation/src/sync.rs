//! Bridge from a persistence push feed to a [`MessageStore`].
//!
//! The channel loads the conversation history, then keeps a live feed open
//! in a background task. Feed failures are never surfaced to callers: the
//! task resubscribes with exponential backoff while the store keeps serving
//! its last-known contents, and re-reads the history after every successful
//! subscription so writes made during an outage show up.

use std::sync::Arc;

use parley_core::{InsertFeed, Message, PersistenceClient, PersistenceError, SyncFeedError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::store::MessageStore;

/// Connection state of the push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

/// Validate a pushed record into a [`Message`] of the expected conversation.
pub fn decode_record(
    conversation_id: Uuid,
    raw: serde_json::Value,
) -> Result<Message, SyncFeedError> {
    let message: Message =
        serde_json::from_value(raw).map_err(|e| SyncFeedError::Malformed(e.to_string()))?;

    if message.conversation_id != conversation_id {
        return Err(SyncFeedError::WrongConversation {
            expected: conversation_id,
            actual: message.conversation_id,
        });
    }

    Ok(message)
}

/// Live synchronization of one conversation into a store.
pub struct SyncChannel {
    conversation_id: Uuid,
    status: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncChannel {
    /// Load the history into `store` and start following the feed.
    ///
    /// Fails only if the initial history fetch fails.
    pub async fn start(
        conversation_id: Uuid,
        persistence: Arc<dyn PersistenceClient>,
        store: Arc<MessageStore>,
        options: SyncOptions,
    ) -> Result<Self, PersistenceError> {
        Self::start_with_token(
            conversation_id,
            persistence,
            store,
            options,
            CancellationToken::new(),
        )
        .await
    }

    /// Like [`SyncChannel::start`], but tied to a caller-owned token so the
    /// feed stops when the surrounding conversation is cancelled.
    pub async fn start_with_token(
        conversation_id: Uuid,
        persistence: Arc<dyn PersistenceClient>,
        store: Arc<MessageStore>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Result<Self, PersistenceError> {
        let history = persistence.list_ordered(conversation_id).await?;
        let loaded = history
            .into_iter()
            .filter(|m| store.append(m.clone()))
            .count();
        info!("Loaded {loaded} messages for conversation {conversation_id}");

        let (status_tx, status) = watch::channel(SyncStatus::Connecting);
        let worker = FeedWorker {
            conversation_id,
            persistence,
            store,
            backoff: Backoff::new(options.backoff),
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        Ok(Self {
            conversation_id,
            status,
            cancel,
            task: Some(task),
        })
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop following the feed. Once this returns no further appends
    /// originate from this channel.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Sync task for {} ended abnormally: {e}", self.conversation_id);
            }
        }
        debug!("Sync channel for {} shut down", self.conversation_id);
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct FeedWorker {
    conversation_id: Uuid,
    persistence: Arc<dyn PersistenceClient>,
    store: Arc<MessageStore>,
    backoff: Backoff,
    status: watch::Sender<SyncStatus>,
    cancel: CancellationToken,
}

impl FeedWorker {
    async fn run(mut self) {
        loop {
            let subscribed = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.persistence.subscribe_inserts(self.conversation_id) => result,
            };

            match subscribed {
                Ok(feed) => {
                    let attempts = self.backoff.attempt();
                    self.backoff.reset();
                    self.status.send_replace(SyncStatus::Live);
                    if attempts > 0 {
                        info!(
                            "Resubscribed to conversation {} after {attempts} attempts",
                            self.conversation_id
                        );
                    }
                    self.catch_up().await;

                    if self.follow(feed).await.is_none() {
                        break;
                    }
                    warn!(
                        "Insert feed for {} closed, reconnecting",
                        self.conversation_id
                    );
                }
                Err(e) => {
                    warn!(
                        "Subscribing to conversation {} failed: {e}",
                        self.conversation_id
                    );
                }
            }

            let delay = self.backoff.next_delay();
            self.status.send_replace(SyncStatus::Reconnecting {
                attempt: self.backoff.attempt(),
            });
            debug!("Retrying subscription in {delay:?}");

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(SyncStatus::Closed);
    }

    /// Drain the feed until it closes. Returns `None` on cancellation.
    async fn follow(&self, mut feed: InsertFeed) -> Option<()> {
        loop {
            let raw = tokio::select! {
                () = self.cancel.cancelled() => return None,
                raw = feed.next() => raw,
            };

            let Some(raw) = raw else {
                return Some(());
            };

            match decode_record(self.conversation_id, raw) {
                Ok(message) => {
                    let id = message.id;
                    if self.store.append(message) {
                        debug!("Applied pushed message {id}");
                    } else {
                        debug!("Pushed message {id} already present");
                    }
                }
                Err(e) => warn!("Dropping pushed record: {e}"),
            }
        }
    }

    /// Re-read the history so writes missed while disconnected appear.
    async fn catch_up(&self) {
        let fetched = tokio::select! {
            () = self.cancel.cancelled() => return,
            fetched = self.persistence.list_ordered(self.conversation_id) => fetched,
        };

        match fetched {
            Ok(history) => {
                let added = history
                    .into_iter()
                    .filter(|m| self.store.append(m.clone()))
                    .count();
                if added > 0 {
                    info!(
                        "Recovered {added} messages for conversation {}",
                        self.conversation_id
                    );
                }
            }
            Err(e) => warn!(
                "History refresh for {} failed: {e}",
                self.conversation_id
            ),
        }
    }
}
