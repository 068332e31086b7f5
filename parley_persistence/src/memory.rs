//! Process-local backend with a broadcast insert feed.
//!
//! Used for offline sessions and tests. It also exposes fault injection so
//! callers can exercise failure paths: failing inserts, refused
//! subscriptions and dropping every live feed at once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parley_core::{
    AgentConfig, AgentDirectory, InsertFeed, Message, PersistenceClient, PersistenceError, Role,
    SyncFeedError,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FEED_CAPACITY: usize = 256;
const FEED_BUFFER: usize = 64;

#[derive(Default)]
struct State {
    messages: Vec<Message>,
    agents: HashMap<Uuid, AgentConfig>,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Faults {
    failing_inserts: usize,
    refused_subscriptions: usize,
    failing_lists: usize,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    feed: broadcast::Sender<serde_json::Value>,
    /// Cancelled to drop every open feed; replaced afterwards.
    feed_epoch: Mutex<CancellationToken>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            feed,
            feed_epoch: Mutex::new(CancellationToken::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_agent(&self, agent: AgentConfig) {
        self.state().agents.insert(agent.id, agent);
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.faults().failing_inserts = count;
    }

    /// Make the next `count` subscription attempts fail.
    pub fn refuse_next_subscriptions(&self, count: usize) {
        self.faults().refused_subscriptions = count;
    }

    /// Make the next `count` history reads fail.
    pub fn fail_next_lists(&self, count: usize) {
        self.faults().failing_lists = count;
    }

    /// Close every open insert feed, as if the push connection dropped.
    pub fn disconnect_feeds(&self) {
        let mut epoch = self
            .feed_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        epoch.cancel();
        *epoch = CancellationToken::new();
        info!("Disconnected all insert feeds");
    }

    /// Push an arbitrary record to subscribers without storing it.
    pub fn push_raw(&self, record: serde_json::Value) {
        self.feed.send(record).ok();
    }

    /// Number of open feeds.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    /// Strictly increasing timestamps, even within one clock tick.
    fn next_timestamp(state: &mut State) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match state.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        state.last_created_at = Some(ts);
        ts
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn belongs_to(record: &serde_json::Value, conversation_id: &str) -> bool {
    record
        .get("conversation_id")
        .and_then(serde_json::Value::as_str)
        == Some(conversation_id)
}

#[async_trait]
impl PersistenceClient for InMemoryBackend {
    async fn insert(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        if Self::take_fault(&mut self.faults().failing_inserts) {
            return Err(PersistenceError::Write("injected insert failure".to_string()));
        }

        let message = {
            let mut state = self.state();
            let message = Message {
                id: Uuid::now_v7(),
                conversation_id,
                role,
                content: content.to_string(),
                created_at: Self::next_timestamp(&mut state),
            };
            state.messages.push(message.clone());
            message
        };

        let record = serde_json::to_value(&message)
            .map_err(|e| PersistenceError::Write(e.to_string()))?;
        // No open feeds is fine.
        self.feed.send(record).ok();

        debug!("Inserted {} message {}", message.role, message.id);
        Ok(message)
    }

    async fn list_ordered(&self, conversation_id: Uuid) -> Result<Vec<Message>, PersistenceError> {
        if Self::take_fault(&mut self.faults().failing_lists) {
            return Err(PersistenceError::Read("injected read failure".to_string()));
        }

        let mut messages: Vec<Message> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(Message::sort_key);
        Ok(messages)
    }

    async fn subscribe_inserts(&self, conversation_id: Uuid) -> Result<InsertFeed, SyncFeedError> {
        if Self::take_fault(&mut self.faults().refused_subscriptions) {
            return Err(SyncFeedError::Subscribe(
                "injected subscription failure".to_string(),
            ));
        }

        let mut rx = self.feed.subscribe();
        let epoch = self
            .feed_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (tx, feed) = InsertFeed::channel(FEED_BUFFER);
        let filter = conversation_id.to_string();

        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    () = epoch.cancelled() => break,
                    () = tx.closed() => break,
                    record = rx.recv() => record,
                };

                match record {
                    Ok(record) if belongs_to(&record, &filter) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Insert feed for {filter} lagged, skipped {skipped} records");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Insert feed for {filter} released");
        });

        Ok(feed)
    }
}

#[async_trait]
impl AgentDirectory for InMemoryBackend {
    async fn fetch_agent(&self, agent_id: Uuid) -> Result<AgentConfig, PersistenceError> {
        self.state()
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or(PersistenceError::AgentNotFound(agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_assigns_increasing_timestamps() {
        let backend = InMemoryBackend::new();
        let conv = Uuid::now_v7();

        let mut last = None;
        for i in 0..20 {
            let msg = backend.insert(conv, Role::User, &format!("m{i}")).await;
            let Ok(msg) = msg else {
                panic!("insert failed");
            };
            if let Some(prev) = last {
                assert!(msg.created_at > prev);
            }
            last = Some(msg.created_at);
        }
        assert_eq!(backend.message_count(), 20);
    }

    #[tokio::test]
    async fn list_filters_by_conversation() {
        let backend = InMemoryBackend::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        backend.insert(a, Role::User, "a1").await.ok();
        backend.insert(b, Role::User, "b1").await.ok();
        backend.insert(a, Role::Assistant, "a2").await.ok();

        let listed = backend.list_ordered(a).await.unwrap_or_default();
        let contents: Vec<_> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["a1", "a2"]);
    }

    #[tokio::test]
    async fn feed_delivers_only_own_conversation() {
        let backend = InMemoryBackend::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        let Ok(mut feed) = backend.subscribe_inserts(a).await else {
            panic!("subscribe failed");
        };
        backend.insert(b, Role::User, "other").await.ok();
        backend.insert(a, Role::User, "mine").await.ok();

        let record = feed.next().await.unwrap_or_default();
        assert_eq!(record["content"], "mine");
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let backend = InMemoryBackend::new();
        let conv = Uuid::now_v7();

        backend.fail_next_inserts(1);
        assert!(backend.insert(conv, Role::User, "x").await.is_err());
        assert!(backend.insert(conv, Role::User, "x").await.is_ok());

        backend.refuse_next_subscriptions(1);
        assert!(backend.subscribe_inserts(conv).await.is_err());
        assert!(backend.subscribe_inserts(conv).await.is_ok());

        backend.fail_next_lists(1);
        assert!(backend.list_ordered(conv).await.is_err());
        assert!(backend.list_ordered(conv).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_closes_open_feeds() {
        let backend = InMemoryBackend::new();
        let Ok(mut feed) = backend.subscribe_inserts(Uuid::now_v7()).await else {
            panic!("subscribe failed");
        };

        backend.disconnect_feeds();
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let backend = InMemoryBackend::new();
        let id = Uuid::now_v7();
        assert_eq!(
            backend.fetch_agent(id).await,
            Err(PersistenceError::AgentNotFound(id))
        );

        backend.put_agent(AgentConfig::new(id, "Helper"));
        assert_eq!(
            backend.fetch_agent(id).await.map(|a| a.persona),
            Ok("Helper".to_string())
        );
    }
}
