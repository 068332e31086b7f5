//! End-to-end conversation flows against the in-memory backend.
//!
//! These cover the full path of a turn (persist, context, completion,
//! persist) together with the live feed: echoes of our own writes, writes
//! from other participants, feed outages and teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_conversation::{
    BackoffPolicy, ConversationConfig, ConversationManager, ConversationServices, HistoryConfig,
    SyncOptions, SyncStatus, TurnError, TurnEvent, TurnState, ValidationError,
};
use parley_core::{
    AgentConfig, ChatMessage, CompletionClient, CompletionError, PersistenceClient,
    PersistenceError, Role,
};
use parley_persistence::InMemoryBackend;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// Replies with a fixed answer and records every context it was given.
struct RecordingCompletion {
    reply: String,
    contexts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl RecordingCompletion {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            contexts: Mutex::new(Vec::new()),
        })
    }

    fn contexts(&self) -> Vec<Vec<ChatMessage>> {
        self.contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CompletionClient for RecordingCompletion {
    async fn complete(
        &self,
        context: &[ChatMessage],
        _config: &AgentConfig,
    ) -> Result<String, CompletionError> {
        self.contexts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(context.to_vec());
        Ok(self.reply.clone())
    }
}

/// Blocks until released, then answers.
struct GatedCompletion {
    gate: Notify,
}

#[async_trait]
impl CompletionClient for GatedCompletion {
    async fn complete(
        &self,
        _context: &[ChatMessage],
        _config: &AgentConfig,
    ) -> Result<String, CompletionError> {
        self.gate.notified().await;
        Ok("done".to_string())
    }
}

struct FailingCompletion;

#[async_trait]
impl CompletionClient for FailingCompletion {
    async fn complete(
        &self,
        _context: &[ChatMessage],
        _config: &AgentConfig,
    ) -> Result<String, CompletionError> {
        Err(CompletionError::Transient("upstream overloaded".to_string()))
    }
}

fn backend_with_agent(conversation_id: Uuid, persona: &str) -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new());
    backend.put_agent(AgentConfig::new(conversation_id, persona));
    backend
}

fn fast_sync() -> ConversationConfig {
    ConversationConfig::default().with_sync(SyncOptions {
        backoff: BackoffPolicy {
            initial_ms: 10,
            max_ms: 50,
            jitter: 0.0,
        },
    })
}

async fn open(
    conversation_id: Uuid,
    backend: &Arc<InMemoryBackend>,
    completion: Arc<dyn CompletionClient>,
    config: ConversationConfig,
) -> ConversationManager {
    let services = ConversationServices::new(backend.clone(), completion, backend.clone());
    match ConversationManager::open(conversation_id, services, config).await {
        Ok(manager) => manager,
        Err(e) => panic!("open failed: {e}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within {WAIT:?}");
}

async fn wait_for_status(manager: &ConversationManager, wanted: fn(&SyncStatus) -> bool) {
    let Some(mut status) = manager.watch_sync_status() else {
        panic!("conversation has no sync channel");
    };
    let seen = tokio::time::timeout(WAIT, status.wait_for(wanted)).await;
    assert!(
        matches!(seen, Ok(Ok(_))),
        "sync status not reached within {WAIT:?}"
    );
}

fn contents(manager: &ConversationManager) -> Vec<String> {
    manager
        .snapshot()
        .iter()
        .map(|m| m.content.clone())
        .collect()
}

#[tokio::test]
async fn turn_persists_both_messages_in_order() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Math Tutor");
    let completion = RecordingCompletion::new("4");
    let manager = open(conv, &backend, completion.clone(), ConversationConfig::default()).await;

    let outcome = manager.send("2+2?").await;
    let Ok(outcome) = outcome else {
        panic!("turn failed: {outcome:?}");
    };

    assert_eq!(outcome.user.role, Role::User);
    assert_eq!(outcome.assistant.role, Role::Assistant);
    assert_eq!(outcome.assistant.content, "4");
    assert!(outcome.user.sort_key() < outcome.assistant.sort_key());

    assert_eq!(
        completion.contexts(),
        vec![vec![ChatMessage {
            role: Role::User,
            content: "2+2?".to_string(),
        }]]
    );
    assert_eq!(contents(&manager), ["2+2?", "4"]);
    assert_eq!(backend.message_count(), 2);
    assert_eq!(manager.orchestrator().state(), TurnState::Idle);

    manager.close().await;
}

#[tokio::test]
async fn feed_echo_of_own_write_is_not_duplicated() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("hi"),
        ConversationConfig::default(),
    )
    .await;
    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;

    let outcome = manager.send("hello").await;
    assert!(outcome.is_ok());

    // A later remote write arrives after both echoes, so once it shows up
    // every echo has been processed.
    let marker = backend.insert(conv, Role::User, "marker").await;
    assert!(marker.is_ok());
    wait_until(|| manager.store().len() == 3).await;

    assert_eq!(contents(&manager), ["hello", "hi", "marker"]);
    manager.close().await;
}

#[tokio::test]
async fn writes_from_other_participants_appear() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("ok"),
        ConversationConfig::default(),
    )
    .await;
    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;

    let other = Uuid::now_v7();
    assert!(backend.insert(other, Role::User, "elsewhere").await.is_ok());
    assert!(backend.insert(conv, Role::User, "from phone").await.is_ok());

    wait_until(|| manager.store().len() == 1).await;
    assert_eq!(contents(&manager), ["from phone"]);
    manager.close().await;
}

#[tokio::test]
async fn existing_history_is_loaded_on_open() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    for text in ["one", "two", "three"] {
        assert!(backend.insert(conv, Role::User, text).await.is_ok());
    }

    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("ok"),
        ConversationConfig::default(),
    )
    .await;

    assert_eq!(contents(&manager), ["one", "two", "three"]);
    manager.close().await;
}

#[tokio::test]
async fn history_fetch_failure_fails_open() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    backend.fail_next_lists(1);

    let services = ConversationServices::new(
        backend.clone(),
        RecordingCompletion::new("ok"),
        backend.clone(),
    );
    let opened = ConversationManager::open(conv, services, ConversationConfig::default()).await;

    assert!(matches!(opened, Err(PersistenceError::Read(_))));
}

#[tokio::test]
async fn second_submit_while_busy_is_rejected() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let completion = Arc::new(GatedCompletion {
        gate: Notify::new(),
    });
    let manager = open(
        conv,
        &backend,
        completion.clone(),
        ConversationConfig::default(),
    )
    .await;

    let first = manager.submit("first");
    let Ok(first) = first else {
        panic!("first submit rejected");
    };
    let second = manager.submit("second");
    assert!(matches!(
        second,
        Err(TurnError::Validation(ValidationError::Busy(_)))
    ));

    wait_until(|| manager.orchestrator().state() == TurnState::AwaitingCompletion).await;
    completion.gate.notify_one();
    assert!(first.wait().await.is_ok());

    // Only the first turn reached storage.
    assert_eq!(backend.message_count(), 2);
    assert_eq!(contents(&manager), ["first", "done"]);

    completion.gate.notify_one();
    assert!(manager.send("third").await.is_ok());
    manager.close().await;
}

#[tokio::test]
async fn completion_failure_keeps_user_message_and_recovers() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        Arc::new(FailingCompletion),
        ConversationConfig::default(),
    )
    .await;
    let mut events = manager.subscribe_events();

    let result = manager.send("are you there?").await;
    assert!(matches!(
        result,
        Err(TurnError::Completion(CompletionError::Transient(_)))
    ));

    assert_eq!(manager.orchestrator().state(), TurnState::Idle);
    assert_eq!(contents(&manager), ["are you there?"]);
    assert_eq!(backend.message_count(), 1);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, TurnEvent::TurnFailed(TurnError::Completion(_)));
    }
    assert!(failed);

    // The machine accepts the next turn.
    let again = manager.send("retry").await;
    assert!(matches!(again, Err(TurnError::Completion(_))));
    assert_eq!(backend.message_count(), 2);
    manager.close().await;
}

#[tokio::test]
async fn user_persist_failure_leaves_store_untouched() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let completion = RecordingCompletion::new("never");
    let manager = open(conv, &backend, completion.clone(), ConversationConfig::default()).await;

    backend.fail_next_inserts(1);
    let result = manager.send("lost").await;

    assert!(matches!(result, Err(TurnError::PersistUser(_))));
    assert!(manager.store().is_empty());
    assert!(completion.contexts().is_empty());
    assert_eq!(manager.orchestrator().state(), TurnState::Idle);
    manager.close().await;
}

#[tokio::test]
async fn missing_agent_fails_turn_after_user_message() {
    let conv = Uuid::now_v7();
    let backend = Arc::new(InMemoryBackend::new());
    let completion = RecordingCompletion::new("never");
    let manager = open(conv, &backend, completion.clone(), ConversationConfig::default()).await;

    let result = manager.send("hello?").await;

    assert!(matches!(
        result,
        Err(TurnError::LoadConfig(PersistenceError::AgentNotFound(id))) if id == conv
    ));
    assert_eq!(contents(&manager), ["hello?"]);
    assert!(completion.contexts().is_empty());
    manager.close().await;
}

#[tokio::test]
async fn events_follow_turn_states() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("pong"),
        ConversationConfig::default(),
    )
    .await;
    let mut events = manager.subscribe_events();

    assert!(manager.send("ping").await.is_ok());

    let mut states = Vec::new();
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TurnEvent::StateChanged(state) => states.push(state),
            TurnEvent::TurnCompleted(outcome) => {
                completed = outcome.assistant.content == "pong";
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(
        states,
        [
            TurnState::PersistingUser,
            TurnState::BuildingContext,
            TurnState::AwaitingCompletion,
            TurnState::PersistingAssistant,
            TurnState::Idle,
        ]
    );
    assert!(completed);
    manager.close().await;
}

#[tokio::test]
async fn context_respects_history_window() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    for text in ["old 1", "old 2", "old 3"] {
        assert!(backend.insert(conv, Role::User, text).await.is_ok());
    }
    let completion = RecordingCompletion::new("ok");
    let config =
        ConversationConfig::default().with_history(HistoryConfig::default().with_max_messages(2));
    let manager = open(conv, &backend, completion.clone(), config).await;

    assert!(manager.send("newest").await.is_ok());

    let contexts = completion.contexts();
    assert_eq!(contexts.len(), 1);
    let sent: Vec<_> = contexts[0].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(sent, ["old 3", "newest"]);
    manager.close().await;
}

#[tokio::test]
async fn malformed_push_is_dropped_and_feed_continues() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("ok"),
        ConversationConfig::default(),
    )
    .await;
    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;

    backend.push_raw(json!({
        "conversation_id": conv.to_string(),
        "role": "robot",
        "content": 42,
    }));
    assert!(backend.insert(conv, Role::User, "valid").await.is_ok());

    wait_until(|| manager.store().len() == 1).await;
    assert_eq!(contents(&manager), ["valid"]);
    assert_eq!(manager.sync_status(), SyncStatus::Live);
    manager.close().await;
}

#[tokio::test]
async fn feed_outage_recovers_missed_writes() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(conv, &backend, RecordingCompletion::new("ok"), fast_sync()).await;
    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;

    backend.refuse_next_subscriptions(2);
    backend.disconnect_feeds();
    wait_for_status(&manager, |s| matches!(s, SyncStatus::Reconnecting { .. })).await;

    // Written while no feed is open; only the catch-up read can deliver it.
    assert!(backend.insert(conv, Role::User, "during outage").await.is_ok());

    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;
    wait_until(|| manager.store().len() == 1).await;
    assert_eq!(contents(&manager), ["during outage"]);

    // The renewed feed delivers live writes again.
    assert!(backend.insert(conv, Role::User, "after").await.is_ok());
    wait_until(|| manager.store().len() == 2).await;
    manager.close().await;
}

#[tokio::test]
async fn abort_during_completion_discards_reply() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let completion = Arc::new(GatedCompletion {
        gate: Notify::new(),
    });
    let manager = open(
        conv,
        &backend,
        completion.clone(),
        ConversationConfig::default(),
    )
    .await;
    let orchestrator = Arc::clone(manager.orchestrator());

    let Ok(handle) = manager.submit("slow question") else {
        panic!("submit rejected");
    };
    wait_until(|| orchestrator.state() == TurnState::AwaitingCompletion).await;

    manager.close().await;
    completion.gate.notify_one();

    assert!(matches!(handle.wait().await, Err(TurnError::Aborted)));
    assert_eq!(orchestrator.state(), TurnState::Aborted);
    assert_eq!(backend.message_count(), 1);
}

#[tokio::test]
async fn close_stops_all_activity() {
    let conv = Uuid::now_v7();
    let backend = backend_with_agent(conv, "Helper");
    let manager = open(
        conv,
        &backend,
        RecordingCompletion::new("ok"),
        ConversationConfig::default(),
    )
    .await;
    wait_for_status(&manager, |s| *s == SyncStatus::Live).await;

    let store = Arc::clone(manager.store());
    let orchestrator = Arc::clone(manager.orchestrator());
    manager.close().await;

    assert!(store.is_closed());
    assert!(matches!(
        orchestrator.submit("anyone?"),
        Err(TurnError::Validation(ValidationError::Closed))
    ));

    assert!(backend.insert(conv, Role::User, "too late").await.is_ok());
    wait_until(|| backend.subscriber_count() == 0).await;
    assert!(store.is_empty());
}
