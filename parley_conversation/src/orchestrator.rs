//! Turn orchestration for one conversation.
//!
//! A turn runs `PersistingUser → BuildingContext → AwaitingCompletion →
//! PersistingAssistant` and returns to `Idle`. At most one turn is in
//! flight; a second submit while busy fails fast instead of queuing.
//! Every failure returns the machine to `Idle` without undoing what was
//! already persisted. `abort` moves it to the terminal `Aborted` state.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_core::{
    AgentConfig, ChatMessage, CompletionError, Message, PersistenceError, Role,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::history::{HistoryConfig, HistoryWindow};
use crate::manager::ConversationServices;
use crate::store::MessageStore;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    PersistingUser,
    BuildingContext,
    AwaitingCompletion,
    PersistingAssistant,
    Aborted,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PersistingUser => "persisting user message",
            Self::BuildingContext => "building context",
            Self::AwaitingCompletion => "awaiting completion",
            Self::PersistingAssistant => "persisting assistant reply",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Rejections raised synchronously by [`TurnOrchestrator::submit`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("a turn is already in progress ({0})")]
    Busy(TurnState),

    #[error("conversation is closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist user message: {0}")]
    PersistUser(#[source] PersistenceError),

    #[error("failed to load agent configuration: {0}")]
    LoadConfig(#[source] PersistenceError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    /// The generated reply could not be stored; `content` is kept so the
    /// caller can resubmit it by hand.
    #[error("failed to persist assistant reply: {source}")]
    PersistAssistant {
        #[source]
        source: PersistenceError,
        content: String,
    },

    #[error("turn aborted")]
    Aborted,
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user: Message,
    pub assistant: Message,
    /// Context that was sent to the completion backend
    pub context: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged(TurnState),
    TurnCompleted(TurnOutcome),
    TurnFailed(TurnError),
    Aborted,
}

/// One orchestration cycle. Lives only while the turn runs.
struct Turn {
    user: Message,
    context: Vec<ChatMessage>,
    config: AgentConfig,
}

/// Awaitable handle for a submitted turn.
///
/// Dropping the handle does not cancel the turn.
#[derive(Debug)]
pub struct TurnHandle {
    task: JoinHandle<Result<TurnOutcome, TurnError>>,
}

impl TurnHandle {
    pub async fn wait(self) -> Result<TurnOutcome, TurnError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Turn task did not complete: {e}");
                Err(TurnError::Aborted)
            }
        }
    }
}

pub struct TurnOrchestrator {
    conversation_id: Uuid,
    store: Arc<MessageStore>,
    services: ConversationServices,
    window: HistoryWindow,
    state: Mutex<TurnState>,
    cancel: CancellationToken,
    events: broadcast::Sender<TurnEvent>,
}

impl TurnOrchestrator {
    #[must_use]
    pub fn new(store: Arc<MessageStore>, services: ConversationServices) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conversation_id: store.conversation_id(),
            store,
            services,
            window: HistoryWindow::default(),
            state: Mutex::new(TurnState::Idle),
            cancel: CancellationToken::new(),
            events,
        }
    }

    #[must_use]
    pub fn with_history(mut self, config: HistoryConfig) -> Self {
        self.window = HistoryWindow::with_config(config);
        self
    }

    /// Tie in-flight calls to an outer cancellation scope.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub fn state(&self) -> TurnState {
        *self.lock_state()
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Start a turn for `content`.
    ///
    /// Validation happens before this returns, so two back-to-back calls
    /// never both start a turn. Must be called within a Tokio runtime.
    pub fn submit(self: &Arc<Self>, content: &str) -> Result<TurnHandle, TurnError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        {
            let mut state = self.lock_state();
            match *state {
                TurnState::Idle if !self.cancel.is_cancelled() => {
                    *state = TurnState::PersistingUser;
                }
                TurnState::Idle | TurnState::Aborted => {
                    return Err(ValidationError::Closed.into());
                }
                busy => return Err(ValidationError::Busy(busy).into()),
            }
        }
        self.emit(TurnEvent::StateChanged(TurnState::PersistingUser));

        let this = Arc::clone(self);
        let content = content.to_string();
        let task = tokio::spawn(async move { this.run_turn(content).await });
        Ok(TurnHandle { task })
    }

    /// Submit and wait for the turn to finish.
    pub async fn send(self: &Arc<Self>, content: &str) -> Result<TurnOutcome, TurnError> {
        self.submit(content)?.wait().await
    }

    /// Stop any further progress. Idempotent; nothing persisted is undone.
    ///
    /// This ends the orchestrator's lifetime, not just the current turn:
    /// `Aborted` is terminal and later submits fail with
    /// [`ValidationError::Closed`]. Calling it while `Idle` closes the
    /// orchestrator without a turn in flight, which is how conversation
    /// teardown uses it.
    pub fn abort(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), TurnState::Aborted);
        self.cancel.cancel();

        if previous != TurnState::Aborted {
            info!(
                "Orchestrator for {} aborted while {previous}",
                self.conversation_id
            );
            self.emit(TurnEvent::StateChanged(TurnState::Aborted));
            self.emit(TurnEvent::Aborted);
        }
    }

    async fn run_turn(&self, content: String) -> Result<TurnOutcome, TurnError> {
        let result = self.drive(&content).await;

        match &result {
            Ok(outcome) => {
                info!(
                    "Turn complete for {}: user {} -> assistant {}",
                    self.conversation_id, outcome.user.id, outcome.assistant.id
                );
                self.emit(TurnEvent::TurnCompleted(outcome.clone()));
            }
            Err(TurnError::Aborted) => self.abort(),
            Err(e) => self.settle_failure(e),
        }

        result
    }

    async fn drive(&self, content: &str) -> Result<TurnOutcome, TurnError> {
        let persistence = &self.services.persistence;

        let user = self
            .cancellable(persistence.insert(self.conversation_id, Role::User, content))
            .await?
            .map_err(TurnError::PersistUser)?;
        self.store.append(user.clone());
        debug!("Persisted user message {}", user.id);

        self.advance(TurnState::BuildingContext)?;
        let turn = self.build_turn(user).await?;

        self.advance(TurnState::AwaitingCompletion)?;
        let reply = self
            .cancellable(self.services.completion.complete(&turn.context, &turn.config))
            .await??;
        if reply.trim().is_empty() {
            return Err(CompletionError::Permanent("empty response".to_string()).into());
        }

        // Not cancellable: once the reply exists it is either stored or
        // handed back to the caller.
        self.advance(TurnState::PersistingAssistant)?;
        let assistant = persistence
            .insert(self.conversation_id, Role::Assistant, &reply)
            .await
            .map_err(|source| TurnError::PersistAssistant {
                source,
                content: reply.clone(),
            })?;
        self.store.append(assistant.clone());

        self.advance(TurnState::Idle)?;
        Ok(TurnOutcome {
            user: turn.user,
            assistant,
            context: turn.context,
        })
    }

    async fn build_turn(&self, user: Message) -> Result<Turn, TurnError> {
        if self.store.is_closed() {
            return Err(TurnError::Aborted);
        }
        let snapshot = self.store.snapshot();
        let context = self.window.build_context(&snapshot);

        let config = self
            .cancellable(self.services.agents.fetch_agent(self.conversation_id))
            .await?
            .map_err(TurnError::LoadConfig)?;

        debug!(
            "Built context of {} messages for {} (persona: {})",
            context.len(),
            self.conversation_id,
            config.persona
        );
        Ok(Turn {
            user,
            context,
            config,
        })
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, TurnError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TurnError::Aborted),
            output = fut => Ok(output),
        }
    }

    /// Move to `next` unless aborted in the meantime.
    fn advance(&self, next: TurnState) -> Result<(), TurnError> {
        {
            let mut state = self.lock_state();
            if *state == TurnState::Aborted {
                return Err(TurnError::Aborted);
            }
            *state = next;
        }
        debug!("Conversation {} now {next}", self.conversation_id);
        self.emit(TurnEvent::StateChanged(next));
        Ok(())
    }

    fn settle_failure(&self, error: &TurnError) {
        warn!("Turn failed for {}: {error}", self.conversation_id);
        if self.advance(TurnState::Idle).is_ok() {
            self.emit(TurnEvent::TurnFailed(error.clone()));
        }
    }

    fn emit(&self, event: TurnEvent) {
        // No subscribers is fine.
        self.events.send(event).ok();
    }

    fn lock_state(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TurnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOrchestrator")
            .field("conversation_id", &self.conversation_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
