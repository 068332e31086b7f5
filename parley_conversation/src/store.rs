//! In-memory ordered message log for one conversation.
//!
//! The store is append-only and idempotent by message id: the same record
//! may arrive from the initial history fetch, from the orchestrator's own
//! write, and from the push echo of that write, and it is applied once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_core::Message;
use tracing::{debug, warn};
use uuid::Uuid;

type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle returned by [`MessageStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct StoreInner {
    messages: Arc<Vec<Message>>,
    ids: HashSet<Uuid>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    closed: bool,
}

/// Ordered log sorted by `(created_at, id)`.
pub struct MessageStore {
    conversation_id: Uuid,
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    #[must_use]
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            inner: Mutex::new(StoreInner {
                messages: Arc::new(Vec::new()),
                ids: HashSet::new(),
                listeners: Vec::new(),
                next_listener: 0,
                closed: false,
            }),
        }
    }

    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `message` unless its id is already present.
    ///
    /// Returns `true` when the log changed. Listeners run after the lock is
    /// released, in subscription order.
    pub fn append(&self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            warn!(
                "Ignoring message {} for conversation {} (store is {})",
                message.id, message.conversation_id, self.conversation_id
            );
            return false;
        }

        let listeners: Vec<Listener> = {
            let mut inner = self.lock();
            if inner.closed || !inner.ids.insert(message.id) {
                return false;
            }

            let key = message.sort_key();
            let messages = Arc::make_mut(&mut inner.messages);
            let pos = messages.partition_point(|m| m.sort_key() < key);
            messages.insert(pos, message.clone());

            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        debug!("Appended message {} ({})", message.id, message.role);
        for listener in &listeners {
            listener(&message);
        }
        true
    }

    /// Detached view of the current log.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            messages: Arc::clone(&self.lock().messages),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        if !inner.closed {
            inner.listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().ids.contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn last(&self) -> Option<Message> {
        self.lock().messages.last().cloned()
    }

    /// Tear the store down: later appends are ignored and listeners dropped.
    /// The last snapshot stays readable.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.listeners.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MessageStore")
            .field("conversation_id", &self.conversation_id)
            .field("len", &inner.messages.len())
            .field("listeners", &inner.listeners.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Immutable, restartable view of the log at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    messages: Arc<Vec<Message>>,
}

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.as_ref().clone()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
