//! Relational backend built on SeaORM.
//!
//! The insert feed polls the `messages` table on the database-assigned
//! `seq` column. Each poll re-reads the last `FEED_LOOKBACK` sequence
//! numbers so a row whose transaction committed after a later one is still
//! delivered; delivered rows are remembered by `seq` and skipped. A query
//! error closes the feed, which the sync channel treats like a dropped
//! connection.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parley_core::{
    AgentConfig, AgentDirectory, InsertFeed, Message, PersistenceClient, PersistenceError, Role,
    SyncFeedError,
};
use parley_entities::{agents, messages};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder, QuerySelect, Schema, Set,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::convert;

const FEED_BUFFER: usize = 64;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Sequence numbers re-read on every poll.
const FEED_LOOKBACK: i64 = 64;

fn write_err(e: &DbErr) -> PersistenceError {
    PersistenceError::Write(e.to_string())
}

fn read_err(e: &DbErr) -> PersistenceError {
    PersistenceError::Read(e.to_string())
}

pub struct SqlBackend {
    db: DatabaseConnection,
    poll_interval: Duration,
}

impl SqlBackend {
    /// Connect and create the tables if they are missing.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database: {}", database_url);
        let mut options = ConnectOptions::new(database_url.to_owned());
        if database_url.starts_with("sqlite::memory:") {
            // Every pooled connection would otherwise get its own database.
            options.max_connections(1);
        }
        let db = Database::connect(options).await?;
        Self::from_connection(db).await
    }

    pub async fn from_connection(db: DatabaseConnection) -> anyhow::Result<Self> {
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);

        let mut create_messages = schema.create_table_from_entity(messages::Entity);
        create_messages.if_not_exists();
        db.execute_unprepared(&backend.build(&create_messages).to_string())
            .await?;

        let mut create_agents = schema.create_table_from_entity(agents::Entity);
        create_agents.if_not_exists();
        db.execute_unprepared(&backend.build(&create_agents).to_string())
            .await?;

        info!("SqlBackend initialized");
        Ok(Self {
            db,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create or replace an agent configuration.
    pub async fn upsert_agent(&self, agent: &AgentConfig) -> Result<(), PersistenceError> {
        let model = agents::ActiveModel {
            id: Set(agent.id),
            persona: Set(agent.persona.clone()),
            memory_state: Set(agent.memory_state.clone()),
            tool_blocks: Set(convert::tool_blocks_to_json(&agent.tool_blocks)),
        };

        let exists = agents::Entity::find_by_id(agent.id)
            .one(&self.db)
            .await
            .map_err(|e| read_err(&e))?
            .is_some();

        if exists {
            model.update(&self.db).await.map_err(|e| write_err(&e))?;
        } else {
            model.insert(&self.db).await.map_err(|e| write_err(&e))?;
        }

        info!("Saved agent {} ({})", agent.id, agent.persona);
        Ok(())
    }

    /// Ids of every conversation with at least one message, oldest first.
    pub async fn list_conversations(&self) -> Result<Vec<Uuid>, PersistenceError> {
        messages::Entity::find()
            .select_only()
            .column(messages::Column::ConversationId)
            .group_by(messages::Column::ConversationId)
            .order_by_asc(messages::Column::Seq.min())
            .into_tuple::<Uuid>()
            .all(&self.db)
            .await
            .map_err(|e| read_err(&e))
    }

    /// Starting point for a new feed: every row that already exists counts
    /// as delivered, since the subscriber reads it through `list_ordered`.
    async fn feed_cursor(&self, conversation_id: Uuid) -> Result<FeedCursor, DbErr> {
        let high = messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .order_by_desc(messages::Column::Seq)
            .one(&self.db)
            .await?
            .map_or(0, |m| m.seq);

        let mut cursor = FeedCursor {
            high,
            delivered: BTreeSet::new(),
        };
        for row in rows_since(&self.db, conversation_id, cursor.window_start()).await? {
            cursor.mark(row.seq);
        }
        Ok(cursor)
    }
}

/// Poll position of one insert feed.
#[derive(Debug, Default)]
struct FeedCursor {
    /// Highest `seq` seen so far
    high: i64,
    /// Delivered `seq` values inside the lookback window
    delivered: BTreeSet<i64>,
}

impl FeedCursor {
    const fn window_start(&self) -> i64 {
        self.high.saturating_sub(FEED_LOOKBACK)
    }

    /// Record `seq` as delivered. Returns `false` if it already was.
    fn mark(&mut self, seq: i64) -> bool {
        if seq <= self.window_start() || !self.delivered.insert(seq) {
            return false;
        }
        self.high = self.high.max(seq);
        let floor = self.window_start();
        self.delivered.retain(|&s| s > floor);
        true
    }
}

/// Rows of `conversation_id` with `seq` greater than `after`, in `seq` order.
async fn rows_since(
    db: &DatabaseConnection,
    conversation_id: Uuid,
    after: i64,
) -> Result<Vec<messages::Model>, DbErr> {
    messages::Entity::find()
        .filter(messages::Column::ConversationId.eq(conversation_id))
        .filter(messages::Column::Seq.gt(after))
        .order_by_asc(messages::Column::Seq)
        .all(db)
        .await
}

#[async_trait]
impl PersistenceClient for SqlBackend {
    async fn insert(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let model = messages::ActiveModel {
            seq: NotSet,
            id: Set(Uuid::now_v7()),
            conversation_id: Set(conversation_id),
            role: Set(role.as_str().to_owned()),
            content: Set(content.to_owned()),
            created_at: Set(Utc::now().timestamp_micros()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| write_err(&e))?;

        debug!("Inserted {} message {}", role, model.id);
        convert::message_from_model(model)
    }

    async fn list_ordered(&self, conversation_id: Uuid) -> Result<Vec<Message>, PersistenceError> {
        messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .order_by_asc(messages::Column::CreatedAt)
            .order_by_asc(messages::Column::Id)
            .all(&self.db)
            .await
            .map_err(|e| read_err(&e))?
            .into_iter()
            .map(convert::message_from_model)
            .collect()
    }

    async fn subscribe_inserts(&self, conversation_id: Uuid) -> Result<InsertFeed, SyncFeedError> {
        let mut cursor = self
            .feed_cursor(conversation_id)
            .await
            .map_err(|e| SyncFeedError::Subscribe(e.to_string()))?;

        let db = self.db.clone();
        let (tx, feed) = InsertFeed::channel(FEED_BUFFER);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            'poll: loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = interval.tick() => {}
                }

                let rows = match rows_since(&db, conversation_id, cursor.window_start()).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("Polling messages for {conversation_id} failed: {e}");
                        break;
                    }
                };

                for row in rows {
                    if !cursor.mark(row.seq) {
                        continue;
                    }
                    let record = match convert::message_from_model(row)
                        .and_then(|m| {
                            serde_json::to_value(&m)
                                .map_err(|e| PersistenceError::InvalidRecord(e.to_string()))
                        }) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("Skipping unreadable row: {e}");
                            continue;
                        }
                    };
                    if tx.send(record).await.is_err() {
                        break 'poll;
                    }
                }
            }
            debug!("Insert feed for {conversation_id} released");
        });

        Ok(feed)
    }
}

#[async_trait]
impl AgentDirectory for SqlBackend {
    async fn fetch_agent(&self, agent_id: Uuid) -> Result<AgentConfig, PersistenceError> {
        agents::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await
            .map_err(|e| read_err(&e))?
            .map(convert::agent_from_model)
            .ok_or(PersistenceError::AgentNotFound(agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_skips_redelivery() {
        let mut cursor = FeedCursor::default();
        assert!(cursor.mark(1));
        assert!(cursor.mark(2));
        assert!(!cursor.mark(1));
        assert_eq!(cursor.high, 2);
    }

    #[test]
    fn cursor_accepts_late_commit_inside_window() {
        let mut cursor = FeedCursor::default();
        assert!(cursor.mark(10));
        assert!(cursor.mark(12));
        // 11 committed after 12 became visible.
        assert!(cursor.mark(11));
        assert_eq!(cursor.high, 12);
    }

    #[test]
    fn cursor_forgets_rows_below_window() {
        let mut cursor = FeedCursor::default();
        assert!(cursor.mark(1));
        assert!(cursor.mark(1 + FEED_LOOKBACK + 5));
        assert!(!cursor.delivered.contains(&1));
        assert!(!cursor.mark(1));
        assert_eq!(cursor.window_start(), 6);
    }
}
