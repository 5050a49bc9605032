//! Unit of work over room storage.
//!
//! A [`Session`] is opened from a [`Store`] with a [`SessionStrategy`] chosen by
//! the call site:
//!
//! | strategy      | transaction | integration events                  |
//! |---------------|-------------|-------------------------------------|
//! | `Default`     | no          | rejected                            |
//! | `Transaction` | fresh       | rejected                            |
//! | `Outbox`      | fresh       | written to the outbox in the same tx|
//! | `Inbox`       | fresh, claims the inbound event id first | allowed |
//!
//! Nothing staged in a transactional session is visible to others until
//! [`Session::commit`]; dropping the session rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_schema::room::{WatchRoomEvent, AGGREGATE_TYPE};
use event_schema::EventEnvelope;
use idempotent_consumer::IdempotencyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use transactional_outbox::{OutboxError, OutboxEvent};
use uuid::Uuid;

use crate::domain::{Message, Room, RoomError, RoomFilter, ViewerSettings};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Source name stamped on published envelopes.
pub const EVENT_SOURCE: &str = "watch-room-service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStrategy {
    Default,
    Transaction,
    Outbox,
    /// Consumption of an inbound event; `event_id` is claimed in the inbox ledger.
    Inbox { event_id: String },
}

impl SessionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SessionStrategy::Default => "default",
            SessionStrategy::Transaction => "transaction",
            SessionStrategy::Outbox => "outbox",
            SessionStrategy::Inbox { .. } => "inbox",
        }
    }

    pub fn is_transactional(&self) -> bool {
        !matches!(self, SessionStrategy::Default)
    }

    pub fn accepts_events(&self) -> bool {
        matches!(
            self,
            SessionStrategy::Outbox | SessionStrategy::Inbox { .. }
        )
    }
}

impl fmt::Display for SessionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} session cannot record integration events")]
    EventsNotSupported(&'static str),

    #[error("event {0} already consumed")]
    AlreadyConsumed(String),

    #[error("stored snapshot failed validation: {0}")]
    Corrupted(String),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("inbox error: {0}")]
    Inbox(#[from] IdempotencyError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl StoreError {
    pub(crate) fn corrupted(room_id: Uuid, err: RoomError) -> Self {
        StoreError::Corrupted(format!("room {}: {}", room_id, err))
    }
}

/// Local projection of an identity-service user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub user_name: String,
    pub photo_key: Option<String>,
    pub settings: ViewerSettings,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub const ANONYMOUS: &'static str = "Anonymous";

    pub fn anonymous(user_id: Uuid) -> Self {
        Self {
            user_id,
            user_name: Self::ANONYMOUS.to_string(),
            photo_key: None,
            settings: ViewerSettings::default(),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Session: Send {
    fn strategy(&self) -> &SessionStrategy;

    async fn load_room(&mut self, room_id: Uuid) -> Result<Option<Room>, StoreError>;

    async fn find_rooms(&mut self, filter: &RoomFilter) -> Result<Vec<Room>, StoreError>;

    async fn save_room(&mut self, room: &Room) -> Result<(), StoreError>;

    async fn delete_room(&mut self, room_id: Uuid) -> Result<(), StoreError>;

    async fn add_message(&mut self, message: &Message) -> Result<(), StoreError>;

    /// Messages strictly older than `from` (newest first). Without `from`,
    /// the newest page. An unknown `from` yields an empty page.
    async fn messages_before(
        &mut self,
        room_id: Uuid,
        from: Option<Uuid>,
        count: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn load_profile(&mut self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;

    async fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError>;

    /// Queue an integration event for dispatch once the session commits.
    async fn record_event(&mut self, event: WatchRoomEvent) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, strategy: SessionStrategy) -> Result<Box<dyn Session>, StoreError>;

    /// Drop inbox claims older than the dedup window.
    async fn purge_expired_claims(&self) -> Result<u64, StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Outbox row for a room fact. The row id doubles as the envelope `event_id`.
pub fn outbox_event(event: &WatchRoomEvent) -> Result<OutboxEvent, StoreError> {
    let mut row = OutboxEvent::new(
        AGGREGATE_TYPE,
        event.room_id(),
        event.event_type(),
        serde_json::Value::Null,
    );
    let envelope = EventEnvelope::new(EVENT_SOURCE, event.clone()).with_event_id(row.id);
    row.payload = serde_json::to_value(&envelope)?;
    Ok(row)
}

/// Record every pending fact of `room` in the session.
pub async fn record_room_events(
    session: &mut dyn Session,
    room: &mut Room,
) -> Result<(), StoreError> {
    for event in room.take_events() {
        session.record_event(event).await?;
    }
    Ok(())
}
