//! Wire types for the Kafka topics watch-room-service touches.
//!
//! Outward: room facts on `<prefix>.room.events`, one [`room::WatchRoomEvent`]
//! per message. Inward: profile facts from `<prefix>.identity.events`.
//! Both travel wrapped in an [`EventEnvelope`]; its `event_id` is the key the
//! consumer claims in its inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod identity;
pub mod room;

pub use identity::{IdentityEvent, UserInfoChangedEvent, UserSettingsChangedEvent};
pub use room::{
    RoomCreatedEvent, RoomDeletedEvent, ViewerJoinedEvent, ViewerKickedEvent, ViewerLeftEvent,
    WatchRoomEvent,
};

pub const SCHEMA_VERSION: u32 = 1;

/// Topic carrying the facts of one aggregate type.
pub fn topic_for(prefix: &str, aggregate_type: &str) -> String {
    format!("{}.{}.events", prefix, aggregate_type)
}

/// Envelopes from another schema generation are skipped, not parsed.
pub fn is_supported_version(schema_version: u64) -> bool {
    schema_version == u64::from(SCHEMA_VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    /// Producing service.
    pub source: String,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            data,
        }
    }

    /// Reuse an outbox row id so every redelivery of the row has the same key.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}
