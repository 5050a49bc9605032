//! Facts published by watch-room-service through its outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type used for outbox rows and topic routing (`<prefix>.room.events`).
pub const AGGREGATE_TYPE: &str = "room";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreatedEvent {
    pub room_id: Uuid,
    pub film_id: Uuid,
    pub owner_id: Uuid,
    pub is_serial: bool,
    pub is_open: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDeletedEvent {
    pub room_id: Uuid,
    pub owner_id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerJoinedEvent {
    pub room_id: Uuid,
    pub viewer_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerLeftEvent {
    pub room_id: Uuid,
    pub viewer_id: Uuid,
    pub left_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerKickedEvent {
    pub room_id: Uuid,
    pub initiator_id: Uuid,
    pub viewer_id: Uuid,
    pub kicked_at: DateTime<Utc>,
}

/// Every fact the room aggregate can publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum WatchRoomEvent {
    RoomCreated(RoomCreatedEvent),
    RoomDeleted(RoomDeletedEvent),
    ViewerJoined(ViewerJoinedEvent),
    ViewerLeft(ViewerLeftEvent),
    ViewerKicked(ViewerKickedEvent),
}

impl WatchRoomEvent {
    /// Dotted event type, first segment is the aggregate.
    pub fn event_type(&self) -> &'static str {
        match self {
            WatchRoomEvent::RoomCreated(_) => "room.created",
            WatchRoomEvent::RoomDeleted(_) => "room.deleted",
            WatchRoomEvent::ViewerJoined(_) => "room.viewer_joined",
            WatchRoomEvent::ViewerLeft(_) => "room.viewer_left",
            WatchRoomEvent::ViewerKicked(_) => "room.viewer_kicked",
        }
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            WatchRoomEvent::RoomCreated(e) => e.room_id,
            WatchRoomEvent::RoomDeleted(e) => e.room_id,
            WatchRoomEvent::ViewerJoined(e) => e.room_id,
            WatchRoomEvent::ViewerLeft(e) => e.room_id,
            WatchRoomEvent::ViewerKicked(e) => e.room_id,
        }
    }
}
