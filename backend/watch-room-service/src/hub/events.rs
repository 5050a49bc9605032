use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Message, Room, SyncData, ViewerPatch, ViewerRecord};

/// Full room state as seen by one viewer. The access code is only disclosed
/// to the owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSnapshot {
    pub id: Uuid,
    pub film_id: Uuid,
    pub is_serial: bool,
    pub is_open: bool,
    pub owner_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub viewers: Vec<ViewerRecord>,
}

impl RoomSnapshot {
    pub fn for_viewer(room: &Room, viewer_id: Uuid) -> Self {
        Self {
            id: room.id(),
            film_id: room.film_id(),
            is_serial: room.is_serial(),
            is_open: room.is_open(),
            owner_id: room.owner_id(),
            code: if viewer_id == room.owner_id() {
                room.code().map(str::to_string)
            } else {
                None
            },
            created_at: room.created_at(),
            viewers: room.viewers().map(|v| v.to_record()).collect(),
        }
    }
}

/// Outbound push, one JSON frame per event: `{"type": "PauseEvent", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    JoinEvent {
        viewer: ViewerRecord,
    },
    RoomEvent {
        room: RoomSnapshot,
    },
    PauseEvent {
        viewer_id: Uuid,
        on_pause: bool,
        time_line: i64,
        buffering: bool,
    },
    SpeedEvent {
        viewer_id: Uuid,
        speed: f64,
    },
    TimeLineEvent {
        viewer_id: Uuid,
        time_line: i64,
    },
    EpisodeEvent {
        viewer_id: Uuid,
        season: i32,
        episode: i32,
    },
    MessageEvent {
        message: Message,
    },
    MessagesEvent {
        messages: Vec<Message>,
    },
    BeepNotificationEvent {
        initiator: Uuid,
        target: Uuid,
    },
    ScreamNotificationEvent {
        initiator: Uuid,
        target: Uuid,
    },
    KickNotificationEvent {
        initiator: Uuid,
        target: Uuid,
        name: String,
    },
    LeaveNotificationEvent {
        initiator: Uuid,
        name: String,
    },
    JoinNotificationEvent {
        initiator: Uuid,
        name: String,
    },
    DeleteNotificationEvent {
        room_id: Uuid,
    },
    ErrorNotificationEvent {
        message: String,
    },
    SyncEvent {
        sync: SyncData,
    },
    TypeEvent {
        initiator: Uuid,
    },
    /// Fields without a dedicated event (presence, screen state, profile, ...).
    ChangeEvent {
        viewer_id: Uuid,
        patch: ViewerPatch,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::JoinEvent { .. } => "JoinEvent",
            Event::RoomEvent { .. } => "RoomEvent",
            Event::PauseEvent { .. } => "PauseEvent",
            Event::SpeedEvent { .. } => "SpeedEvent",
            Event::TimeLineEvent { .. } => "TimeLineEvent",
            Event::EpisodeEvent { .. } => "EpisodeEvent",
            Event::MessageEvent { .. } => "MessageEvent",
            Event::MessagesEvent { .. } => "MessagesEvent",
            Event::BeepNotificationEvent { .. } => "BeepNotificationEvent",
            Event::ScreamNotificationEvent { .. } => "ScreamNotificationEvent",
            Event::KickNotificationEvent { .. } => "KickNotificationEvent",
            Event::LeaveNotificationEvent { .. } => "LeaveNotificationEvent",
            Event::JoinNotificationEvent { .. } => "JoinNotificationEvent",
            Event::DeleteNotificationEvent { .. } => "DeleteNotificationEvent",
            Event::ErrorNotificationEvent { .. } => "ErrorNotificationEvent",
            Event::SyncEvent { .. } => "SyncEvent",
            Event::TypeEvent { .. } => "TypeEvent",
            Event::ChangeEvent { .. } => "ChangeEvent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Viewer, ViewerSettings};

    #[test]
    fn test_event_tagging() {
        let json = serde_json::to_value(Event::ErrorNotificationEvent {
            message: "Room not found".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "ErrorNotificationEvent", "message": "Room not found"})
        );
    }

    #[test]
    fn test_snapshot_hides_code_from_guests() {
        let owner = Uuid::new_v4();
        let room = Room::create(
            Uuid::new_v4(),
            false,
            false,
            Viewer::new(owner, "owner", None, ViewerSettings::default()),
        );

        assert!(RoomSnapshot::for_viewer(&room, owner).code.is_some());
        assert!(RoomSnapshot::for_viewer(&room, Uuid::new_v4()).code.is_none());
    }

    #[test]
    fn test_change_event_carries_patch_only() {
        let mut viewer = Viewer::new(Uuid::new_v4(), "bob", None, ViewerSettings::default());
        viewer.set_online(true);
        let event = Event::ChangeEvent {
            viewer_id: viewer.id(),
            patch: viewer.take_patch(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ChangeEvent");
        assert_eq!(json["patch"], serde_json::json!({"online": true}));
    }
}
