use chrono::{DateTime, Utc};
use event_schema::room::{
    RoomCreatedEvent, RoomDeletedEvent, ViewerJoinedEvent, ViewerKickedEvent, ViewerLeftEvent,
    WatchRoomEvent,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::errors::{RoomAction, RoomError};
use super::viewer::{Viewer, ViewerRecord};

pub const MAX_VIEWERS: usize = 10;
pub const CODE_LENGTH: usize = 5;
pub const OWNER_TAG: &str = "owner";

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

/// Playback state a (re)connecting viewer should adopt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncData {
    pub source_id: Uuid,
    pub on_pause: bool,
    pub speed: f64,
    pub time_line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<i32>,
}

/// Watch-together room aggregate.
///
/// Invariants: at most [`MAX_VIEWERS`] viewers, the owner is always a viewer,
/// banned ids never appear among viewers.
#[derive(Debug, Clone)]
pub struct Room {
    id: Uuid,
    film_id: Uuid,
    is_serial: bool,
    owner_id: Uuid,
    code: Option<String>,
    created_at: DateTime<Utc>,
    viewers: BTreeMap<Uuid, Viewer>,
    banned_ids: BTreeSet<Uuid>,

    pending_events: Vec<WatchRoomEvent>,
}

impl Room {
    /// Create a room; the owner joins immediately. Closed rooms get an access code.
    pub fn create(film_id: Uuid, is_serial: bool, is_open: bool, mut owner: Viewer) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let owner_id = owner.id();

        owner.add_tag(OWNER_TAG);
        if is_serial {
            owner.set_season(Some(1));
            owner.set_episode(Some(1));
        }
        owner.clear_changes();

        let mut viewers = BTreeMap::new();
        viewers.insert(owner_id, owner);

        let mut room = Self {
            id,
            film_id,
            is_serial,
            owner_id,
            code: if is_open { None } else { Some(generate_code()) },
            created_at: now,
            viewers,
            banned_ids: BTreeSet::new(),
            pending_events: Vec::new(),
        };

        room.record_event(WatchRoomEvent::RoomCreated(RoomCreatedEvent {
            room_id: id,
            film_id,
            owner_id,
            is_serial,
            is_open,
            created_at: now,
        }));

        room
    }

    /// Rebuild from storage. Runs the same checks the mutating operations enforce.
    pub fn restore(record: RoomRecord) -> Result<Self, RoomError> {
        if record.viewers.len() > MAX_VIEWERS {
            return Err(RoomError::argument("too many viewers"));
        }
        if let Some(code) = &record.code {
            if !is_valid_code(code) {
                return Err(RoomError::argument("malformed access code"));
            }
        }

        let banned_ids: BTreeSet<Uuid> = record.banned_ids.into_iter().collect();
        let mut viewers = BTreeMap::new();
        for viewer in record.viewers {
            let viewer = Viewer::restore(viewer)?;
            if banned_ids.contains(&viewer.id()) {
                return Err(RoomError::argument("banned viewer present"));
            }
            if viewers.insert(viewer.id(), viewer).is_some() {
                return Err(RoomError::argument("duplicate viewer"));
            }
        }
        if !viewers.contains_key(&record.owner_id) {
            return Err(RoomError::argument("owner is not a viewer"));
        }

        Ok(Self {
            id: record.id,
            film_id: record.film_id,
            is_serial: record.is_serial,
            owner_id: record.owner_id,
            code: record.code,
            created_at: record.created_at,
            viewers,
            banned_ids,
            pending_events: Vec::new(),
        })
    }

    pub fn to_record(&self) -> RoomRecord {
        RoomRecord {
            id: self.id,
            film_id: self.film_id,
            is_serial: self.is_serial,
            owner_id: self.owner_id,
            code: self.code.clone(),
            created_at: self.created_at,
            viewers: self.viewers.values().map(Viewer::to_record).collect(),
            banned_ids: self.banned_ids.iter().copied().collect(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn film_id(&self) -> Uuid {
        self.film_id
    }

    pub fn is_serial(&self) -> bool {
        self.is_serial
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.code.is_none()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn viewers(&self) -> impl Iterator<Item = &Viewer> {
        self.viewers.values()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer(&self, id: Uuid) -> Option<&Viewer> {
        self.viewers.get(&id)
    }

    pub fn viewer_mut(&mut self, id: Uuid) -> Result<&mut Viewer, RoomError> {
        self.viewers.get_mut(&id).ok_or(RoomError::ViewerNotFound)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.viewers.contains_key(&id)
    }

    pub fn owner(&self) -> Option<&Viewer> {
        self.viewers.get(&self.owner_id)
    }

    pub fn is_banned(&self, id: Uuid) -> bool {
        self.banned_ids.contains(&id)
    }

    pub fn join(&mut self, mut viewer: Viewer, code: Option<&str>) -> Result<(), RoomError> {
        let viewer_id = viewer.id();
        if self.viewers.contains_key(&viewer_id) {
            return Err(RoomError::AlreadyJoined);
        }
        if let Some(expected) = &self.code {
            match code {
                Some(given) if given.eq_ignore_ascii_case(expected) => {}
                _ => return Err(RoomError::InvalidCode),
            }
        }
        if self.banned_ids.contains(&viewer_id) {
            return Err(RoomError::UserBanned);
        }
        if self.viewers.len() >= MAX_VIEWERS {
            return Err(RoomError::RoomFull);
        }

        if self.is_serial {
            let (season, episode) = self
                .owner()
                .map(|o| (o.season(), o.episode()))
                .unwrap_or((Some(1), Some(1)));
            viewer.set_season(season);
            viewer.set_episode(episode);
        }
        viewer.clear_changes();
        self.viewers.insert(viewer_id, viewer);

        self.record_event(WatchRoomEvent::ViewerJoined(ViewerJoinedEvent {
            room_id: self.id,
            viewer_id,
            joined_at: Utc::now(),
        }));
        Ok(())
    }

    pub fn leave(&mut self, viewer_id: Uuid) -> Result<Viewer, RoomError> {
        if viewer_id == self.owner_id {
            return Err(RoomError::ActionNotAllowed(RoomAction::Leave));
        }
        let viewer = self
            .viewers
            .remove(&viewer_id)
            .ok_or(RoomError::ViewerNotFound)?;

        self.record_event(WatchRoomEvent::ViewerLeft(ViewerLeftEvent {
            room_id: self.id,
            viewer_id,
            left_at: Utc::now(),
        }));
        Ok(viewer)
    }

    pub fn kick(&mut self, initiator_id: Uuid, target_id: Uuid) -> Result<Viewer, RoomError> {
        if initiator_id != self.owner_id || initiator_id == target_id {
            return Err(RoomError::ActionNotAllowed(RoomAction::Kick));
        }
        let viewer = self
            .viewers
            .remove(&target_id)
            .ok_or(RoomError::ViewerNotFound)?;
        self.banned_ids.insert(target_id);

        self.record_event(WatchRoomEvent::ViewerKicked(ViewerKickedEvent {
            room_id: self.id,
            initiator_id,
            viewer_id: target_id,
            kicked_at: Utc::now(),
        }));
        Ok(viewer)
    }

    pub fn can_delete(&self, user_id: Uuid) -> Result<(), RoomError> {
        if user_id != self.owner_id {
            return Err(RoomError::ActionNotAllowed(RoomAction::Delete));
        }
        Ok(())
    }

    /// Owner-only. Records the deletion fact; removing the row is up to the caller.
    pub fn delete(&mut self, user_id: Uuid) -> Result<(), RoomError> {
        self.can_delete(user_id)?;
        self.record_event(WatchRoomEvent::RoomDeleted(RoomDeletedEvent {
            room_id: self.id,
            owner_id: self.owner_id,
            deleted_at: Utc::now(),
        }));
        Ok(())
    }

    /// Owner's state while the owner is online, otherwise the requester's own.
    pub fn sync_data(&self, requester_id: Uuid) -> Result<SyncData, RoomError> {
        let source = match self.owner() {
            Some(owner) if owner.online() => owner,
            _ => self
                .viewers
                .get(&requester_id)
                .ok_or(RoomError::ViewerNotFound)?,
        };

        Ok(SyncData {
            source_id: source.id(),
            on_pause: source.on_pause(),
            speed: source.speed(),
            time_line: source.time_line(),
            season: if self.is_serial { source.season() } else { None },
            episode: if self.is_serial { source.episode() } else { None },
        })
    }

    fn record_event(&mut self, event: WatchRoomEvent) {
        self.pending_events.push(event);
    }

    /// Get and clear pending integration events
    pub fn take_events(&mut self) -> Vec<WatchRoomEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

/// Persisted shape of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: Uuid,
    pub film_id: Uuid,
    pub is_serial: bool,
    pub owner_id: Uuid,
    pub code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub viewers: Vec<ViewerRecord>,
    pub banned_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::viewer::ViewerSettings;

    fn viewer(id: Uuid) -> Viewer {
        Viewer::new(id, format!("user-{}", &id.to_string()[..4]), None, ViewerSettings::default())
    }

    fn open_room(owner: Uuid) -> Room {
        Room::create(Uuid::new_v4(), false, true, viewer(owner))
    }

    #[test]
    fn test_create_open_room() {
        let owner = Uuid::new_v4();
        let mut room = open_room(owner);

        assert!(room.is_open());
        assert!(room.contains(owner));
        assert!(room.owner().unwrap().has_tag(OWNER_TAG));
        let events = room.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WatchRoomEvent::RoomCreated(_)));
        assert!(room.take_events().is_empty());
    }

    #[test]
    fn test_closed_room_code_is_case_insensitive() {
        let owner = Uuid::new_v4();
        let mut room = Room::create(Uuid::new_v4(), false, false, viewer(owner));
        let code = room.code().unwrap().to_string();
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(is_valid_code(&code));

        let guest = Uuid::new_v4();
        assert_eq!(room.join(viewer(guest), Some("?????")), Err(RoomError::InvalidCode));
        assert_eq!(room.join(viewer(guest), None), Err(RoomError::InvalidCode));
        room.join(viewer(guest), Some(&code.to_lowercase())).unwrap();

        let ids: BTreeSet<Uuid> = room.viewers().map(|v| v.id()).collect();
        assert_eq!(ids, BTreeSet::from([owner, guest]));
    }

    #[test]
    fn test_join_rejects_duplicates_and_full_room() {
        let owner = Uuid::new_v4();
        let mut room = open_room(owner);
        assert_eq!(room.join(viewer(owner), None), Err(RoomError::AlreadyJoined));

        for _ in 1..MAX_VIEWERS {
            room.join(viewer(Uuid::new_v4()), None).unwrap();
        }
        assert_eq!(room.viewer_count(), MAX_VIEWERS);
        assert_eq!(room.join(viewer(Uuid::new_v4()), None), Err(RoomError::RoomFull));
        assert_eq!(room.viewer_count(), MAX_VIEWERS);
    }

    #[test]
    fn test_owner_cannot_leave() {
        let owner = Uuid::new_v4();
        let mut room = open_room(owner);
        assert_eq!(
            room.leave(owner).unwrap_err(),
            RoomError::ActionNotAllowed(RoomAction::Leave)
        );

        let guest = Uuid::new_v4();
        room.join(viewer(guest), None).unwrap();
        room.leave(guest).unwrap();
        assert!(!room.contains(guest));
        assert_eq!(room.leave(guest).unwrap_err(), RoomError::ViewerNotFound);
    }

    #[test]
    fn test_kick_rules_and_ban() {
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut room = open_room(owner);
        room.join(viewer(guest), None).unwrap();
        room.join(viewer(other), None).unwrap();

        let not_allowed = RoomError::ActionNotAllowed(RoomAction::Kick);
        assert_eq!(room.kick(guest, other).unwrap_err(), not_allowed);
        assert_eq!(room.kick(owner, owner).unwrap_err(), not_allowed);

        room.kick(owner, guest).unwrap();
        assert!(!room.contains(guest));
        assert!(room.is_banned(guest));
        assert_eq!(room.join(viewer(guest), None), Err(RoomError::UserBanned));
    }

    #[test]
    fn test_only_owner_can_delete() {
        let owner = Uuid::new_v4();
        let mut room = open_room(owner);
        room.take_events();

        assert_eq!(
            room.delete(Uuid::new_v4()),
            Err(RoomError::ActionNotAllowed(RoomAction::Delete))
        );
        assert!(room.take_events().is_empty());

        room.delete(owner).unwrap();
        assert!(matches!(room.take_events()[0], WatchRoomEvent::RoomDeleted(_)));
    }

    #[test]
    fn test_sync_prefers_online_owner() {
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let mut room = Room::create(Uuid::new_v4(), true, true, viewer(owner));
        room.join(viewer(guest), None).unwrap();

        {
            let o = room.viewer_mut(owner).unwrap();
            o.set_online(true);
            o.set_on_pause(false);
            o.set_time_line(900);
            o.set_episode(Some(3));
        }
        room.viewer_mut(guest).unwrap().set_time_line(10);

        let sync = room.sync_data(guest).unwrap();
        assert_eq!(sync.source_id, owner);
        assert_eq!(sync.time_line, 900);
        assert!(!sync.on_pause);
        assert_eq!(sync.episode, Some(3));

        room.viewer_mut(owner).unwrap().set_online(false);
        let sync = room.sync_data(guest).unwrap();
        assert_eq!(sync.source_id, guest);
        assert_eq!(sync.time_line, 10);
        assert!(sync.on_pause);
    }

    #[test]
    fn test_restore_round_trip_and_validation() {
        let owner = Uuid::new_v4();
        let mut room = Room::create(Uuid::new_v4(), false, false, viewer(owner));
        let guest = Uuid::new_v4();
        room.join(viewer(guest), room.code().map(str::to_string).as_deref()).unwrap();
        room.kick(owner, guest).unwrap();

        let record = room.to_record();
        let restored = Room::restore(record.clone()).unwrap();
        assert_eq!(restored.to_record(), record);
        assert!(restored.is_banned(guest));

        let mut orphaned = record.clone();
        orphaned.viewers.clear();
        assert!(Room::restore(orphaned).is_err());

        let mut bad_code = record.clone();
        bad_code.code = Some("ab".to_string());
        assert!(Room::restore(bad_code).is_err());

        let mut banned_member = record;
        banned_member.banned_ids.push(owner);
        assert!(Room::restore(banned_member).is_err());
    }
}
