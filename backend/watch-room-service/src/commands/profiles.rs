use event_schema::IdentityEvent;
use uuid::Uuid;

use super::RoomService;
use crate::domain::{Room, RoomFilter, ViewerPatch, ViewerSettings};
use crate::error::AppResult;
use crate::hub::events::Event;
use crate::store::{Profile, SessionStrategy, StoreError};

/// Trimmed name, or `None` for a blank one. A blank rename keeps the stored name.
fn usable_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn apply_to_profile(profile: &mut Profile, event: &IdentityEvent) {
    match event {
        IdentityEvent::UserInfoChanged(e) => {
            if let Some(name) = usable_name(&e.user_name) {
                profile.user_name = name;
            }
            profile.photo_key = e.photo_key.clone();
            profile.updated_at = e.changed_at;
        }
        IdentityEvent::UserSettingsChanged(e) => {
            profile.settings = ViewerSettings {
                allow_beep: e.allow_beep,
                allow_scream: e.allow_scream,
            };
            profile.updated_at = e.changed_at;
        }
    }
}

/// Plain assignment, so applying the same fact twice leaves the same state.
fn apply_to_room(room: &mut Room, event: &IdentityEvent) -> Option<ViewerPatch> {
    let viewer = room.viewer_mut(event.user_id()).ok()?;
    match event {
        IdentityEvent::UserInfoChanged(e) => {
            if let Some(name) = usable_name(&e.user_name) {
                viewer.set_user_name(name);
            }
            viewer.set_photo_key(e.photo_key.clone());
        }
        IdentityEvent::UserSettingsChanged(e) => {
            viewer.set_settings(ViewerSettings {
                allow_beep: e.allow_beep,
                allow_scream: e.allow_scream,
            });
        }
    }
    let patch = viewer.take_patch();
    (!patch.is_empty()).then_some(patch)
}

impl RoomService {
    /// Apply an identity fact to the profile projection and every room the
    /// user sits in, inside one inbox session.
    ///
    /// Returns `Ok(false)` when `event_id` was already consumed.
    pub async fn apply_identity_event(&self, event_id: &str, event: &IdentityEvent) -> AppResult<bool> {
        let user_id = event.user_id();
        // Held to the end so no create or join copies the profile mid-update.
        let _profile = self.profile_locks.lock(user_id).await;
        let strategy = SessionStrategy::Inbox {
            event_id: event_id.to_string(),
        };
        let mut session = match self.store.begin(strategy).await {
            Ok(session) => session,
            Err(StoreError::AlreadyConsumed(_)) => {
                tracing::debug!(event_id, "Identity event already consumed, skipping");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let mut profile = session
            .load_profile(user_id)
            .await?
            .unwrap_or_else(|| Profile::anonymous(user_id));
        apply_to_profile(&mut profile, event);
        session.save_profile(&profile).await?;

        let mut room_ids: Vec<Uuid> = session
            .find_rooms(&RoomFilter::has_viewer(user_id))
            .await?
            .iter()
            .map(Room::id)
            .collect();
        // Fixed lock order across concurrent consumers.
        room_ids.sort();

        let mut guards = Vec::with_capacity(room_ids.len());
        for room_id in &room_ids {
            guards.push(self.locks.lock(*room_id).await);
        }

        let mut changes = Vec::new();
        for room_id in room_ids {
            // Reload under the lock; the room may have changed since the lookup.
            let Some(mut room) = session.load_room(room_id).await? else {
                continue;
            };
            if let Some(patch) = apply_to_room(&mut room, event) {
                session.save_room(&room).await?;
                changes.push((room_id, patch));
            }
        }

        match session.commit().await {
            Ok(()) => {}
            Err(StoreError::AlreadyConsumed(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        drop(guards);

        for (room_id, patch) in changes {
            self.registry
                .broadcast(room_id, &Event::ChangeEvent { viewer_id: user_id, patch }, None)
                .await;
        }

        tracing::info!(event_id, user_id = %user_id, "Identity event applied");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{drain, fixture, types};
    use crate::store::Store;
    use chrono::Utc;
    use event_schema::{UserInfoChangedEvent, UserSettingsChangedEvent};

    fn renamed(user_id: Uuid, name: &str) -> IdentityEvent {
        IdentityEvent::UserInfoChanged(UserInfoChangedEvent {
            user_id,
            user_name: name.to_string(),
            photo_key: Some("avatars/new.png".to_string()),
            changed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_rename_reaches_rooms_and_profile() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();
        let (_guest_caller, mut guest_rx) = f.connect(guest, room.id).await;

        let applied = f
            .service
            .apply_identity_event("evt-1", &renamed(owner, "Captain"))
            .await
            .unwrap();
        assert!(applied);

        let frames = drain(&mut guest_rx);
        assert_eq!(types(&frames), vec!["ChangeEvent"]);
        assert_eq!(frames[0]["patch"]["user_name"], "Captain");

        let snapshot = f.service.room_snapshot(owner, room.id).await.unwrap();
        let me = snapshot.viewers.iter().find(|v| v.id == owner).unwrap();
        assert_eq!(me.user_name, "Captain");

        let mut session = f.store.begin(SessionStrategy::Default).await.unwrap();
        let profile = session.load_profile(owner).await.unwrap().unwrap();
        assert_eq!(profile.photo_key.as_deref(), Some("avatars/new.png"));
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped_and_state_unchanged() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let room = f.open_room(owner, false).await;
        let event = renamed(owner, "Captain");

        assert!(f.service.apply_identity_event("evt-2", &event).await.unwrap());
        let first = f.service.room_snapshot(owner, room.id).await.unwrap();

        assert!(!f.service.apply_identity_event("evt-2", &event).await.unwrap());
        let second = f.service.room_snapshot(owner, room.id).await.unwrap();
        assert_eq!(first, second);
        assert!(f.store.is_consumed("evt-2").await);
    }

    #[tokio::test]
    async fn test_same_fact_under_new_id_is_idempotent() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let room = f.open_room(owner, false).await;
        let event = IdentityEvent::UserSettingsChanged(UserSettingsChangedEvent {
            user_id: owner,
            allow_beep: false,
            allow_scream: false,
            changed_at: Utc::now(),
        });

        f.service.apply_identity_event("a", &event).await.unwrap();
        let once = f.service.room_snapshot(owner, room.id).await.unwrap();
        f.service.apply_identity_event("b", &event).await.unwrap();
        let twice = f.service.room_snapshot(owner, room.id).await.unwrap();

        assert_eq!(once, twice);
        assert!(!once.viewers[0].settings.allow_beep);
    }

    #[tokio::test]
    async fn test_profile_feeds_new_viewers() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.service
            .apply_identity_event("evt-3", &renamed(user, "Dana"))
            .await
            .unwrap();

        let room = f.open_room(user, false).await;
        assert_eq!(room.viewers[0].user_name, "Dana");

        let anonymous = f.open_room(Uuid::new_v4(), false).await;
        assert_eq!(anonymous.viewers[0].user_name, Profile::ANONYMOUS);
    }

    #[tokio::test]
    async fn test_blank_rename_keeps_stored_name() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let room = f.open_room(owner, false).await;
        f.service
            .apply_identity_event("named", &renamed(owner, "  Captain "))
            .await
            .unwrap();

        assert!(f
            .service
            .apply_identity_event("blank", &renamed(owner, "   "))
            .await
            .unwrap());

        let snapshot = f.service.room_snapshot(owner, room.id).await.unwrap();
        assert_eq!(snapshot.viewers[0].user_name, "Captain");
        let later = f.open_room(owner, false).await;
        assert_eq!(later.viewers[0].user_name, "Captain");
        f.service.delete_room(owner, room.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_racing_a_rename_sees_new_name() {
        for rename_first in [true, false] {
            let f = fixture();
            let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
            let room_id = f.open_room(owner, false).await.id;

            let spawn_rename = || {
                let service = f.service.clone();
                let event = renamed(guest, "Racer");
                tokio::spawn(async move {
                    service.apply_identity_event("evt-race", &event).await.unwrap();
                })
            };
            let spawn_join = || {
                let service = f.service.clone();
                tokio::spawn(async move {
                    service.join_room(guest, room_id, None).await.unwrap();
                })
            };
            let settle = || tokio::time::sleep(std::time::Duration::from_millis(10));

            // Queue both behind the guest's profile lock in a fixed order.
            let held = f.service.profile_locks.lock(guest).await;
            let (first, second) = if rename_first {
                let first = spawn_rename();
                settle().await;
                (first, spawn_join())
            } else {
                let first = spawn_join();
                settle().await;
                (first, spawn_rename())
            };
            settle().await;
            drop(held);
            first.await.unwrap();
            second.await.unwrap();

            let snapshot = f.service.room_snapshot(guest, room_id).await.unwrap();
            let me = snapshot.viewers.iter().find(|v| v.id == guest).unwrap();
            assert_eq!(me.user_name, "Racer", "rename_first={rename_first}");
            assert!(f.service.profile_locks.is_empty());
        }
    }
}
