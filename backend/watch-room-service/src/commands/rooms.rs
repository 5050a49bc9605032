use uuid::Uuid;

use super::{Caller, RoomService};
use crate::domain::{Room, RoomError, RoomFilter};
use crate::error::{AppError, AppResult};
use crate::hub::events::{Event, RoomSnapshot};
use crate::hub::registry::ConnectionId;
use crate::store::{record_room_events, SessionStrategy};

impl RoomService {
    /// Create a room owned by `owner_id`, who joins it immediately.
    pub async fn create_room(
        &self,
        owner_id: Uuid,
        film_id: Uuid,
        is_serial: bool,
        is_open: bool,
    ) -> AppResult<RoomSnapshot> {
        let _profile = self.profile_locks.lock(owner_id).await;
        let owner = self.viewer_for(owner_id).await?;
        let mut room = Room::create(film_id, is_serial, is_open, owner);

        let mut session = self.store.begin(SessionStrategy::Outbox).await?;
        session.save_room(&room).await?;
        record_room_events(session.as_mut(), &mut room).await?;
        session.commit().await?;

        tracing::info!(
            room_id = %room.id(),
            owner_id = %owner_id,
            film_id = %film_id,
            is_open,
            "Room created"
        );
        Ok(RoomSnapshot::for_viewer(&room, owner_id))
    }

    /// Rooms `user_id` is currently a viewer of.
    pub async fn list_rooms(&self, user_id: Uuid) -> AppResult<Vec<RoomSnapshot>> {
        let mut session = self.store.begin(SessionStrategy::Default).await?;
        let rooms = session.find_rooms(&RoomFilter::has_viewer(user_id)).await?;
        session.commit().await?;

        Ok(rooms
            .iter()
            .map(|room| RoomSnapshot::for_viewer(room, user_id))
            .collect())
    }

    /// Snapshot for a viewer of the room. Outsiders see `RoomNotFound`.
    pub async fn room_snapshot(&self, user_id: Uuid, room_id: Uuid) -> AppResult<RoomSnapshot> {
        let mut session = self.store.begin(SessionStrategy::Default).await?;
        let room = session
            .load_room(room_id)
            .await?
            .filter(|room| room.contains(user_id))
            .ok_or(RoomError::RoomNotFound)?;
        session.commit().await?;

        Ok(RoomSnapshot::for_viewer(&room, user_id))
    }

    pub async fn join_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        code: Option<&str>,
    ) -> AppResult<RoomSnapshot> {
        let _profile = self.profile_locks.lock(user_id).await;
        let viewer = self.viewer_for(user_id).await?;

        let _guard = self.locks.lock(room_id).await;
        let mut session = self.store.begin(SessionStrategy::Outbox).await?;
        let mut room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;

        room.join(viewer, code)?;
        session.save_room(&room).await?;
        record_room_events(session.as_mut(), &mut room).await?;
        session.commit().await?;

        if let Some(joined) = room.viewer(user_id) {
            self.registry
                .broadcast(
                    room_id,
                    &Event::JoinEvent {
                        viewer: joined.to_record(),
                    },
                    None,
                )
                .await;
            self.registry
                .broadcast(
                    room_id,
                    &Event::JoinNotificationEvent {
                        initiator: user_id,
                        name: joined.user_name().to_string(),
                    },
                    None,
                )
                .await;
        }

        tracing::info!(room_id = %room_id, viewer_id = %user_id, "Viewer joined");
        Ok(RoomSnapshot::for_viewer(&room, user_id))
    }

    pub async fn leave_room(&self, user_id: Uuid, room_id: Uuid) -> AppResult<()> {
        let _guard = self.locks.lock(room_id).await;
        let mut session = self.store.begin(SessionStrategy::Outbox).await?;
        let mut room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;

        let viewer = room.leave(user_id)?;
        session.save_room(&room).await?;
        record_room_events(session.as_mut(), &mut room).await?;
        session.commit().await?;

        self.registry.detach_user(room_id, user_id).await;
        self.registry
            .broadcast(
                room_id,
                &Event::LeaveNotificationEvent {
                    initiator: user_id,
                    name: viewer.user_name().to_string(),
                },
                None,
            )
            .await;

        tracing::info!(room_id = %room_id, viewer_id = %user_id, "Viewer left");
        Ok(())
    }

    pub async fn kick(&self, caller: &Caller, room_id: Uuid, target_id: Uuid) -> AppResult<()> {
        let _guard = self.locks.lock(room_id).await;
        let mut session = self.store.begin(SessionStrategy::Outbox).await?;
        let mut room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;

        let target = room.kick(caller.user_id, target_id)?;
        session.save_room(&room).await?;
        record_room_events(session.as_mut(), &mut room).await?;
        session.commit().await?;

        // The kicked viewer still receives the notification before being detached.
        self.registry
            .broadcast(
                room_id,
                &Event::KickNotificationEvent {
                    initiator: caller.user_id,
                    target: target_id,
                    name: target.user_name().to_string(),
                },
                None,
            )
            .await;
        let detached = self.registry.detach_user(room_id, target_id).await;

        tracing::info!(
            room_id = %room_id,
            initiator_id = %caller.user_id,
            viewer_id = %target_id,
            connections = detached.len(),
            "Viewer kicked"
        );
        Ok(())
    }

    pub async fn delete_room(&self, user_id: Uuid, room_id: Uuid) -> AppResult<()> {
        {
            let _guard = self.locks.lock(room_id).await;
            let mut session = self.store.begin(SessionStrategy::Outbox).await?;
            let mut room = session
                .load_room(room_id)
                .await?
                .ok_or(RoomError::RoomNotFound)?;

            room.delete(user_id)?;
            session.delete_room(room_id).await?;
            record_room_events(session.as_mut(), &mut room).await?;
            session.commit().await?;
        }

        self.registry
            .broadcast(room_id, &Event::DeleteNotificationEvent { room_id }, None)
            .await;
        self.registry.close_room(room_id).await;

        tracing::info!(room_id = %room_id, owner_id = %user_id, "Room deleted");
        Ok(())
    }

    /// Attach the caller's connection to the room group, mark the viewer
    /// online and push the full state plus sync data to the caller.
    pub async fn connect(&self, caller: &Caller, room_id: Uuid) -> AppResult<()> {
        let connection_id = caller
            .connection_id
            .ok_or_else(|| AppError::BadRequest("connect needs a connection".into()))?;

        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_online(true);
                Ok(())
            })
            .await?;

        if let Some(previous) = self.registry.attach(connection_id, room_id).await {
            self.mark_offline_if_gone(previous, caller.user_id).await?;
        }

        if update.changed() {
            self.registry
                .broadcast(
                    room_id,
                    &Event::ChangeEvent {
                        viewer_id: caller.user_id,
                        patch: update.patch.clone(),
                    },
                    Some(connection_id),
                )
                .await;
        }

        let sync = update.room.sync_data(caller.user_id)?;
        self.reply(
            caller,
            &Event::RoomEvent {
                room: RoomSnapshot::for_viewer(&update.room, caller.user_id),
            },
        )
        .await;
        self.reply(caller, &Event::SyncEvent { sync }).await;

        tracing::info!(
            room_id = %room_id,
            viewer_id = %caller.user_id,
            connection_id = %connection_id,
            "Viewer connected"
        );
        Ok(())
    }

    /// Push the full room state to the caller.
    pub async fn get_room(&self, caller: &Caller, room_id: Uuid) -> AppResult<()> {
        let snapshot = self.room_snapshot(caller.user_id, room_id).await?;
        self.reply(caller, &Event::RoomEvent { room: snapshot }).await;
        Ok(())
    }

    /// Push the authoritative playback state to the caller.
    pub async fn sync(&self, caller: &Caller, room_id: Uuid) -> AppResult<()> {
        let mut session = self.store.begin(SessionStrategy::Default).await?;
        let room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;
        session.commit().await?;

        let sync = room.sync_data(caller.user_id)?;
        self.reply(caller, &Event::SyncEvent { sync }).await;
        Ok(())
    }

    /// Transport closed. Returns false for an unknown connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> AppResult<bool> {
        let Some((user_id, room_id)) = self.registry.unregister(connection_id).await else {
            return Ok(false);
        };
        if let Some(room_id) = room_id {
            self.mark_offline_if_gone(room_id, user_id).await?;
        }
        tracing::info!(connection_id = %connection_id, user_id = %user_id, "Connection closed");
        Ok(true)
    }

    /// Mark the viewer offline unless another connection of the same user
    /// is still attached to the room.
    async fn mark_offline_if_gone(&self, room_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if self.registry.user_connections(room_id, user_id).await > 0 {
            return Ok(());
        }

        let caller = Caller::rest(user_id);
        let update = match self
            .update_own_viewer(&caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_online(false);
                Ok(())
            })
            .await
        {
            Ok(update) => update,
            // Room deleted or viewer removed in the meantime.
            Err(AppError::Room(RoomError::RoomNotFound | RoomError::ViewerNotFound)) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        if update.changed() {
            self.registry
                .broadcast(
                    room_id,
                    &Event::ChangeEvent {
                        viewer_id: user_id,
                        patch: update.patch,
                    },
                    None,
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{drain, fixture, types};
    use crate::domain::{RoomAction, MAX_VIEWERS};

    fn room_err(result: AppResult<impl std::fmt::Debug>) -> RoomError {
        match result {
            Err(AppError::Room(e)) => e,
            other => panic!("expected room error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_room_code_flow() {
        let f = fixture();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let snapshot = f
            .service
            .create_room(u1, Uuid::new_v4(), false, false)
            .await
            .unwrap();
        let code = snapshot.code.clone().unwrap();
        assert_eq!(code.len(), 5);

        let err = room_err(f.service.join_room(u2, snapshot.id, Some("WRONG")).await);
        assert_eq!(err, RoomError::InvalidCode);

        let joined = f
            .service
            .join_room(u2, snapshot.id, Some(&code.to_lowercase()))
            .await
            .unwrap();
        let ids: Vec<Uuid> = joined.viewers.iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&u1) && ids.contains(&u2));
        assert!(joined.code.is_none());
    }

    #[tokio::test]
    async fn test_eleventh_viewer_is_rejected() {
        let f = fixture();
        let room = f.open_room(Uuid::new_v4(), false).await;
        for _ in 1..MAX_VIEWERS {
            f.service.join_room(Uuid::new_v4(), room.id, None).await.unwrap();
        }
        let err = room_err(f.service.join_room(Uuid::new_v4(), room.id, None).await);
        assert_eq!(err, RoomError::RoomFull);
    }

    #[tokio::test]
    async fn test_lifecycle_records_outbox_events() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();
        f.service.leave_room(guest, room.id).await.unwrap();
        f.service.delete_room(owner, room.id).await.unwrap();

        let kinds: Vec<String> = f
            .store
            .outbox_events()
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                "room.created",
                "room.viewer_joined",
                "room.viewer_left",
                "room.deleted"
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();

        let err = room_err(f.service.delete_room(guest, room.id).await);
        assert_eq!(err, RoomError::ActionNotAllowed(RoomAction::Delete));

        f.service.delete_room(owner, room.id).await.unwrap();
        assert_eq!(f.store.room_count().await, 0);
        let err = room_err(f.service.sync(&Caller::rest(owner), room.id).await);
        assert_eq!(err, RoomError::RoomNotFound);
    }

    #[tokio::test]
    async fn test_owner_cannot_leave() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let room = f.open_room(owner, false).await;
        let err = room_err(f.service.leave_room(owner, room.id).await);
        assert_eq!(err, RoomError::ActionNotAllowed(RoomAction::Leave));
    }

    #[tokio::test]
    async fn test_kick_bans_and_detaches() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();
        let (owner_caller, mut owner_rx) = f.connect(owner, room.id).await;
        let (guest_caller, mut guest_rx) = f.connect(guest, room.id).await;
        drain(&mut owner_rx);

        let err = room_err(f.service.kick(&guest_caller, room.id, owner).await);
        assert_eq!(err, RoomError::ActionNotAllowed(RoomAction::Kick));

        f.service.kick(&owner_caller, room.id, guest).await.unwrap();
        assert!(types(&drain(&mut guest_rx)).contains(&"KickNotificationEvent".to_string()));
        assert_eq!(f.service.registry().room_of(guest_caller.connection_id.unwrap()).await, None);

        let err = room_err(f.service.join_room(guest, room.id, None).await);
        assert_eq!(err, RoomError::UserBanned);
    }

    #[tokio::test]
    async fn test_connect_pushes_room_and_sync() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let room = f.open_room(owner, false).await;

        let (connection_id, mut rx) = f.service.registry().register(owner).await;
        let caller = Caller::connection(owner, connection_id);
        f.service.connect(&caller, room.id).await.unwrap();

        let frames = drain(&mut rx);
        assert_eq!(types(&frames), vec!["RoomEvent", "SyncEvent"]);
        assert_eq!(frames[1]["sync"]["source_id"], serde_json::json!(owner));
        let online = frames[0]["room"]["viewers"][0]["online"].as_bool();
        assert_eq!(online, Some(true));
    }

    #[tokio::test]
    async fn test_connect_requires_membership() {
        let f = fixture();
        let room = f.open_room(Uuid::new_v4(), false).await;
        let stranger = Uuid::new_v4();
        let (connection_id, _rx) = f.service.registry().register(stranger).await;

        let err = room_err(
            f.service
                .connect(&Caller::connection(stranger, connection_id), room.id)
                .await,
        );
        assert_eq!(err, RoomError::ViewerNotFound);
        let err = room_err(
            f.service
                .connect(&Caller::connection(stranger, connection_id), Uuid::new_v4())
                .await,
        );
        assert_eq!(err, RoomError::RoomNotFound);
    }

    #[tokio::test]
    async fn test_offline_only_after_last_tab_closes() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();
        let (_owner_caller, mut owner_rx) = f.connect(owner, room.id).await;
        let (tab1, _rx1) = f.connect(guest, room.id).await;
        let (tab2, _rx2) = f.connect(guest, room.id).await;
        drain(&mut owner_rx);

        f.service.disconnect(tab1.connection_id.unwrap()).await.unwrap();
        assert!(drain(&mut owner_rx).is_empty());

        f.service.disconnect(tab2.connection_id.unwrap()).await.unwrap();
        let frames = drain(&mut owner_rx);
        assert_eq!(types(&frames), vec!["ChangeEvent"]);
        assert_eq!(frames[0]["patch"], serde_json::json!({"online": false}));

        assert!(!f.service.disconnect(tab2.connection_id.unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_follows_owner_presence() {
        let f = fixture();
        let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.service.join_room(guest, room.id, None).await.unwrap();
        let (guest_caller, mut guest_rx) = f.connect(guest, room.id).await;

        f.service.sync(&guest_caller, room.id).await.unwrap();
        let frames = drain(&mut guest_rx);
        assert_eq!(frames[0]["sync"]["source_id"], serde_json::json!(guest));

        let (_owner_caller, _owner_rx) = f.connect(owner, room.id).await;
        drain(&mut guest_rx);
        f.service.sync(&guest_caller, room.id).await.unwrap();
        let frames = drain(&mut guest_rx);
        assert_eq!(frames[0]["sync"]["source_id"], serde_json::json!(owner));
    }

    #[tokio::test]
    async fn test_list_and_snapshot_visibility() {
        let f = fixture();
        let (owner, stranger) = (Uuid::new_v4(), Uuid::new_v4());
        let room = f.open_room(owner, false).await;
        f.open_room(stranger, false).await;

        let mine = f.service.list_rooms(owner).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, room.id);

        let err = room_err(f.service.room_snapshot(stranger, room.id).await);
        assert_eq!(err, RoomError::RoomNotFound);
    }

    #[tokio::test]
    async fn test_unknown_rooms_leave_no_lock_entries() {
        let f = fixture();
        let user = Uuid::new_v4();
        let (connection_id, _rx) = f.service.registry().register(user).await;
        let caller = Caller::connection(user, connection_id);

        for _ in 0..100 {
            let room_id = Uuid::new_v4();
            assert_eq!(
                room_err(f.service.connect(&caller, room_id).await),
                RoomError::RoomNotFound
            );
            assert!(f.service.leave_room(user, room_id).await.is_err());
        }
        assert!(f.service.locks.is_empty());

        let room = f.open_room(user, false).await;
        f.service.connect(&caller, room.id).await.unwrap();
        assert!(f.service.locks.is_empty());
        assert!(f.service.profile_locks.is_empty());
    }
}
