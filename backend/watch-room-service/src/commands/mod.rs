//! Command handlers: apply one client intent to a room, persist it under the
//! right session strategy, then broadcast the outcome.
//!
//! Every mutating handler holds the room's lock from load to commit. Events
//! are pushed to connections only after the session committed.
//!
//! Paths that copy a profile into a room (create, join, identity updates) also
//! hold the user's profile lock, taken before any room lock.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{Room, RoomError, Viewer, ViewerPatch};
use crate::error::AppResult;
use crate::hub::events::Event;
use crate::hub::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{Profile, SessionStrategy, SharedStore};

pub mod chat;
pub mod cooldown;
pub mod locks;
pub mod notify;
pub mod playback;
pub mod profiles;
pub mod rooms;

pub use cooldown::CooldownTracker;
pub use locks::RoomLocks;

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub beep_cooldown: Duration,
    pub scream_cooldown: Duration,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            beep_cooldown: Duration::from_secs(10),
            scream_cooldown: Duration::from_secs(30),
        }
    }
}

/// Who issued a command. REST callers have no connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub connection_id: Option<ConnectionId>,
}

impl Caller {
    pub fn rest(user_id: Uuid) -> Self {
        Self {
            user_id,
            connection_id: None,
        }
    }

    pub fn connection(user_id: Uuid, connection_id: ConnectionId) -> Self {
        Self {
            user_id,
            connection_id: Some(connection_id),
        }
    }
}

/// Outcome of a change to the caller's own viewer.
pub(crate) struct ViewerUpdate {
    pub room: Room,
    pub patch: ViewerPatch,
}

impl ViewerUpdate {
    pub fn changed(&self) -> bool {
        !self.patch.is_empty()
    }
}

#[derive(Clone)]
pub struct RoomService {
    store: SharedStore,
    registry: ConnectionRegistry,
    locks: RoomLocks,
    /// Keyed by user id.
    profile_locks: RoomLocks,
    cooldowns: Arc<CooldownTracker>,
    settings: CommandSettings,
}

impl RoomService {
    pub fn new(store: SharedStore, registry: ConnectionRegistry, settings: CommandSettings) -> Self {
        Self {
            store,
            registry,
            locks: RoomLocks::new(),
            profile_locks: RoomLocks::new(),
            cooldowns: Arc::new(CooldownTracker::new()),
            settings,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    /// Push an event to the caller's own connection, if it has one.
    pub(crate) async fn reply(&self, caller: &Caller, event: &Event) {
        if let Some(connection_id) = caller.connection_id {
            if !self.registry.send_to(connection_id, event).await {
                tracing::debug!(
                    connection_id = %connection_id,
                    event = event.name(),
                    "Reply dropped, connection is gone"
                );
            }
        }
    }

    /// Load -> mutate own viewer -> save, without a transaction.
    ///
    /// The save is skipped when `apply` left the viewer untouched.
    pub(crate) async fn update_own_viewer<F>(
        &self,
        caller: &Caller,
        room_id: Uuid,
        apply: F,
    ) -> AppResult<ViewerUpdate>
    where
        F: FnOnce(&mut Room, Uuid) -> Result<(), RoomError> + Send,
    {
        let _guard = self.locks.lock(room_id).await;
        let mut session = self.store.begin(SessionStrategy::Default).await?;

        let mut room = session
            .load_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound)?;
        if !room.contains(caller.user_id) {
            return Err(RoomError::ViewerNotFound.into());
        }

        apply(&mut room, caller.user_id)?;
        let patch = room.viewer_mut(caller.user_id)?.take_patch();
        if !patch.is_empty() {
            session.save_room(&room).await?;
        }
        session.commit().await?;

        Ok(ViewerUpdate { room, patch })
    }

    /// New viewer for `user_id` from the local profile projection.
    ///
    /// Callers hold the user's profile lock until the viewer is committed.
    pub(crate) async fn viewer_for(&self, user_id: Uuid) -> AppResult<Viewer> {
        let mut session = self.store.begin(SessionStrategy::Default).await?;
        let profile = session
            .load_profile(user_id)
            .await?
            .unwrap_or_else(|| Profile::anonymous(user_id));
        session.commit().await?;

        Ok(Viewer::new(
            user_id,
            profile.user_name,
            profile.photo_key,
            profile.settings,
        ))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hub::events::RoomSnapshot;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub struct Fixture {
        pub store: MemoryStore,
        pub service: RoomService,
    }

    pub fn fixture() -> Fixture {
        let store = MemoryStore::default();
        let service = RoomService::new(
            Arc::new(store.clone()),
            ConnectionRegistry::new(),
            CommandSettings::default(),
        );
        Fixture { store, service }
    }

    impl Fixture {
        pub async fn open_room(&self, owner: Uuid, is_serial: bool) -> RoomSnapshot {
            self.service
                .create_room(owner, Uuid::new_v4(), is_serial, true)
                .await
                .unwrap()
        }

        /// Register and connect a user to a room, draining the initial push.
        pub async fn connect(
            &self,
            user_id: Uuid,
            room_id: Uuid,
        ) -> (Caller, UnboundedReceiver<String>) {
            let (connection_id, mut rx) = self.service.registry().register(user_id).await;
            let caller = Caller::connection(user_id, connection_id);
            self.service.connect(&caller, room_id).await.unwrap();
            while rx.try_recv().is_ok() {}
            (caller, rx)
        }
    }

    pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Ok(value) = serde_json::from_str(&frame) {
                out.push(value);
            }
        }
        out
    }

    pub fn types(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| f["type"].as_str().map(str::to_string))
            .collect()
    }
}
