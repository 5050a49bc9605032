use std::time::Duration;
use uuid::Uuid;

use super::{Caller, RoomService};
use crate::domain::{Room, RoomAction, RoomError, ViewerSettings, STAT_BEEPS, STAT_SCREAMS};
use crate::error::AppResult;
use crate::hub::events::Event;
use crate::store::SessionStrategy;

/// Directed nudge from one viewer to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nudge {
    Beep,
    Scream,
}

impl Nudge {
    fn action(self) -> RoomAction {
        match self {
            Nudge::Beep => RoomAction::Beep,
            Nudge::Scream => RoomAction::Scream,
        }
    }

    fn allowed_by(self, settings: ViewerSettings) -> bool {
        match self {
            Nudge::Beep => settings.allow_beep,
            Nudge::Scream => settings.allow_scream,
        }
    }

    fn statistic(self) -> &'static str {
        match self {
            Nudge::Beep => STAT_BEEPS,
            Nudge::Scream => STAT_SCREAMS,
        }
    }

    fn event(self, initiator: Uuid, target: Uuid) -> Event {
        match self {
            Nudge::Beep => Event::BeepNotificationEvent { initiator, target },
            Nudge::Scream => Event::ScreamNotificationEvent { initiator, target },
        }
    }
}

/// Target online with the capability enabled, caller with the mirrored one, no self-nudge.
fn check_nudge(room: &Room, nudge: Nudge, initiator: Uuid, target: Uuid) -> Result<(), RoomError> {
    let sender = room.viewer(initiator).ok_or(RoomError::ViewerNotFound)?;
    let receiver = room.viewer(target).ok_or(RoomError::ViewerNotFound)?;

    let allowed = initiator != target
        && receiver.online()
        && nudge.allowed_by(receiver.settings())
        && nudge.allowed_by(sender.settings());
    if !allowed {
        return Err(RoomError::ActionNotAllowed(nudge.action()));
    }
    Ok(())
}

impl RoomService {
    pub async fn beep(&self, caller: &Caller, room_id: Uuid, target: Uuid) -> AppResult<()> {
        self.nudge(caller, room_id, target, Nudge::Beep, self.settings.beep_cooldown)
            .await
    }

    pub async fn scream(&self, caller: &Caller, room_id: Uuid, target: Uuid) -> AppResult<()> {
        self.nudge(caller, room_id, target, Nudge::Scream, self.settings.scream_cooldown)
            .await
    }

    async fn nudge(
        &self,
        caller: &Caller,
        room_id: Uuid,
        target: Uuid,
        nudge: Nudge,
        cooldown: Duration,
    ) -> AppResult<()> {
        let patch = {
            let _guard = self.locks.lock(room_id).await;
            let mut session = self.store.begin(SessionStrategy::Transaction).await?;
            let mut room = session
                .load_room(room_id)
                .await?
                .ok_or(RoomError::RoomNotFound)?;

            check_nudge(&room, nudge, caller.user_id, target)?;
            self.cooldowns
                .try_acquire(caller.user_id, nudge.action(), cooldown)?;

            let sender = room.viewer_mut(caller.user_id)?;
            sender.increment_statistic(nudge.statistic());
            let patch = sender.take_patch();
            session.save_room(&room).await?;
            session.commit().await?;
            patch
        };

        self.registry
            .broadcast(room_id, &nudge.event(caller.user_id, target), None)
            .await;
        self.registry
            .broadcast(
                room_id,
                &Event::ChangeEvent {
                    viewer_id: caller.user_id,
                    patch,
                },
                None,
            )
            .await;

        tracing::debug!(
            room_id = %room_id,
            initiator_id = %caller.user_id,
            target_id = %target,
            action = %nudge.action(),
            "Nudge delivered"
        );
        Ok(())
    }
}
