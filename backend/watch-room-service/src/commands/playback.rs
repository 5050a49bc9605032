use uuid::Uuid;

use super::{Caller, RoomService, ViewerUpdate};
use crate::domain::RoomError;
use crate::error::AppResult;
use crate::hub::events::Event;

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

fn check_ticks(ticks: i64) -> Result<(), RoomError> {
    if ticks < 0 {
        return Err(RoomError::argument("time line must not be negative"));
    }
    Ok(())
}

fn check_speed(speed: f64) -> Result<(), RoomError> {
    if !speed.is_finite() || !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        return Err(RoomError::argument(format!(
            "speed must be within {}..={}",
            MIN_SPEED, MAX_SPEED
        )));
    }
    Ok(())
}

impl RoomService {
    pub async fn set_episode(
        &self,
        caller: &Caller,
        room_id: Uuid,
        season: i32,
        episode: i32,
    ) -> AppResult<()> {
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                if !room.is_serial() {
                    return Err(RoomError::ChangeFilmSeriesNotAllowed);
                }
                if season < 1 || episode < 1 {
                    return Err(RoomError::argument("season and episode start at 1"));
                }
                let viewer = room.viewer_mut(me)?;
                viewer.set_season(Some(season));
                viewer.set_episode(Some(episode));
                Ok(())
            })
            .await?;

        self.broadcast_change(
            caller,
            room_id,
            &update,
            Event::EpisodeEvent {
                viewer_id: caller.user_id,
                season,
                episode,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_time_line(&self, caller: &Caller, room_id: Uuid, ticks: i64) -> AppResult<()> {
        check_ticks(ticks)?;
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_time_line(ticks);
                Ok(())
            })
            .await?;

        self.broadcast_change(
            caller,
            room_id,
            &update,
            Event::TimeLineEvent {
                viewer_id: caller.user_id,
                time_line: ticks,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_pause(
        &self,
        caller: &Caller,
        room_id: Uuid,
        pause: bool,
        ticks: i64,
        buffering: bool,
    ) -> AppResult<()> {
        check_ticks(ticks)?;
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                let viewer = room.viewer_mut(me)?;
                viewer.set_on_pause(pause);
                viewer.set_time_line(ticks);
                Ok(())
            })
            .await?;

        self.broadcast_change(
            caller,
            room_id,
            &update,
            Event::PauseEvent {
                viewer_id: caller.user_id,
                on_pause: pause,
                time_line: ticks,
                buffering,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_speed(&self, caller: &Caller, room_id: Uuid, speed: f64) -> AppResult<()> {
        check_speed(speed)?;
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_speed(speed);
                Ok(())
            })
            .await?;

        self.broadcast_change(
            caller,
            room_id,
            &update,
            Event::SpeedEvent {
                viewer_id: caller.user_id,
                speed,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_full_screen(
        &self,
        caller: &Caller,
        room_id: Uuid,
        full_screen: bool,
    ) -> AppResult<()> {
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_full_screen(full_screen);
                Ok(())
            })
            .await?;

        let event = Event::ChangeEvent {
            viewer_id: caller.user_id,
            patch: update.patch.clone(),
        };
        self.broadcast_change(caller, room_id, &update, event).await;
        Ok(())
    }

    pub async fn set_muted(&self, caller: &Caller, room_id: Uuid, muted: bool) -> AppResult<()> {
        let update = self
            .update_own_viewer(caller, room_id, |room, me| {
                room.viewer_mut(me)?.set_muted(muted);
                Ok(())
            })
            .await?;

        let event = Event::ChangeEvent {
            viewer_id: caller.user_id,
            patch: update.patch.clone(),
        };
        self.broadcast_change(caller, room_id, &update, event).await;
        Ok(())
    }

    /// Tell the rest of the room, only when something actually changed.
    async fn broadcast_change(
        &self,
        caller: &Caller,
        room_id: Uuid,
        update: &ViewerUpdate,
        event: Event,
    ) {
        if !update.changed() {
            tracing::trace!(room_id = %room_id, event = event.name(), "No change to broadcast");
            return;
        }
        self.registry
            .broadcast(room_id, &event, caller.connection_id)
            .await;
    }
}
