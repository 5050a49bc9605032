use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::domain::{RoomAction, RoomError};

/// Per-(viewer, action) cooldowns, local to this instance.
#[derive(Default)]
pub struct CooldownTracker {
    last_used: DashMap<(Uuid, RoomAction), Instant>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the cooldown, or fail with the whole seconds still remaining.
    pub fn try_acquire(
        &self,
        viewer_id: Uuid,
        action: RoomAction,
        cooldown: Duration,
    ) -> Result<(), RoomError> {
        self.try_acquire_at(viewer_id, action, cooldown, Instant::now())
    }

    fn try_acquire_at(
        &self,
        viewer_id: Uuid,
        action: RoomAction,
        cooldown: Duration,
        now: Instant,
    ) -> Result<(), RoomError> {
        match self.last_used.entry((viewer_id, action)) {
            Entry::Occupied(mut entry) => {
                let elapsed = now.saturating_duration_since(*entry.get());
                if elapsed < cooldown {
                    let remaining = cooldown - elapsed;
                    let seconds_remaining =
                        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                    return Err(RoomError::ActionCooldown {
                        action,
                        seconds_remaining,
                    });
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        Ok(())
    }

    /// Drop entries whose cooldown has long passed.
    pub fn prune(&self, older_than: Duration) {
        let now = Instant::now();
        self.last_used
            .retain(|_, at| now.saturating_duration_since(*at) < older_than);
    }
}
