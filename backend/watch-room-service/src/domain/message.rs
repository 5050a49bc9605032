use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::RoomError;

pub const MAX_MESSAGE_LEN: usize = 1000;
pub const MAX_PAGE_SIZE: usize = 100;

/// Chat line, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(room_id: Uuid, user_id: Uuid, text: &str) -> Result<Self, RoomError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::argument("message is empty"));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(RoomError::argument("message too long"));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            text: text.to_string(),
            sent_at: Utc::now(),
        })
    }

    /// Page ordering key: newest first.
    pub fn cursor_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.sent_at, self.id)
    }
}

pub fn validate_page_size(count: u32) -> Result<usize, RoomError> {
    let count = count as usize;
    if count == 0 || count > MAX_PAGE_SIZE {
        return Err(RoomError::argument(format!(
            "count must be within 1..={}",
            MAX_PAGE_SIZE
        )));
    }
    Ok(count)
}
