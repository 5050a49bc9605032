//! Facts consumed from identity-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type of identity-service facts (`<prefix>.identity.events`).
pub const AGGREGATE_TYPE: &str = "identity";

pub const USER_INFO_CHANGED: &str = "identity.user.info_changed";
pub const USER_SETTINGS_CHANGED: &str = "identity.user.settings_changed";

/// Public profile fields were edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfoChangedEvent {
    pub user_id: Uuid,
    pub user_name: String,
    pub photo_key: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Notification preferences were edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettingsChangedEvent {
    pub user_id: Uuid,
    pub allow_beep: bool,
    pub allow_scream: bool,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdentityEvent {
    UserInfoChanged(UserInfoChangedEvent),
    UserSettingsChanged(UserSettingsChangedEvent),
}

impl IdentityEvent {
    /// Decode a payload given its `event_type` header. Unknown types yield `Ok(None)`.
    pub fn decode(event_type: &str, data: serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        match event_type {
            USER_INFO_CHANGED | "UserInfoChanged" => {
                Ok(Some(IdentityEvent::UserInfoChanged(serde_json::from_value(data)?)))
            }
            USER_SETTINGS_CHANGED | "UserSettingsChanged" => Ok(Some(
                IdentityEvent::UserSettingsChanged(serde_json::from_value(data)?),
            )),
            _ => Ok(None),
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            IdentityEvent::UserInfoChanged(e) => e.user_id,
            IdentityEvent::UserSettingsChanged(e) => e.user_id,
        }
    }
}
