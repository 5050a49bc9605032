use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Actions that can be refused by room rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RoomAction {
    Join,
    Leave,
    Kick,
    Delete,
    Beep,
    Scream,
}

impl RoomAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomAction::Join => "Join",
            RoomAction::Leave => "Leave",
            RoomAction::Kick => "Kick",
            RoomAction::Delete => "Delete",
            RoomAction::Beep => "Beep",
            RoomAction::Scream => "Scream",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            RoomAction::Join => "join this room",
            RoomAction::Leave => "leave this room",
            RoomAction::Kick => "kick this viewer",
            RoomAction::Delete => "delete this room",
            RoomAction::Beep => "beep this viewer",
            RoomAction::Scream => "scream at this viewer",
        }
    }
}

impl fmt::Display for RoomAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain failures. Every variant has a user-safe message, see
/// [`RoomError::user_message`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,

    #[error("viewer not found")]
    ViewerNotFound,

    #[error("action not allowed: {0}")]
    ActionNotAllowed(RoomAction),

    #[error("{action} on cooldown, {seconds_remaining}s remaining")]
    ActionCooldown {
        action: RoomAction,
        seconds_remaining: u64,
    },

    #[error("film of a non-serial room has no episodes")]
    ChangeFilmSeriesNotAllowed,

    #[error("invalid access code")]
    InvalidCode,

    #[error("user is banned from this room")]
    UserBanned,

    #[error("room is full")]
    RoomFull,

    #[error("viewer already joined")]
    AlreadyJoined,

    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),
}

impl RoomError {
    pub fn argument(msg: impl Into<String>) -> Self {
        RoomError::ArgumentInvalid(msg.into())
    }

    pub fn user_message(&self) -> String {
        match self {
            RoomError::RoomNotFound => "Room not found".to_string(),
            RoomError::ViewerNotFound => "Viewer not found".to_string(),
            RoomError::ActionNotAllowed(action) => {
                format!("You are not allowed to {}", action.verb())
            }
            RoomError::ActionCooldown {
                seconds_remaining, ..
            } => format!(
                "Please wait {} {} before doing this again",
                seconds_remaining,
                if *seconds_remaining == 1 {
                    "second"
                } else {
                    "seconds"
                }
            ),
            RoomError::ChangeFilmSeriesNotAllowed => {
                "Episodes can only be changed for series".to_string()
            }
            RoomError::InvalidCode => "Invalid room code".to_string(),
            RoomError::UserBanned => "You have been banned from this room".to_string(),
            RoomError::RoomFull => "The room is full".to_string(),
            RoomError::AlreadyJoined => "You have already joined this room".to_string(),
            RoomError::ArgumentInvalid(_) => "Invalid request".to_string(),
        }
    }

    /// HTTP status for the REST surface.
    pub fn status_code(&self) -> u16 {
        match self {
            RoomError::RoomNotFound | RoomError::ViewerNotFound => 404,
            RoomError::ActionNotAllowed(_) | RoomError::UserBanned | RoomError::InvalidCode => 403,
            RoomError::ActionCooldown { .. } => 429,
            RoomError::RoomFull | RoomError::AlreadyJoined => 409,
            RoomError::ChangeFilmSeriesNotAllowed | RoomError::ArgumentInvalid(_) => 400,
        }
    }
}
