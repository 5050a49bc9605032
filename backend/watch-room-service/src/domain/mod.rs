pub mod errors;
pub mod filter;
pub mod message;
pub mod room;
pub mod viewer;

pub use errors::{RoomAction, RoomError};
pub use filter::{RoomFilter, RoomPredicate};
pub use message::{validate_page_size, Message};
pub use room::{Room, RoomRecord, SyncData, MAX_VIEWERS};
pub use viewer::{
    Viewer, ViewerField, ViewerPatch, ViewerRecord, ViewerSettings, STAT_BEEPS, STAT_MESSAGES,
    STAT_SCREAMS, TICKS_PER_SECOND,
};
