pub mod janitor;
pub mod outbox_worker;

pub use janitor::{Janitor, SWEEP_INTERVAL};
pub use outbox_worker::{build_publisher, spawn_outbox_processor};
