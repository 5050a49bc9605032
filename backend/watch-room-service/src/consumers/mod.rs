pub mod identity_events;

pub use identity_events::IdentityEventConsumer;
