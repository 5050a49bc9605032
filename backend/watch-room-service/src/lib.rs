pub mod commands;
pub mod config;
pub mod consumers;
pub mod domain;
pub mod error;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod store;
pub mod workers;
