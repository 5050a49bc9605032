use std::sync::Arc;

use crate::commands::RoomService;
use crate::config::Config;
use crate::hub::{ConnectionRegistry, Hub};

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: Hub, config: Arc<Config>) -> Self {
        Self { hub, config }
    }

    pub fn rooms(&self) -> &RoomService {
        self.hub.service()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.hub.registry()
    }
}
