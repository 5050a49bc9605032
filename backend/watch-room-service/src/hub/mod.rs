//! Realtime hub: inbound method calls, the filter chain around them and the
//! dispatch onto room commands.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::commands::{Caller, RoomService};
use crate::domain::RoomError;
use crate::error::{AppError, AppResult};

pub mod context;
pub mod events;
pub mod filters;
pub mod registry;

pub use context::ConnectionContext;
pub use events::{Event, RoomSnapshot};
pub use filters::{HubEndpoint, HubFilter, Next};
pub use registry::{ConnectionId, ConnectionRegistry};

/// Inbound frame: `{"method": "SetPause", "args": {"pause": true, ...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum HubRequest {
    Connect {
        room_id: Uuid,
    },
    GetRoom,
    GetMessages {
        #[serde(default)]
        from_id: Option<Uuid>,
        count: u32,
    },
    SetEpisode {
        season: i32,
        episode: i32,
    },
    SendMessage {
        text: String,
    },
    SetTimeLine {
        ticks: i64,
    },
    SetPause {
        pause: bool,
        ticks: i64,
        #[serde(default)]
        buffering: bool,
    },
    SetFullScreen {
        full_screen: bool,
    },
    SetSpeed {
        speed: f64,
    },
    SetMuted {
        muted: bool,
    },
    Beep {
        target: Uuid,
    },
    Scream {
        target: Uuid,
    },
    Kick {
        target: Uuid,
    },
    Type,
    Sync,
    /// Raised by the transport when the connection closes.
    #[serde(skip_deserializing)]
    Disconnect,
}

impl HubRequest {
    pub fn method(&self) -> &'static str {
        match self {
            HubRequest::Connect { .. } => "Connect",
            HubRequest::GetRoom => "GetRoom",
            HubRequest::GetMessages { .. } => "GetMessages",
            HubRequest::SetEpisode { .. } => "SetEpisode",
            HubRequest::SendMessage { .. } => "SendMessage",
            HubRequest::SetTimeLine { .. } => "SetTimeLine",
            HubRequest::SetPause { .. } => "SetPause",
            HubRequest::SetFullScreen { .. } => "SetFullScreen",
            HubRequest::SetSpeed { .. } => "SetSpeed",
            HubRequest::SetMuted { .. } => "SetMuted",
            HubRequest::Beep { .. } => "Beep",
            HubRequest::Scream { .. } => "Scream",
            HubRequest::Kick { .. } => "Kick",
            HubRequest::Type => "Type",
            HubRequest::Sync => "Sync",
            HubRequest::Disconnect => "Disconnect",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubCall {
    pub context: ConnectionContext,
    pub request: HubRequest,
}

/// Resolves the caller from the bound context and routes to the command.
struct RoomEndpoint {
    service: RoomService,
}

impl RoomEndpoint {
    async fn bound_room(&self, connection_id: ConnectionId) -> AppResult<Uuid> {
        self.service
            .registry()
            .room_of(connection_id)
            .await
            .ok_or_else(|| RoomError::RoomNotFound.into())
    }
}

#[async_trait]
impl HubEndpoint for RoomEndpoint {
    async fn dispatch(&self, call: &HubCall) -> AppResult<()> {
        let ctx = ConnectionContext::current()
            .ok_or_else(|| AppError::Internal("hub call without connection context".into()))?;
        let caller = Caller::connection(ctx.user_id, ctx.connection_id);
        let service = &self.service;

        match &call.request {
            HubRequest::Connect { room_id } => service.connect(&caller, *room_id).await,
            HubRequest::Disconnect => service.disconnect(ctx.connection_id).await.map(|_| ()),
            request => {
                let room_id = self.bound_room(ctx.connection_id).await?;
                match request {
                    HubRequest::GetRoom => service.get_room(&caller, room_id).await,
                    HubRequest::GetMessages { from_id, count } => service
                        .get_messages(&caller, room_id, *from_id, *count)
                        .await
                        .map(|_| ()),
                    HubRequest::SetEpisode { season, episode } => {
                        service.set_episode(&caller, room_id, *season, *episode).await
                    }
                    HubRequest::SendMessage { text } => service
                        .send_message(&caller, room_id, text)
                        .await
                        .map(|_| ()),
                    HubRequest::SetTimeLine { ticks } => {
                        service.set_time_line(&caller, room_id, *ticks).await
                    }
                    HubRequest::SetPause {
                        pause,
                        ticks,
                        buffering,
                    } => {
                        service
                            .set_pause(&caller, room_id, *pause, *ticks, *buffering)
                            .await
                    }
                    HubRequest::SetFullScreen { full_screen } => {
                        service.set_full_screen(&caller, room_id, *full_screen).await
                    }
                    HubRequest::SetSpeed { speed } => {
                        service.set_speed(&caller, room_id, *speed).await
                    }
                    HubRequest::SetMuted { muted } => {
                        service.set_muted(&caller, room_id, *muted).await
                    }
                    HubRequest::Beep { target } => service.beep(&caller, room_id, *target).await,
                    HubRequest::Scream { target } => {
                        service.scream(&caller, room_id, *target).await
                    }
                    HubRequest::Kick { target } => service.kick(&caller, room_id, *target).await,
                    HubRequest::Type => service.typing(&caller, room_id).await,
                    HubRequest::Sync => service.sync(&caller, room_id).await,
                    HubRequest::Connect { .. } | HubRequest::Disconnect => Ok(()),
                }
            }
        }
    }
}

/// Entry point for transports.
#[derive(Clone)]
pub struct Hub {
    filters: Arc<Vec<Arc<dyn HubFilter>>>,
    endpoint: Arc<RoomEndpoint>,
    service: RoomService,
}

impl Hub {
    pub fn new(service: RoomService) -> Self {
        let filters = filters::default_filters(service.registry().clone());
        Self::with_filters(service, filters)
    }

    pub fn with_filters(service: RoomService, filters: Vec<Arc<dyn HubFilter>>) -> Self {
        Self {
            filters: Arc::new(filters),
            endpoint: Arc::new(RoomEndpoint {
                service: service.clone(),
            }),
            service,
        }
    }

    pub fn service(&self) -> &RoomService {
        &self.service
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.service.registry()
    }

    /// Run one call through the chain. The caller already got its error
    /// event; the failure is logged here for operators.
    pub async fn invoke(&self, context: ConnectionContext, request: HubRequest) -> AppResult<()> {
        let call = HubCall { context, request };
        let result = Next::new(&self.filters, self.endpoint.as_ref())
            .run(&call)
            .await;

        if let Err(e) = &result {
            tracing::error!(
                connection_id = %call.context.connection_id,
                user_id = %call.context.user_id,
                method = call.request.method(),
                kind = e.kind(),
                error = %e,
                "Hub call failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_decoding() {
        let request: HubRequest = serde_json::from_value(json!({
            "method": "SetPause",
            "args": {"pause": true, "ticks": 10_000_000}
        }))
        .unwrap();
        assert_eq!(
            request,
            HubRequest::SetPause {
                pause: true,
                ticks: 10_000_000,
                buffering: false
            }
        );

        let request: HubRequest = serde_json::from_value(json!({"method": "Sync"})).unwrap();
        assert_eq!(request.method(), "Sync");

        let request: HubRequest = serde_json::from_value(json!({
            "method": "GetMessages",
            "args": {"count": 20}
        }))
        .unwrap();
        assert_eq!(
            request,
            HubRequest::GetMessages {
                from_id: None,
                count: 20
            }
        );
    }

    #[test]
    fn test_disconnect_cannot_be_sent_by_clients() {
        let result = serde_json::from_value::<HubRequest>(json!({"method": "Disconnect"}));
        assert!(result.is_err());
        let result = serde_json::from_value::<HubRequest>(json!({"method": "DropTables"}));
        assert!(result.is_err());
    }
}
