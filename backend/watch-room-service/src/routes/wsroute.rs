use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use uuid::Uuid;

use crate::domain::RoomError;
use crate::hub::{ConnectionContext, ConnectionId, Event, Hub, HubRequest};
use crate::metrics::HUB_CONNECTIONS_ACTIVE;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Uuid,
}

// Frame produced by the hub for this connection.
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Outbound(String);

struct WsSession {
    context: ConnectionContext,
    outbound: Option<UnboundedReceiver<String>>,
    // Calls are handed to a single worker so they run in arrival order.
    calls: UnboundedSender<HubRequest>,
    hb: Instant,
}

impl WsSession {
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    connection_id = %act.context.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let event = Event::ErrorNotificationEvent {
            message: RoomError::argument("").user_message(),
        };
        if let Ok(frame) = serde_json::to_string(&event) {
            ctx.text(frame);
        }
    }
}

/// Drain calls of one connection sequentially through the hub.
fn spawn_call_worker(hub: Hub, context: ConnectionContext) -> UnboundedSender<HubRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<HubRequest>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let done = request == HubRequest::Disconnect;
            // Failures were already reported to the client and logged by the hub.
            let _ = hub.invoke(context, request).await;
            if done {
                break;
            }
        }
    });
    tx
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.context.connection_id,
            user_id = %self.context.user_id,
            "WebSocket session started"
        );
        HUB_CONNECTIONS_ACTIVE.inc();
        self.hb(ctx);

        if let Some(rx) = self.outbound.take() {
            ctx.add_message_stream(UnboundedReceiverStream::new(rx).map(Outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.context.connection_id,
            user_id = %self.context.user_id,
            "WebSocket session stopped"
        );
        HUB_CONNECTIONS_ACTIVE.dec();

        if self.calls.send(HubRequest::Disconnect).is_err() {
            tracing::warn!(
                connection_id = %self.context.connection_id,
                "Call worker gone before disconnect"
            );
        }
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<HubRequest>(&text) {
                Ok(request) => {
                    if self.calls.send(request).is_err() {
                        ctx.stop();
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %self.context.connection_id,
                        error = %e,
                        "Failed to parse WS message"
                    );
                    self.reject(ctx);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
                self.reject(ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(reason = ?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let user_id = query.user_id;
    let (connection_id, outbound): (ConnectionId, _) = state.registry().register(user_id).await;
    let context = ConnectionContext::new(connection_id, user_id);

    let session = WsSession {
        context,
        outbound: Some(outbound),
        calls: spawn_call_worker(state.hub.clone(), context),
        hb: Instant::now(),
    };

    ws::start(session, &req, stream).map_err(|e| {
        let registry = state.registry().clone();
        tokio::spawn(async move {
            registry.unregister(connection_id).await;
        });
        e
    })
}
