//! End-to-end hub flows against the in-memory store.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;
use watch_room_service::commands::{CommandSettings, RoomService};
use watch_room_service::domain::TICKS_PER_SECOND;
use watch_room_service::hub::{ConnectionContext, ConnectionRegistry, Hub, HubRequest};
use watch_room_service::store::MemoryStore;

struct Client {
    context: ConnectionContext,
    rx: UnboundedReceiver<String>,
}

impl Client {
    /// Frames received since the last call.
    fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn types(&mut self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

fn hub() -> (Hub, MemoryStore) {
    let store = MemoryStore::default();
    let service = RoomService::new(
        Arc::new(store.clone()),
        ConnectionRegistry::new(),
        CommandSettings::default(),
    );
    (Hub::new(service), store)
}

async fn client(hub: &Hub, user_id: Uuid) -> Client {
    let (connection_id, rx) = hub.registry().register(user_id).await;
    Client {
        context: ConnectionContext::new(connection_id, user_id),
        rx,
    }
}

async fn call(hub: &Hub, client: &Client, request: HubRequest) -> bool {
    hub.invoke(client.context, request).await.is_ok()
}

#[tokio::test]
async fn test_calls_before_connect_report_room_not_found() {
    let (hub, _) = hub();
    let mut alice = client(&hub, Uuid::new_v4()).await;

    assert!(!call(&hub, &alice, HubRequest::Sync).await);

    let frames = alice.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "ErrorNotificationEvent");
    assert_eq!(frames[0]["message"], "Room not found");
}

#[tokio::test]
async fn test_playback_is_relayed_to_other_viewers() {
    let (hub, _) = hub();
    let (owner_id, guest_id) = (Uuid::new_v4(), Uuid::new_v4());
    let room = hub
        .service()
        .create_room(owner_id, Uuid::new_v4(), false, true)
        .await
        .unwrap();
    hub.service().join_room(guest_id, room.id, None).await.unwrap();

    let mut owner = client(&hub, owner_id).await;
    let mut guest = client(&hub, guest_id).await;
    assert!(call(&hub, &owner, HubRequest::Connect { room_id: room.id }).await);
    assert_eq!(owner.types(), vec!["RoomEvent", "SyncEvent"]);
    assert!(call(&hub, &guest, HubRequest::Connect { room_id: room.id }).await);
    guest.frames();
    assert_eq!(owner.types(), vec!["ChangeEvent"]);

    let ticks = 90 * TICKS_PER_SECOND;
    assert!(
        call(
            &hub,
            &owner,
            HubRequest::SetPause {
                pause: true,
                ticks,
                buffering: false
            }
        )
        .await
    );

    let frames = guest.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "PauseEvent");
    assert_eq!(frames[0]["viewer_id"], owner_id.to_string());
    assert_eq!(frames[0]["time_line"], ticks);
    assert!(owner.frames().is_empty());

    // Guest syncs to the owner while the owner is online.
    assert!(call(&hub, &guest, HubRequest::Sync).await);
    let frames = guest.frames();
    assert_eq!(frames[0]["type"], "SyncEvent");
    assert_eq!(frames[0]["sync"]["source_id"], owner_id.to_string());
    assert_eq!(frames[0]["sync"]["on_pause"], true);
}

#[tokio::test]
async fn test_beep_cooldown_reaches_the_caller_as_error_event() {
    let (hub, _) = hub();
    let (owner_id, guest_id) = (Uuid::new_v4(), Uuid::new_v4());
    let room = hub
        .service()
        .create_room(owner_id, Uuid::new_v4(), false, true)
        .await
        .unwrap();
    hub.service().join_room(guest_id, room.id, None).await.unwrap();

    let mut owner = client(&hub, owner_id).await;
    let mut guest = client(&hub, guest_id).await;
    call(&hub, &owner, HubRequest::Connect { room_id: room.id }).await;
    call(&hub, &guest, HubRequest::Connect { room_id: room.id }).await;
    owner.frames();
    guest.frames();

    assert!(call(&hub, &guest, HubRequest::Beep { target: owner_id }).await);
    assert!(owner.types().contains(&"BeepNotificationEvent".to_string()));
    guest.frames();

    assert!(!call(&hub, &guest, HubRequest::Beep { target: owner_id }).await);
    let frames = guest.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "ErrorNotificationEvent");
    let message = frames[0]["message"].as_str().unwrap();
    assert!(message.starts_with("Please wait"), "{message}");
    assert!(owner.frames().is_empty());
}

#[tokio::test]
async fn test_chat_round_trip() {
    let (hub, _) = hub();
    let (owner_id, guest_id) = (Uuid::new_v4(), Uuid::new_v4());
    let room = hub
        .service()
        .create_room(owner_id, Uuid::new_v4(), false, true)
        .await
        .unwrap();
    hub.service().join_room(guest_id, room.id, None).await.unwrap();

    let mut owner = client(&hub, owner_id).await;
    let mut guest = client(&hub, guest_id).await;
    call(&hub, &owner, HubRequest::Connect { room_id: room.id }).await;
    call(&hub, &guest, HubRequest::Connect { room_id: room.id }).await;
    owner.frames();
    guest.frames();

    for text in ["first", "second"] {
        assert!(
            call(
                &hub,
                &guest,
                HubRequest::SendMessage {
                    text: text.to_string()
                }
            )
            .await
        );
    }
    assert_eq!(
        owner.types(),
        vec!["MessageEvent", "ChangeEvent", "MessageEvent", "ChangeEvent"]
    );
    guest.frames();

    assert!(
        call(
            &hub,
            &owner,
            HubRequest::GetMessages {
                from_id: None,
                count: 10
            }
        )
        .await
    );
    let frames = owner.frames();
    assert_eq!(frames[0]["type"], "MessagesEvent");
    assert_eq!(frames[0]["messages"].as_array().unwrap().len(), 2);

    assert!(
        !call(
            &hub,
            &owner,
            HubRequest::SendMessage {
                text: "   ".to_string()
            }
        )
        .await
    );
    assert_eq!(owner.frames()[0]["message"], "Invalid request");
}

#[tokio::test]
async fn test_disconnect_marks_viewer_offline_for_others() {
    let (hub, _) = hub();
    let (owner_id, guest_id) = (Uuid::new_v4(), Uuid::new_v4());
    let room = hub
        .service()
        .create_room(owner_id, Uuid::new_v4(), false, true)
        .await
        .unwrap();
    hub.service().join_room(guest_id, room.id, None).await.unwrap();

    let mut owner = client(&hub, owner_id).await;
    let guest = client(&hub, guest_id).await;
    call(&hub, &owner, HubRequest::Connect { room_id: room.id }).await;
    call(&hub, &guest, HubRequest::Connect { room_id: room.id }).await;
    owner.frames();

    assert!(call(&hub, &guest, HubRequest::Disconnect).await);

    let frames = owner.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "ChangeEvent");
    assert_eq!(frames[0]["viewer_id"], guest_id.to_string());
    assert_eq!(frames[0]["patch"]["online"], false);
    assert_eq!(hub.registry().subscriber_count(room.id).await, 1);
}

#[tokio::test]
async fn test_deleted_room_stops_accepting_commands() {
    let (hub, store) = hub();
    let (owner_id, guest_id) = (Uuid::new_v4(), Uuid::new_v4());
    let room = hub
        .service()
        .create_room(owner_id, Uuid::new_v4(), false, true)
        .await
        .unwrap();
    hub.service().join_room(guest_id, room.id, None).await.unwrap();

    let mut guest = client(&hub, guest_id).await;
    call(&hub, &guest, HubRequest::Connect { room_id: room.id }).await;
    guest.frames();

    tokio_test::assert_err!(hub.service().delete_room(guest_id, room.id).await);
    tokio_test::assert_ok!(hub.service().delete_room(owner_id, room.id).await);
    assert_eq!(guest.types(), vec!["DeleteNotificationEvent"]);
    assert_eq!(store.room_count().await, 0);

    // The connection was detached along with the room.
    assert!(!call(&hub, &guest, HubRequest::Sync).await);
    assert_eq!(guest.frames()[0]["message"], "Room not found");
}
