use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use watch_room_service::commands::{CommandSettings, RoomService};
use watch_room_service::config::Config;
use watch_room_service::hub::{ConnectionRegistry, Hub};
use watch_room_service::routes::{self, rooms::USER_ID_HEADER};
use watch_room_service::state::AppState;
use watch_room_service::store::MemoryStore;

fn state() -> AppState {
    let service = RoomService::new(
        Arc::new(MemoryStore::default()),
        ConnectionRegistry::new(),
        CommandSettings::default(),
    );
    AppState::new(Hub::new(service), Arc::new(Config::default()))
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn test_missing_user_header_is_unauthorized() {
    let state = state();
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/rooms").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_closed_room_lifecycle() {
    let state = state();
    let app = app!(state);
    let (owner, guest) = (Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/api/v1/rooms")
        .insert_header((USER_ID_HEADER, owner.to_string()))
        .set_json(json!({"film_id": Uuid::new_v4(), "is_open": false}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let room: Value = test::read_body_json(resp).await;
    let room_id = room["id"].as_str().unwrap().to_string();
    let code = room["code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 5);

    let join_uri = format!("/api/v1/rooms/{room_id}/join");
    let req = test::TestRequest::post()
        .uri(&join_uri)
        .insert_header((USER_ID_HEADER, guest.to_string()))
        .set_json(json!({"code": "WRONG-CODE"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_client_error());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Invalid room code");

    let req = test::TestRequest::post()
        .uri(&join_uri)
        .insert_header((USER_ID_HEADER, guest.to_string()))
        .set_json(json!({"code": code.to_lowercase()}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let joined: Value = test::read_body_json(resp).await;
    assert_eq!(joined["viewers"].as_array().unwrap().len(), 2);
    assert!(joined.get("code").is_none());

    let req = test::TestRequest::get()
        .uri("/api/v1/rooms")
        .insert_header((USER_ID_HEADER, guest.to_string()))
        .to_request();
    let rooms: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(rooms.as_array().unwrap().len(), 1);

    let room_uri = format!("/api/v1/rooms/{room_id}");
    let req = test::TestRequest::delete()
        .uri(&room_uri)
        .insert_header((USER_ID_HEADER, guest.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/rooms/{room_id}/leave"))
        .insert_header((USER_ID_HEADER, guest.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::delete()
        .uri(&room_uri)
        .insert_header((USER_ID_HEADER, owner.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get()
        .uri(&room_uri)
        .insert_header((USER_ID_HEADER, owner.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn test_outsiders_cannot_read_a_room() {
    let state = state();
    let app = app!(state);
    let owner = Uuid::new_v4();

    let room = state
        .rooms()
        .create_room(owner, Uuid::new_v4(), false, true)
        .await
        .unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/rooms/{}", room.id))
        .insert_header((USER_ID_HEADER, Uuid::new_v4().to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Room not found");
}

#[actix_web::test]
async fn test_health_and_metrics() {
    let state = state();
    let app = app!(state);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}
