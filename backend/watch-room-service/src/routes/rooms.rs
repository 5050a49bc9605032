use actix_web::{delete, get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Header set by the gateway after authentication.
pub const USER_ID_HEADER: &str = "X-User-Id";

fn caller_id(req: &HttpRequest) -> AppResult<Uuid> {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(AppError::Unauthorized)
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub film_id: Uuid,
    #[serde(default)]
    pub is_serial: bool,
    #[serde(default = "default_open")]
    pub is_open: bool,
}

fn default_open() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinRoomRequest {
    pub code: Option<String>,
}

#[post("/api/v1/rooms")]
pub async fn create_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateRoomRequest>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    let snapshot = state
        .rooms()
        .create_room(user_id, body.film_id, body.is_serial, body.is_open)
        .await?;
    Ok(HttpResponse::Created().json(snapshot))
}

#[get("/api/v1/rooms")]
pub async fn list_rooms(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    let rooms = state.rooms().list_rooms(user_id).await?;
    Ok(HttpResponse::Ok().json(rooms))
}

#[get("/api/v1/rooms/{room_id}")]
pub async fn get_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    let snapshot = state.rooms().room_snapshot(user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

#[post("/api/v1/rooms/{room_id}/join")]
pub async fn join_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<JoinRoomRequest>>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    let body = body.map(|b| b.into_inner()).unwrap_or_default();
    let snapshot = state
        .rooms()
        .join_room(user_id, path.into_inner(), body.code.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

#[post("/api/v1/rooms/{room_id}/leave")]
pub async fn leave_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    state.rooms().leave_room(user_id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/api/v1/rooms/{room_id}")]
pub async fn delete_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    state.rooms().delete_room(user_id, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
