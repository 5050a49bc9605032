use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::domain::RoomError;
use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

/// Message shown to clients for anything outside the room taxonomy.
pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again later";

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl AppError {
    /// Short, client-safe text. Internal details never leave the process.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Room(e) => e.user_message(),
            AppError::BadRequest(_) => RoomError::argument("").user_message(),
            AppError::Unauthorized => "Unauthorized".to_string(),
            _ => GENERIC_ERROR_MESSAGE.to_string(),
        }
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Room(_) => "room",
            AppError::Store(_) => "store",
            AppError::Config(_) => "config",
            AppError::StartServer(_) => "start_server",
            AppError::Transport(_) => "transport",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Room(e) => e.status_code(),
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Store(StoreError::AlreadyConsumed(_)) => 409,
            _ => 500,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(ResponseError::status_code(self)).json(ErrorBody {
            error: self.kind(),
            message: self.user_message(),
        })
    }
}
