use crate::types::SessionState;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no session for call {0}")]
    SessionNotFound(String),
    #[error("session cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("voice model error: {0}")]
    VoiceModel(&'static str),
    #[error("telephony error: {0}")]
    Telephony(&'static str),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Dispatch(DispatchError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            AppError::Dispatch(DispatchError::BookingNotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store call timed out")]
    Timeout,
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatch request: {0}")]
    InvalidRequest(String),
    #[error("booking {0} not found")]
    BookingNotFound(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("gateway rejected request with status {0}")]
    Rejected(u16),
}

/// Failures of a single tool-call attempt.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Unknown function: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<reqwest::Error> for ToolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ToolError::Timeout
        } else if e.is_connect() {
            ToolError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            ToolError::Status {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            ToolError::Request(e.to_string())
        }
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
