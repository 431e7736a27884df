use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Serialization(_) => (StatusCode::BAD_REQUEST, "Invalid data".to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO error".to_string()),
            AppError::Storage(_) | AppError::Catalog(_) | AppError::Fatal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };

        (status, message).into_response()
    }
}

/// Conditions that stop the broadcast from making forward progress.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("no working proxies remain after refreshing the pool")]
    ProxyPoolExhausted,
}

/// Failures scoped to a single track. The gatherer skips the track and moves on.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("track {0} could not be resolved")]
    UnknownTrack(String),

    #[error("track {0} has no downloadable source url")]
    NoSourceUrl(String),

    #[error("download failed after {attempts} attempts: {last_error}")]
    DownloadExhausted { attempts: u32, last_error: String },

    #[error("announcement unavailable: {0}")]
    Announcement(String),

    #[error("could not join audio: {0}")]
    Join(String),

    #[error("lookup failed: {0}")]
    Lookup(#[from] AppError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum GatherError {
    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}
