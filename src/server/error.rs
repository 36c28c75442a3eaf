//! HTTP error mapping.
//!
//! One enum, one `IntoResponse` impl mapping each variant to its HTTP
//! status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::bundle::BundleError;
use crate::facade::FacadeError;
use crate::storage::ErrorKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("entry too large: {0}")]
    EntryTooLarge(#[from] BundleError),
    #[error("checkpoint not found")]
    CheckpointNotFound,
    #[error("tile not found")]
    TileNotFound,
    #[error(transparent)]
    Facade(#[from] FacadeError),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::EntryTooLarge(_) => StatusCode::BAD_REQUEST,
            Self::CheckpointNotFound | Self::TileNotFound => StatusCode::NOT_FOUND,
            Self::Facade(e) => match e.kind() {
                ErrorKind::TransientStorage => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::PermanentStorage | ErrorKind::InvariantViolation => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_string();

        // 503 gets a Retry-After so well-behaved clients back off instead
        // of hammering a log that's shedding load.
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [("retry-after", "1")], body).into_response();
        }
        (status, body).into_response()
    }
}
