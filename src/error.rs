//! Error taxonomy shared by the codec, store, registry and join layers.
//!
//! Storage drivers are wrapped once at the store boundary; the driver error is
//! logged there and never reaches API clients. The HTTP mapping lives in the
//! `IntoResponse` impl at the bottom of this file.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("latitude {0} is outside [-90, 90]")]
    InvalidLatitude(f64),

    #[error("longitude {0} is outside [-180, 180]")]
    InvalidLongitude(f64),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures turning bytes into a canonical reading.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload carries no sensor identifier")]
    MissingSensorId,

    #[error("watermark {index} has negative depth {depth}")]
    NegativeDepth { index: usize, depth: i32 },
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    /// Taxonomy name reported in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::BadRequest(_) => "BadRequest",
            Error::InvalidLatitude(_) => "InvalidLatitude",
            Error::InvalidLongitude(_) => "InvalidLongitude",
            Error::Conflict(_) => "Conflict",
            Error::StorageUnavailable => "StorageUnavailable",
            Error::Cancelled => "Cancelled",
            Error::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) | Error::InvalidLatitude(_) | Error::InvalidLongitude(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Conflict(_) => StatusCode::CONFLICT,
            // Client closed request; no standard constant exists.
            Error::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::StorageUnavailable | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error envelope returned by every endpoint.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    error: &'static str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // ---
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let body = ErrorBody {
            code: status.as_u16(),
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_status_mapping() {
        // ---
        assert_eq!(Error::not_found("sensor x").status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::InvalidLatitude(95.0).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::InvalidLongitude(181.0).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Conflict("sensor s1".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::Cancelled.status().as_u16(), 499);
        assert_eq!(
            Error::StorageUnavailable.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_decode_errors_become_bad_request() {
        // ---
        let err: Error = DecodeError::MissingSensorId.into();
        assert_eq!(err.kind(), "BadRequest");

        let err: Error = DecodeError::NegativeDepth { index: 1, depth: -3 }.into();
        assert!(err.to_string().contains("negative depth -3"));
    }
}
