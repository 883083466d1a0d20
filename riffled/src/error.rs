//! Control-plane error taxonomy.
//!
//! Fast-path errors (empty pool, partial send) are never raised this way;
//! they are accounted as per-queue drop counters. Everything the HTTP API
//! can report goes through `ControlError` and is rendered as a
//! `{code, message}` JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} is busy")]
    Busy(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Stable numeric code reported to clients alongside the message.
    pub fn code(&self) -> u32 {
        match self {
            ControlError::NotFound(_) => 1,
            ControlError::AlreadyExists(_) => 2,
            ControlError::InvalidArgument(_) => 3,
            ControlError::Busy(_) => 4,
            ControlError::ResourceExhausted(_) => 5,
            ControlError::NotSupported(_) => 6,
            ControlError::Device(_) => 7,
            ControlError::Io(_) => 8,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::AlreadyExists(_) => StatusCode::CONFLICT,
            ControlError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ControlError::Busy(_) => StatusCode::CONFLICT,
            ControlError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            ControlError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            ControlError::Device(_) => StatusCode::BAD_GATEWAY,
            ControlError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errs = [
            ControlError::NotFound("m".into()),
            ControlError::AlreadyExists("m".into()),
            ControlError::InvalidArgument("x".into()),
            ControlError::Busy("w".into()),
            ControlError::ResourceExhausted("pool".into()),
            ControlError::NotSupported("op".into()),
            ControlError::Device("drv".into()),
        ];
        let mut codes: Vec<u32> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn message_includes_name() {
        let e = ControlError::NotFound("src0".into());
        assert_eq!(e.to_string(), "src0 not found");
    }
}
