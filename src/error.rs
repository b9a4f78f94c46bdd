//! The error taxonomy, collapsed into one enum so every component reports
//! failures the same way and axum can turn them into the right status code
//! in one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,
    #[error("remote client not ready")]
    Unavailable,
    #[error("timed out")]
    Timeout,
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("range not satisfiable")]
    RangeNotSatisfiable { total_len: u64 },
    #[error("permission denied")]
    PermissionDenied,
    #[error("tool missing: {0}")]
    ToolMissing(String),
    #[error("corrupted: {0}")]
    Corrupted(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            AppError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "remote client not ready").into_response()
            }
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timed out").into_response(),
            AppError::RemoteError(msg) => {
                (StatusCode::BAD_GATEWAY, format!("remote error: {msg}")).into_response()
            }
            AppError::RateLimited { retry_after_secs } => {
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
                if let Some(secs) = retry_after_secs {
                    resp.headers_mut().insert(
                        axum::http::header::RETRY_AFTER,
                        secs.to_string().parse().unwrap(),
                    );
                }
                resp
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::RangeNotSatisfiable { total_len } => {
                let mut resp = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
                resp.headers_mut().insert(
                    axum::http::header::CONTENT_RANGE,
                    format!("bytes */{total_len}").parse().unwrap(),
                );
                resp
            }
            AppError::PermissionDenied => {
                (StatusCode::FORBIDDEN, "loopback only").into_response()
            }
            AppError::ToolMissing(tool) => {
                (StatusCode::SERVICE_UNAVAILABLE, format!("{tool} not available")).into_response()
            }
            AppError::Corrupted(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("corrupted: {msg}")).into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
