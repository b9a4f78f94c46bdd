//! The internal raw endpoint. Loopback-only; gives the transcode
//! supervisor and subtitle extractor a plain HTTP URL they can
//! hand to ffmpeg so it can issue its own range requests instead of being
//! fed through a pipe (a pipe can't seek).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;

use crate::error::{AppError, AppResult};
use crate::AppState;

use super::{parse_range_header, range::build_range_response};

pub async fn raw_handler(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> AppResult<Response> {
    if !peer.ip().is_loopback() {
        return Err(AppError::PermissionDenied);
    }

    let handle = Arc::new(app.resolve_file(file_id).await?);
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = parse_range_header(range_header, handle.size)?;
    Ok(build_range_response(app.chunk_cache.clone(), handle, range))
}
