//! The byte-serving primitive shared by the public streaming endpoint and
//! the internal loopback endpoint: given a resolved file handle and an
//! already-parsed range, stream the bytes through the chunk cache with a
//! retry-once-then-give-up policy on transient read failures.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use tracing::warn;

use crate::remote::{ChunkCache, RemoteFileHandle, CHUNK_SIZE};
use crate::util::align_down;

use super::{content_type_for, ByteRange};

struct RangeStreamState {
    handle: Arc<RemoteFileHandle>,
    chunk_cache: Arc<ChunkCache>,
    pos: u64,
    end_exclusive: u64,
}

/// Yields bytes `[start, end_exclusive)` one aligned chunk at a time. A
/// transient read error is retried once after 1.5s at the same position; a
/// second failure ends the stream early rather than propagating an error —
/// whatever reached the client stands.
fn range_stream(
    handle: Arc<RemoteFileHandle>,
    chunk_cache: Arc<ChunkCache>,
    start: u64,
    end_exclusive: u64,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let state = RangeStreamState {
        handle,
        chunk_cache,
        pos: start,
        end_exclusive,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.pos >= state.end_exclusive {
            return None;
        }
        let aligned = align_down(state.pos, CHUNK_SIZE);
        let mut retried = false;
        loop {
            match state.chunk_cache.read(&state.handle, aligned).await {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        return None;
                    }
                    let chunk_end = aligned + chunk.len() as u64;
                    let slice_start = state.pos.max(aligned);
                    let slice_end = state.end_exclusive.min(chunk_end);
                    if slice_end <= slice_start {
                        return None;
                    }
                    let lo = (slice_start - aligned) as usize;
                    let hi = (slice_end - aligned) as usize;
                    let out = chunk.slice(lo..hi);
                    state.pos = slice_end;
                    return Some((Ok(out), state));
                }
                Err(e) => {
                    if !retried {
                        retried = true;
                        tokio::time::sleep(Duration::from_millis(1500)).await;
                        continue;
                    }
                    warn!(file_id = state.handle.id, error = %e, "range read failed twice, ending response early");
                    return None;
                }
            }
        }
    })
}

/// Builds the full 200/206/416 response for a resolved file and an
/// already-parsed, already-validated optional range.
pub fn build_range_response(
    chunk_cache: Arc<ChunkCache>,
    handle: Arc<RemoteFileHandle>,
    range: Option<ByteRange>,
) -> Response {
    let total_len = handle.size;
    let (status, start, end_exclusive, content_length) = match range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.end_inclusive + 1, r.len()),
        None => (StatusCode::OK, 0, total_len, total_len),
    };

    let content_type = content_type_for(&handle.file_name);
    let body = Body::from_stream(range_stream(handle.clone(), chunk_cache, start, end_exclusive));

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, content_length)
        .body(body)
        .expect("building a streaming response cannot fail here");

    if status == StatusCode::PARTIAL_CONTENT {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "bytes {}-{}/{}",
            start,
            end_exclusive - 1,
            total_len
        )) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }

    response
}
