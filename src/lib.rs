//! The app shell: `AppState`, route tables, and the handlers that are thin
//! enough not to deserve their own module. Grounded on `fritztv/src/lib.rs`'s
//! flat `Router::new().route(...)` style and its split between a public
//! router and a narrower one (there HLS vs. direct stream, here public vs.
//! loopback-only).

pub mod activity;
pub mod admin;
pub mod config;
pub mod error;
pub mod library;
pub mod metadata;
pub mod metrics;
pub mod probe;
pub mod remote;
pub mod stream;
pub mod subtitle;
pub mod sync;
pub mod transcode;
pub mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::activity::ActivityTracker;
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::library::LibrarySnapshot;
use crate::metadata::store::MetadataStore;
use crate::metadata::worker::MetadataWorker;
use crate::metadata::{MetadataRecord, ShowAggregate};
use crate::probe::{AudioStreamInfo, MediaProbe, SubtitleStreamInfo};
use crate::remote::{ChunkCache, RemoteClient, RemoteFileHandle};
use crate::stream::range::build_range_response;
use crate::stream::{parse_range_header, ByteRange};
use crate::subtitle::{SubtitleBody, SubtitleExtractor};
use crate::sync::SyncLoop;
use crate::transcode::{TranscodeOptions, TranscodeSupervisor};

/// Everything a request handler or background task needs, shared behind one
/// `Arc` the way `fritztv`'s `AppState` bundles its channel list and
/// stream/HLS managers.
pub struct AppState {
    pub config: Settings,
    pub remote: Arc<dyn RemoteClient>,
    pub chunk_cache: Arc<ChunkCache>,
    pub probe: Arc<MediaProbe>,
    pub metadata_store: Arc<MetadataStore>,
    pub worker: Arc<MetadataWorker>,
    pub sync_loop: Arc<SyncLoop>,
    pub activity: ActivityTracker,
    pub transcode: Arc<TranscodeSupervisor>,
    pub subtitle: Arc<SubtitleExtractor>,
}

impl AppState {
    /// `RemoteClient::resolve` already folds the primary-lookup, listing-cache,
    /// and metadata-fallback chain behind one opaque call, so there's nothing
    /// left to do here but delegate.
    pub async fn resolve_file(&self, file_id: i64) -> AppResult<RemoteFileHandle> {
        self.remote.resolve(file_id).await
    }
}

/// The public HTTP surface: streaming, metadata, search, admin, and `/metrics`.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{id}", get(stream_handler))
        .route("/stream/{id}/tracks", get(tracks_handler))
        .route("/stream/{id}/subtitle/{stream_index}", get(subtitle_handler))
        .route("/stream/{id}/heartbeat", get(heartbeat_handler))
        .route("/metadata", get(metadata_handler))
        .route("/metadata/{id}", get(metadata_record_handler))
        .route("/tv/{show_tmdb_id}", get(tv_show_handler))
        .route("/search", get(search_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .merge(admin::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The loopback-only surface the transcode supervisor and subtitle extractor
/// hand to ffmpeg as a seekable URL.
pub fn create_internal_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/raw/{id}", get(stream::internal::raw_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    start: Option<f64>,
    #[serde(rename = "audioTrack")]
    audio_track: Option<u32>,
}

/// `GET /stream/{id}`. Direct byte-range path when the requested (or
/// default) audio track is browser-playable and no seek was requested;
/// otherwise hands off to the transcode supervisor, since neither a
/// non-default track nor a time-based seek can be served out of the raw
/// container bytes.
async fn stream_handler(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> AppResult<Response> {
    app.activity.register_activity(file_id, peer.ip()).await;
    let handle = Arc::new(app.resolve_file(file_id).await?);
    let info = app.probe.probe(&handle).await;

    let track_playable = info
        .as_ref()
        .map(|i| i.is_browser_playable(query.audio_track))
        .unwrap_or(true);
    let selecting_non_default = query.audio_track.is_some()
        && info.as_ref().and_then(|i| i.default_audio_track()) != query.audio_track;
    let seeking = query.start.map(|s| s > 0.0).unwrap_or(false);

    if selecting_non_default || !track_playable || seeking {
        let options = TranscodeOptions {
            seek_seconds: query.start.unwrap_or(0.0),
            audio_track_index: query
                .audio_track
                .or_else(|| info.as_ref().and_then(|i| i.default_audio_track()))
                .unwrap_or(0),
            transcode_audio: !track_playable,
        };
        let job = app.transcode.start(file_id, options).await?;
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::TRANSFER_ENCODING, "chunked")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(job.body))
            .expect("building a chunked transcode response cannot fail here");
        response.headers_mut().insert(
            "x-seek-sequence",
            job.seek_sequence.to_string().parse().expect("seek sequence is ascii digits"),
        );
        return Ok(response);
    }

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range: Option<ByteRange> = parse_range_header(range_header, handle.size)?;
    Ok(build_range_response(app.chunk_cache.clone(), handle, range))
}

#[derive(Debug, Serialize)]
struct TracksResponse {
    audio_tracks: Vec<AudioStreamInfo>,
    subtitle_tracks: Vec<SubtitleStreamInfo>,
    has_unsupported_audio: bool,
    duration: Option<f64>,
    default_audio_codec: Option<String>,
    browser_playable: bool,
}

/// `GET /stream/{id}/tracks`.
async fn tracks_handler(State(app): State<Arc<AppState>>, Path(file_id): Path<i64>) -> AppResult<Json<TracksResponse>> {
    let handle = app.resolve_file(file_id).await?;
    let info = app.probe.probe(&handle).await;
    let response = match info {
        Some(info) => {
            let default_codec = info
                .default_audio_track()
                .and_then(|idx| info.audio_streams.iter().find(|s| s.index == idx))
                .map(|s| s.codec.clone());
            TracksResponse {
                browser_playable: info.is_browser_playable(None),
                has_unsupported_audio: !info.is_browser_playable(None),
                duration: info.duration_seconds,
                default_audio_codec: default_codec,
                audio_tracks: info.audio_streams.clone(),
                subtitle_tracks: info.subtitle_streams.clone(),
            }
        }
        None => TracksResponse {
            audio_tracks: Vec::new(),
            subtitle_tracks: Vec::new(),
            has_unsupported_audio: false,
            duration: None,
            default_audio_codec: None,
            browser_playable: true,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SubtitleQuery {
    start: Option<f64>,
}

/// `GET /stream/{id}/subtitle/{stream_index}`.
async fn subtitle_handler(
    State(app): State<Arc<AppState>>,
    Path((file_id, stream_index)): Path<(i64, u32)>,
    Query(query): Query<SubtitleQuery>,
) -> AppResult<Response> {
    let body = app
        .subtitle
        .extract(file_id, stream_index, query.start.unwrap_or(0.0))
        .await?;
    let response_body = match body {
        SubtitleBody::Whole(bytes) => Body::from(bytes),
        SubtitleBody::Streaming(stream) => Body::from_stream(stream),
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/vtt; charset=utf-8")
        .body(response_body)
        .expect("building a subtitle response cannot fail here"))
}

/// `GET /stream/{id}/heartbeat`.
async fn heartbeat_handler(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> StatusCode {
    app.activity.register_activity(file_id, peer.ip()).await;
    StatusCode::NO_CONTENT
}

/// `GET /metadata`.
async fn metadata_handler(State(app): State<Arc<AppState>>) -> Json<LibrarySnapshot> {
    Json(library::build(&app.metadata_store).await)
}

/// `GET /metadata/{id}`.
async fn metadata_record_handler(
    State(app): State<Arc<AppState>>,
    Path(file_id): Path<i64>,
) -> AppResult<Json<MetadataRecord>> {
    let record = app
        .metadata_store
        .load(file_id)
        .await?
        .filter(|r| r.is_valid())
        .ok_or(AppError::NotFound)?;
    Ok(Json(record))
}

/// `GET /tv/{show_tmdb_id}`.
async fn tv_show_handler(
    State(app): State<Arc<AppState>>,
    Path(show_tmdb_id): Path<u64>,
) -> AppResult<Json<ShowAggregate>> {
    let aggregate = app
        .metadata_store
        .show_aggregate(show_tmdb_id)
        .await
        .ok_or(AppError::NotFound)?;
    Ok(Json((*aggregate).clone()))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

/// `GET /search?q=`.
async fn search_handler(
    State(app): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<library::SearchResult>> {
    let snapshot = library::build(&app.metadata_store).await;
    let q = query.q.unwrap_or_default();
    Json(library::search(&snapshot, &q))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}
