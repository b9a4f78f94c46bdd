use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use parking_lot::Mutex as SyncMutex;
use tower::util::ServiceExt;

use async_trait::async_trait;
use telestream::activity::ActivityTracker;
use telestream::config::{AdminConfig, MetadataApiConfig, RemoteConfig, ServerConfig, Settings, StreamingConfig};
use telestream::error::{AppError, AppResult};
use telestream::metadata::store::MetadataStore;
use telestream::metadata::tmdb::TmdbClient;
use telestream::metadata::worker::MetadataWorker;
use telestream::probe::MediaProbe;
use telestream::remote::{ChunkCache, RemoteClient, RemoteFileHandle};
use telestream::subtitle::SubtitleExtractor;
use telestream::sync::SyncLoop;
use telestream::transcode::TranscodeSupervisor;
use telestream::{create_app, create_internal_app, AppState};

/// A minimal in-memory stand-in for `RemoteClient`, mirroring the one the
/// library keeps behind `#[cfg(test)]` for its own unit tests (which an
/// external integration test crate can't reach).
struct FakeRemoteClient {
    files: SyncMutex<HashMap<i64, (RemoteFileHandle, Bytes)>>,
    reads_issued: AtomicUsize,
}

impl FakeRemoteClient {
    fn new() -> Self {
        Self {
            files: SyncMutex::new(HashMap::new()),
            reads_issued: AtomicUsize::new(0),
        }
    }

    fn insert(&self, id: i64, file_name: &str, mime_type: &str, data: Bytes) {
        let handle = RemoteFileHandle {
            id,
            size: data.len() as u64,
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            location: format!("loc-{id}"),
        };
        self.files.lock().insert(id, (handle, data));
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn resolve(&self, file_id: i64) -> AppResult<RemoteFileHandle> {
        self.files
            .lock()
            .get(&file_id)
            .map(|(h, _)| h.clone())
            .ok_or(AppError::NotFound)
    }

    async fn read_chunk(&self, handle: &RemoteFileHandle, aligned_offset: u64, limit: u32) -> AppResult<Bytes> {
        self.reads_issued.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock();
        let (_, data) = files.get(&handle.id).ok_or(AppError::NotFound)?;
        let start = aligned_offset.min(data.len() as u64) as usize;
        let end = (aligned_offset + limit as u64).min(data.len() as u64) as usize;
        Ok(data.slice(start..end))
    }

    async fn list_channel(&self, offset: u32, limit: u32) -> AppResult<Vec<RemoteFileHandle>> {
        let files = self.files.lock();
        let mut handles: Vec<_> = files.values().map(|(h, _)| h.clone()).collect();
        handles.sort_by_key(|h| h.id);
        Ok(handles.into_iter().skip(offset as usize).take(limit as usize).collect())
    }
}

fn peer() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)), 54321)
}

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 54321)
}

async fn build_state(fake: Arc<FakeRemoteClient>) -> (Arc<AppState>, tempfile::TempDir) {
    let data_dir = tempfile::tempdir().expect("tempdir");

    let remote: Arc<dyn RemoteClient> = fake;
    let chunk_cache = Arc::new(ChunkCache::new(remote.clone(), 100 * 1024 * 1024));
    let probe = Arc::new(MediaProbe::new(chunk_cache.clone()));
    let tmdb = Arc::new(TmdbClient::new("test-key", "http://127.0.0.1:0", "http://127.0.0.1:0"));
    let activity = ActivityTracker::new();

    let metadata_store = Arc::new(MetadataStore::new(data_dir.path()));
    metadata_store.ensure_dirs().await.expect("ensure_dirs");

    let worker = Arc::new(MetadataWorker::new(
        metadata_store.clone(),
        tmdb,
        remote.clone(),
        probe.clone(),
        activity.clone(),
    ));
    let sync_loop = Arc::new(
        SyncLoop::new(
            metadata_store.clone(),
            remote.clone(),
            worker.clone(),
            activity.clone(),
            data_dir.path(),
        )
        .expect("sync loop"),
    );

    let internal_base_url = "http://127.0.0.1:9".to_string();
    let transcode = Arc::new(TranscodeSupervisor::new(internal_base_url.clone()));
    let subtitle = Arc::new(SubtitleExtractor::new(internal_base_url));

    let config = Settings {
        server: ServerConfig { host: "127.0.0.1".into(), port: 0, internal_port: 0 },
        remote: RemoteConfig {
            api_id: "id".into(),
            api_hash: "hash".into(),
            session: "session".into(),
            channel_id: 1,
            base_url: "http://127.0.0.1:0".into(),
        },
        streaming: StreamingConfig {
            chunk_size: 1024 * 1024,
            max_cache_size: 100 * 1024 * 1024,
            data_dir: data_dir.path().to_string_lossy().into_owned(),
        },
        metadata: MetadataApiConfig {
            base_url: "http://127.0.0.1:0".into(),
            image_base_url: "http://127.0.0.1:0".into(),
        },
        metadata_api_key: "test-key".into(),
        admin: AdminConfig {
            jwt_secret: Some("test-secret".into()),
            admin_user: Some("admin".into()),
            admin_password: Some("password".into()),
        },
    };

    let state = Arc::new(AppState {
        config,
        remote,
        chunk_cache,
        probe,
        metadata_store,
        worker,
        sync_loop,
        activity,
        transcode,
        subtitle,
    });
    (state, data_dir)
}

fn with_peer(mut req: Request<Body>, addr: SocketAddr) -> Request<Body> {
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

#[tokio::test]
async fn full_get_returns_whole_file() {
    let fake = Arc::new(FakeRemoteClient::new());
    fake.insert(1, "movie.mp4", "video/mp4", Bytes::from(vec![9u8; 5_000_000]));
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let req = with_peer(Request::builder().uri("/stream/1").body(Body::empty()).unwrap(), peer());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCEPT_RANGES).unwrap(),
        "bytes"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 5_000_000);
}

#[tokio::test]
async fn range_get_returns_partial_content() {
    let fake = Arc::new(FakeRemoteClient::new());
    let mut data = vec![0u8; 2_000_000];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    fake.insert(2, "movie.mkv", "video/x-matroska", Bytes::from(data.clone()));
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let req = with_peer(
        Request::builder()
            .uri("/stream/2")
            .header(header::RANGE, "bytes=100-199")
            .body(Body::empty())
            .unwrap(),
        peer(),
    );
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 100-199/2000000"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &data[100..200]);
}

#[tokio::test]
async fn unknown_file_id_is_404() {
    let fake = Arc::new(FakeRemoteClient::new());
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let req = with_peer(Request::builder().uri("/stream/999").body(Body::empty()).unwrap(), peer());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_and_metrics_respond() {
    let fake = Arc::new(FakeRemoteClient::new());
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn empty_library_returns_empty_snapshot() {
    let fake = Arc::new(FakeRemoteClient::new());
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let req = with_peer(Request::builder().uri("/metadata").body(Body::empty()).unwrap(), peer());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["movies"].as_array().unwrap().len(), 0);
    assert_eq!(snapshot["tv_shows"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn internal_raw_endpoint_rejects_non_loopback_peer() {
    let fake = Arc::new(FakeRemoteClient::new());
    fake.insert(3, "movie.mp4", "video/mp4", Bytes::from(vec![1u8; 10]));
    let (state, _guard) = build_state(fake).await;
    let app = create_internal_app(state);

    let req = with_peer(Request::builder().uri("/internal/raw/3").body(Body::empty()).unwrap(), peer());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn internal_raw_endpoint_serves_loopback_peer() {
    let fake = Arc::new(FakeRemoteClient::new());
    fake.insert(4, "movie.mp4", "video/mp4", Bytes::from(vec![1u8; 10]));
    let (state, _guard) = build_state(fake).await;
    let app = create_internal_app(state);

    let req = with_peer(Request::builder().uri("/internal/raw/4").body(Body::empty()).unwrap(), loopback());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_route_requires_bearer_token() {
    let fake = Arc::new(FakeRemoteClient::new());
    let (state, _guard) = build_state(fake).await;
    let app = create_app(state);

    let body = serde_json::json!({ "tmdb_id": 42 }).to_string();
    let req = with_peer(
        Request::builder()
            .method("POST")
            .uri("/admin/metadata/1/fix")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        peer(),
    );
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
