use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::{AppError, AppResult};

use super::RemoteFileHandle;

/// A leaky-bucket gate enforcing a minimum spacing between calls. Grounded
/// on `transcoder.rs`'s `tokio::time::sleep`-based pacing, not a separate
/// limiter crate.
pub struct RateGate {
    min_spacing: Duration,
    last: Mutex<Instant>,
}

impl RateGate {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last: Mutex::new(Instant::now() - min_spacing),
        }
    }

    /// Blocks the caller until at least `min_spacing` has elapsed since the
    /// previous call returned.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        let now = Instant::now();
        let earliest = *last + self.min_spacing;
        if earliest > now {
            tokio::time::sleep_until(earliest).await;
        }
        *last = Instant::now();
    }
}

/// The remote object store boundary. Resolving and reading are kept on one
/// trait so a hand-written in-memory fake can stand in for tests, the same
/// direct-struct-over-mocking-framework style used throughout `fritztv`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn resolve(&self, file_id: i64) -> AppResult<RemoteFileHandle>;

    /// `aligned_offset` must be a multiple of [`super::CHUNK_SIZE`]. Returns
    /// fewer than `limit` bytes only at end of file; an empty result means
    /// EOF. Never retried internally — a short read is authoritative.
    async fn read_chunk(
        &self,
        handle: &RemoteFileHandle,
        aligned_offset: u64,
        limit: u32,
    ) -> AppResult<Bytes>;

    /// Pages the channel listing, 100 at a time, for the sync loop's full scan.
    async fn list_channel(&self, offset: u32, limit: u32) -> AppResult<Vec<RemoteFileHandle>>;
}

/// Talks to the chat backend through its HTTP bridge/gateway rather than
/// reimplementing its wire protocol in-process — the remote store is
/// consumed as an opaque client. `session` authenticates against the
/// bridge; `channel_id` scopes every call.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    channel_id: i64,
    session: String,
    gate: RateGate,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            channel_id: config.channel_id,
            session: config.session.clone(),
            gate: RateGate::new(Duration::from_millis(100)),
        }
    }
}

#[derive(serde::Deserialize)]
struct ResolveResponse {
    id: i64,
    size: u64,
    file_name: String,
    mime_type: String,
    location: String,
}

#[derive(serde::Deserialize)]
struct ListEntry {
    id: i64,
    size: u64,
    file_name: String,
    mime_type: String,
    location: String,
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn resolve(&self, file_id: i64) -> AppResult<RemoteFileHandle> {
        self.gate.wait().await;
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, self.channel_id, file_id
        );
        let resp = tokio::time::timeout(
            Duration::from_secs(30),
            self.http.get(&url).bearer_auth(&self.session).send(),
        )
        .await
        .map_err(|_| AppError::Timeout)?
        .map_err(|e| AppError::RemoteError(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound);
        }
        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(AppError::Unavailable);
        }
        let body: ResolveResponse = resp
            .json()
            .await
            .map_err(|e| AppError::RemoteError(e.to_string()))?;
        Ok(RemoteFileHandle {
            id: body.id,
            size: body.size,
            file_name: body.file_name,
            mime_type: body.mime_type,
            location: body.location,
        })
    }

    async fn read_chunk(
        &self,
        handle: &RemoteFileHandle,
        aligned_offset: u64,
        limit: u32,
    ) -> AppResult<Bytes> {
        debug_assert_eq!(aligned_offset % super::CHUNK_SIZE, 0);
        self.gate.wait().await;
        let url = format!("{}/locations/{}/bytes", self.base_url, handle.location);
        let resp = tokio::time::timeout(
            Duration::from_secs(30),
            self.http
                .get(&url)
                .bearer_auth(&self.session)
                .query(&[("offset", aligned_offset.to_string()), ("limit", limit.to_string())])
                .send(),
        )
        .await
        .map_err(|_| AppError::Timeout)?
        .map_err(|e| AppError::RemoteError(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(AppError::Unavailable);
        }
        if !resp.status().is_success() {
            warn!(status = %resp.status(), file_id = handle.id, "remote chunk read failed");
            return Err(AppError::RemoteError(format!("status {}", resp.status())));
        }
        resp.bytes().await.map_err(|e| AppError::RemoteError(e.to_string()))
    }

    async fn list_channel(&self, offset: u32, limit: u32) -> AppResult<Vec<RemoteFileHandle>> {
        self.gate.wait().await;
        let url = format!("{}/channels/{}/messages", self.base_url, self.channel_id);
        let resp = tokio::time::timeout(
            Duration::from_secs(30),
            self.http
                .get(&url)
                .bearer_auth(&self.session)
                .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
                .send(),
        )
        .await
        .map_err(|_| AppError::Timeout)?
        .map_err(|e| AppError::RemoteError(e.to_string()))?;

        let entries: Vec<ListEntry> =
            resp.json().await.map_err(|e| AppError::RemoteError(e.to_string()))?;
        debug!(count = entries.len(), offset, "listed channel page");
        Ok(entries
            .into_iter()
            .map(|e| RemoteFileHandle {
                id: e.id,
                size: e.size,
                file_name: e.file_name,
                mime_type: e.mime_type,
                location: e.location,
            })
            .collect())
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;

    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Hand-written in-memory stand-in for `RemoteClient`, used by the chunk cache, streaming endpoints, and transcode supervisor
    /// tests instead of a mocking framework.
    pub struct FakeRemoteClient {
        files: SyncMutex<HashMap<i64, (RemoteFileHandle, Bytes)>>,
        pub reads_issued: std::sync::atomic::AtomicUsize,
    }

    impl FakeRemoteClient {
        pub fn new() -> Self {
            Self {
                files: SyncMutex::new(HashMap::new()),
                reads_issued: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        pub fn insert(&self, id: i64, file_name: &str, mime_type: &str, data: Bytes) {
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

        async fn read_chunk(
            &self,
            handle: &RemoteFileHandle,
            aligned_offset: u64,
            limit: u32,
        ) -> AppResult<Bytes> {
            self.reads_issued
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
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
            Ok(handles
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }
    }
}
