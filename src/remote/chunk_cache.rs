//! Single-flight, rate-limited, LRU-cached 1 MiB reads from the remote
//! store. Grounded on `other_examples/918fdbfc_d0m1n1kr-pod-insights__src-
//! cache.rs`'s moka-backed cache-or-load pattern.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::metrics::{CHUNK_CACHE_HITS, CHUNK_CACHE_MISSES, REMOTE_READS};
use crate::util::SingleFlightGroup;

use super::{ChunkCacheKey, RemoteClient, RemoteFileHandle, CHUNK_SIZE};

pub struct ChunkCache {
    cache: moka::future::Cache<ChunkCacheKey, Bytes>,
    inflight: SingleFlightGroup<ChunkCacheKey, Result<Bytes, AppError>>,
    client: Arc<dyn RemoteClient>,
}

impl ChunkCache {
    pub fn new(client: Arc<dyn RemoteClient>, max_cache_bytes: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(max_cache_bytes)
            .weigher(|_key: &ChunkCacheKey, value: &Bytes| value.len() as u32)
            .time_to_live(Duration::from_secs(5 * 60))
            .build();
        Self {
            cache,
            inflight: SingleFlightGroup::new(),
            client,
        }
    }

    /// Reads exactly one aligned chunk: `aligned_offset % CHUNK_SIZE == 0`
    /// and `limit == CHUNK_SIZE` (the caller — the public and internal streaming endpoints — is responsible for
    /// rounding down and trimming). An empty result means EOF.
    pub async fn read(&self, handle: &RemoteFileHandle, aligned_offset: u64) -> AppResult<Bytes> {
        debug_assert_eq!(aligned_offset % CHUNK_SIZE, 0, "caller must align offset");
        let key = ChunkCacheKey {
            file_id: handle.id,
            aligned_offset,
            limit: CHUNK_SIZE as u32,
        };

        if let Some(hit) = self.cache.get(&key).await {
            CHUNK_CACHE_HITS.inc();
            return Ok(hit);
        }
        CHUNK_CACHE_MISSES.inc();

        let client = self.client.clone();
        let handle = handle.clone();
        let result = self
            .inflight
            .work(key, move || async move {
                let outcome = client
                    .read_chunk(&handle, aligned_offset, CHUNK_SIZE as u32)
                    .await;
                match &outcome {
                    Ok(_) => REMOTE_READS.with_label_values(&["ok"]).inc(),
                    Err(_) => REMOTE_READS.with_label_values(&["error"]).inc(),
                }
                outcome
            })
            .await;

        let bytes = result?;
        debug!(file_id = key.file_id, offset = aligned_offset, len = bytes.len(), "remote chunk read");
        if !bytes.is_empty() {
            self.cache.insert(key, bytes.clone()).await;
        }
        Ok(bytes)
    }

    /// Reads an arbitrary, possibly unaligned byte range `[start, end)`,
    /// stitching together as many aligned chunk reads as required.
    pub async fn read_range(
        &self,
        handle: &RemoteFileHandle,
        start: u64,
        end: u64,
    ) -> AppResult<Bytes> {
        if end <= start {
            return Ok(Bytes::new());
        }
        let mut out = Vec::with_capacity((end - start) as usize);
        let mut pos = crate::util::align_down(start, CHUNK_SIZE);
        while pos < end {
            let chunk = self.read(handle, pos).await?;
            if chunk.is_empty() {
                break;
            }
            let chunk_start = pos;
            let chunk_end = pos + chunk.len() as u64;
            let want_start = start.max(chunk_start);
            let want_end = end.min(chunk_end);
            if want_end > want_start {
                let lo = (want_start - chunk_start) as usize;
                let hi = (want_end - chunk_start) as usize;
                out.extend_from_slice(&chunk[lo..hi]);
            }
            if chunk.len() < CHUNK_SIZE as usize {
                break;
            }
            pos += CHUNK_SIZE;
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::client::fake::FakeRemoteClient;
    use std::sync::atomic::Ordering;

    fn make_cache(client: Arc<FakeRemoteClient>) -> ChunkCache {
        ChunkCache::new(client, 100 * 1024 * 1024)
    }

    #[tokio::test]
    async fn aligned_read_is_cached() {
        let fake = Arc::new(FakeRemoteClient::new());
        let data = Bytes::from(vec![7u8; (CHUNK_SIZE * 2) as usize]);
        fake.insert(1, "movie.mkv", "video/x-matroska", data);
        let cache = make_cache(fake.clone());
        let handle = fake.resolve(1).await.unwrap();

        let a = cache.read(&handle, 0).await.unwrap();
        let b = cache.read(&handle, 0).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(fake.reads_issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_chunk_issue_one_remote_read() {
        let fake = Arc::new(FakeRemoteClient::new());
        let data = Bytes::from(vec![1u8; (CHUNK_SIZE * 3) as usize]);
        fake.insert(2, "movie.mkv", "video/x-matroska", data);
        let cache = Arc::new(make_cache(fake.clone()));
        let handle = fake.resolve(2).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let handle = handle.clone();
            handles.push(tokio::spawn(async move { cache.read(&handle, 0).await.unwrap() }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fake.reads_issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unaligned_range_spans_two_chunks() {
        let fake = Arc::new(FakeRemoteClient::new());
        let mut data = vec![0u8; 10_000_000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        fake.insert(3, "movie.mkv", "video/x-matroska", Bytes::from(data.clone()));
        let cache = make_cache(fake.clone());
        let handle = fake.resolve(3).await.unwrap();

        let got = cache.read_range(&handle, 500, 1_500_001).await.unwrap();
        assert_eq!(got.len(), 1_499_501);
        assert_eq!(&got[..], &data[500..1_500_001]);
    }
}
