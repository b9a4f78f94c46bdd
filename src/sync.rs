//! The sync / idle loop. Grounded on `fritztv/src/manager.rs`'s
//! idle-cleanup spawned loop (`tokio::time::sleep` + periodic check) for the
//! pass-timing skeleton. The metadata-directory watch repurposes `notify`,
//! a dependency `fritztv` declares but never calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::activity::ActivityTracker;
use crate::error::AppResult;
use crate::metadata::store::MetadataStore;
use crate::metadata::worker::MetadataWorker;
use crate::remote::RemoteClient;

const FULL_SCAN_INTERVAL: Duration = Duration::from_secs(7 * 60);
const WATCH_DEBOUNCE: Duration = Duration::from_secs(2);
const LIST_PAGE_SIZE: u32 = 100;
const BUSY_SLEEP: Duration = Duration::from_secs(15);
const IDLE_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ListingCache {
    files: HashMap<i64, String>,
}

pub struct SyncLoop {
    store: Arc<MetadataStore>,
    remote: Arc<dyn RemoteClient>,
    worker: Arc<MetadataWorker>,
    activity: ActivityTracker,
    listing_cache_path: PathBuf,
    refetch_rx: Mutex<mpsc::UnboundedReceiver<i64>>,
    _watcher: RecommendedWatcher,
}

impl SyncLoop {
    pub fn new(
        store: Arc<MetadataStore>,
        remote: Arc<dyn RemoteClient>,
        worker: Arc<MetadataWorker>,
        activity: ActivityTracker,
        data_dir: impl AsRef<Path>,
    ) -> AppResult<Self> {
        let listing_cache_path = data_dir.as_ref().join("list_caches.json");
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = spawn_metadata_watcher(store.metadata_dir().to_path_buf(), tx)?;
        Ok(Self {
            store,
            remote,
            worker,
            activity,
            listing_cache_path,
            refetch_rx: Mutex::new(rx),
            _watcher: watcher,
        })
    }

    /// Runs forever; call via `tokio::spawn(sync_loop.run())`.
    pub async fn run(self: Arc<Self>) {
        let mut last_full_scan: Option<Instant> = None;
        loop {
            self.activity.wait_if_busy().await;
            let mut did_work = false;

            let due_for_full_scan = last_full_scan
                .map(|t| t.elapsed() >= FULL_SCAN_INTERVAL)
                .unwrap_or(true);
            if due_for_full_scan {
                match self.full_channel_scan().await {
                    Ok(changed) => did_work |= changed,
                    Err(e) => warn!(error = %e, "full channel scan failed"),
                }
                last_full_scan = Some(Instant::now());
            }

            did_work |= self.drain_manual_refetch_queue().await;

            let before = self.store.all_raw().await.map(|r| r.len()).unwrap_or(0);
            self.worker.retry_failed_lookups().await;
            let after = self.store.all_raw().await.map(|r| r.len()).unwrap_or(0);
            did_work |= before != after;

            if did_work {
                if let Err(e) = self.store.rebuild_show_cache().await {
                    warn!(error = %e, "show-aggregate cache rebuild failed");
                }
            }

            self.worker.retry_missing_images().await;

            tokio::time::sleep(if did_work { BUSY_SLEEP } else { IDLE_SLEEP }).await;
        }
    }

    /// Forces one full channel scan outside the regular interval; used by
    /// the admin `sync-telegram` route.
    pub async fn force_full_scan(&self) -> AppResult<bool> {
        self.full_channel_scan().await
    }

    /// Enumerates the whole remote channel, reconciling the local listing
    /// cache: new files are enriched, missing ones are dropped, renamed ones
    /// are flagged `needs_refetch`. Returns whether anything changed.
    async fn full_channel_scan(&self) -> AppResult<bool> {
        let mut cache = self.load_listing_cache().await;
        let mut seen = HashMap::new();
        let mut offset = 0u32;
        loop {
            let page = self.remote.list_channel(offset, LIST_PAGE_SIZE).await?;
            if page.is_empty() {
                break;
            }
            for handle in &page {
                seen.insert(handle.id, handle.file_name.clone());
            }
            offset += page.len() as u32;
            if page.len() < LIST_PAGE_SIZE as usize {
                break;
            }
        }

        let mut new_files = Vec::new();
        let mut renamed = Vec::new();
        for (id, name) in &seen {
            match cache.files.get(id) {
                None => new_files.push((*id, name.clone())),
                Some(old_name) if old_name != name => renamed.push((*id, name.clone())),
                _ => {}
            }
        }
        let removed: Vec<i64> = cache.files.keys().filter(|id| !seen.contains_key(id)).copied().collect();

        let changed = !new_files.is_empty() || !renamed.is_empty() || !removed.is_empty();

        for id in &removed {
            info!(file_id = id, "file removed from remote channel");
            let _ = self.store.delete(*id).await;
        }
        for (id, _) in &renamed {
            if let Ok(Some(mut record)) = self.store.load(*id).await {
                record.needs_refetch = true;
                record.file_name = seen.get(id).cloned().unwrap_or(record.file_name);
                let _ = self.store.save(&record).await;
            }
        }
        if !new_files.is_empty() {
            info!(count = new_files.len(), "enriching newly discovered files");
            self.worker.process_batch(new_files).await;
        }

        cache.files = seen;
        self.save_listing_cache(&cache).await;

        if !removed.is_empty() {
            if let Err(e) = self.store.rebuild_show_cache().await {
                warn!(error = %e, "show-aggregate cache rebuild after deletion failed");
            }
        }

        Ok(changed)
    }

    /// Drains file_ids queued by the metadata-directory watcher; each is
    /// re-enriched immediately regardless of backoff.
    async fn drain_manual_refetch_queue(&self) -> bool {
        let mut rx = self.refetch_rx.lock().await;
        let mut files = Vec::new();
        while let Ok(file_id) = rx.try_recv() {
            if let Ok(Some(record)) = self.store.load(file_id).await {
                if record.needs_refetch || record.manual_tmdb_id.is_some() {
                    files.push((file_id, record.file_name));
                }
            }
        }
        drop(rx);
        if files.is_empty() {
            return false;
        }
        info!(count = files.len(), "draining manual refetch queue");
        self.worker.process_batch(files).await;
        true
    }

    async fn load_listing_cache(&self) -> ListingCache {
        match tokio::fs::read(&self.listing_cache_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => ListingCache::default(),
        }
    }

    async fn save_listing_cache(&self, cache: &ListingCache) {
        let Ok(body) = serde_json::to_vec_pretty(cache) else { return };
        let tmp_path = self.listing_cache_path.with_extension("json.tmp");
        if tokio::fs::write(&tmp_path, &body).await.is_ok() {
            let _ = tokio::fs::rename(&tmp_path, &self.listing_cache_path).await;
        }
    }
}

/// Watches the metadata directory for JSON mutations; debounces bursts (a
/// `save()` is a write-then-rename, which fires two raw fs events) before
/// forwarding the affected `file_id` to the sync loop.
fn spawn_metadata_watcher(
    metadata_dir: PathBuf,
    tx: mpsc::UnboundedSender<i64>,
) -> AppResult<RecommendedWatcher> {
    let pending: Arc<std::sync::Mutex<HashMap<i64, Instant>>> = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        for path in &event.paths {
            let Some(file_id) = file_id_from_path(path) else { continue };
            let mut pending = pending.lock().unwrap();
            let now = Instant::now();
            let should_fire = pending
                .get(&file_id)
                .map(|last| now.duration_since(*last) >= WATCH_DEBOUNCE)
                .unwrap_or(true);
            pending.insert(file_id, now);
            if should_fire {
                let _ = tx.send(file_id);
            }
        }
    })
    .map_err(|e| crate::error::AppError::Corrupted(format!("starting metadata watcher: {e}")))?;

    watcher
        .watch(&metadata_dir, RecursiveMode::NonRecursive)
        .map_err(|e| crate::error::AppError::Corrupted(format!("watching {}: {e}", metadata_dir.display())))?;
    Ok(watcher)
}

fn file_id_from_path(path: &Path) -> Option<i64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_from_path_parses_json_stem() {
        assert_eq!(file_id_from_path(Path::new("/data/metadata/42.json")), Some(42));
        assert_eq!(file_id_from_path(Path::new("/data/metadata/42.json.tmp")), None);
        assert_eq!(file_id_from_path(Path::new("/data/metadata/notanumber.json")), None);
    }
}
