//! The on-disk metadata store. Grounded on `other_examples/918fdbfc_d0m1n1kr-
//! pod-insights__src-cache.rs`'s whole-file JSON read/reload pattern,
//! adapted to per-`file_id` files with a TTL-memoized "all valid records"
//! snapshot and a short debounce so write bursts don't thrash the memo.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

use super::{MetadataRecord, ShowAggregate};

const SNAPSHOT_TTL: Duration = Duration::from_secs(60 * 60);
const INVALIDATE_DEBOUNCE: Duration = Duration::from_secs(1);

struct Snapshot {
    records: Arc<HashMap<i64, MetadataRecord>>,
    loaded_at: Instant,
}

pub struct MetadataStore {
    metadata_dir: PathBuf,
    posters_dir: PathBuf,
    backdrops_dir: PathBuf,
    tv_cache_dir: PathBuf,
    snapshot: RwLock<Option<Snapshot>>,
    invalidate_generation: AtomicU64,
    show_cache: RwLock<HashMap<u64, Arc<ShowAggregate>>>,
}

impl MetadataStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            metadata_dir: data_dir.join("metadata"),
            posters_dir: data_dir.join("posters"),
            backdrops_dir: data_dir.join("backdrops"),
            tv_cache_dir: data_dir.join("tv_cache"),
            snapshot: RwLock::new(None),
            invalidate_generation: AtomicU64::new(0),
            show_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ensure_dirs(&self) -> AppResult<()> {
        for dir in [&self.metadata_dir, &self.posters_dir, &self.backdrops_dir, &self.tv_cache_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Corrupted(format!("creating {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    fn record_path(&self, file_id: i64) -> PathBuf {
        self.metadata_dir.join(format!("{file_id}.json"))
    }

    /// Whole-file rewrite via temp-file-then-rename, the standard atomic
    /// write pattern across this pack's JSON stores. Takes `Arc<Self>` so it
    /// can debounce the memo invalidation in a spawned task.
    pub async fn save(self: &Arc<Self>, record: &MetadataRecord) -> AppResult<()> {
        let path = self.record_path(record.file_id);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| AppError::Corrupted(format!("serializing record: {e}")))?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| AppError::Corrupted(format!("writing {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| AppError::Corrupted(format!("renaming into {}: {e}", path.display())))?;
        self.invalidate_after_debounce();
        Ok(())
    }

    pub async fn delete(self: &Arc<Self>, file_id: i64) -> AppResult<()> {
        let path = self.record_path(file_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AppError::Corrupted(format!("removing {}: {e}", path.display()))),
        }
        self.invalidate_after_debounce();
        Ok(())
    }

    /// Loads a single record, applying read-time auto-fix. A promotion
    /// (movie -> tv) is re-persisted; a demotion is in-memory only.
    pub async fn load(self: &Arc<Self>, file_id: i64) -> AppResult<Option<MetadataRecord>> {
        let path = self.record_path(file_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Corrupted(format!("reading {}: {e}", path.display()))),
        };
        let mut record: MetadataRecord = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Corrupted(format!("parsing {}: {e}", path.display())))?;
        if record.auto_fix() {
            self.save(&record).await?;
        }
        Ok(Some(record))
    }

    /// All valid records, snapshotted with a 1-hour TTL. Re-scans the
    /// metadata directory on miss.
    pub async fn all_valid(&self) -> AppResult<Arc<HashMap<i64, MetadataRecord>>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snap) = guard.as_ref() {
                if snap.loaded_at.elapsed() < SNAPSHOT_TTL {
                    return Ok(snap.records.clone());
                }
            }
        }
        self.reload_snapshot().await
    }

    /// Forces a snapshot refresh regardless of TTL; used after the sync loop passes
    /// that mutate multiple records, and by the 1s write-debounce.
    pub async fn reload_snapshot(&self) -> AppResult<Arc<HashMap<i64, MetadataRecord>>> {
        let metadata_dir = self.metadata_dir.clone();
        let posters_dir = self.posters_dir.clone();
        let backdrops_dir = self.backdrops_dir.clone();
        let records = tokio::task::spawn_blocking(move || scan_valid_records(&metadata_dir, &posters_dir, &backdrops_dir))
            .await
            .map_err(|e| AppError::Corrupted(format!("scan task panicked: {e}")))??;
        let records = Arc::new(records);
        let mut guard = self.snapshot.write().await;
        *guard = Some(Snapshot {
            records: records.clone(),
            loaded_at: Instant::now(),
        });
        debug!(count = records.len(), "metadata snapshot reloaded");
        Ok(records)
    }

    /// Recomputes the per-show aggregate cache from the current valid
    /// record set and persists each aggregate to `tv_cache/{show_tmdb_id}.json`,
    /// removing files for shows that no longer have any valid episode. Run
    /// by the sync loop after any pass that mutated records.
    pub async fn rebuild_show_cache(&self) -> AppResult<()> {
        let valid = self.all_valid().await?;
        let mut by_show: HashMap<u64, Vec<&MetadataRecord>> = HashMap::new();
        for record in valid.values() {
            if let Some(tv) = &record.tv {
                by_show.entry(tv.show_tmdb_id).or_default().push(record);
            }
        }
        let mut rebuilt = HashMap::new();
        for (show_tmdb_id, records) in by_show {
            let first = records[0];
            let tv = first.tv.as_ref().expect("grouped by tv.show_tmdb_id");
            let mut aggregate = ShowAggregate {
                show_tmdb_id,
                show_title: tv.show_title.clone(),
                overview: first.overview.clone(),
                genres: first.genres.clone(),
                rating: first.rating,
                poster_path: first.poster_path.clone(),
                backdrop_path: first.backdrop_path.clone(),
                total_seasons: tv.total_seasons,
                total_episodes: tv.total_episodes,
                seasons: std::collections::BTreeMap::new(),
            };
            aggregate.rebuild_seasons(&records);
            rebuilt.insert(show_tmdb_id, Arc::new(aggregate));
        }
        self.persist_tv_cache(&rebuilt).await;
        let count = rebuilt.len();
        *self.show_cache.write().await = rebuilt;
        debug!(count, "show-aggregate cache rebuilt");
        Ok(())
    }

    async fn persist_tv_cache(&self, aggregates: &HashMap<u64, Arc<ShowAggregate>>) {
        for (show_tmdb_id, aggregate) in aggregates {
            let Ok(body) = serde_json::to_vec_pretty(aggregate.as_ref()) else { continue };
            let path = self.tv_cache_path(*show_tmdb_id);
            let tmp_path = path.with_extension("json.tmp");
            if tokio::fs::write(&tmp_path, &body).await.is_ok() {
                let _ = tokio::fs::rename(&tmp_path, &path).await;
            }
        }

        let stale: Vec<PathBuf> = match tokio::fs::read_dir(&self.tv_cache_dir).await {
            Ok(mut entries) => {
                let mut stale = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let kept = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse::<u64>().ok())
                        .is_some_and(|id| aggregates.contains_key(&id));
                    if !kept {
                        stale.push(path);
                    }
                }
                stale
            }
            Err(_) => Vec::new(),
        };
        for path in stale {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    fn tv_cache_path(&self, show_tmdb_id: u64) -> PathBuf {
        self.tv_cache_dir.join(format!("{show_tmdb_id}.json"))
    }

    pub async fn show_aggregate(&self, show_tmdb_id: u64) -> Option<Arc<ShowAggregate>> {
        self.show_cache.read().await.get(&show_tmdb_id).cloned()
    }

    pub async fn all_show_aggregates(&self) -> Vec<Arc<ShowAggregate>> {
        self.show_cache.read().await.values().cloned().collect()
    }

    pub fn invalidate_after_debounce(self: &Arc<Self>) {
        let this = self.clone();
        let generation = self.invalidate_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            tokio::time::sleep(INVALIDATE_DEBOUNCE).await;
            if this.invalidate_generation.load(Ordering::SeqCst) == generation {
                let _ = this.reload_snapshot().await;
            }
        });
    }

    /// Every on-disk record, auto-fixed but not filtered for validity —
    /// used by the sync loop's retry/image-repair passes, which need to see
    /// `needs_retry` records too.
    pub async fn all_raw(&self) -> AppResult<Vec<MetadataRecord>> {
        let metadata_dir = self.metadata_dir.clone();
        tokio::task::spawn_blocking(move || -> AppResult<Vec<MetadataRecord>> {
            let mut out = Vec::new();
            let entries = match std::fs::read_dir(&metadata_dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
                Err(e) => return Err(AppError::Corrupted(format!("reading {}: {e}", metadata_dir.display()))),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(bytes) = std::fs::read(&path) else { continue };
                let Ok(mut record) = serde_json::from_slice::<MetadataRecord>(&bytes) else { continue };
                record.auto_fix();
                out.push(record);
            }
            Ok(out)
        })
        .await
        .map_err(|e| AppError::Corrupted(format!("scan task panicked: {e}")))?
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn posters_dir(&self) -> &Path {
        &self.posters_dir
    }

    pub fn backdrops_dir(&self) -> &Path {
        &self.backdrops_dir
    }

    pub fn tv_cache_dir(&self) -> &Path {
        &self.tv_cache_dir
    }
}

fn scan_valid_records(
    metadata_dir: &Path,
    posters_dir: &Path,
    backdrops_dir: &Path,
) -> AppResult<HashMap<i64, MetadataRecord>> {
    let mut out = HashMap::new();
    let entries = match std::fs::read_dir(metadata_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(AppError::Corrupted(format!("reading {}: {e}", metadata_dir.display()))),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable metadata file");
                continue;
            }
        };
        let mut record: MetadataRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupted metadata file");
                continue;
            }
        };
        record.auto_fix();
        if !record.is_valid() {
            continue;
        }
        if let Some(poster) = &record.poster_path {
            if !image_present(posters_dir, backdrops_dir, poster) {
                continue;
            }
        }
        if let Some(backdrop) = &record.backdrop_path {
            if !image_present(posters_dir, backdrops_dir, backdrop) {
                continue;
            }
        }
        out.insert(record.file_id, record);
    }
    Ok(out)
}

fn image_present(posters_dir: &Path, backdrops_dir: &Path, relative: &str) -> bool {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    posters_dir.join(name).is_file() || backdrops_dir.join(name).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MediaKind;
    use chrono::Utc;

    fn valid_record(file_id: i64) -> MetadataRecord {
        let mut r = MetadataRecord::stub(file_id, format!("movie-{file_id}.mkv"));
        r.kind = MediaKind::Movie;
        r.title = "A Movie".into();
        r.tmdb_id = Some(42);
        r.fetched_at = Some(Utc::now());
        r.needs_retry = false;
        r
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(tmp.path()));
        store.ensure_dirs().await.unwrap();
        let record = valid_record(1);
        store.save(&record).await.unwrap();
        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.file_id, record.file_id);
        assert_eq!(loaded.title, record.title);
    }

    #[tokio::test]
    async fn all_valid_excludes_records_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(tmp.path()));
        store.ensure_dirs().await.unwrap();
        store.save(&valid_record(1)).await.unwrap();
        let mut stub = MetadataRecord::stub(2, "incomplete.mkv".into());
        stub.needs_retry = true;
        store.save(&stub).await.unwrap();

        let snapshot = store.reload_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&1));
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(tmp.path()));
        store.ensure_dirs().await.unwrap();
        assert!(store.load(999).await.unwrap().is_none());
    }
}
