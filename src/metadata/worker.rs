//! The enrichment worker. Grounded on `other_examples/b5ffab40_drmckay-
//! homeflix__server-src-presentation-http-handlers-media_handlers.rs` for
//! the movie-vs-episode branch and on `other_examples/a07e981b_abarnes6-
//! presence-for-plex__src-plex_server.rs` for the external-id lookup shape.
//! The per-show in-flight guard reuses the chunk cache's `SingleFlightGroup`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::error::AppError;
use crate::probe::MediaProbe;
use crate::remote::RemoteClient;
use crate::util::SingleFlightGroup;

use super::filename::{self, FilenameInfo};
use super::store::MetadataStore;
use super::tmdb::{MediaDetails, TmdbClient};
use super::{FailureKind, MediaKind, MetadataRecord, RetryDescriptor, TvInfo};

const MAX_ATTEMPT_COUNT: u32 = 10;

fn backoff_for(attempt_index: u32) -> Duration {
    match attempt_index {
        0 => Duration::from_secs(3600),
        1 => Duration::from_secs(6 * 3600),
        2 => Duration::from_secs(24 * 3600),
        _ => Duration::from_secs(7 * 24 * 3600),
    }
}

fn failure_kind_for(error: &AppError) -> FailureKind {
    match error {
        AppError::NotFound => FailureKind::NotFound,
        AppError::RateLimited { .. } => FailureKind::RateLimited,
        AppError::Timeout | AppError::RemoteError(_) | AppError::Unavailable => FailureKind::NetworkError,
        AppError::Corrupted(_) => FailureKind::Corrupted,
        _ => FailureKind::PendingTmdb,
    }
}

pub struct MetadataWorker {
    store: Arc<MetadataStore>,
    tmdb: Arc<TmdbClient>,
    remote: Arc<dyn RemoteClient>,
    probe: Arc<MediaProbe>,
    activity: ActivityTracker,
    show_inflight: SingleFlightGroup<u64, Option<Arc<MediaDetails>>>,
}

impl MetadataWorker {
    pub fn new(
        store: Arc<MetadataStore>,
        tmdb: Arc<TmdbClient>,
        remote: Arc<dyn RemoteClient>,
        probe: Arc<MediaProbe>,
        activity: ActivityTracker,
    ) -> Self {
        Self {
            store,
            tmdb,
            remote,
            probe,
            activity,
            show_inflight: SingleFlightGroup::new(),
        }
    }

    /// Processes a batch of newly-discovered or re-queued files: classifies
    /// each, runs movies individually and TV episodes grouped by show so
    /// the "one show fetch per batch" invariant holds.
    pub async fn process_batch(&self, files: Vec<(i64, String)>) {
        let mut movies = Vec::new();
        let mut shows: HashMap<String, Vec<(i64, String, FilenameInfo)>> = HashMap::new();

        for (file_id, file_name) in files {
            let info = filename::classify(&file_name);
            if info.is_tv() {
                shows.entry(info.normalized_title.clone()).or_default().push((file_id, file_name, info));
            } else {
                movies.push((file_id, file_name, info));
            }
        }

        for (file_id, file_name, info) in movies {
            self.activity.wait_if_busy().await;
            if let Err(e) = self.process_movie(file_id, &file_name, &info).await {
                warn!(file_id, error = %e, "movie enrichment failed");
            }
            self.cooperative_sleep().await;
        }

        for (show_key, episodes) in shows {
            self.activity.wait_if_busy().await;
            self.process_show_group(&show_key, episodes).await;
        }
    }

    async fn cooperative_sleep(&self) {
        if self.activity.session_count().await > 0 {
            tokio::time::sleep(Duration::from_secs(2)).await;
        } else {
            tokio::time::sleep(Duration::from_millis(jitter_millis(150, 500))).await;
        }
    }

    async fn process_movie(&self, file_id: i64, file_name: &str, info: &FilenameInfo) -> Result<(), AppError> {
        if let Some(part) = info.part_number {
            if part > 1 {
                if let Some(first_part) = self.find_part_one(info).await? {
                    let mut copy = first_part;
                    copy.file_id = file_id;
                    copy.file_name = file_name.to_string();
                    copy.part_number = Some(part);
                    copy.is_split = true;
                    self.store.save(&copy).await?;
                    info!(file_id, part, "movie part linked to existing tmdb match");
                    return Ok(());
                }
            }
        }

        // Reuse the existing record rather than a fresh stub so an admin
        // fix's `manual_tmdb_id` and a rename's `needs_refetch` survive the
        // round trip instead of being silently reset.
        let mut record = self
            .store
            .load(file_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| MetadataRecord::stub(file_id, file_name.to_string()));
        record.file_name = file_name.to_string();
        record.part_number = info.part_number;
        record.needs_refetch = false;
        if let Some(tracks) = self.detect_tracks(file_id).await {
            record.audio_tracks = tracks.0;
            record.subtitle_tracks = tracks.1;
        }
        self.store.save(&record).await?;

        // An admin fix carries its own tmdb id forward across stub saves
        // and skips the search step entirely.
        let target_tmdb_id = match record.manual_tmdb_id {
            Some(id) => id,
            None => {
                let hit = self.tmdb.search_movie(&info.normalized_title, info.year).await;
                match hit {
                    Ok(Some(hit)) => hit.tmdb_id,
                    Ok(None) => {
                        self.mark_retry(&mut record, FailureKind::NotFound).await?;
                        return Ok(());
                    }
                    Err(e) => {
                        self.mark_retry(&mut record, failure_kind_for(&e)).await?;
                        return Ok(());
                    }
                }
            }
        };

        match self.tmdb.movie_details(target_tmdb_id).await {
            Ok(details) => {
                self.apply_movie_details(&mut record, &details);
                self.download_movie_images(file_id, &details).await;
                record.needs_retry = false;
                record.retry = None;
                record.fetched_at = Some(Utc::now());
                self.store.save(&record).await?;
                info!(file_id, tmdb_id = details.tmdb_id, "movie enriched");
            }
            Err(e) => self.mark_retry(&mut record, failure_kind_for(&e)).await?,
        }
        Ok(())
    }

    async fn find_part_one(&self, info: &FilenameInfo) -> Result<Option<MetadataRecord>, AppError> {
        let all = self.store.all_valid().await?;
        Ok(all
            .values()
            .find(|r| {
                let same_part_one = matches!(r.part_number, None | Some(1));
                let same_title = filename::classify(&r.file_name).normalized_title == info.normalized_title;
                same_part_one && same_title && r.year == info.year
            })
            .cloned())
    }

    fn apply_movie_details(&self, record: &mut MetadataRecord, details: &MediaDetails) {
        record.kind = MediaKind::Movie;
        record.title = details.title.clone();
        record.overview = details.overview.clone();
        record.genres = details.genres.clone();
        record.rating = details.rating;
        record.runtime = details.runtime;
        record.year = details.year.or(record.year);
        record.tmdb_id = Some(details.tmdb_id);
        record.poster_path = details.poster_path.as_ref().map(|_| format!("{}.jpg", record.file_id));
        record.backdrop_path = details
            .backdrop_path
            .as_ref()
            .map(|_| format!("{}_bd.jpg", record.file_id));
    }

    /// Poster/backdrop destinations for movies are keyed by `file_id`, not
    /// `tmdb_id`, so multi-part records sharing one tmdb match still each
    /// get their own image file.
    async fn download_movie_images(&self, file_id: i64, details: &MediaDetails) {
        if let Some(poster) = &details.poster_path {
            let dest = self.store.posters_dir().join(format!("{file_id}.jpg"));
            let _ = self.tmdb.download_image(poster, &dest).await;
        }
        if let Some(backdrop) = &details.backdrop_path {
            let dest = self.store.backdrops_dir().join(format!("{file_id}_bd.jpg"));
            let _ = self.tmdb.download_image(backdrop, &dest).await;
        }
    }

    async fn process_show_group(&self, show_key: &str, episodes: Vec<(i64, String, FilenameInfo)>) {
        // An admin fix on any episode in this group carries its manual tmdb
        // id forward for the whole show and skips the title search entirely,
        // the same way `process_movie` honors a movie's `manual_tmdb_id`.
        let mut manual_show_id: Option<u64> = None;
        for (file_id, _, _) in &episodes {
            if let Ok(Some(existing)) = self.store.load(*file_id).await {
                if let Some(id) = existing.manual_tmdb_id {
                    manual_show_id = Some(id);
                    break;
                }
            }
        }

        let tmdb = self.tmdb.clone();
        let details = if let Some(manual_id) = manual_show_id {
            tmdb.show_details(manual_id).await.ok().map(Arc::new)
        } else {
            let search_title = show_key.to_string();
            self.show_inflight
                .work(
                    {
                        // key the single-flight group by a stable hash of the
                        // title rather than the title itself until we know the
                        // real show_tmdb_id; collisions just mean one extra
                        // fetch, never incorrect data.
                        let mut acc: u64 = 1469598103934665603;
                        for b in search_title.bytes() {
                            acc ^= b as u64;
                            acc = acc.wrapping_mul(1099511628211);
                        }
                        acc
                    },
                    move || async move {
                        match tmdb.search_show(&search_title).await {
                            Ok(Some(hit)) => tmdb.show_details(hit.tmdb_id).await.ok().map(Arc::new),
                            _ => None,
                        }
                    },
                )
                .await
        };

        let Some(details) = details else {
            for (file_id, file_name, _info) in episodes {
                let mut record = self
                    .store
                    .load(file_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| MetadataRecord::stub(file_id, file_name));
                let _ = self.mark_retry(&mut record, FailureKind::NotFound).await;
            }
            return;
        };

        self.download_show_images(&details).await;

        for (file_id, file_name, info) in episodes {
            self.activity.wait_if_busy().await;
            if let Err(e) = self.process_episode(file_id, &file_name, &info, &details).await {
                warn!(file_id, error = %e, "episode enrichment failed");
            }
            self.cooperative_sleep().await;
        }
    }

    async fn download_show_images(&self, details: &MediaDetails) {
        if let Some(poster) = &details.poster_path {
            let dest = self
                .store
                .posters_dir()
                .join(format!("show_{}.jpg", details.tmdb_id));
            let _ = self.tmdb.download_image(poster, &dest).await;
        }
        if let Some(backdrop) = &details.backdrop_path {
            let dest = self
                .store
                .backdrops_dir()
                .join(format!("show_{}_bd.jpg", details.tmdb_id));
            let _ = self.tmdb.download_image(backdrop, &dest).await;
        }
    }

    async fn process_episode(
        &self,
        file_id: i64,
        file_name: &str,
        info: &FilenameInfo,
        show: &MediaDetails,
    ) -> Result<(), AppError> {
        let Some(se) = info.season_episode else {
            return Ok(());
        };
        // Reuse the existing record, as `process_movie` does, so an admin
        // fix's `manual_tmdb_id` survives instead of being thrown away by a
        // fresh stub on every re-enrichment pass.
        let mut record = self
            .store
            .load(file_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| MetadataRecord::stub(file_id, file_name.to_string()));
        record.file_name = file_name.to_string();
        record.needs_refetch = false;
        if let Some(tracks) = self.detect_tracks(file_id).await {
            record.audio_tracks = tracks.0;
            record.subtitle_tracks = tracks.1;
        }

        let episode_details = self.tmdb.episode_details(show.tmdb_id, se.season, se.episode).await;
        let (episode_title, episode_overview) = match episode_details {
            Ok(d) => (d.title, d.overview),
            Err(e) => {
                debug!(file_id, error = %e, "episode detail fetch failed, falling back to show-level data");
                (None, None)
            }
        };

        record.kind = MediaKind::Tv;
        record.title = show.title.clone();
        record.overview = show.overview.clone();
        record.genres = show.genres.clone();
        record.rating = show.rating;
        record.year = show.year;
        record.tmdb_id = Some(show.tmdb_id);
        record.poster_path = show.poster_path.as_ref().map(|_| format!("show_{}.jpg", show.tmdb_id));
        record.backdrop_path = show
            .backdrop_path
            .as_ref()
            .map(|_| format!("show_{}_bd.jpg", show.tmdb_id));
        record.tv = Some(TvInfo {
            show_tmdb_id: show.tmdb_id,
            show_title: show.title.clone(),
            season: se.season,
            episode: se.episode,
            episode_title,
            episode_overview,
            total_seasons: show.total_seasons,
            total_episodes: show.total_episodes,
        });
        record.needs_retry = false;
        record.retry = None;
        record.fetched_at = Some(Utc::now());
        self.store.save(&record).await?;
        Ok(())
    }

    async fn mark_retry(&self, record: &mut MetadataRecord, kind: FailureKind) -> Result<(), AppError> {
        let attempt_count = record
            .retry
            .as_ref()
            .map(|r| (r.attempt_count + 1).min(MAX_ATTEMPT_COUNT))
            .unwrap_or(1);
        record.needs_retry = true;
        record.retry = Some(RetryDescriptor {
            failure_kind: kind,
            attempt_count,
            last_attempt_at: Utc::now(),
        });
        self.store.save(record).await
    }

    fn is_eligible_for_retry(record: &MetadataRecord) -> bool {
        match &record.retry {
            None => true,
            Some(r) => {
                let elapsed = Utc::now().signed_duration_since(r.last_attempt_at);
                let required = backoff_for(r.attempt_count.saturating_sub(1));
                elapsed.to_std().map(|e| e >= required).unwrap_or(true)
            }
        }
    }

    /// Sweeps `needs_retry` records whose backoff has elapsed. TV episodes
    /// are grouped by show so the single-fetch-per-show invariant still
    /// holds across a retry pass.
    pub async fn retry_failed_lookups(&self) {
        let Ok(all) = self.store.all_raw().await else { return };
        let due: Vec<_> = all
            .into_iter()
            .filter(|r| r.needs_retry && Self::is_eligible_for_retry(r))
            .collect();
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "retrying failed metadata lookups");
        let files = due.into_iter().map(|r| (r.file_id, r.file_name)).collect();
        self.process_batch(files).await;
    }

    /// Re-fetches images for otherwise-valid records whose poster/backdrop
    /// is missing or dangling, one external lookup per distinct tmdb id.
    pub async fn retry_missing_images(&self) {
        let Ok(all) = self.store.all_raw().await else { return };
        // Caches fetched details by tmdb id so a show with many episodes
        // (or a movie split into several parts) triggers one external
        // lookup even though every part needs its own image write.
        let mut details_cache: HashMap<u64, MediaDetails> = HashMap::new();
        for record in all {
            if record.needs_retry {
                continue;
            }
            let Some(tmdb_id) = record.tmdb_id else { continue };
            let poster_missing = record
                .poster_path
                .as_ref()
                .map(|p| !self.store.posters_dir().join(p).is_file())
                .unwrap_or(false);
            let backdrop_missing = record
                .backdrop_path
                .as_ref()
                .map(|p| !self.store.backdrops_dir().join(p).is_file())
                .unwrap_or(false);
            if !poster_missing && !backdrop_missing {
                continue;
            }
            let is_tv = record.effective_type() == MediaKind::Tv;
            let details = if let Some(cached) = details_cache.get(&tmdb_id) {
                cached.clone()
            } else {
                let fetched = if is_tv {
                    self.tmdb.show_details(tmdb_id).await
                } else {
                    self.tmdb.movie_details(tmdb_id).await
                };
                let Ok(fetched) = fetched else { continue };
                details_cache.insert(tmdb_id, fetched.clone());
                fetched
            };
            if is_tv {
                self.download_show_images(&details).await;
            } else {
                self.download_movie_images(record.file_id, &details).await;
            }
        }
    }

    async fn detect_tracks(
        &self,
        file_id: i64,
    ) -> Option<(Vec<crate::probe::AudioStreamInfo>, Vec<crate::probe::SubtitleStreamInfo>)> {
        let handle = self.remote.resolve(file_id).await.ok()?;
        let info = self.probe.probe(&handle).await?;
        Some((info.audio_streams.clone(), info.subtitle_streams.clone()))
    }
}

/// A cheap, dependency-free jitter source: this only needs to spread sleeps
/// across a few hundred milliseconds, not produce real randomness.
fn jitter_millis(min: u64, max: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    min + nanos % (max - min + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_follows_retry_ladder() {
        assert_eq!(backoff_for(0), Duration::from_secs(3600));
        assert_eq!(backoff_for(1), Duration::from_secs(6 * 3600));
        assert_eq!(backoff_for(2), Duration::from_secs(24 * 3600));
        assert_eq!(backoff_for(3), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(backoff_for(9), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn failure_kind_maps_not_found() {
        assert_eq!(failure_kind_for(&AppError::NotFound), FailureKind::NotFound);
        assert_eq!(
            failure_kind_for(&AppError::RateLimited { retry_after_secs: Some(5) }),
            FailureKind::RateLimited
        );
    }
}
