//! The metadata data model plus the components built on it: the on-disk
//! store, the enrichment worker, the TMDB-style client, and the filename
//! heuristic.

pub mod filename;
pub mod store;
pub mod tmdb;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::{AudioStreamInfo, SubtitleStreamInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Tv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    RateLimited,
    NetworkError,
    PendingTmdb,
    Corrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDescriptor {
    pub failure_kind: FailureKind,
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvInfo {
    pub show_tmdb_id: u64,
    pub show_title: String,
    pub season: u32,
    pub episode: u32,
    pub episode_title: Option<String>,
    pub episode_overview: Option<String>,
    pub total_seasons: Option<u32>,
    pub total_episodes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub file_id: i64,
    pub file_name: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<u32>,
    pub overview: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub rating: Option<f64>,
    pub runtime: Option<u32>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub tmdb_id: Option<u64>,
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub needs_retry: bool,
    pub retry: Option<RetryDescriptor>,
    /// Set by the admin refetch route or by the sync loop's rename
    /// reconciliation; drained on the record's next pass through the
    /// worker, which re-derives title/year from scratch.
    #[serde(default)]
    pub needs_refetch: bool,
    /// Set alongside an admin-supplied tmdb id, distinguishing an operator
    /// override from an id the worker found itself.
    #[serde(default, rename = "_manual_tmdb_id")]
    pub manual_tmdb_id: Option<u64>,
    pub tv: Option<TvInfo>,
    pub part_number: Option<u32>,
    #[serde(default)]
    pub is_split: bool,
    #[serde(default)]
    pub audio_tracks: Vec<AudioStreamInfo>,
    #[serde(default)]
    pub subtitle_tracks: Vec<SubtitleStreamInfo>,
}

impl MetadataRecord {
    /// `type` is derived, never independently authoritative: a record is TV
    /// iff it carries `tv.show_tmdb_id`.
    pub fn effective_type(&self) -> MediaKind {
        if self.tv.is_some() {
            MediaKind::Tv
        } else {
            MediaKind::Movie
        }
    }

    pub fn is_valid(&self) -> bool {
        self.file_id != 0
            && self.fetched_at.is_some()
            && self.tmdb_id.map(|id| id > 0).unwrap_or(false)
            && !self.title.is_empty()
            && !self.needs_retry
            && !self.needs_refetch
    }

    pub fn stub(file_id: i64, file_name: String) -> Self {
        Self {
            file_id,
            file_name,
            kind: MediaKind::Movie,
            title: String::new(),
            year: None,
            overview: None,
            genres: Vec::new(),
            rating: None,
            runtime: None,
            poster_path: None,
            backdrop_path: None,
            tmdb_id: None,
            fetched_at: None,
            needs_retry: true,
            retry: None,
            needs_refetch: false,
            manual_tmdb_id: None,
            tv: None,
            part_number: None,
            is_split: false,
            audio_tracks: Vec::new(),
            subtitle_tracks: Vec::new(),
        }
    }

    /// Applies the metadata store's read-time auto-fix rules, returning whether the record
    /// should be re-persisted (only the promotion case is; the demotion
    /// case is in-memory only).
    pub fn auto_fix(&mut self) -> bool {
        match (&self.tv, self.kind) {
            (Some(_), MediaKind::Movie) => {
                self.kind = MediaKind::Tv;
                true
            }
            (None, MediaKind::Tv) => {
                self.kind = MediaKind::Movie;
                false
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub file_id: i64,
    pub episode: u32,
    pub episode_title: Option<String>,
}

/// Derived per-show view, one on-disk aggregate per `show_tmdb_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowAggregate {
    pub show_tmdb_id: u64,
    pub show_title: String,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    pub rating: Option<f64>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub total_seasons: Option<u32>,
    pub total_episodes: Option<u32>,
    pub seasons: std::collections::BTreeMap<u32, Vec<EpisodeRef>>,
}

impl ShowAggregate {
    pub fn available_seasons(&self) -> Vec<u32> {
        self.seasons.keys().copied().collect()
    }

    pub fn available_episode_count(&self) -> usize {
        self.seasons.values().map(|v| v.len()).sum()
    }

    /// Rebuilds the episode map from the current set of valid TV records
    /// sharing this show id, sorted by `(season, episode)` with duplicates
    /// collapsed (most recently fetched wins).
    pub fn rebuild_seasons(&mut self, records: &[&MetadataRecord]) {
        let mut seasons: std::collections::BTreeMap<u32, Vec<EpisodeRef>> =
            std::collections::BTreeMap::new();
        for record in records {
            let Some(tv) = &record.tv else { continue };
            if tv.show_tmdb_id != self.show_tmdb_id {
                continue;
            }
            let entry = seasons.entry(tv.season).or_default();
            if let Some(existing) = entry.iter_mut().find(|e: &&mut EpisodeRef| e.episode == tv.episode) {
                existing.file_id = record.file_id;
                existing.episode_title = tv.episode_title.clone();
            } else {
                entry.push(EpisodeRef {
                    file_id: record.file_id,
                    episode: tv.episode,
                    episode_title: tv.episode_title.clone(),
                });
            }
        }
        for episodes in seasons.values_mut() {
            episodes.sort_by_key(|e| e.episode);
        }
        self.seasons = seasons;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> MetadataRecord {
        let mut r = MetadataRecord::stub(1, "x.mkv".into());
        r.title = "X".into();
        r.tmdb_id = Some(5);
        r.fetched_at = Some(Utc::now());
        r.needs_retry = false;
        r
    }

    #[test]
    fn tv_auto_fix_promotes_when_show_id_present() {
        let mut r = base_record();
        r.kind = MediaKind::Movie;
        r.tv = Some(TvInfo {
            show_tmdb_id: 1399,
            show_title: "Show".into(),
            season: 1,
            episode: 1,
            episode_title: None,
            episode_overview: None,
            total_seasons: None,
            total_episodes: None,
        });
        let persisted = r.auto_fix();
        assert!(persisted);
        assert_eq!(r.effective_type(), MediaKind::Tv);
    }

    #[test]
    fn tv_auto_fix_demotes_in_memory_only_when_show_id_missing() {
        let mut r = base_record();
        r.kind = MediaKind::Tv;
        r.tv = None;
        let persisted = r.auto_fix();
        assert!(!persisted);
        assert_eq!(r.kind, MediaKind::Movie);
    }

    #[test]
    fn valid_requires_all_fields() {
        let r = base_record();
        assert!(r.is_valid());
        let mut missing_title = r.clone();
        missing_title.title.clear();
        assert!(!missing_title.is_valid());
    }
}
