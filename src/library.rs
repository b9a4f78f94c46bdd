//! The library aggregator. Grounded on `other_examples/b5ffab40_drmckay-
//! homeflix__server-src-presentation-http-handlers-media_handlers.rs`'s
//! `series_to_library_media`/grouped-library shape: flatten the metadata
//! store's valid records into the handful of list views the frontend reads.

use std::collections::HashMap;

use serde::Serialize;

use crate::metadata::store::MetadataStore;
use crate::metadata::{MediaKind, MetadataRecord};

#[derive(Debug, Clone, Serialize)]
pub struct MoviePart {
    pub file_id: i64,
    pub file_name: String,
    pub part_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MovieEntry {
    pub file_id: i64,
    pub tmdb_id: Option<u64>,
    pub title: String,
    pub year: Option<u32>,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    pub rating: Option<f64>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub is_split: bool,
    pub total_parts: usize,
    pub parts: Vec<MoviePart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TvShowEntry {
    pub show_tmdb_id: u64,
    pub title: String,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    pub rating: Option<f64>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub seasons: Vec<SeasonEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeasonEntry {
    pub season: u32,
    pub episodes: Vec<crate::metadata::EpisodeRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenreRow {
    pub genre: String,
    pub item_ids: Vec<LibraryItemRef>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LibraryItemRef {
    Movie { file_id: i64 },
    Show { show_tmdb_id: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct HeroItem {
    pub item: LibraryItemRef,
    pub title: String,
    pub backdrop_path: Option<String>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryCounts {
    pub movies: usize,
    pub tv_shows: usize,
    pub total_episodes: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct LibrarySnapshot {
    pub movies: Vec<MovieEntry>,
    pub tv_shows: Vec<TvShowEntry>,
    pub genre_rows: Vec<GenreRow>,
    pub hero_items: Vec<HeroItem>,
    pub counts: LibraryCounts,
}

impl Default for LibraryCounts {
    fn default() -> Self {
        Self { movies: 0, tv_shows: 0, total_episodes: 0 }
    }
}

const HERO_LIMIT: usize = 8;
const HERO_MIN_RATING: f64 = 5.0;

pub async fn build(store: &MetadataStore) -> LibrarySnapshot {
    let valid = match store.all_valid().await {
        Ok(v) => v,
        Err(_) => return LibrarySnapshot::default(),
    };

    let movie_records: Vec<&MetadataRecord> = valid
        .values()
        .filter(|r| r.effective_type() == MediaKind::Movie)
        .collect();
    let movies = group_movies(&movie_records);

    let shows = store.all_show_aggregates().await;
    let tv_shows: Vec<TvShowEntry> = shows
        .iter()
        .map(|agg| TvShowEntry {
            show_tmdb_id: agg.show_tmdb_id,
            title: agg.show_title.clone(),
            overview: agg.overview.clone(),
            genres: agg.genres.clone(),
            rating: agg.rating,
            poster_path: agg.poster_path.clone(),
            backdrop_path: agg.backdrop_path.clone(),
            seasons: agg
                .seasons
                .iter()
                .map(|(season, episodes)| SeasonEntry { season: *season, episodes: episodes.clone() })
                .collect(),
        })
        .collect();

    let genre_rows = build_genre_rows(&movies, &tv_shows);
    let hero_items = build_hero_items(&movies, &tv_shows);
    let total_episodes = shows.iter().map(|a| a.available_episode_count()).sum();

    LibrarySnapshot {
        counts: LibraryCounts {
            movies: movies.len(),
            tv_shows: tv_shows.len(),
            total_episodes,
        },
        movies,
        tv_shows,
        genre_rows,
        hero_items,
    }
}

/// Grouping strategy #1: records sharing a `tmdb_id` (>= 2) merge. Strategy
/// #2: records lacking `tmdb_id` but sharing a normalized title + a part
/// marker merge by filename grouping instead.
fn group_movies(records: &[&MetadataRecord]) -> Vec<MovieEntry> {
    let mut by_tmdb: HashMap<u64, Vec<&MetadataRecord>> = HashMap::new();
    let mut without_tmdb: Vec<&MetadataRecord> = Vec::new();
    for r in records {
        match r.tmdb_id {
            Some(id) => by_tmdb.entry(id).or_default().push(r),
            None => without_tmdb.push(r),
        }
    }

    let mut out = Vec::new();
    for (tmdb_id, mut group) in by_tmdb {
        group.sort_by_key(|r| (r.part_number.unwrap_or(0), r.file_name.clone()));
        out.push(build_movie_entry(Some(tmdb_id), &group));
    }

    let mut by_title: HashMap<String, Vec<&MetadataRecord>> = HashMap::new();
    for r in without_tmdb {
        let title = crate::metadata::filename::classify(&r.file_name).normalized_title;
        by_title.entry(title).or_default().push(r);
    }
    for (_, mut group) in by_title {
        group.sort_by_key(|r| (r.part_number.unwrap_or(0), r.file_name.clone()));
        out.push(build_movie_entry(None, &group));
    }

    out.sort_by(|a, b| a.title.cmp(&b.title));
    out
}

fn build_movie_entry(tmdb_id: Option<u64>, group: &[&MetadataRecord]) -> MovieEntry {
    let primary = group.iter().find(|r| r.part_number.is_none() || r.part_number == Some(1)).unwrap_or(&group[0]);
    let parts: Vec<MoviePart> = group
        .iter()
        .map(|r| MoviePart { file_id: r.file_id, file_name: r.file_name.clone(), part_number: r.part_number })
        .collect();
    MovieEntry {
        file_id: primary.file_id,
        tmdb_id,
        title: primary.title.clone(),
        year: primary.year,
        overview: primary.overview.clone(),
        genres: primary.genres.clone(),
        rating: primary.rating,
        poster_path: primary.poster_path.clone(),
        backdrop_path: primary.backdrop_path.clone(),
        is_split: group.len() > 1,
        total_parts: group.len(),
        parts,
    }
}

fn build_genre_rows(movies: &[MovieEntry], shows: &[TvShowEntry]) -> Vec<GenreRow> {
    let mut rows: HashMap<String, Vec<LibraryItemRef>> = HashMap::new();
    for m in movies {
        for g in &m.genres {
            rows.entry(g.clone()).or_default().push(LibraryItemRef::Movie { file_id: m.file_id });
        }
    }
    for s in shows {
        for g in &s.genres {
            rows.entry(g.clone()).or_default().push(LibraryItemRef::Show { show_tmdb_id: s.show_tmdb_id });
        }
    }
    let mut rows: Vec<GenreRow> = rows
        .into_iter()
        .filter(|(_, items)| items.len() >= 2)
        .map(|(genre, item_ids)| GenreRow { genre, item_ids })
        .collect();
    rows.sort_by(|a, b| b.item_ids.len().cmp(&a.item_ids.len()).then_with(|| a.genre.cmp(&b.genre)));
    rows
}

fn build_hero_items(movies: &[MovieEntry], shows: &[TvShowEntry]) -> Vec<HeroItem> {
    // Every movie/show is a candidate, backdrop or not, so the no-qualifiers
    // fallback below can still pick a top-rated item without one.
    let mut candidates: Vec<HeroItem> = Vec::new();
    for m in movies {
        candidates.push(HeroItem {
            item: LibraryItemRef::Movie { file_id: m.file_id },
            title: m.title.clone(),
            backdrop_path: m.backdrop_path.clone(),
            rating: m.rating,
        });
    }
    for s in shows {
        candidates.push(HeroItem {
            item: LibraryItemRef::Show { show_tmdb_id: s.show_tmdb_id },
            title: s.title.clone(),
            backdrop_path: s.backdrop_path.clone(),
            rating: s.rating,
        });
    }

    let mut qualified: Vec<HeroItem> = candidates
        .iter()
        .filter(|h| h.backdrop_path.is_some() && h.rating.unwrap_or(0.0) >= HERO_MIN_RATING)
        .cloned()
        .collect();
    qualified.sort_by(|a, b| b.rating.partial_cmp(&a.rating).unwrap_or(std::cmp::Ordering::Equal));

    if qualified.is_empty() {
        candidates.sort_by(|a, b| {
            b.rating
                .unwrap_or(-1.0)
                .partial_cmp(&a.rating.unwrap_or(-1.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(HERO_LIMIT);
        candidates
    } else {
        qualified.truncate(HERO_LIMIT);
        qualified
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub item: LibraryItemRef,
    pub title: String,
    pub score: u32,
    pub rating: Option<f64>,
}

/// Weighted search: exact title 100, prefix 80, substring 60, genre
/// substring 40, overview substring 20; ties broken by rating then title.
pub fn search(snapshot: &LibrarySnapshot, query: &str) -> Vec<SearchResult> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return Vec::new();
    }
    let mut results: Vec<SearchResult> = Vec::new();

    for m in &snapshot.movies {
        if let Some(score) = score_entry(&q, &m.title, &m.genres, m.overview.as_deref()) {
            results.push(SearchResult {
                item: LibraryItemRef::Movie { file_id: m.file_id },
                title: m.title.clone(),
                score,
                rating: m.rating,
            });
        }
    }
    for s in &snapshot.tv_shows {
        if let Some(score) = score_entry(&q, &s.title, &s.genres, s.overview.as_deref()) {
            results.push(SearchResult {
                item: LibraryItemRef::Show { show_tmdb_id: s.show_tmdb_id },
                title: s.title.clone(),
                score,
                rating: s.rating,
            });
        }
    }

    results.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.rating.partial_cmp(&a.rating).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.title.cmp(&b.title))
    });
    results
}

fn score_entry(query: &str, title: &str, genres: &[String], overview: Option<&str>) -> Option<u32> {
    let title_lower = title.to_lowercase();
    let mut score = 0u32;
    if title_lower == query {
        score = score.max(100);
    } else if title_lower.starts_with(query) {
        score = score.max(80);
    } else if title_lower.contains(query) {
        score = score.max(60);
    }
    if genres.iter().any(|g| g.to_lowercase().contains(query)) {
        score = score.max(40);
    }
    if let Some(overview) = overview {
        if overview.to_lowercase().contains(query) {
            score = score.max(20);
        }
    }
    if score == 0 {
        None
    } else {
        Some(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movie(title: &str, genre: &str, rating: Option<f64>) -> MovieEntry {
        MovieEntry {
            file_id: 1,
            tmdb_id: Some(1),
            title: title.to_string(),
            year: None,
            overview: Some("an overview".into()),
            genres: vec![genre.to_string()],
            rating,
            poster_path: None,
            backdrop_path: None,
            is_split: false,
            total_parts: 1,
            parts: vec![],
        }
    }

    #[test]
    fn search_ranks_exact_above_substring() {
        let snapshot = LibrarySnapshot {
            movies: vec![movie("The Matrix", "Action", Some(8.0)), movie("Matrix Reloaded", "Action", Some(7.0))],
            ..Default::default()
        };
        let results = search(&snapshot, "matrix reloaded");
        assert_eq!(results[0].title, "Matrix Reloaded");
    }

    #[test]
    fn genre_row_requires_at_least_two_items() {
        let movies = vec![movie("A", "Horror", Some(6.0))];
        let rows = build_genre_rows(&movies, &[]);
        assert!(rows.is_empty());
    }

    #[test]
    fn hero_items_fall_back_when_none_qualify() {
        let mut low = movie("Low Rated", "Drama", Some(2.0));
        low.backdrop_path = Some("x.jpg".into());
        let heroes = build_hero_items(&[low], &[]);
        assert_eq!(heroes.len(), 1);
    }

    #[test]
    fn hero_items_fall_back_includes_items_without_backdrops() {
        let no_backdrop_unrated = movie("No Backdrop", "Drama", None);
        let heroes = build_hero_items(&[no_backdrop_unrated], &[]);
        assert_eq!(heroes.len(), 1);
        assert!(heroes[0].backdrop_path.is_none());
    }
}
