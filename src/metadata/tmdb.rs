//! The external metadata API client, upstream of the enrichment worker. Grounded on
//! `other_examples/b5ffab40_drmckay-homeflix__server-src-presentation-http-
//! handlers-media_handlers.rs` for field naming (`tmdb_id`, `poster_path`,
//! `backdrop_path`) and on `other_examples/a07e981b_abarnes6-presence-for-
//! plex__src-plex_server.rs` for the "pull an external id, retry without a
//! disambiguator" idiom (here: retry a movie search without `year`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::remote::RateGate;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub tmdb_id: u64,
    pub title: String,
    pub year: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaDetails {
    pub tmdb_id: u64,
    pub title: String,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    pub rating: Option<f64>,
    pub runtime: Option<u32>,
    pub year: Option<u32>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub total_seasons: Option<u32>,
    pub total_episodes: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeDetails {
    pub title: Option<String>,
    pub overview: Option<String>,
}

pub struct TmdbClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    image_base_url: String,
    gate: RateGate,
}

impl TmdbClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, image_base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            image_base_url: image_base_url.into(),
            // ~40 calls/s, a window just under 1s, to stay under the external API's rate limit.
            gate: RateGate::new(Duration::from_millis(25)),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> AppResult<T> {
        self.gate.wait().await;
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).query(&[("api_key", self.api_key.clone())]);
        if !query.is_empty() {
            request = request.query(query);
        }
        let resp = tokio::time::timeout(DEFAULT_TIMEOUT, request.send())
            .await
            .map_err(|_| AppError::Timeout)?
            .map_err(|e| AppError::RemoteError(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(AppError::RateLimited { retry_after_secs });
        }
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound);
        }
        if !resp.status().is_success() {
            return Err(AppError::RemoteError(format!("tmdb status {}", resp.status())));
        }
        resp.json().await.map_err(|e| AppError::Corrupted(format!("parsing tmdb response: {e}")))
    }

    /// Searches for a movie, retrying once without `year` if the first
    /// attempt yields nothing — the "retry without disambiguator" idiom.
    pub async fn search_movie(&self, title: &str, year: Option<u32>) -> AppResult<Option<SearchHit>> {
        let mut query = vec![("query".to_string(), title.to_string())];
        if let Some(y) = year {
            query.push(("year".to_string(), y.to_string()));
        }
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let hit = self.search_once("/search/movie", &query).await?;
        if hit.is_some() || year.is_none() {
            return Ok(hit);
        }
        debug!(title, "movie search with year empty, retrying without year");
        self.search_once("/search/movie", &[("query", title.to_string())]).await
    }

    pub async fn search_show(&self, title: &str) -> AppResult<Option<SearchHit>> {
        self.search_once("/search/tv", &[("query", title.to_string())]).await
    }

    async fn search_once(&self, path: &str, query: &[(&str, String)]) -> AppResult<Option<SearchHit>> {
        #[derive(Deserialize)]
        struct SearchResponse {
            results: Vec<SearchResult>,
        }
        #[derive(Deserialize)]
        struct SearchResult {
            id: u64,
            #[serde(alias = "name")]
            title: String,
            #[serde(default, alias = "first_air_date")]
            release_date: Option<String>,
        }
        let response: SearchResponse = self.get_json(path, query).await?;
        Ok(response.results.into_iter().next().map(|r| SearchHit {
            tmdb_id: r.id,
            title: r.title,
            year: r.release_date.and_then(|d| d.get(0..4).and_then(|y| y.parse().ok())),
        }))
    }

    pub async fn movie_details(&self, tmdb_id: u64) -> AppResult<MediaDetails> {
        #[derive(Deserialize)]
        struct Response {
            id: u64,
            title: String,
            overview: Option<String>,
            #[serde(default)]
            genres: Vec<Genre>,
            vote_average: Option<f64>,
            runtime: Option<u32>,
            release_date: Option<String>,
            poster_path: Option<String>,
            backdrop_path: Option<String>,
        }
        #[derive(Deserialize)]
        struct Genre {
            name: String,
        }
        let r: Response = self.get_json(&format!("/movie/{tmdb_id}"), &[]).await?;
        Ok(MediaDetails {
            tmdb_id: r.id,
            title: r.title,
            overview: r.overview,
            genres: r.genres.into_iter().map(|g| g.name).collect(),
            rating: r.vote_average,
            runtime: r.runtime,
            year: r.release_date.and_then(|d| d.get(0..4).and_then(|y| y.parse().ok())),
            poster_path: r.poster_path,
            backdrop_path: r.backdrop_path,
            total_seasons: None,
            total_episodes: None,
        })
    }

    pub async fn show_details(&self, show_tmdb_id: u64) -> AppResult<MediaDetails> {
        #[derive(Deserialize)]
        struct Response {
            id: u64,
            name: String,
            overview: Option<String>,
            #[serde(default)]
            genres: Vec<Genre>,
            vote_average: Option<f64>,
            first_air_date: Option<String>,
            poster_path: Option<String>,
            backdrop_path: Option<String>,
            number_of_seasons: Option<u32>,
            number_of_episodes: Option<u32>,
        }
        #[derive(Deserialize)]
        struct Genre {
            name: String,
        }
        let r: Response = self.get_json(&format!("/tv/{show_tmdb_id}"), &[]).await?;
        Ok(MediaDetails {
            tmdb_id: r.id,
            title: r.name,
            overview: r.overview,
            genres: r.genres.into_iter().map(|g| g.name).collect(),
            rating: r.vote_average,
            runtime: None,
            year: r.first_air_date.and_then(|d| d.get(0..4).and_then(|y| y.parse().ok())),
            poster_path: r.poster_path,
            backdrop_path: r.backdrop_path,
            total_seasons: r.number_of_seasons,
            total_episodes: r.number_of_episodes,
        })
    }

    pub async fn episode_details(
        &self,
        show_tmdb_id: u64,
        season: u32,
        episode: u32,
    ) -> AppResult<EpisodeDetails> {
        #[derive(Deserialize)]
        struct Response {
            name: Option<String>,
            overview: Option<String>,
        }
        let r: Response = self
            .get_json(&format!("/tv/{show_tmdb_id}/season/{season}/episode/{episode}"), &[])
            .await?;
        Ok(EpisodeDetails {
            title: r.name,
            overview: r.overview,
        })
    }

    /// Downloads an image to `dest` unless a non-empty file already exists
    /// there.
    pub async fn download_image(&self, tmdb_path: &str, dest: &Path) -> AppResult<()> {
        if let Ok(meta) = tokio::fs::metadata(dest).await {
            if meta.len() > 0 {
                return Ok(());
            }
        }
        self.gate.wait().await;
        let url = format!("{}{}", self.image_base_url, tmdb_path);
        let resp = tokio::time::timeout(DEFAULT_TIMEOUT, self.http.get(&url).send())
            .await
            .map_err(|_| AppError::Timeout)?
            .map_err(|e| AppError::RemoteError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::RemoteError(format!("image fetch status {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| AppError::RemoteError(e.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| AppError::Corrupted(format!("writing {}: {e}", dest.display())))?;
        Ok(())
    }
}
