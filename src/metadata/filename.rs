//! Filename heuristic: classifies a raw file name into title/year/season/
//! episode/part fields the enrichment worker and library aggregator both
//! need before they can do anything else. Grounded on `fritztv/src/
//! channels.rs`'s `parse_m3u` idiom: compile static patterns once, map
//! captures into a typed struct.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SEASON_EPISODE: Regex = Regex::new(r"(?i)s(\d{1,2})e(\d{1,3})").unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    static ref PART: Regex = Regex::new(r"(?i)\bpart[\s._-]*([0-9]+)\b").unwrap();
    static ref TAG_BRACKETS: Regex = Regex::new(r"[\[(][^\])]*[\])]").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonEpisode {
    pub season: u32,
    pub episode: u32,
}

#[derive(Debug, Clone)]
pub struct FilenameInfo {
    /// Lowercased, punctuation-collapsed title, used as the grouping key
    /// for part-less movie matching and show-key derivation.
    pub normalized_title: String,
    pub year: Option<u32>,
    pub season_episode: Option<SeasonEpisode>,
    pub part_number: Option<u32>,
}

impl FilenameInfo {
    pub fn is_tv(&self) -> bool {
        self.season_episode.is_some()
    }
}

pub fn classify(file_name: &str) -> FilenameInfo {
    let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
    let working = stem.replace(['.', '_'], " ");

    let season_episode = SEASON_EPISODE.captures(&working).map(|c| SeasonEpisode {
        season: c[1].parse().unwrap_or(0),
        episode: c[2].parse().unwrap_or(0),
    });
    let year = YEAR
        .captures(&working)
        .and_then(|c| c[1].parse::<u32>().ok());
    let part_number = PART.captures(&working).and_then(|c| c[1].parse::<u32>().ok());

    let mut title_source = TAG_BRACKETS.replace_all(&working, " ").to_string();
    if let Some(se) = &season_episode {
        title_source = SEASON_EPISODE.replace(&title_source, "").to_string();
        let _ = se; // only used to decide whether to strip
    }
    title_source = YEAR.replace(&title_source, "").to_string();
    title_source = PART.replace(&title_source, "").to_string();

    let normalized_title = normalize(&title_source);

    FilenameInfo {
        normalized_title,
        year,
        season_episode,
        part_number,
    }
}

/// Lowercases, strips non-alphanumerics, collapses whitespace — used so
/// `"The.Matrix.1999.mkv"` and `"The Matrix (1999).mkv"` group together.
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tv_episode() {
        let info = classify("Breaking.Bad.S01E03.720p.mkv");
        assert_eq!(info.season_episode, Some(SeasonEpisode { season: 1, episode: 3 }));
        assert!(info.is_tv());
    }

    #[test]
    fn classifies_movie_with_year_and_part() {
        let info = classify("The Matrix (1999) Part 2.mkv");
        assert_eq!(info.year, Some(1999));
        assert_eq!(info.part_number, Some(2));
        assert!(!info.is_tv());
        assert_eq!(info.normalized_title, "the matrix");
    }

    #[test]
    fn normalizes_separators_consistently() {
        let a = classify("The.Matrix.1999.mkv");
        let b = classify("The Matrix (1999).mkv");
        assert_eq!(a.normalized_title, b.normalized_title);
    }
}
