//! The media probe. Grounded on `other_examples/cee29479_izderadicka-
//! audioserve__src-services-transcode-mod.rs`'s child-process invocation
//! pattern (`tokio::process::Command` + `tokio::time::timeout` around
//! `child.wait()`), pointed at `ffprobe -show_streams -of json` over a
//! bounded prefix pulled through the chunk cache.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::error::AppResult;
use crate::remote::{ChunkCache, RemoteFileHandle};

const PROBE_PREFIX_BYTES: u64 = 5 * 1024 * 1024;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Codecs a browser can direct-play without a server-side remux.
const BROWSER_PLAYABLE_AUDIO_CODECS: &[&str] = &["aac", "mp3", "opus", "vorbis", "flac"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub channels: u32,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleStreamInfo {
    pub stream_index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub is_text_based: bool,
    pub is_image_based: bool,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub container: String,
    pub duration_seconds: Option<f64>,
    pub audio_streams: Vec<AudioStreamInfo>,
    pub subtitle_streams: Vec<SubtitleStreamInfo>,
}

impl MediaInfo {
    pub fn is_browser_playable(&self, audio_track_index: Option<u32>) -> bool {
        let track = match audio_track_index {
            Some(idx) => self.audio_streams.iter().find(|s| s.index == idx),
            None => self
                .audio_streams
                .iter()
                .find(|s| s.is_default)
                .or_else(|| self.audio_streams.first()),
        };
        match track {
            Some(s) => BROWSER_PLAYABLE_AUDIO_CODECS.contains(&s.codec.as_str()),
            None => true,
        }
    }

    pub fn default_audio_track(&self) -> Option<u32> {
        self.audio_streams
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.audio_streams.first())
            .map(|s| s.index)
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: String,
    codec_name: Option<String>,
    channels: Option<u32>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
    disposition: Option<FfprobeDisposition>,
}

#[derive(Deserialize)]
struct FfprobeDisposition {
    default: Option<i32>,
}

/// Caches probe results by file id; probing is expensive and a file's
/// streams never change underneath a stable remote id.
pub struct MediaProbe {
    cache: Cache<i64, Arc<MediaInfo>>,
    chunk_cache: Arc<ChunkCache>,
}

impl MediaProbe {
    pub fn new(chunk_cache: Arc<ChunkCache>) -> Self {
        Self {
            cache: Cache::builder().max_capacity(10_000).build(),
            chunk_cache,
        }
    }

    /// Returns `None` (never an error) when `ffprobe` is absent or the probe
    /// fails — callers degrade gracefully rather than surface `ToolMissing`.
    pub async fn probe(&self, handle: &RemoteFileHandle) -> Option<Arc<MediaInfo>> {
        if let Some(cached) = self.cache.get(&handle.id).await {
            return Some(cached);
        }
        match self.probe_uncached(handle).await {
            Ok(info) => {
                let info = Arc::new(info);
                self.cache.insert(handle.id, info.clone()).await;
                Some(info)
            }
            Err(e) => {
                warn!(file_id = handle.id, error = %e, "media probe failed, degrading");
                None
            }
        }
    }

    async fn probe_uncached(&self, handle: &RemoteFileHandle) -> AppResult<MediaInfo> {
        let end = handle.size.min(PROBE_PREFIX_BYTES);
        let prefix = self.chunk_cache.read_range(handle, 0, end).await?;

        let mut child = Command::new("ffprobe")
            .args([
                "-v", "quiet",
                "-print_format", "json",
                "-show_format",
                "-show_streams",
                "-i", "pipe:0",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| crate::error::AppError::ToolMissing(format!("ffprobe: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&prefix).await;
        }

        let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| crate::error::AppError::Timeout)?
            .map_err(|e| crate::error::AppError::ToolMissing(format!("ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(crate::error::AppError::Corrupted(
                "ffprobe exited with an error".into(),
            ));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| crate::error::AppError::Corrupted(format!("unparseable ffprobe output: {e}")))?;

        let mut audio_streams = Vec::new();
        let mut subtitle_streams = Vec::new();
        for stream in parsed.streams {
            match stream.codec_type.as_str() {
                "audio" => audio_streams.push(AudioStreamInfo {
                    index: stream.index,
                    codec: stream.codec_name.unwrap_or_default(),
                    language: stream.tags.get("language").cloned(),
                    channels: stream.channels.unwrap_or(2),
                    is_default: stream.disposition.and_then(|d| d.default).unwrap_or(0) == 1,
                }),
                "subtitle" => {
                    let codec = stream.codec_name.unwrap_or_default();
                    let is_image_based = matches!(codec.as_str(), "hdmv_pgs_subtitle" | "dvd_subtitle" | "dvb_subtitle");
                    subtitle_streams.push(SubtitleStreamInfo {
                        stream_index: stream.index,
                        codec: codec.clone(),
                        language: stream.tags.get("language").cloned(),
                        is_text_based: !is_image_based,
                        is_image_based,
                    });
                }
                _ => {}
            }
        }

        Ok(MediaInfo {
            container: parsed.format.format_name,
            duration_seconds: parsed.format.duration.and_then(|d| d.parse().ok()),
            audio_streams,
            subtitle_streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(codecs: &[(&str, bool)]) -> MediaInfo {
        MediaInfo {
            container: "mov,mp4,m4a,3gp,3g2,mj2".into(),
            duration_seconds: Some(120.0),
            audio_streams: codecs
                .iter()
                .enumerate()
                .map(|(i, (codec, is_default))| AudioStreamInfo {
                    index: i as u32,
                    codec: codec.to_string(),
                    language: None,
                    channels: 2,
                    is_default: *is_default,
                })
                .collect(),
            subtitle_streams: vec![],
        }
    }

    #[test]
    fn default_aac_track_is_browser_playable() {
        let m = info(&[("aac", true), ("dts", false)]);
        assert!(m.is_browser_playable(None));
        assert_eq!(m.default_audio_track(), Some(0));
    }

    #[test]
    fn selecting_dts_track_is_not_browser_playable() {
        let m = info(&[("aac", true), ("dts", false)]);
        assert!(!m.is_browser_playable(Some(1)));
    }
}
