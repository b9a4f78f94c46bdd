//! The subtitle extractor. Grounded on `transcoder.rs`'s child-process
//! pattern, pointed at `-c:s webvtt -f webvtt` against the internal loopback
//! endpoint, and on `other_examples/cee29479_izderadicka-audioserve`'s cache-or-bypass
//! split (there gated by a cargo feature; here by `start == 0`).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use moka::future::Cache;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use crate::error::{AppError, AppResult};

const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(120);
const PREFIX_PROBE_BYTES: usize = 4096;
const CACHE_CAPACITY: u64 = 50;

pub struct SubtitleExtractor {
    cache: Cache<(i64, u32), Bytes>,
    internal_base_url: String,
}

pub enum SubtitleBody {
    /// The `start == 0` case: the full VTT was already produced (and
    /// cached), so it is served as one chunk.
    Whole(Bytes),
    /// A mid-stream seek: bypasses the cache and streams as ffmpeg produces
    /// it, after the `WEBVTT` header has already been validated.
    Streaming(PrefixedStream),
}

impl SubtitleExtractor {
    pub fn new(internal_base_url: impl Into<String>) -> Self {
        Self {
            cache: Cache::builder().max_capacity(CACHE_CAPACITY).build(),
            internal_base_url: internal_base_url.into(),
        }
    }

    pub async fn extract(
        &self,
        file_id: i64,
        stream_index: u32,
        start_seconds: f64,
    ) -> AppResult<SubtitleBody> {
        if start_seconds == 0.0 {
            if let Some(cached) = self.cache.get(&(file_id, stream_index)).await {
                return Ok(SubtitleBody::Whole(cached));
            }
        }

        let url = format!("{}/internal/raw/{file_id}", self.internal_base_url);
        let mut args: Vec<String> = Vec::new();
        if start_seconds > 0.0 {
            args.extend(["-ss".into(), format!("{:.3}", start_seconds)]);
        }
        args.extend([
            "-i".into(),
            url,
            "-map".into(),
            format!("0:{stream_index}"),
            "-c:s".into(),
            "webvtt".into(),
            "-f".into(),
            "webvtt".into(),
            "pipe:1".into(),
        ]);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ToolMissing(format!("ffmpeg: {e}")))?;

        let mut stdout = child.stdout.take().expect("piped stdout");

        if start_seconds == 0.0 {
            let output = tokio::time::timeout(EXTRACTION_TIMEOUT, async {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await.map(|_| buf)
            })
            .await
            .map_err(|_| AppError::Timeout)?
            .map_err(|e| AppError::Corrupted(format!("reading subtitle output: {e}")))?;

            if !starts_with_webvtt(&output) {
                warn!(file_id, stream_index, "subtitle extraction missing WEBVTT header");
                return Err(AppError::Corrupted("ffmpeg did not produce a WEBVTT header".into()));
            }
            let bytes = Bytes::from(output);
            self.cache.insert((file_id, stream_index), bytes.clone()).await;
            Ok(SubtitleBody::Whole(bytes))
        } else {
            let mut prefix = vec![0u8; PREFIX_PROBE_BYTES];
            let n = tokio::time::timeout(EXTRACTION_TIMEOUT, stdout.read(&mut prefix))
                .await
                .map_err(|_| AppError::Timeout)?
                .map_err(|e| AppError::Corrupted(format!("reading subtitle output: {e}")))?;
            prefix.truncate(n);
            if !starts_with_webvtt(&prefix) {
                warn!(file_id, stream_index, "subtitle extraction missing WEBVTT header");
                return Err(AppError::Corrupted("ffmpeg did not produce a WEBVTT header".into()));
            }
            Ok(SubtitleBody::Streaming(PrefixedStream {
                prefix: Some(Bytes::from(prefix)),
                inner: tokio_util::io::ReaderStream::new(stdout),
                _child: Arc::new(child),
            }))
        }
    }
}

fn starts_with_webvtt(buf: &[u8]) -> bool {
    let trimmed = buf
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace() || *b == 0xEF || *b == 0xBB || *b == 0xBF)
        .collect::<Vec<u8>>();
    trimmed.starts_with(b"WEBVTT")
}

pub struct PrefixedStream {
    prefix: Option<Bytes>,
    inner: tokio_util::io::ReaderStream<tokio::process::ChildStdout>,
    _child: Arc<tokio::process::Child>,
}

impl Stream for PrefixedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(prefix) = this.prefix.take() {
            return std::task::Poll::Ready(Some(Ok(prefix)));
        }
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_webvtt_header_with_bom() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice(b"WEBVTT\n\n00:00.000 --> 00:01.000\nhi");
        assert!(starts_with_webvtt(&data));
    }

    #[test]
    fn rejects_non_webvtt_output() {
        assert!(!starts_with_webvtt(b"not a subtitle file"));
    }
}
