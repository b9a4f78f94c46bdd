//! HTTP range serving for the public and internal streaming endpoints. Grounded on `fritztv/src/lib.rs`'s
//! `hls_segment_handler`/`stream_handler` Range-header parsing and
//! 206/416 response building, generalized from a fixed in-memory segment to
//! chunked reads through the chunk cache.

pub mod internal;
pub mod range;

use crate::error::{AppError, AppResult};

/// An inclusive-end byte range resolved against a known total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// Parses a single `Range: bytes=a-b` header against `total_len`. Returns
/// `Ok(None)` for a missing header (full-length response), `Ok(Some(_))`
/// for a satisfiable range, and `Err(RangeNotSatisfiable)` otherwise. Only
/// ever serves one range per request; a multi-range `Range` header is
/// rejected rather than answered with `multipart/byteranges`.
pub fn parse_range_header(header: Option<&str>, total_len: u64) -> AppResult<Option<ByteRange>> {
    let Some(header) = header else {
        return Ok(None);
    };
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::BadRequest("range unit must be bytes".into()))?;
    if spec.contains(',') {
        return Err(AppError::BadRequest("multiple ranges not supported".into()));
    }
    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| AppError::BadRequest("malformed range".into()))?;

    if total_len == 0 {
        return Err(AppError::RangeNotSatisfiable { total_len });
    }

    let range = if start_str.is_empty() {
        // suffix range: bytes=-N means "last N bytes"
        let suffix_len: u64 = end_str
            .parse()
            .map_err(|_| AppError::BadRequest("malformed range".into()))?;
        if suffix_len == 0 {
            return Err(AppError::RangeNotSatisfiable { total_len });
        }
        let start = total_len.saturating_sub(suffix_len);
        ByteRange {
            start,
            end_inclusive: total_len - 1,
        }
    } else {
        let start: u64 = start_str
            .parse()
            .map_err(|_| AppError::BadRequest("malformed range".into()))?;
        let end_inclusive = if end_str.is_empty() {
            total_len - 1
        } else {
            end_str
                .parse()
                .map_err(|_| AppError::BadRequest("malformed range".into()))?
        };
        ByteRange { start, end_inclusive }
    };

    if range.start >= total_len || range.end_inclusive >= total_len || range.start > range.end_inclusive {
        return Err(AppError::RangeNotSatisfiable { total_len });
    }

    Ok(Some(range))
}

/// Content-type sniffing by extension, defaulting to `video/mp4` for an
/// unrecognized or missing extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        _ => "video/mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_range_is_full_length() {
        assert_eq!(parse_range_header(None, 1000).unwrap(), None);
    }

    #[test]
    fn unaligned_range_scenario() {
        let range = parse_range_header(Some("bytes=500-1500000"), 10_000_000)
            .unwrap()
            .unwrap();
        assert_eq!(range.start, 500);
        assert_eq!(range.end_inclusive, 1_500_000);
        assert_eq!(range.len(), 1_499_501);
    }

    #[test]
    fn out_of_range_is_416() {
        let err = parse_range_header(Some("bytes=20000000-"), 10_000_000).unwrap_err();
        assert!(matches!(err, AppError::RangeNotSatisfiable { total_len: 10_000_000 }));
    }

    #[test]
    fn open_ended_range_reaches_end_of_file() {
        let range = parse_range_header(Some("bytes=900-"), 1000).unwrap().unwrap();
        assert_eq!(range.start, 900);
        assert_eq!(range.end_inclusive, 999);
    }

    #[test]
    fn suffix_range_returns_last_n_bytes() {
        let range = parse_range_header(Some("bytes=-100"), 1000).unwrap().unwrap();
        assert_eq!(range.start, 900);
        assert_eq!(range.end_inclusive, 999);
    }

    #[test]
    fn content_type_defaults_to_mp4() {
        assert_eq!(content_type_for("movie.mkv"), "video/x-matroska");
        assert_eq!(content_type_for("movie"), "video/mp4");
    }
}
