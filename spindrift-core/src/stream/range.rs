//! HTTP Range header resolution.
//!
//! Lenient where the RFC allows it: an absent or malformed header falls
//! back to a full-body response. Only a syntactically valid range that
//! starts at or past end-of-file is a hard 416.

use std::fmt;

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    // An inclusive range holds at least one byte, so no is_empty() pair.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Range start {start} beyond file size {file_size}")]
    NotSatisfiable { start: u64, file_size: u64 },
}

/// Resolves a `Range` header value against a known file size.
///
/// Returns `Ok(None)` when the whole file should be served: no header,
/// an unparsable header, or an inverted range. `end` past the file is
/// clamped rather than rejected, matching what players send while
/// probing.
///
/// # Errors
/// - `RangeError::NotSatisfiable` - Valid syntax but `start` is at or
///   past end-of-file
pub fn resolve_range(
    header: Option<&str>,
    file_size: u64,
) -> Result<Option<ByteRange>, RangeError> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };

    // Multi-range requests are answered with the full body.
    if spec.contains(',') {
        return Ok(None);
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };

    if start_str.is_empty() {
        // Suffix form: last N bytes.
        let Ok(suffix) = end_str.trim().parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || file_size == 0 {
            return Ok(None);
        }
        let start = file_size.saturating_sub(suffix);
        return Ok(Some(ByteRange {
            start,
            end: file_size - 1,
        }));
    }

    let Ok(start) = start_str.trim().parse::<u64>() else {
        return Ok(None);
    };
    if start >= file_size {
        return Err(RangeError::NotSatisfiable { start, file_size });
    }

    let end = if end_str.trim().is_empty() {
        file_size - 1
    } else {
        match end_str.trim().parse::<u64>() {
            Ok(end) if end >= start => end.min(file_size - 1),
            _ => return Ok(None),
        }
    };

    Ok(Some(ByteRange { start, end }))
}
