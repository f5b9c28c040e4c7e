//! HTTP byte ranges
//!
//! Single-range forms only: `bytes=start-end`, `bytes=start-` and
//! `bytes=-suffix`. Anything else is unsatisfiable.

use super::ContentError;

/// Inclusive byte range within an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parse a `Range` header against an object of `size` bytes
pub fn parse_range_header(header: &str, size: u64) -> Result<ByteRange, ContentError> {
    let unsatisfiable = || ContentError::RangeNotSatisfiable { size };

    let range_set = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(unsatisfiable)?
        .trim();

    if range_set.contains(',') {
        return Err(unsatisfiable());
    }

    let (start, end) = range_set.split_once('-').ok_or_else(unsatisfiable)?;
    let (start, end) = (start.trim(), end.trim());

    let range = if start.is_empty() {
        // Suffix range: bytes=-500 means the last 500 bytes
        let suffix: u64 = end.parse().map_err(|_| unsatisfiable())?;
        if suffix == 0 || size == 0 {
            return Err(unsatisfiable());
        }
        ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        }
    } else {
        let start: u64 = start.parse().map_err(|_| unsatisfiable())?;
        let end: u64 = if end.is_empty() {
            // Open-ended range: bytes=1000-
            size.checked_sub(1).ok_or_else(unsatisfiable)?
        } else {
            end.parse().map_err(|_| unsatisfiable())?
        };
        ByteRange { start, end }
    };

    if range.start >= size || range.end >= size || range.start > range.end {
        return Err(unsatisfiable());
    }

    Ok(range)
}
