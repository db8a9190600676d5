//! HTTP `Range` header parsing
//!
//! Only the single-range form `bytes=<start>-<end>` is accepted, with `<end>`
//! optional. Intervals are inclusive on both ends, matching HTTP.

use crate::error::{Error, Result};

const BYTES_PREFIX: &str = "bytes=";

/// Inclusive byte interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range, `start <= end` is the caller's responsibility
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    /// The whole resource, `None` if it is empty
    pub fn full(total: u64) -> Option<Self> {
        total.checked_sub(1).map(|end| ByteRange { start: 0, end })
    }

    /// Number of bytes covered
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` response header
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// `Content-Range` value sent with a 416 for a resource of `total` bytes
pub fn unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// Parse a `Range` header value against a resource of `total` bytes.
///
/// A leading `-` on the start position is treated as a sign, so
/// `bytes=-1-10` is a negative start rather than a three-part header.
pub fn parse_range(header: &str, total: u64) -> Result<ByteRange> {
    let spec = header
        .trim()
        .strip_prefix(BYTES_PREFIX)
        .ok_or_else(|| Error::MalformedRange(format!("expected '{}' prefix", BYTES_PREFIX)))?;

    let (start_str, end_str) = split_bounds(spec)
        .ok_or_else(|| Error::MalformedRange(format!("expected <start>-<end>, got '{}'", spec)))?;

    let start = parse_bound(start_str)?;
    let end = if end_str.is_empty() {
        i128::from(total) - 1
    } else {
        parse_bound(end_str)?
    };

    if start < 0 {
        return Err(Error::RangeNotSatisfiable(format!(
            "start {} is negative",
            start
        )));
    }
    if start > end {
        return Err(Error::RangeNotSatisfiable(format!(
            "start {} is past end {}",
            start, end
        )));
    }
    if end >= i128::from(total) {
        return Err(Error::RangeNotSatisfiable(format!(
            "end {} is beyond resource size {}",
            end, total
        )));
    }

    // Both bounds are within [0, total) here
    Ok(ByteRange::new(start as u64, end as u64))
}

/// Split `<start>-<end>` into exactly two parts, skipping a sign on `start`
fn split_bounds(spec: &str) -> Option<(&str, &str)> {
    let sign_len = usize::from(spec.starts_with('-'));
    let dash = spec[sign_len..].find('-')? + sign_len;
    let (start, end) = (&spec[..dash], &spec[dash + 1..]);

    if start.is_empty() || end.contains('-') {
        return None;
    }
    Some((start, end))
}

fn parse_bound(s: &str) -> Result<i128> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::MalformedRange(format!("'{}' is not an integer", s)));
    }
    s.parse::<i128>()
        .map_err(|_| Error::MalformedRange(format!("'{}' is out of range", s)))
}
