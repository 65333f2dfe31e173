//! Parsers for user-facing unit strings: byte sizes, time ranges and page ranges.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::expect_used)]
static BYTE_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(\d+(?:\.\d+)?)\s*([KMGTPEZY]?)B?$").expect("byte size regex is valid")
});

/// A `[start, end]` window in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    /// Start in seconds.
    pub start: f64,
    /// End in seconds.
    pub end: f64,
}

impl TimeRange {
    /// Length of the window in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_seconds(self.start), format_seconds(self.end))
    }
}

fn format_seconds(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// Parses a size such as `10`, `1.5M`, `200 KB` (1000-based).
///
/// ```
/// use mediadl_core::parse_byte_size;
///
/// assert_eq!(parse_byte_size("1.5MB"), Some(1_500_000.0));
/// assert_eq!(parse_byte_size("2k"), Some(2000.0));
/// assert_eq!(parse_byte_size("fast"), None);
/// ```
#[must_use]
pub fn parse_byte_size(value: &str) -> Option<f64> {
    let caps = BYTE_SIZE_RE.captures(value.trim())?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default();
    let exponent = match unit.as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        "Z" => 7,
        "Y" => 8,
        _ => return None,
    };
    Some(number * 1000f64.powi(exponent))
}

/// Parses one time endpoint: `HH:MM:SS`, `MM:SS` or plain seconds.
#[must_use]
pub fn parse_time_point(value: &str) -> Option<f64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return None;
    }
    let mut seconds = 0.0;
    for part in &parts {
        let n: f64 = part.trim().parse().ok()?;
        if n < 0.0 {
            return None;
        }
        seconds = seconds * 60.0 + n;
    }
    Some(seconds)
}

/// Parses `START-END` where each endpoint is accepted by [`parse_time_point`].
///
/// The end must be after the start.
///
/// ```
/// use mediadl_core::parse_time_range;
///
/// let range = parse_time_range("00:00:10-01:30").unwrap();
/// assert_eq!((range.start, range.end), (10.0, 90.0));
/// assert!(parse_time_range("30-10").is_none());
/// ```
#[must_use]
pub fn parse_time_range(value: &str) -> Option<TimeRange> {
    let (start, end) = value.split_once('-')?;
    let start = parse_time_point(start)?;
    let end = parse_time_point(end)?;
    (end > start).then_some(TimeRange { start, end })
}

/// Converts a 1-based inclusive page range into a 0-based half-open one
/// clamped to `len`.
#[must_use]
pub fn page_slice(range: (usize, usize), len: usize) -> std::ops::Range<usize> {
    let (first, last) = range;
    let start = first.saturating_sub(1).min(len);
    let end = last.min(len).max(start);
    start..end
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size_units() {
        assert_eq!(parse_byte_size("100"), Some(100.0));
        assert_eq!(parse_byte_size("100B"), Some(100.0));
        assert_eq!(parse_byte_size("1.5 MB"), Some(1_500_000.0));
        assert_eq!(parse_byte_size("3G"), Some(3e9));
        assert_eq!(parse_byte_size("1kb"), Some(1000.0));
        assert_eq!(parse_byte_size("1.MB"), None);
        assert_eq!(parse_byte_size("-1M"), None);
        assert_eq!(parse_byte_size("1Q"), None);
    }

    #[test]
    fn test_parse_time_point_forms() {
        assert_eq!(parse_time_point("01:02:03"), Some(3723.0));
        assert_eq!(parse_time_point("02:03"), Some(123.0));
        assert_eq!(parse_time_point("42"), Some(42.0));
        assert_eq!(parse_time_point("4.5"), Some(4.5));
        assert_eq!(parse_time_point("1:2:3:4"), None);
        assert_eq!(parse_time_point("a:b"), None);
        assert_eq!(parse_time_point(""), None);
    }

    #[test]
    fn test_parse_time_range_requires_order() {
        let range = parse_time_range("5-23").unwrap();
        assert_eq!(range, TimeRange { start: 5.0, end: 23.0 });
        assert_eq!(range.duration(), 18.0);
        assert_eq!(range.to_string(), "5-23");
        assert!(parse_time_range("10-10").is_none());
        assert!(parse_time_range("10").is_none());
    }

    #[test]
    fn test_page_slice_is_one_based_inclusive() {
        assert_eq!(page_slice((1, 3), 10), 0..3);
        assert_eq!(page_slice((2, 2), 10), 1..2);
        assert_eq!(page_slice((5, 20), 8), 4..8);
        assert_eq!(page_slice((9, 12), 8), 8..8);
        assert_eq!(page_slice((0, 1), 8), 0..1);
    }
}
