//! Path arbitration: title sanitization, existence checks and filename
//! shortening for file systems that reject long names.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use super::error::DownloadError;

/// Maximum UTF-8 byte length of a sanitized title.
pub const MAX_TITLE_BYTES: usize = 150;

/// Ratio applied to a stem each time the file system rejects it as too long.
const SHRINK_RATIO: f64 = 0.8;

const ELLIPSIS: char = '…';

#[cfg(any(target_os = "linux", target_os = "android"))]
const ENAMETOOLONG: i32 = 36;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
const ENAMETOOLONG: i32 = 63;
#[cfg(windows)]
const ENAMETOOLONG: i32 = 206; // ERROR_FILENAME_EXCED_RANGE
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
const ENAMETOOLONG: i32 = 36;

/// Turns a title into a file-name-safe string.
///
/// HTML entities are unescaped, surrounding whitespace trimmed, the characters
/// `/ \ : * ? " < > |` and control characters removed, and the result cut to
/// [`MAX_TITLE_BYTES`] on a char boundary. These steps repeat until the title
/// stops changing, so nested entities such as `&amp;amp;` are fully decoded
/// and sanitizing a sanitized title is a no-op. A non-empty `extra` is
/// sanitized the same way and appended as `-{extra}`.
///
/// ```
/// use mediadl_core::download::sanitize;
///
/// assert_eq!(sanitize("a/b: c?", None), "ab c");
/// assert_eq!(sanitize("Tom &amp; Jerry", Some("P1")), "Tom & Jerry-P1");
/// ```
#[must_use]
pub fn sanitize(title: &str, extra: Option<&str>) -> String {
    let base = clean_component(title);
    match extra.map(clean_component) {
        Some(extra) if !extra.is_empty() => {
            if base.is_empty() {
                extra
            } else {
                format!("{base}-{extra}")
            }
        }
        _ => base,
    }
}

fn clean_component(raw: &str) -> String {
    // every pass that changes the value shortens it, so this terminates
    let mut current = clean_pass(raw);
    loop {
        let next = clean_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_pass(raw: &str) -> String {
    let unescaped = html_unescape(raw.trim());
    let filtered: String = unescaped
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    truncate_utf8(filtered.trim(), MAX_TITLE_BYTES)
        .trim_end()
        .to_string()
}

fn truncate_utf8(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Unescapes the HTML entities titles commonly carry.
///
/// Unknown named entities are left untouched.
#[must_use]
pub fn html_unescape(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let Some(semi) = tail.find(';').filter(|&i| i <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        match decode_entity(entity) {
            Some(ch) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let numeric = entity.strip_prefix('#')?;
            let code = if let Some(hex) = numeric
                .strip_prefix('x')
                .or_else(|| numeric.strip_prefix('X'))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                numeric.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}

/// Shortens `s` to at most `max_chars` characters by keeping its head and tail
/// around a single `…`.
#[must_use]
pub fn eclipse(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    let half = max_chars.saturating_sub(1) / 2;
    let head: String = s.chars().take(half).collect();
    let tail: String = s.chars().skip(count - half).collect();
    format!("{head}{ELLIPSIS}{tail}")
}

/// Checks whether `path` exists, shortening its file name while the file
/// system reports it as too long.
///
/// Returns `(exists, usable_path)`. Each shortening keeps the extension and
/// cuts the stem to 80% of its length.
///
/// # Errors
///
/// Returns [`DownloadError::FilenameTooLong`] when `retry` shortenings were not
/// enough, or [`DownloadError::Io`] for any other file system error.
pub async fn path_check(path: &Path, retry: u32) -> Result<(bool, PathBuf), DownloadError> {
    let mut candidate = path.to_path_buf();
    for _ in 0..=retry {
        match tokio::fs::try_exists(&candidate).await {
            Ok(exists) => return Ok((exists, candidate)),
            Err(error) if is_name_too_long(&error) => {
                let shortened = shorten_file_name(&candidate);
                debug!(
                    from = %candidate.display(),
                    to = %shortened.display(),
                    "file name too long, shortening"
                );
                if shortened == candidate {
                    break;
                }
                candidate = shortened;
            }
            Err(error) => return Err(DownloadError::io(candidate, error)),
        }
    }
    Err(DownloadError::FilenameTooLong { path: candidate })
}

fn is_name_too_long(error: &io::Error) -> bool {
    error.raw_os_error() == Some(ENAMETOOLONG)
}

fn shorten_file_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let target = (stem.chars().count() as f64 * SHRINK_RATIO) as usize;
    path.with_file_name(format!("{}{suffix}", eclipse(&stem, target)))
}

/// Last non-empty path segment of a URL, percent-decoded.
#[must_use]
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.rfind(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    let cleaned = sanitize(&decoded, None);
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Lower-cased extension (with dot) of the URL path, if it looks like one.
#[must_use]
pub fn extension_from_url(url: &str) -> Option<String> {
    let name = file_name_from_url(url)?;
    let dot_index = name.rfind('.')?;
    let ext = &name[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Parses a Content-Disposition header value to extract the file name.
///
/// Handles:
/// - `attachment; filename="example.mp4"`
/// - `attachment; filename=example.mp4`
/// - `attachment; filename*=UTF-8''example.mp4` (RFC 5987)
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Appends `suffix` to the file name of `path` (`a/b.mp4` + `-v` → `a/b.mp4-v`).
#[must_use]
pub fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_removes_reserved_characters() {
        let out = sanitize(r#" a/b\c:d*e?f"g<h>i|j "#, None);
        assert_eq!(out, "abcdefghij");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "Tom &amp; Jerry: the <movie>",
            "  spaced  ",
            "&amp;amp;",
            "中文标题 | 第1集",
        ];
        for input in inputs {
            let once = sanitize(input, Some("P1"));
            assert_eq!(sanitize(&once, None), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_sanitize_decodes_nested_entities_to_a_fixed_point() {
        let long = format!("{} &amp;amp; tail", "word ".repeat(40));
        let inputs = [
            "Tom &amp;amp; Jerry",
            "&amp;amp;amp;lt;",
            "&am/p;",
            "&amp;#58;colon",
            long.as_str(),
        ];
        for input in inputs {
            let once = sanitize(input, None);
            assert_eq!(sanitize(&once, None), once, "not idempotent for {input:?}");
        }
        assert_eq!(sanitize("Tom &amp;amp; Jerry", None), "Tom & Jerry");
        assert_eq!(sanitize("&am/p;", None), "&");
    }

    #[test]
    fn test_sanitize_truncates_on_utf8_bytes() {
        let title = "视".repeat(100); // 300 bytes
        let out = sanitize(&title, None);
        assert!(out.len() <= MAX_TITLE_BYTES);
        assert_eq!(out.chars().count(), 50);
    }

    #[test]
    fn test_sanitize_appends_extra_only_when_non_empty() {
        assert_eq!(sanitize("Title", Some("")), "Title");
        assert_eq!(sanitize("Title", Some("P2-Part")), "Title-P2-Part");
        assert_eq!(sanitize("Title", Some(" / ")), "Title");
    }

    #[test]
    fn test_html_unescape_numeric_and_named() {
        assert_eq!(html_unescape("&#39;quoted&#x27;"), "'quoted'");
        assert_eq!(html_unescape("a &lt;b&gt; &unknown; c"), "a <b> &unknown; c");
        assert_eq!(html_unescape("R&D"), "R&D");
    }

    #[test]
    fn test_eclipse_keeps_head_and_tail() {
        assert_eq!(eclipse("abcdefghij", 20), "abcdefghij");
        let out = eclipse("abcdefghij", 8);
        assert_eq!(out, "abc…hij");
        assert!(out.chars().count() <= 8);
    }

    #[test]
    fn test_shorten_file_name_keeps_suffix() {
        let path = Path::new("/tmp").join(format!("{}.mp4", "x".repeat(100)));
        let shortened = shorten_file_name(&path);
        assert_eq!(shortened.extension().unwrap(), "mp4");
        let stem_len = shortened.file_stem().unwrap().to_string_lossy().chars().count();
        assert!(stem_len <= 80, "stem length {stem_len}");
        assert!(shortened.to_string_lossy().contains('…'));
    }

    #[tokio::test]
    async fn test_path_check_reports_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("video.mp4");
        assert_eq!(path_check(&path, 100).await.unwrap(), (false, path.clone()));

        std::fs::write(&path, b"data").unwrap();
        assert_eq!(path_check(&path, 100).await.unwrap(), (true, path));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_path_check_shortens_overlong_names() {
        let temp_dir = TempDir::new().unwrap();
        let long_name = format!("{}.mp4", "长".repeat(200)); // 600 bytes
        let path = temp_dir.path().join(long_name);

        let (exists, usable) = path_check(&path, 100).await.unwrap();
        assert!(!exists);
        assert_eq!(usable.extension().unwrap(), "mp4");
        assert!(usable.file_name().unwrap().len() <= 255);
        std::fs::write(&usable, b"ok").unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_path_check_gives_up_without_retries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(format!("{}.ts", "a".repeat(400)));
        let result = path_check(&path, 0).await;
        assert!(matches!(result, Err(DownloadError::FilenameTooLong { .. })));
    }

    #[test]
    fn test_file_name_from_url_decodes_last_segment() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/a/my%20clip.mp4?x=1").as_deref(),
            Some("my clip.mp4")
        );
        assert_eq!(file_name_from_url("https://cdn.example.com/").as_deref(), None);
        assert_eq!(
            extension_from_url("https://i0.example.com/cover.JPG").as_deref(),
            Some(".jpg")
        );
    }

    #[test]
    fn test_parse_content_disposition_variants() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="clip.mp4""#).as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=clip.mp4; size=3").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''%E8%A7%86.mp4").as_deref(),
            Some("视.mp4")
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_with_name_suffix() {
        assert_eq!(
            with_name_suffix(Path::new("/d/Hello"), "-v"),
            PathBuf::from("/d/Hello-v")
        );
    }
}
