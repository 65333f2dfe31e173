//! Subtitle JSON to SRT conversion.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SubtitleDocument {
    body: Vec<Cue>,
}

#[derive(Debug, Deserialize)]
struct Cue {
    from: f64,
    to: f64,
    content: String,
}

/// Formats seconds as `HH:MM:SS,mmm`.
#[must_use]
pub fn srt_timestamp(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let s = total_ms / 1000;
    format!("{:02}:{:02}:{:02},{ms:03}", s / 3600, (s / 60) % 60, s % 60)
}

/// Converts a `{"body": [{"from", "to", "content"}]}` subtitle document to SRT.
///
/// # Errors
///
/// Returns the decoder error for malformed JSON.
pub fn json_to_srt(json: &str) -> Result<String, serde_json::Error> {
    let document: SubtitleDocument = serde_json::from_str(json)?;
    let mut out = String::new();
    for (idx, cue) in document.body.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            idx + 1,
            srt_timestamp(cue.from),
            srt_timestamp(cue.to),
            cue.content
        ));
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_srt_timestamp() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(3723.5), "01:02:03,500");
        assert_eq!(srt_timestamp(1.2346), "00:00:01,235");
    }

    #[test]
    fn test_json_to_srt() {
        let json = r#"{"font_size":0.4,"body":[
            {"from":0.5,"to":2.0,"location":2,"content":"hello"},
            {"from":61.0,"to":62.25,"location":2,"content":"world"}]}"#;
        assert_eq!(
            json_to_srt(json).unwrap(),
            "1\n00:00:00,500 --> 00:00:02,000\nhello\n\n2\n00:01:01,000 --> 00:01:02,250\nworld\n\n"
        );
        assert!(json_to_srt("{}").is_err());
    }
}
