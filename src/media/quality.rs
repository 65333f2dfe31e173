//! Quality and codec selection for dash manifests.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use super::{DashManifest, Stream};

/// Requested video quality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    /// Position in the distinct quality ids, best first; clamped to the
    /// lowest available.
    Index(usize),
    /// Case-insensitive prefix of a format description (`1080p`).
    Label(String),
}

impl Default for Quality {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl FromStr for Quality {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(s.parse::<usize>()
            .map_or_else(|_| Self::Label(s.to_string()), Self::Index))
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Requested codecs as `video:audio` prefixes. Empty matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecChoice {
    /// Video codec prefix (`hev`, `avc1`).
    pub video: String,
    /// Audio codec prefix (`fLaC`, `ec-3`).
    pub audio: String,
}

impl FromStr for CodecChoice {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (video, audio) = s.split_once(':').unwrap_or((s, ""));
        Ok(Self {
            video: video.trim().to_string(),
            audio: audio.trim().to_string(),
        })
    }
}

impl fmt::Display for CodecChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.video, self.audio)
    }
}

/// Chooses a video stream and, when the manifest has audio, an audio stream.
///
/// Returns `None` when no video stream matches, or when audio exists but none
/// matches the requested audio codec.
///
/// ```
/// use mediadl_core::media::{DashManifest, Stream, StreamKind, choose_quality, Quality, CodecChoice};
///
/// let v = |label: &str, id, codec: &str| {
///     Stream::new(StreamKind::Video, vec![format!("{label}-{codec}")])
///         .with_quality(label, id)
///         .with_codec(codec)
/// };
/// let manifest = DashManifest {
///     videos: vec![v("1080P", 80, "avc1"), v("1080P", 80, "hev1"), v("720P", 64, "avc1")],
///     ..DashManifest::default()
/// };
/// let (video, audio) = choose_quality(&manifest, &Quality::Index(9), &"".parse().unwrap()).unwrap();
/// assert_eq!(video.quality, "720P");
/// assert!(audio.is_none());
/// ```
#[must_use]
pub fn choose_quality<'a>(
    manifest: &'a DashManifest,
    quality: &Quality,
    codec: &CodecChoice,
) -> Option<(&'a Stream, Option<&'a Stream>)> {
    let video_codec_matches = |stream: &&Stream| stream.codec.starts_with(&codec.video);

    let video = match quality {
        Quality::Label(label) => {
            let label = label.to_lowercase();
            let format = manifest
                .videos
                .iter()
                .find(|s| s.quality.to_lowercase().starts_with(&label))?;
            manifest
                .videos
                .iter()
                .filter(|s| s.quality_id == format.quality_id)
                .find(video_codec_matches)?
        }
        Quality::Index(index) => {
            let mut ids: Vec<u32> = Vec::new();
            for stream in &manifest.videos {
                if !ids.contains(&stream.quality_id) {
                    ids.push(stream.quality_id);
                }
            }
            ids.sort_unstable_by(|a, b| b.cmp(a));
            let id = *ids.get((*index).min(ids.len().checked_sub(1)?))?;
            manifest
                .videos
                .iter()
                .filter(|s| s.quality_id == id)
                .find(video_codec_matches)?
        }
    };

    let mut audio_streams = manifest.audio_streams().peekable();
    if audio_streams.peek().is_none() {
        return Some((video, None));
    }
    let audio = audio_streams.find(|s| s.codec.starts_with(&codec.audio))?;
    Some((video, Some(audio)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::StreamKind;

    fn video(label: &str, id: u32, codec: &str) -> Stream {
        Stream::new(StreamKind::Video, vec![format!("v-{id}-{codec}")])
            .with_quality(label, id)
            .with_codec(codec)
    }

    fn audio(codec: &str) -> Stream {
        Stream::new(StreamKind::Audio, vec![format!("a-{codec}")]).with_codec(codec)
    }

    fn manifest() -> DashManifest {
        DashManifest {
            duration: 60.0,
            videos: vec![
                video("1080P 60帧", 116, "avc1.640032"),
                video("1080P 60帧", 116, "hev1.1.6.L150"),
                video("720P 高清", 64, "avc1.640028"),
                video("360P 流畅", 16, "avc1.64001E"),
                video("360P 流畅", 16, "hev1.1.6.L120"),
            ],
            audios: vec![audio("mp4a.40.2")],
            dolby: vec![audio("ec-3")],
            flac: vec![audio("fLaC")],
        }
    }

    fn codec(s: &str) -> CodecChoice {
        s.parse().unwrap()
    }

    #[test]
    fn test_index_quality_orders_and_clamps() {
        let m = manifest();
        let (v, a) = choose_quality(&m, &Quality::Index(0), &codec("")).unwrap();
        assert_eq!(v.quality_id, 116);
        assert_eq!(v.codec, "avc1.640032");
        assert_eq!(a.unwrap().codec, "mp4a.40.2");

        let (v, _) = choose_quality(&m, &Quality::Index(999), &codec("hev")).unwrap();
        assert_eq!(v.quality_id, 16);
        assert!(v.codec.starts_with("hev"));
    }

    #[test]
    fn test_label_quality_is_case_insensitive_prefix() {
        let m = manifest();
        let (v, _) = choose_quality(&m, &Quality::Label("1080p".into()), &codec("hev")).unwrap();
        assert_eq!(v.codec, "hev1.1.6.L150");

        assert!(choose_quality(&m, &Quality::Label("4K".into()), &codec("")).is_none());
        assert!(choose_quality(&m, &Quality::Label("720P".into()), &codec("hev")).is_none());
    }

    #[test]
    fn test_audio_scans_dolby_and_flac() {
        let m = manifest();
        let (_, a) = choose_quality(&m, &Quality::Index(0), &codec(":ec-3")).unwrap();
        assert_eq!(a.unwrap().codec, "ec-3");
        let (_, a) = choose_quality(&m, &Quality::Index(0), &codec("hev:fLaC")).unwrap();
        assert_eq!(a.unwrap().codec, "fLaC");
        assert!(choose_quality(&m, &Quality::Index(0), &codec(":opus")).is_none());
    }

    #[test]
    fn test_no_audio_streams_yields_video_only() {
        let m = DashManifest {
            videos: vec![video("480P", 32, "avc1")],
            ..DashManifest::default()
        };
        let (v, a) = choose_quality(&m, &Quality::Index(0), &codec(":fLaC")).unwrap();
        assert_eq!(v.quality_id, 32);
        assert!(a.is_none());
    }

    #[test]
    fn test_parse_quality_and_codec() {
        assert_eq!("2".parse::<Quality>().unwrap(), Quality::Index(2));
        assert_eq!(
            "1080P".parse::<Quality>().unwrap(),
            Quality::Label("1080P".to_string())
        );
        let c = codec("hev:fLaC");
        assert_eq!((c.video.as_str(), c.audio.as_str()), ("hev", "fLaC"));
        let c = codec("avc");
        assert_eq!((c.video.as_str(), c.audio.as_str()), ("avc", ""));
        assert!(choose_quality(&DashManifest::default(), &Quality::Index(0), &c).is_none());
    }
}
