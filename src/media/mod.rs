//! Media descriptors and media job orchestration.
//!
//! Site scrapers describe a resource as a [`MediaDescriptor`]; the
//! [`MediaOrchestrator`] picks streams, issues range or HLS jobs on the
//! download engine and runs the post-completion transmux step.

mod error;
mod orchestrator;
pub mod quality;
pub mod subtitle;

use std::fmt;

use crate::download::SegmentBase;

pub use error::{ApiError, MediaError};
pub use orchestrator::{MediaOptions, MediaOrchestrator, TITLE_OVERFLOW, media_names};
pub use quality::{CodecChoice, Quality, choose_quality};

/// Kind of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Video without audio.
    Video,
    /// Audio only.
    Audio,
    /// Video with audio.
    Muxed,
    /// Subtitle track (JSON cues).
    Subtitle,
    /// Cover image.
    Image,
    /// Danmaku segment.
    Danmaku,
}

/// One downloadable stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    /// Stream kind.
    pub kind: StreamKind,
    /// Codec string (`avc1.640032`, `mp4a.40.2`, `fLaC`).
    pub codec: String,
    /// Quality label (`1080P 高清`) or subtitle language.
    pub quality: String,
    /// Numeric quality id; higher is better.
    pub quality_id: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Size in bytes, when known.
    pub size: Option<u64>,
    /// Primary URL followed by backups.
    pub urls: Vec<String>,
    /// HLS playlist for this stream, if it is served that way.
    pub hls_url: Option<String>,
    /// File suffix including the dot (`.m4a`), or without for legacy parts.
    pub suffix: String,
    /// Initialization and index ranges of a dash stream, for clips.
    pub segment_base: Option<SegmentBase>,
}

impl Stream {
    /// A stream of `kind` served from `urls`.
    #[must_use]
    pub fn new(kind: StreamKind, urls: Vec<String>) -> Self {
        Self {
            kind,
            codec: String::new(),
            quality: String::new(),
            quality_id: 0,
            width: 0,
            height: 0,
            size: None,
            urls,
            hls_url: None,
            suffix: String::new(),
            segment_base: None,
        }
    }

    /// Sets the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    /// Sets the quality label and id.
    #[must_use]
    pub fn with_quality(mut self, label: impl Into<String>, id: u32) -> Self {
        self.quality = label.into();
        self.quality_id = id;
        self
    }

    /// Sets the suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Sets the segment base.
    #[must_use]
    pub fn with_segment_base(mut self, base: Option<SegmentBase>) -> Self {
        self.segment_base = base;
        self
    }

    /// Sets the frame size.
    #[must_use]
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Dash streams of one video grouped by kind.
///
/// Audio is scanned in field order: regular, dolby, then flac.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashManifest {
    /// Duration in seconds.
    pub duration: f64,
    /// Video streams, highest quality first.
    pub videos: Vec<Stream>,
    /// Regular audio streams.
    pub audios: Vec<Stream>,
    /// Dolby audio streams.
    pub dolby: Vec<Stream>,
    /// Lossless audio streams.
    pub flac: Vec<Stream>,
}

impl DashManifest {
    /// Audio streams in preference order.
    pub fn audio_streams(&self) -> impl Iterator<Item = &Stream> {
        self.audios.iter().chain(&self.dolby).chain(&self.flac)
    }
}

/// Position of a descriptor inside a multi-page series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Zero-based page index.
    pub index: usize,
    /// Page name (`P2-Intro`); empty for single-page videos.
    pub name: String,
    /// URL of the page.
    pub url: String,
}

/// Everything a scraper knows about one downloadable resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaDescriptor {
    /// Title of the resource (the series title for multi-page videos).
    pub title: String,
    /// Side artifacts: cover image, subtitle tracks, danmaku segments.
    pub streams: Vec<Stream>,
    /// Dash manifest, when the site serves separate video and audio.
    pub dash: Option<DashManifest>,
    /// HLS playlist URL.
    pub hls_url: Option<String>,
    /// Legacy direct file list (one or more parts to concatenate).
    pub files: Vec<Stream>,
    /// Page the descriptor was scraped from.
    pub source_url: String,
    /// Current page within a series.
    pub page: Option<PageInfo>,
    /// Every page of the series, in order.
    pub pages: Vec<PageInfo>,
}

impl MediaDescriptor {
    /// Name of the current page, or empty.
    #[must_use]
    pub fn page_name(&self) -> &str {
        self.page.as_ref().map_or("", |page| page.name.as_str())
    }

    /// Side artifacts of `kind`.
    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

impl fmt::Display for MediaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        if !self.page_name().is_empty() {
            writeln!(f, "  page: {}", self.page_name())?;
        }
        if self.pages.len() > 1 {
            writeln!(f, "  pages: {}", self.pages.len())?;
        }
        writeln!(f, "  source: {}", self.source_url)?;
        if let Some(dash) = &self.dash {
            writeln!(f, "  duration: {:.0}s", dash.duration)?;
            for video in &dash.videos {
                writeln!(
                    f,
                    "  video: {} [{}] {}x{} {}",
                    video.quality, video.quality_id, video.width, video.height, video.codec
                )?;
            }
            for audio in dash.audio_streams() {
                writeln!(f, "  audio: {} {}", audio.quality, audio.codec)?;
            }
        }
        if let Some(hls) = &self.hls_url {
            writeln!(f, "  hls: {hls}")?;
        }
        if !self.files.is_empty() {
            writeln!(f, "  files: {}", self.files.len())?;
        }
        for subtitle in self.streams_of(StreamKind::Subtitle) {
            writeln!(f, "  subtitle: {}", subtitle.quality)?;
        }
        Ok(())
    }
}
