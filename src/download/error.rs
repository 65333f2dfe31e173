//! Error types for the download module.
//!
//! This module defines structured errors for every engine operation. Variants
//! carry the URL or path they concern so log lines and user messages stay
//! actionable without extra context.

use std::path::PathBuf;

use thiserror::Error;

use crate::ffmpeg::ToolError;

/// Errors that can occur while fetching, assembling or post-processing media.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level failure (connect, TLS, protocol, body read).
    #[error("transport error fetching {url}: {source}")]
    Transport {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-2xx response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Anything the transport layer could not classify.
    #[error("unexpected failure fetching {url}: {message}")]
    Unknown {
        /// The URL being fetched.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// File system error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Neither HEAD nor a ranged GET reported the resource size.
    #[error("no content length reported for {url}")]
    MissingContentLength {
        /// The probed URL.
        url: String,
    },

    /// A byte-range part kept failing.
    #[error("part {part} still failing after {attempts} attempts")]
    PartRetryExceeded {
        /// Part file name (`{base}-{start}-{end}`).
        part: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A whole-body stream (HLS segment, static file) kept failing.
    #[error("stream {url} still failing after {attempts} attempts")]
    StreamRetryExceeded {
        /// The stream URL.
        url: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The file name could not be shortened enough for the file system.
    #[error("file name too long even after shortening: {path}")]
    FilenameTooLong {
        /// Last candidate path.
        path: PathBuf,
    },

    /// The playlist could not be parsed or had no usable segments.
    #[error("invalid playlist {url}: {message}")]
    Playlist {
        /// Playlist URL.
        url: String,
        /// Parser or validation message.
        message: String,
    },

    /// A requested time range selects no segment.
    #[error("time range {start}-{end} selects nothing in {url}")]
    EmptyTimeRange {
        /// Playlist or stream URL.
        url: String,
        /// Range start in seconds.
        start: f64,
        /// Range end in seconds.
        end: f64,
    },

    /// A dash stream's segment index is missing or malformed.
    #[error("bad segment index in {url}: {message}")]
    SegmentIndex {
        /// Stream URL.
        url: String,
        /// Parser or validation message.
        message: String,
    },

    /// Key fetch or AES decryption failed.
    #[error("cannot decrypt with key {uri}: {message}")]
    Decrypt {
        /// Key URI.
        uri: String,
        /// Failure description.
        message: String,
    },

    /// The job gate was closed while waiting.
    #[error("concurrency gate closed")]
    GateClosed,

    /// External transmux tool failure.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl DownloadError {
    /// Creates a transport error from a reqwest error.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an unclassified error.
    pub fn unknown(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unknown {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a playlist error.
    pub fn playlist(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Playlist {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a segment index error.
    pub fn segment_index(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SegmentIndex {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a decryption error.
    pub fn decrypt(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decrypt {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// Returns true when the failure should abort only the file it concerns
    /// and be reported as an error rather than a warning.
    #[must_use]
    pub fn is_retry_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::PartRetryExceeded { .. } | Self::StreamRetryExceeded { .. }
        )
    }

    /// Classifies the error for retry and URL scoring.
    #[must_use]
    pub fn failure_kind(&self) -> super::retry::FailureKind {
        super::retry::classify_error(self)
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// URL or path, which the source errors do not carry.
