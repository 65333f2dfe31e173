//! Concurrent download engine.
//!
//! Two job kinds share one [`Governor`]:
//!
//! - [`RangeDownloader`] fetches a file as byte ranges in parallel, with
//!   backup URLs, resumable part files and a final merge;
//! - [`HlsDownloader`] fetches an m3u8 playlist's segments in parallel,
//!   decrypts AES-128 segments and concatenates them.
//!
//! Dash time-range clips reuse the range downloader on byte ranges picked
//! from the stream's segment index.
//!
//! [`DownloadEngine`] composes both over one [`HttpClient`].

mod client;
mod constants;
mod engine;
mod error;
mod governor;
mod hls;
mod path;
mod range;
mod retry;
mod sidx;

pub use client::{ClientConfig, ContentInfo, FetchRequest, HttpClient, parse_content_range_total};
pub use constants::{
    DEFAULT_PART_CONCURRENCY, DEFAULT_VIDEO_CONCURRENCY, PATH_CHECK_RETRY, URL_SCORE_CAPACITY,
};
pub use engine::{DownloadEngine, EngineConfig, EngineError, SiteCookie};
pub use error::DownloadError;
pub use governor::{Governor, UrlScores, choose_uniform, throttle_delay};
pub use hls::{
    AesKey, HlsDownloader, HlsSegment, KeyCache, KeyEntry, ResolvedPlaylist, SegmentKey,
    Selection, decrypt_segment, parse_iv, resolve_media_playlist, resolve_uri, select_time_range,
    sequence_iv, strip_camouflage,
};
pub use path::{
    MAX_TITLE_BYTES, eclipse, extension_from_url, file_name_from_url, html_unescape,
    parse_content_disposition, path_check, sanitize, with_name_suffix,
};
pub use range::{PartFile, RangeDownloader, merge_files, plan_parts};
pub use retry::{
    DEFAULT_STREAM_RETRY, FailureKind, PART_RETRY_LIMIT, RetryDecision, RetrySchedule,
    classify_error,
};
pub use sidx::{
    ClipRanges, SegmentBase, SegmentIndex, SidxReference, clip_ranges, parse_sidx,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
