//! Media Downloader Core Library
//!
//! This library provides the concurrent download engine behind the `mediadl`
//! tool: segmented range downloads, HLS playlists, a shared governor for
//! concurrency and bandwidth, and a dispatch layer that routes a method name
//! and a set of resource keys to a site handler.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - HTTP fetcher, governor, range and HLS downloaders
//! - [`progress`] - Task registry with aggregate speed and terminal rendering
//! - [`ffmpeg`] - External transmux tool protocol
//! - [`media`] - Media descriptors, quality selection and job orchestration
//! - [`dispatch`] - Handler contract, option schemas and the dispatcher
//! - [`sites`] - Shipped handlers (direct files, m3u8, site handlers)
//! - [`units`] - Byte-size, time-range and page-range parsing

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatch;
pub mod download;
pub mod ffmpeg;
pub mod media;
pub mod progress;
pub mod sites;
pub mod units;
mod user_agent;

// Re-export commonly used types
pub use dispatch::{DispatchError, Dispatched, Dispatcher, Handler, HandlerContext, RunReport};
pub use download::{
    DEFAULT_PART_CONCURRENCY, DEFAULT_STREAM_RETRY, DEFAULT_VIDEO_CONCURRENCY, DownloadEngine,
    DownloadError, EngineConfig, EngineError, FailureKind, HttpClient, classify_error,
};
pub use ffmpeg::{Ffmpeg, ToolError, Transmuxer};
pub use media::{MediaDescriptor, MediaError, MediaOrchestrator, Stream, StreamKind};
pub use progress::{ProgressSurface, TaskId};
pub use units::{TimeRange, parse_byte_size, parse_time_range};
