//! Shipped handlers.
//!
//! - [`FileHandler`] - direct file URLs through the range downloader
//! - [`M3u8Handler`] - HLS playlist URLs
//! - [`BilibiliHandler`] - videos, series, listings and side artifacts of
//!   bilibili.com
//! - [`CctvHandler`] - videos and series of tv.cctv.com

mod bilibili;
mod cctv;
mod file;
mod m3u8;

pub use bilibili::{
    BilibiliApi, BilibiliHandler, CateInfo, CateQuery, ListingPage, VideoInfo, WebBilibiliApi,
    danmaku_urls, parse_cate_meta, parse_video_page,
};
pub use cctv::{CctvApi, CctvHandler, CctvIds, WebCctvApi};
pub use file::FileHandler;
pub use m3u8::M3u8Handler;

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use serde::de::DeserializeOwned;

use crate::dispatch::{Handler, ParamInfo, ParamKind};
use crate::media::ApiError;

/// The handlers registered by [`crate::Dispatcher::with_default_handlers`],
/// base handlers first.
#[must_use]
pub fn default_handlers() -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(M3u8Handler),
        Box::new(FileHandler),
        Box::new(BilibiliHandler::new()),
        Box::new(CctvHandler::new()),
    ]
}

/// Compiles a regex at static init; panics on invalid pattern.
pub(crate) fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Headers sending `referer` on every request.
pub(crate) fn referer_headers(referer: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(referer) {
        headers.insert(REFERER, value);
    }
    headers
}

/// Decodes a JSON body, naming `context` on failure.
pub(crate) fn decode_json<T: DeserializeOwned>(context: &str, body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::parse(context, e))
}

pub(crate) const MAX_CON: ParamInfo =
    ParamInfo::new("max_con", ParamKind::Int, "3", "media jobs running at once");
pub(crate) const PART_CON: ParamInfo = ParamInfo::new(
    "part_con",
    ParamKind::Int,
    "10",
    "ranges or segments fetched at once per job",
);
pub(crate) const SPEED_LIMIT: ParamInfo = ParamInfo::new(
    "speed_limit",
    ParamKind::ByteSize,
    "",
    "aggregate speed ceiling, e.g. 1.5MB",
);
pub(crate) const STREAM_RETRY: ParamInfo =
    ParamInfo::new("stream_retry", ParamKind::Int, "5", "retries per request");
pub(crate) const HIERARCHY: ParamInfo = ParamInfo::new(
    "hierarchy",
    ParamKind::Flag,
    "true",
    "nest series into directories",
);

pub(crate) const DIR: ParamInfo = ParamInfo::new("dir", ParamKind::Text, ".", "output directory");
pub(crate) const QUALITY: ParamInfo = ParamInfo::new(
    "quality",
    ParamKind::Any,
    "0",
    "index (0 is best) or label prefix such as 1080P",
);
pub(crate) const TIME_RANGE: ParamInfo = ParamInfo::new(
    "time_range",
    ParamKind::TimeRange,
    "",
    "clip START-END, e.g. 00:01:00-00:02:30",
);
