//! Option maps, parameter schemas and typed option records.
//!
//! The CLI hands the dispatcher an untyped [`OptionMap`]. Each handler
//! declares the parameters its constructor and methods accept; the map is
//! filtered against those declarations and then turned into typed records
//! such as [`EngineOptions`] and [`VideoOptions`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use super::error::DispatchError;
use crate::download::{DEFAULT_PART_CONCURRENCY, DEFAULT_STREAM_RETRY, DEFAULT_VIDEO_CONCURRENCY};
use crate::media::{CodecChoice, MediaOptions, Quality};
use crate::units::{TimeRange, parse_byte_size, parse_time_range};

/// One option value as provided by the CLI or a config file.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// A boolean switch.
    Flag(bool),
    /// An unsigned integer.
    Int(u64),
    /// Free text.
    Text(String),
    /// A pair of integers (`-p 1 3`).
    Range(usize, usize),
}

/// Options keyed by canonical name (`max_con`, `speed_limit`, ...).
pub type OptionMap = BTreeMap<String, OptionValue>;

/// Value check applied to a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Any value passes.
    Any,
    /// A switch.
    Flag,
    /// An unsigned integer.
    Int,
    /// Free text.
    Text,
    /// A byte size string (`1.5MB`) or integer.
    ByteSize,
    /// A `START-END` time range.
    TimeRange,
    /// A pair of integers.
    Range,
}

impl ParamKind {
    /// Whether `value` is acceptable for this kind.
    #[must_use]
    pub fn accepts(self, value: &OptionValue) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (Self::Flag, OptionValue::Flag(_))
            | (Self::Int | Self::ByteSize, OptionValue::Int(_))
            | (Self::Text, OptionValue::Text(_))
            | (Self::Range, OptionValue::Range(_, _)) => true,
            (Self::ByteSize, OptionValue::Text(text)) => parse_byte_size(text).is_some(),
            (Self::TimeRange, OptionValue::Text(text)) => parse_time_range(text).is_some(),
            _ => false,
        }
    }
}

/// A declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    /// Canonical option name.
    pub name: &'static str,
    /// Accepted values.
    pub kind: ParamKind,
    /// Default shown in help.
    pub default: &'static str,
    /// One-line help.
    pub help: &'static str,
}

impl ParamInfo {
    /// Declares a parameter.
    #[must_use]
    pub const fn new(
        name: &'static str,
        kind: ParamKind,
        default: &'static str,
        help: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            default,
            help,
        }
    }
}

/// Keeps the entries of `options` declared in `schema` whose values pass the
/// declared check. Dropped entries are logged at debug level.
///
/// ```
/// use mediadl_core::dispatch::options::{OptionMap, OptionValue, ParamInfo, ParamKind, filter_options};
///
/// let schema = [ParamInfo::new("num", ParamKind::Int, "10", "count")];
/// let mut options = OptionMap::new();
/// options.insert("num".into(), OptionValue::Int(3));
/// options.insert("image".into(), OptionValue::Flag(true));
/// let kept = filter_options(&schema, &options);
/// assert_eq!(kept.len(), 1);
/// assert!(kept.contains_key("num"));
/// ```
#[must_use]
pub fn filter_options(schema: &[ParamInfo], options: &OptionMap) -> OptionMap {
    let mut kept = OptionMap::new();
    for (name, value) in options {
        match schema.iter().find(|param| param.name == name) {
            Some(param) if param.kind.accepts(value) => {
                kept.insert(name.clone(), value.clone());
            }
            Some(param) => {
                debug!(option = %name, kind = ?param.kind, ?value, "dropping option with invalid value");
            }
            None => debug!(option = %name, "dropping option not accepted here"),
        }
    }
    kept
}

fn flag(options: &OptionMap, name: &str, default: bool) -> bool {
    match options.get(name) {
        Some(OptionValue::Flag(value)) => *value,
        _ => default,
    }
}

fn int(options: &OptionMap, name: &str) -> Option<u64> {
    match options.get(name) {
        Some(OptionValue::Int(value)) => Some(*value),
        Some(OptionValue::Text(text)) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text<'a>(options: &'a OptionMap, name: &str) -> Option<&'a str> {
    match options.get(name) {
        Some(OptionValue::Text(value)) => Some(value.as_str()),
        _ => None,
    }
}

fn usize_option(options: &OptionMap, name: &str, default: usize) -> Result<usize, DispatchError> {
    match int(options, name) {
        Some(value) => usize::try_from(value)
            .map_err(|_| DispatchError::invalid_option(name, format!("{value} is too large"))),
        None => Ok(default),
    }
}

/// Engine construction options shared by every handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Media jobs at once (`--max-con`).
    pub video_concurrency: usize,
    /// Parts per job at once (`--part-con`).
    pub part_concurrency: usize,
    /// Speed ceiling in bytes per second (`--speed-limit`).
    pub speed_limit: Option<f64>,
    /// Retries per request (`--stream-retry`).
    pub stream_retry: u32,
    /// `SESSDATA` cookie (`--cookie`).
    pub cookie: Option<String>,
    /// Hierarchy mode (`--no-hierarchy` turns it off).
    pub hierarchy: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            video_concurrency: DEFAULT_VIDEO_CONCURRENCY,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            speed_limit: None,
            stream_retry: DEFAULT_STREAM_RETRY,
            cookie: None,
            hierarchy: true,
        }
    }
}

impl EngineOptions {
    /// Builds the record from a filtered map.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidOption`] for unparsable values.
    pub fn from_map(options: &OptionMap) -> Result<Self, DispatchError> {
        let defaults = Self::default();
        let speed_limit = match options.get("speed_limit") {
            None => None,
            #[allow(clippy::cast_precision_loss)]
            Some(OptionValue::Int(bytes)) => Some(*bytes as f64),
            Some(OptionValue::Text(text)) => Some(parse_byte_size(text).ok_or_else(|| {
                DispatchError::invalid_option("speed_limit", format!("'{text}' is not a byte size"))
            })?),
            Some(other) => {
                return Err(DispatchError::invalid_option(
                    "speed_limit",
                    format!("unexpected value {other:?}"),
                ));
            }
        };
        let stream_retry = match int(options, "stream_retry") {
            Some(value) => u32::try_from(value).map_err(|_| {
                DispatchError::invalid_option("stream_retry", format!("{value} is too large"))
            })?,
            None => defaults.stream_retry,
        };
        Ok(Self {
            video_concurrency: usize_option(options, "max_con", defaults.video_concurrency)?,
            part_concurrency: usize_option(options, "part_con", defaults.part_concurrency)?,
            speed_limit,
            stream_retry,
            cookie: text(options, "cookie").map(str::to_string),
            hierarchy: flag(options, "hierarchy", defaults.hierarchy),
        })
    }
}

/// Sort order for listing methods.
pub const UP_ORDERS: [&str; 3] = ["pubdate", "click", "stow"];

/// Sort orders accepted by category listings.
pub const CATE_ORDERS: [&str; 5] = ["click", "scores", "stow", "coin", "dm"];

/// Options of the video-producing methods.
#[derive(Debug, Clone)]
pub struct VideoOptions {
    /// Output directory (`--dir`).
    pub dir: PathBuf,
    /// Per-media choices.
    pub media: MediaOptions,
    /// 1-based inclusive page range of a series (`-p`).
    pub p_range: Option<(usize, usize)>,
    /// Download every page of each listed video (`--no-series` turns it off).
    pub series: bool,
    /// Item count for listings (`-n`).
    pub num: usize,
    /// Listing sort order (`--order`).
    pub order: Option<String>,
    /// Listing keyword filter (`--keyword`).
    pub keyword: String,
    /// Category listing window in days (`--days`).
    pub days: u32,
}

impl VideoOptions {
    /// Builds the record from a filtered map. `hierarchy` comes from the
    /// handler's engine options.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidOption`] for unparsable values.
    pub fn from_map(options: &OptionMap, hierarchy: bool) -> Result<Self, DispatchError> {
        let time_range = match text(options, "time_range") {
            Some(raw) => Some(parse_time_range(raw).ok_or_else(|| {
                DispatchError::invalid_option("time_range", format!("'{raw}' is not START-END"))
            })?),
            None => None,
        };
        let quality = match options.get("quality") {
            Some(OptionValue::Int(i)) => Quality::Index(usize::try_from(*i).unwrap_or(usize::MAX)),
            Some(OptionValue::Text(raw)) => raw.parse().unwrap_or_default(),
            _ => Quality::default(),
        };
        let codec: CodecChoice = text(options, "codec")
            .map(|raw| raw.parse().unwrap_or_default())
            .unwrap_or_default();
        let p_range = match options.get("p_range") {
            Some(OptionValue::Range(first, last)) => {
                if *first == 0 || first > last {
                    return Err(DispatchError::invalid_option(
                        "p_range",
                        format!("{first} {last} is not a 1-based inclusive range"),
                    ));
                }
                Some((*first, *last))
            }
            _ => None,
        };
        let order = text(options, "order").map(str::to_string);
        let days = match int(options, "days") {
            Some(days) => u32::try_from(days)
                .map_err(|_| DispatchError::invalid_option("days", format!("{days} is too large")))?,
            None => 7,
        };

        Ok(Self {
            dir: text(options, "dir").map_or_else(|| PathBuf::from("."), PathBuf::from),
            media: MediaOptions {
                quality,
                codec,
                only_audio: flag(options, "only_audio", false),
                image: flag(options, "image", false),
                subtitle: flag(options, "subtitle", false),
                dm: flag(options, "dm", false),
                time_range,
                hierarchy,
            },
            p_range,
            series: flag(options, "series", true),
            num: usize_option(options, "num", 10)?,
            order,
            keyword: text(options, "keyword").unwrap_or_default().to_string(),
            days,
        })
    }

    /// The time range, if any.
    #[must_use]
    pub fn time_range(&self) -> Option<TimeRange> {
        self.media.time_range
    }

    /// The requested order if it is one of `allowed`, else `allowed[0]`.
    #[must_use]
    pub fn order_or<'a>(&'a self, allowed: &[&'a str]) -> &'a str {
        match &self.order {
            Some(order) if allowed.contains(&order.as_str()) => order.as_str(),
            _ => allowed.first().copied().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, OptionValue)]) -> OptionMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_param_kind_checks() {
        assert!(ParamKind::Any.accepts(&OptionValue::Range(1, 2)));
        assert!(ParamKind::ByteSize.accepts(&OptionValue::Text("1.5MB".into())));
        assert!(!ParamKind::ByteSize.accepts(&OptionValue::Text("fast".into())));
        assert!(ParamKind::TimeRange.accepts(&OptionValue::Text("00:10-00:20".into())));
        assert!(!ParamKind::TimeRange.accepts(&OptionValue::Text("20-10".into())));
        assert!(!ParamKind::Flag.accepts(&OptionValue::Int(1)));
    }

    #[test]
    fn test_filter_drops_undeclared_and_invalid() {
        let schema = [
            ParamInfo::new("speed_limit", ParamKind::ByteSize, "", ""),
            ParamInfo::new("image", ParamKind::Flag, "false", ""),
        ];
        let options = map(&[
            ("speed_limit", OptionValue::Text("nope".into())),
            ("image", OptionValue::Flag(true)),
            ("days", OptionValue::Int(3)),
        ]);
        let kept = filter_options(&schema, &options);
        assert_eq!(kept, map(&[("image", OptionValue::Flag(true))]));
    }

    #[test]
    fn test_engine_options_from_map() {
        let options = map(&[
            ("max_con", OptionValue::Int(2)),
            ("speed_limit", OptionValue::Text("2MB".into())),
            ("hierarchy", OptionValue::Flag(false)),
            ("cookie", OptionValue::Text("abc".into())),
        ]);
        let engine = EngineOptions::from_map(&options).unwrap();
        assert_eq!(engine.video_concurrency, 2);
        assert_eq!(engine.part_concurrency, DEFAULT_PART_CONCURRENCY);
        assert_eq!(engine.speed_limit, Some(2_000_000.0));
        assert!(!engine.hierarchy);
        assert_eq!(engine.cookie.as_deref(), Some("abc"));

        assert_eq!(EngineOptions::from_map(&OptionMap::new()).unwrap(), EngineOptions::default());
    }

    #[test]
    fn test_video_options_from_map() {
        let options = map(&[
            ("dir", OptionValue::Text("/tmp/v".into())),
            ("quality", OptionValue::Text("1080P".into())),
            ("codec", OptionValue::Text("hev:fLaC".into())),
            ("p_range", OptionValue::Range(2, 4)),
            ("series", OptionValue::Flag(false)),
            ("time_range", OptionValue::Text("5-23".into())),
            ("order", OptionValue::Text("bogus".into())),
        ]);
        let video = VideoOptions::from_map(&options, true).unwrap();
        assert_eq!(video.dir, PathBuf::from("/tmp/v"));
        assert_eq!(video.media.quality, Quality::Label("1080P".into()));
        assert_eq!(video.media.codec.audio, "fLaC");
        assert_eq!(video.p_range, Some((2, 4)));
        assert!(!video.series);
        assert_eq!(video.time_range().unwrap().duration(), 18.0);
        assert_eq!(video.order_or(&UP_ORDERS), "pubdate");
        assert_eq!(video.num, 10);
        assert_eq!(video.days, 7);
    }

    #[test]
    fn test_video_options_reject_bad_page_range() {
        let options = map(&[("p_range", OptionValue::Range(3, 1))]);
        assert!(matches!(
            VideoOptions::from_map(&options, true),
            Err(DispatchError::InvalidOption { .. })
        ));
    }
}
