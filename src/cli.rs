//! CLI argument definitions using clap derive macros.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, parser::ValueSource};

use mediadl_core::dispatch::{OptionMap, OptionValue};

/// Download videos, playlists and files concurrently.
///
/// `mediadl METHOD KEYS... [OPTIONS]`: METHOD names what to do with the keys
/// (`v` for one video, `s` for a series, `f` for a plain file, `m3u8` for a
/// playlist). Run `mediadl help <handler>` for the methods of one site.
#[derive(Parser, Debug, Clone)]
#[command(name = "mediadl")]
#[command(author, version, about, disable_version_flag = true)]
pub struct Args {
    /// Method name, or `help`
    pub method: Option<String>,

    /// Resource keys: URLs or site ids
    pub keys: Vec<String>,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: Option<bool>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Config file (default: $XDG_CONFIG_HOME/mediadl/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output directory
    #[arg(long, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Quality index (0 is best) or label prefix such as 1080P
    #[arg(short = 'q', long)]
    pub quality: Option<String>,

    /// Media jobs running at once (1-100)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=100))]
    pub max_con: Option<u64>,

    /// Ranges or segments fetched at once per job (1-100)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=100))]
    pub part_con: Option<u64>,

    /// Aggregate speed ceiling, e.g. 1.5MB (also `-sl`)
    #[arg(long, value_name = "BYTES")]
    pub speed_limit: Option<String>,

    /// Retries per request
    #[arg(long)]
    pub stream_retry: Option<u64>,

    /// SESSDATA cookie value
    #[arg(long)]
    pub cookie: Option<String>,

    /// Category listing window in days
    #[arg(long)]
    pub days: Option<u64>,

    /// Number of listing items
    #[arg(short = 'n', long)]
    pub num: Option<u64>,

    /// Listing order (pubdate, click, stow, coin, dm, scores)
    #[arg(long)]
    pub order: Option<String>,

    /// Listing keyword filter
    #[arg(long)]
    pub keyword: Option<String>,

    /// Only the first page of every listed video
    #[arg(long)]
    pub no_series: bool,

    /// Do not nest series into directories
    #[arg(long)]
    pub no_hierarchy: bool,

    /// Also download the cover image
    #[arg(long)]
    pub image: bool,

    /// Also download subtitles
    #[arg(long)]
    pub subtitle: bool,

    /// Also download danmaku
    #[arg(long)]
    pub dm: bool,

    /// Audio stream only
    #[arg(long)]
    pub only_audio: bool,

    /// Page range of a series, 1-based inclusive
    #[arg(short = 'p', num_args = 2, value_names = ["START", "END"])]
    pub p_range: Option<Vec<usize>>,

    /// Codec choice as vcodec:acodec prefixes, e.g. hev:fLaC
    #[arg(long)]
    pub codec: Option<String>,

    /// Clip START-END, e.g. 00:01:00-00:02:30
    #[arg(long, value_name = "START-END")]
    pub time_range: Option<String>,
}

/// Which options were given on the command line rather than defaulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliValueSources {
    pub dir: bool,
    pub quality: bool,
    pub max_con: bool,
    pub part_con: bool,
    pub speed_limit: bool,
    pub stream_retry: bool,
    pub codec: bool,
    pub cookie: bool,
    pub no_hierarchy: bool,
}

/// Rewrites the two-letter `-sl` alias, which clap cannot express as a
/// short flag, to `--speed-limit`.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if arg == "-sl" {
                OsString::from("--speed-limit")
            } else {
                arg
            }
        })
        .collect()
}

/// Parses `args` and records which values came from the command line.
///
/// # Errors
///
/// Returns clap's error for invalid arguments, `--help` and `--version`.
pub fn try_parse_with_sources<I, T>(args: I) -> Result<(Args, CliValueSources), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let matches = Args::command().try_get_matches_from(normalize_args(args))?;
    let parsed = Args::from_arg_matches(&matches)?;
    let sources = CliValueSources {
        dir: is_commandline_value(&matches, "dir"),
        quality: is_commandline_value(&matches, "quality"),
        max_con: is_commandline_value(&matches, "max_con"),
        part_con: is_commandline_value(&matches, "part_con"),
        speed_limit: is_commandline_value(&matches, "speed_limit"),
        stream_retry: is_commandline_value(&matches, "stream_retry"),
        codec: is_commandline_value(&matches, "codec"),
        cookie: is_commandline_value(&matches, "cookie"),
        no_hierarchy: is_commandline_value(&matches, "no_hierarchy"),
    };
    Ok((parsed, sources))
}

fn is_commandline_value(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

impl Args {
    /// The options the user gave, keyed by canonical name. Absent options
    /// are left out so handlers fall back to their own defaults.
    pub fn option_map(&self) -> OptionMap {
        let mut options = OptionMap::new();
        let mut text = |name: &str, value: Option<&String>| {
            if let Some(value) = value {
                options.insert(name.to_string(), OptionValue::Text(value.clone()));
            }
        };
        text("quality", self.quality.as_ref());
        text("speed_limit", self.speed_limit.as_ref());
        text("cookie", self.cookie.as_ref());
        text("order", self.order.as_ref());
        text("keyword", self.keyword.as_ref());
        text("codec", self.codec.as_ref());
        text("time_range", self.time_range.as_ref());

        if let Some(dir) = &self.dir {
            options.insert(
                "dir".to_string(),
                OptionValue::Text(dir.to_string_lossy().into_owned()),
            );
        }
        for (name, value) in [
            ("max_con", self.max_con),
            ("part_con", self.part_con),
            ("stream_retry", self.stream_retry),
            ("days", self.days),
            ("num", self.num),
        ] {
            if let Some(value) = value {
                options.insert(name.to_string(), OptionValue::Int(value));
            }
        }
        for (name, on) in [
            ("image", self.image),
            ("subtitle", self.subtitle),
            ("dm", self.dm),
            ("only_audio", self.only_audio),
        ] {
            if on {
                options.insert(name.to_string(), OptionValue::Flag(true));
            }
        }
        if self.no_series {
            options.insert("series".to_string(), OptionValue::Flag(false));
        }
        if self.no_hierarchy {
            options.insert("hierarchy".to_string(), OptionValue::Flag(false));
        }
        if let Some([first, last]) = self.p_range.as_deref() {
            options.insert("p_range".to_string(), OptionValue::Range(*first, *last));
        }
        options
    }
}
