//! File configuration for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use mediadl_core::dispatch::{OptionMap, OptionValue};
use mediadl_core::parse_byte_size;

use crate::cli::CliValueSources;

/// Defaults read from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Output directory.
    pub dir: Option<PathBuf>,
    /// Media jobs at once.
    pub video_concurrency: Option<u64>,
    /// Parts per job at once.
    pub part_concurrency: Option<u64>,
    /// Speed ceiling as a byte-size string.
    pub speed_limit: Option<String>,
    /// Retries per request.
    pub stream_retry: Option<u64>,
    /// Quality index or label.
    pub quality: Option<String>,
    /// Codec choice.
    pub codec: Option<String>,
    /// `SESSDATA` cookie.
    pub cookie: Option<String>,
    /// Hierarchy mode.
    pub hierarchy: Option<bool>,
    /// Transmux tool program.
    pub ffmpeg: Option<String>,
}

impl FileConfig {
    /// Validates config values against CLI constraints.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("video_concurrency", self.video_concurrency),
            ("part_concurrency", self.part_concurrency),
        ] {
            if let Some(value) = value {
                if !(1..=100).contains(&value) {
                    bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=100");
                }
            }
        }
        if let Some(speed_limit) = &self.speed_limit {
            if parse_byte_size(speed_limit).is_none() {
                bail!("Invalid config value for `speed_limit`: '{speed_limit}' is not a byte size");
            }
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            if ffmpeg.trim().is_empty() {
                bail!("Invalid config value for `ffmpeg`: empty program");
            }
        }
        Ok(())
    }

    /// Fills `options` with config values for every option not given on the
    /// command line.
    pub fn apply_defaults(&self, options: &mut OptionMap, sources: &CliValueSources) {
        let mut fill = |given: bool, name: &str, value: Option<OptionValue>| {
            if let (false, Some(value)) = (given, value) {
                options.insert(name.to_string(), value);
            }
        };
        fill(
            sources.dir,
            "dir",
            self.dir
                .as_ref()
                .map(|dir| OptionValue::Text(dir.to_string_lossy().into_owned())),
        );
        fill(
            sources.max_con,
            "max_con",
            self.video_concurrency.map(OptionValue::Int),
        );
        fill(
            sources.part_con,
            "part_con",
            self.part_concurrency.map(OptionValue::Int),
        );
        fill(
            sources.speed_limit,
            "speed_limit",
            self.speed_limit.clone().map(OptionValue::Text),
        );
        fill(
            sources.stream_retry,
            "stream_retry",
            self.stream_retry.map(OptionValue::Int),
        );
        fill(sources.quality, "quality", self.quality.clone().map(OptionValue::Text));
        fill(sources.codec, "codec", self.codec.clone().map(OptionValue::Text));
        fill(sources.cookie, "cookie", self.cookie.clone().map(OptionValue::Text));
        fill(
            sources.no_hierarchy,
            "hierarchy",
            self.hierarchy.map(OptionValue::Flag),
        );
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mediadl/config.toml`
/// 2. `$HOME/.config/mediadl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("mediadl")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("mediadl")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` (which must exist), or the default path if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = read_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(read_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let string = || {
            parse_string_literal(value)
                .with_context(|| format!("Invalid `{key}` value on line {line_no}"))
        };
        let integer = || {
            parse_integer_u64(value)
                .with_context(|| format!("Invalid `{key}` value on line {line_no}"))
        };

        match key {
            "dir" => cfg.dir = Some(PathBuf::from(string()?)),
            "video_concurrency" => cfg.video_concurrency = Some(integer()?),
            "part_concurrency" => cfg.part_concurrency = Some(integer()?),
            "speed_limit" => cfg.speed_limit = Some(string()?),
            "stream_retry" => cfg.stream_retry = Some(integer()?),
            "quality" => {
                // Accept `quality = 0` as well as `quality = "1080P"`.
                cfg.quality = Some(match parse_integer_u64(value) {
                    Ok(index) => index.to_string(),
                    Err(_) => string()?,
                });
            }
            "codec" => cfg.codec = Some(string()?),
            "cookie" => cfg.cookie = Some(string()?),
            "hierarchy" => {
                let parsed = parse_boolean(value)
                    .with_context(|| format!("Invalid `hierarchy` value on line {line_no}"))?;
                cfg.hierarchy = Some(parsed);
            }
            "ffmpeg" => cfg.ffmpeg = Some(string()?),
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
dir = "/data/videos"
video_concurrency = 4
part_concurrency = 16 # ranges per file
speed_limit = "2MB"
stream_retry = 3
quality = "1080P"
codec = "hev:fLaC"
cookie = "abc%2C123"
hierarchy = false
ffmpeg = "/usr/local/bin/ffmpeg"
"#,
        )
        .expect("full config should parse");
        assert_eq!(cfg.dir, Some(PathBuf::from("/data/videos")));
        assert_eq!(cfg.video_concurrency, Some(4));
        assert_eq!(cfg.part_concurrency, Some(16));
        assert_eq!(cfg.speed_limit.as_deref(), Some("2MB"));
        assert_eq!(cfg.stream_retry, Some(3));
        assert_eq!(cfg.quality.as_deref(), Some("1080P"));
        assert_eq!(cfg.codec.as_deref(), Some("hev:fLaC"));
        assert_eq!(cfg.cookie.as_deref(), Some("abc%2C123"));
        assert_eq!(cfg.hierarchy, Some(false));
        assert_eq!(cfg.ffmpeg.as_deref(), Some("/usr/local/bin/ffmpeg"));
    }

    #[test]
    fn test_parse_config_integer_quality() {
        let cfg = parse_config_str("quality = 2").expect("integer quality should parse");
        assert_eq!(cfg.quality.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_concurrency() {
        let err = parse_config_str("video_concurrency = 0").expect_err("0 is below range");
        assert!(err.to_string().contains("video_concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_speed_limit() {
        let err = parse_config_str(r#"speed_limit = "fast""#).expect_err("not a byte size");
        assert!(err.to_string().contains("speed_limit"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("dir").expect_err("syntax error expected");
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_config_keeps_hash_inside_strings() {
        let cfg = parse_config_str(r#"dir = "videos#1" # comment"#).expect("should parse");
        assert_eq!(cfg.dir, Some(PathBuf::from("videos#1")));
    }

    #[test]
    fn test_apply_defaults_respects_command_line() {
        let cfg = FileConfig {
            dir: Some(PathBuf::from("from-config")),
            video_concurrency: Some(7),
            hierarchy: Some(false),
            ..FileConfig::default()
        };
        let mut options = OptionMap::new();
        options.insert("dir".to_string(), OptionValue::Text("from-cli".to_string()));
        let sources = CliValueSources {
            dir: true,
            ..CliValueSources::default()
        };
        cfg.apply_defaults(&mut options, &sources);
        assert_eq!(options.get("dir"), Some(&OptionValue::Text("from-cli".into())));
        assert_eq!(options.get("max_con"), Some(&OptionValue::Int(7)));
        assert_eq!(options.get("hierarchy"), Some(&OptionValue::Flag(false)));
        assert!(!options.contains_key("speed_limit"));
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        assert!(load_file_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "part_concurrency = 12\n").unwrap();
        let loaded = load_file_config(Some(&path)).unwrap();
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.unwrap().part_concurrency, Some(12));
    }
}
