//! Routing a method name and resource keys to a handler.
//!
//! A [`Handler`] describes itself with static [`HandlerInfo`] metadata and
//! turns a method call into a [`Dispatched`] future. The [`Dispatcher`]
//! orders the registered handlers for a request and hands it to the first
//! one that accepts it.

mod error;
pub mod options;
mod registry;

pub use error::DispatchError;
pub use options::{EngineOptions, OptionMap, OptionValue, ParamInfo, ParamKind, VideoOptions};
pub use registry::{Dispatcher, compare_key, longest_common_len};

use std::fmt::{self, Write as _};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use reqwest::header::HeaderMap;
use tracing::{error, info, warn};

use crate::download::{DownloadEngine, DownloadError, EngineConfig, SiteCookie};
use crate::ffmpeg::Transmuxer;
use crate::media::MediaError;
use crate::progress::ProgressSurface;

/// Whether a handler is a generic base downloader or a site handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Ordered by similarity between its tag and the method name.
    Base,
    /// Ordered by similarity between its tag and the key's domain.
    Site,
}

/// A method offered by a handler.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    /// Full method name (`get_video`).
    pub name: &'static str,
    /// Short alias (`v`).
    pub short: &'static str,
    /// One-line help.
    pub help: &'static str,
    /// Parameters accepted by the method.
    pub params: &'static [ParamInfo],
}

impl MethodInfo {
    /// Whether `method` names this method or its alias.
    #[must_use]
    pub fn answers_to(&self, method: &str) -> bool {
        self.name == method || self.short == method
    }
}

/// Static description of a handler.
#[derive(Debug, Clone, Copy)]
pub struct HandlerInfo {
    /// Handler tag compared against keys and methods (`bilibili`, `m3u8`).
    pub tag: &'static str,
    /// Base or site handler.
    pub kind: HandlerKind,
    /// URL pattern accepted by a site handler.
    pub pattern: Option<&'static str>,
    /// One-line help.
    pub help: &'static str,
    /// Parameters accepted when constructing the handler's engine.
    pub init: &'static [ParamInfo],
    /// Offered methods.
    pub methods: &'static [MethodInfo],
}

impl HandlerInfo {
    /// Finds a method by name or alias.
    #[must_use]
    pub fn method(&self, method: &str) -> Option<&'static MethodInfo> {
        self.methods.iter().find(|info| info.answers_to(method))
    }

    /// Renders the method and parameter table printed by `help <handler>`.
    #[must_use]
    pub fn help_text(&self) -> String {
        let mut out = format!("{}: {}\n", self.tag, self.help);
        if let Some(pattern) = self.pattern {
            let _ = writeln!(out, "  keys matching {pattern}");
        }
        if !self.init.is_empty() {
            out.push_str("\nengine options:\n");
            write_params(&mut out, self.init);
        }
        out.push_str("\nmethods:\n");
        for method in self.methods {
            let _ = writeln!(out, "  {:<22} {:<5} {}", method.name, method.short, method.help);
            write_params(&mut out, method.params);
        }
        out
    }
}

fn write_params(out: &mut String, params: &[ParamInfo]) {
    for param in params {
        let flag = format!("--{}", param.name.replace('_', "-"));
        let default = if param.default.is_empty() {
            String::new()
        } else {
            format!(" [default: {}]", param.default)
        };
        let _ = writeln!(out, "      {flag:<18} {}{default}", param.help);
    }
}

/// Shared dependencies handed to every handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// Progress surface shared by every engine.
    pub progress: Arc<ProgressSurface>,
    /// External transmux tool.
    pub tool: Arc<dyn Transmuxer>,
    /// Baseline engine configuration; handler options override it.
    pub base: EngineConfig,
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    /// Creates a context with the default engine configuration.
    #[must_use]
    pub fn new(progress: Arc<ProgressSurface>, tool: Arc<dyn Transmuxer>) -> Self {
        Self {
            progress,
            tool,
            base: EngineConfig::default(),
        }
    }

    /// Replaces the baseline engine configuration.
    #[must_use]
    pub fn with_base(mut self, base: EngineConfig) -> Self {
        self.base = base;
        self
    }

    /// Builds an engine from the baseline, the handler's engine options and
    /// its site headers.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Engine`] for out-of-range concurrency or a
    /// client that cannot be built.
    pub fn engine(
        &self,
        options: &EngineOptions,
        headers: HeaderMap,
        cookie: Option<SiteCookie>,
    ) -> Result<DownloadEngine, DispatchError> {
        let mut config = self.base.clone();
        config.video_concurrency = options.video_concurrency;
        config.part_concurrency = options.part_concurrency;
        config.speed_limit = options.speed_limit.or(config.speed_limit);
        config.stream_retry = options.stream_retry;
        config.headers.extend(headers);
        if cookie.is_some() {
            config.cookie = cookie;
        }
        Ok(DownloadEngine::new(
            config,
            Arc::clone(&self.progress),
            Arc::clone(&self.tool),
        )?)
    }
}

/// The result of one key.
#[derive(Debug)]
pub struct KeyOutcome {
    /// The key as given on the command line.
    pub key: String,
    /// Produced files, or the failure.
    pub result: Result<Vec<PathBuf>, MediaError>,
}

/// Per-key outcomes of a dispatched run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Outcomes in key order.
    pub outcomes: Vec<KeyOutcome>,
}

impl RunReport {
    /// Files produced by every successful key.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok())
            .flatten()
    }

    /// Failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &KeyOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    /// Whether any key failed in a way that must fail the process:
    /// part retries exhausted or a file name that cannot be shortened.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.failures().any(|outcome| {
            outcome.result.as_ref().err().and_then(MediaError::as_download).is_some_and(
                |error| {
                    matches!(
                        error,
                        DownloadError::PartRetryExceeded { .. }
                            | DownloadError::FilenameTooLong { .. }
                    )
                },
            )
        })
    }
}

/// A method call bound to its handler, ready to run.
pub struct Dispatched {
    /// Tag of the chosen handler.
    pub handler: &'static str,
    /// Full name of the chosen method.
    pub method: &'static str,
    /// The work; resolves once every key has finished.
    pub run: BoxFuture<'static, RunReport>,
}

impl fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatched")
            .field("handler", &self.handler)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// A downloader for a family of keys.
pub trait Handler: Send + Sync {
    /// Static metadata.
    fn info(&self) -> &'static HandlerInfo;

    /// Whether the keys belong to this handler. Base handlers accept
    /// anything.
    fn matches(&self, _keys: &[String]) -> bool {
        true
    }

    /// Whether this handler takes the request.
    fn decide_handle(&self, method: &str, keys: &[String]) -> bool {
        self.matches(keys) && self.info().method(method).is_some()
    }

    /// Binds `method` to `keys`. `init` holds the filtered engine options,
    /// `options` the filtered method options.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidOption`] for unusable options, or
    /// [`DispatchError::Engine`] when the engine cannot be built.
    fn handle(
        &self,
        method: &str,
        keys: &[String],
        init: &OptionMap,
        options: &OptionMap,
        context: &HandlerContext,
    ) -> Result<Dispatched, DispatchError>;
}

/// Runs `job` for every key concurrently and collects the outcomes.
///
/// Failures are logged, `warn!` for skippable ones and `error!` otherwise,
/// and never cancel sibling keys.
pub fn run_keys<F, Fut>(keys: &[String], job: F) -> BoxFuture<'static, RunReport>
where
    F: Fn(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<PathBuf>, MediaError>> + Send + 'static,
{
    let jobs: Vec<_> = keys
        .iter()
        .map(|key| {
            let key = key.clone();
            let run = job(key.clone());
            async move {
                let result = run.await;
                match &result {
                    Ok(files) => info!(key = %key, files = files.len(), "key finished"),
                    Err(e) if e.is_warning() => warn!(key = %key, error = %e, "key skipped"),
                    Err(e) => error!(key = %key, error = %e, "key failed"),
                }
                KeyOutcome { key, result }
            }
        })
        .collect();
    async move {
        RunReport {
            outcomes: join_all(jobs).await,
        }
    }
    .boxed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::ApiError;
    use std::path::Path;

    #[tokio::test]
    async fn test_run_keys_keeps_siblings() {
        let keys = vec!["ok".to_string(), "bad".to_string(), "fatal".to_string()];
        let report = run_keys(&keys, |key| async move {
            match key.as_str() {
                "ok" => Ok(vec![PathBuf::from("ok.mp4")]),
                "bad" => Err(MediaError::Api(ApiError::unsupported("no media"))),
                _ => Err(MediaError::Download(DownloadError::FilenameTooLong {
                    path: Path::new("x").to_path_buf(),
                })),
            }
        })
        .await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcomes[0].key, "ok");
        assert_eq!(report.files().count(), 1);
        assert_eq!(report.failures().count(), 2);
        assert!(report.is_fatal());
    }

    #[tokio::test]
    async fn test_skippable_failures_are_not_fatal() {
        let keys = vec!["a".to_string()];
        let report = run_keys(&keys, |_| async {
            Err(MediaError::Api(ApiError::resource("gone", "BV1")))
        })
        .await;
        assert!(!report.is_fatal());
    }

    #[test]
    fn test_help_text_lists_methods_and_params() {
        static PARAMS: [ParamInfo; 1] = [ParamInfo::new("dir", ParamKind::Text, ".", "output dir")];
        static METHODS: [MethodInfo; 1] = [MethodInfo {
            name: "get_file",
            short: "f",
            help: "download files",
            params: &PARAMS,
        }];
        let info = HandlerInfo {
            tag: "file",
            kind: HandlerKind::Base,
            pattern: None,
            help: "direct files",
            init: &[],
            methods: &METHODS,
        };
        let text = info.help_text();
        assert!(text.starts_with("file: direct files"));
        assert!(text.contains("get_file"));
        assert!(text.contains("--dir"));
        assert!(text.contains("[default: .]"));
        assert!(info.method("f").is_some());
        assert!(info.method("get_video").is_none());
    }
}
