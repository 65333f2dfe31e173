//! Download engine composition.
//!
//! A [`DownloadEngine`] owns one [`HttpClient`], one [`Governor`] and the
//! transmux tool, shared by its range and HLS downloaders through an
//! [`EngineCore`]. Engines are cheap to clone; clones share all state.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use mediadl_core::{DownloadEngine, EngineConfig, Ffmpeg, ProgressSurface};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(ProgressSurface::hidden()),
//!     Arc::new(Ffmpeg::default()),
//! )?;
//! let urls = vec!["https://example.com/video.mp4".to_string()];
//! let path = engine.get_file(&urls, Path::new("./downloads"), None).await?;
//! println!("saved {}", path.display());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::HeaderMap;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, instrument};
use url::Url;

use super::client::{ClientConfig, HttpClient};
use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_PART_CONCURRENCY, DEFAULT_VIDEO_CONCURRENCY, MAX_CONCURRENCY,
    PATH_CHECK_RETRY, READ_TIMEOUT_SECS,
};
use super::error::DownloadError;
use super::governor::Governor;
use super::hls::HlsDownloader;
use super::path::{extension_from_url, path_check, with_name_suffix};
use super::range::RangeDownloader;
use super::retry::{DEFAULT_STREAM_RETRY, RetrySchedule};
use super::sidx::{ClipRanges, SegmentBase};
use crate::ffmpeg::Transmuxer;
use crate::progress::{ProgressSurface, TaskId};
use crate::units::TimeRange;
use crate::user_agent;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Error type for engine construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A concurrency setting is outside `1..=100`.
    #[error(
        "invalid {name} value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// Setting name.
        name: &'static str,
        /// The rejected value.
        value: usize,
    },

    /// The HTTP client could not be built.
    #[error("cannot build HTTP client: {source}")]
    Client {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// A cookie attached to every request for one site.
#[derive(Debug, Clone)]
pub struct SiteCookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value as sent on the wire.
    pub value: String,
    /// URL whose domain receives the cookie.
    pub url: Url,
}

impl SiteCookie {
    /// Builds a `SESSDATA` cookie, URL-encoding `value` unless it already
    /// contains a `%` escape.
    ///
    /// ```
    /// use mediadl_core::download::SiteCookie;
    /// use url::Url;
    ///
    /// let url = Url::parse("https://www.bilibili.com").unwrap();
    /// assert_eq!(SiteCookie::sessdata("a,b", url.clone()).value, "a%2Cb");
    /// assert_eq!(SiteCookie::sessdata("a%2Cb", url).value, "a%2Cb");
    /// ```
    #[must_use]
    pub fn sessdata(value: &str, url: Url) -> Self {
        let value = if value.contains('%') {
            value.to_string()
        } else {
            urlencoding::encode(value).into_owned()
        };
        Self {
            name: "SESSDATA".to_string(),
            value,
            url,
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Media jobs running at once.
    pub video_concurrency: usize,
    /// Ranges or segments fetched at once inside one job.
    pub part_concurrency: usize,
    /// Aggregate speed ceiling in bytes per second.
    pub speed_limit: Option<f64>,
    /// Retries per HTTP request and per HLS segment.
    pub stream_retry: u32,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Longest wait for the next chunk of a response.
    pub read_timeout: Duration,
    /// Back-off steps for retries.
    pub retry: RetrySchedule,
    /// `user-agent` header value.
    pub user_agent: String,
    /// Default headers (e.g. `referer`).
    pub headers: HeaderMap,
    /// Site cookie.
    pub cookie: Option<SiteCookie>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_concurrency: DEFAULT_VIDEO_CONCURRENCY,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            speed_limit: None,
            stream_retry: DEFAULT_STREAM_RETRY,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            retry: RetrySchedule::default(),
            user_agent: user_agent::default_download_user_agent(),
            headers: HeaderMap::new(),
            cookie: None,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("video_concurrency", self.video_concurrency),
            ("part_concurrency", self.part_concurrency),
        ] {
            if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
                return Err(EngineError::InvalidConcurrency { name, value });
            }
        }
        Ok(())
    }
}

/// State shared by the downloaders of one engine.
pub(crate) struct EngineCore {
    pub(crate) client: HttpClient,
    pub(crate) governor: Governor,
    pub(crate) tool: Arc<dyn Transmuxer>,
    pub(crate) stream_retry: u32,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("governor", &self.governor)
            .field("stream_retry", &self.stream_retry)
            .finish_non_exhaustive()
    }
}

/// Concurrent media download engine.
///
/// Range and HLS jobs share one job gate, one speed ceiling and one URL
/// score cache; each job gets its own part gate.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    core: Arc<EngineCore>,
    range: RangeDownloader,
    hls: HlsDownloader,
}

impl DownloadEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if either concurrency is
    /// outside `1..=100`, or [`EngineError::Client`] if the HTTP client
    /// cannot be built.
    pub fn new(
        config: EngineConfig,
        progress: Arc<ProgressSurface>,
        tool: Arc<dyn Transmuxer>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let cookie_jar = config.cookie.as_ref().map(|cookie| {
            let jar = Jar::default();
            jar.add_cookie_str(&format!("{}={}", cookie.name, cookie.value), &cookie.url);
            debug!(name = %cookie.name, domain = ?cookie.url.host_str(), "cookie installed");
            Arc::new(jar)
        });
        let client_config = ClientConfig {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            user_agent: config.user_agent.clone(),
            headers: config.headers.clone(),
            cookie_jar,
        };
        let client = HttpClient::new(&client_config, config.retry)
            .map_err(|source| EngineError::Client { source })?;

        let governor = Governor::new(
            config.video_concurrency,
            config.part_concurrency,
            config.speed_limit,
            config.stream_retry,
            config.retry,
            progress,
        );
        let core = Arc::new(EngineCore {
            client,
            governor,
            tool,
            stream_retry: config.stream_retry,
        });
        debug!(
            video_concurrency = config.video_concurrency,
            part_concurrency = config.part_concurrency,
            speed_limit = ?config.speed_limit,
            "engine created"
        );

        Ok(Self {
            range: RangeDownloader::new(Arc::clone(&core)),
            hls: HlsDownloader::new(Arc::clone(&core)),
            core,
        })
    }

    /// Downloads a file as concurrent byte ranges. See
    /// [`RangeDownloader::get_file`].
    ///
    /// # Errors
    ///
    /// Propagates the range downloader's errors.
    pub async fn get_file(
        &self,
        urls: &[String],
        path: &Path,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        self.range.get_file(urls, path, task).await
    }

    /// Downloads an HLS playlist. See [`HlsDownloader::get_m3u8_video`].
    ///
    /// # Errors
    ///
    /// Propagates the HLS downloader's errors.
    pub async fn get_m3u8_video(
        &self,
        url: &str,
        path: &Path,
        time_range: Option<TimeRange>,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        self.hls.get_m3u8_video(url, path, time_range, task).await
    }

    /// Picks the byte ranges of a dash stream overlapping `range`. See
    /// [`RangeDownloader::plan_clip`].
    ///
    /// # Errors
    ///
    /// Propagates the range downloader's errors.
    pub async fn plan_media_clip(
        &self,
        urls: &[String],
        base: &SegmentBase,
        range: TimeRange,
    ) -> Result<ClipRanges, DownloadError> {
        self.range.plan_clip(urls, base, range).await
    }

    /// Downloads and cuts a dash stream clip. See
    /// [`RangeDownloader::get_clip`].
    ///
    /// # Errors
    ///
    /// Propagates the range downloader's errors.
    pub async fn get_media_clip(
        &self,
        urls: &[String],
        clip: &ClipRanges,
        start: f64,
        duration: f64,
        path: &Path,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        self.range
            .get_clip(urls, clip, start, duration, path, task)
            .await
    }

    /// Downloads a small file in one request. `path` has no suffix; the
    /// URL's extension is appended.
    ///
    /// # Errors
    ///
    /// Returns request, IO or path errors.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn get_static(&self, url: &str, path: &Path) -> Result<PathBuf, DownloadError> {
        let target = match extension_from_url(url) {
            Some(ext) => with_name_suffix(path, &ext),
            None => path.to_path_buf(),
        };
        let (exists, target) = path_check(&target, PATH_CHECK_RETRY).await?;
        if exists {
            info!(path = %target.display(), "exists");
            return Ok(target);
        }
        let bytes = self.core.client.get_bytes(url).await?;
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| DownloadError::io(&target, e))?;
        info!(path = %target.display(), "done");
        Ok(target)
    }

    /// Waits for a job slot on the shared job gate.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::GateClosed`] if the gate was closed.
    pub async fn acquire_job(&self) -> Result<OwnedSemaphorePermit, DownloadError> {
        self.core.governor.acquire_job().await
    }

    /// The shared progress surface.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressSurface> {
        self.core.governor.progress()
    }

    /// The engine's HTTP client.
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.core.client
    }

    /// The transmux tool.
    #[must_use]
    pub fn tool(&self) -> &Arc<dyn Transmuxer> {
        &self.core.tool
    }

    /// The engine's governor.
    #[must_use]
    pub fn governor(&self) -> &Governor {
        &self.core.governor
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ffmpeg::Ffmpeg;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(config: EngineConfig) -> Result<DownloadEngine, EngineError> {
        DownloadEngine::new(
            config,
            Arc::new(ProgressSurface::hidden()),
            Arc::new(Ffmpeg::default()),
        )
    }

    #[test]
    fn test_engine_rejects_out_of_range_concurrency() {
        let result = engine(EngineConfig {
            video_concurrency: 0,
            ..EngineConfig::default()
        });
        assert!(matches!(
            result,
            Err(EngineError::InvalidConcurrency {
                name: "video_concurrency",
                value: 0
            })
        ));

        let result = engine(EngineConfig {
            part_concurrency: 101,
            ..EngineConfig::default()
        });
        assert!(matches!(
            result,
            Err(EngineError::InvalidConcurrency {
                name: "part_concurrency",
                value: 101
            })
        ));
    }

    #[test]
    fn test_engine_accepts_bounds() {
        assert!(
            engine(EngineConfig {
                video_concurrency: 1,
                part_concurrency: 100,
                ..EngineConfig::default()
            })
            .is_ok()
        );
    }

    #[tokio::test]
    async fn test_get_static_appends_url_suffix_and_skips_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/cover.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = engine(EngineConfig {
            retry: RetrySchedule::immediate(),
            ..EngineConfig::default()
        })
        .unwrap();
        let url = format!("{}/cover.jpg?x=1", server.uri());

        let saved = engine
            .get_static(&url, &dir.path().join("Title"))
            .await
            .unwrap();
        assert_eq!(saved, dir.path().join("Title.jpg"));
        assert_eq!(std::fs::read(&saved).unwrap(), b"jpeg");

        let again = engine
            .get_static(&url, &dir.path().join("Title"))
            .await
            .unwrap();
        assert_eq!(again, saved);
    }
}
