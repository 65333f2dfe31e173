//! Shared concurrency, speed and URL-health control for one engine.
//!
//! The [`Governor`] owns:
//! - the **job gate**, a FIFO semaphore bounding concurrent media jobs;
//! - the **part gate** size, used to build a fresh semaphore per fanned-out job;
//! - the **speed gate**, which delays writers while the aggregate speed of
//!   visible progress tasks exceeds the configured limit, and paces admitted
//!   bytes so the aggregate never runs ahead of the limit;
//! - [`UrlScores`], the health score of every URL seen recently.
//!
//! # Example
//!
//! ```
//! use mediadl_core::download::{FailureKind, UrlScores};
//!
//! let scores = UrlScores::new(1000, 5);
//! let url = "https://cdn.example.com/v.m4s";
//! assert_eq!(scores.score(url), 25);
//!
//! scores.penalize(url, FailureKind::HttpStatus(503));
//! assert_eq!(scores.score(url), 21);
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use lru::LruCache;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use super::constants::{SMALL_SPEED_LIMIT, URL_SCORE_CAPACITY};
use super::error::DownloadError;
use super::retry::{FailureKind, RetrySchedule};
use crate::progress::ProgressSurface;

/// Score multiplier applied to the retry cap for a URL seen for the first time.
const INITIAL_SCORE_FACTOR: i64 = 5;

/// Bounded map of URL health scores.
///
/// Reads never promote an entry, so eviction removes the entry inserted
/// longest ago.
pub struct UrlScores {
    cache: Mutex<LruCache<String, i64>>,
    initial: i64,
}

impl fmt::Debug for UrlScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlScores")
            .field("len", &self.len())
            .field("initial", &self.initial)
            .finish()
    }
}

impl UrlScores {
    /// Creates a cache holding at most `capacity` URLs, each starting at
    /// `retry_cap * 5`.
    #[must_use]
    pub fn new(capacity: usize, retry_cap: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            initial: (i64::from(retry_cap) * INITIAL_SCORE_FACTOR).max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, i64>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current score of `url` (the initial score when unseen).
    #[must_use]
    pub fn score(&self, url: &str) -> i64 {
        self.lock().peek(url).copied().unwrap_or(self.initial)
    }

    /// Lowers the score of `url` after a failure: −1 for transport errors,
    /// −4 for status errors. Scores never drop below 1.
    pub fn penalize(&self, url: &str, kind: FailureKind) {
        let penalty = match kind {
            FailureKind::Transport => 1,
            FailureKind::HttpStatus(_) => 4,
            FailureKind::Unknown => return,
        };
        let mut cache = self.lock();
        let updated = if let Some(score) = cache.peek_mut(url) {
            *score = (*score - penalty).max(1);
            *score
        } else {
            let score = (self.initial - penalty).max(1);
            cache.put(url.to_string(), score);
            score
        };
        drop(cache);
        warn!(url = %url, score = updated, "url score degraded");
    }

    /// Picks one URL, weighted by score. Returns `None` for an empty list.
    #[must_use]
    pub fn choose<'a>(&self, urls: &'a [String]) -> Option<&'a str> {
        match urls {
            [] => None,
            [only] => Some(only.as_str()),
            _ => {
                let weights: Vec<i64> = urls.iter().map(|url| self.score(url)).collect();
                let mut rng = rand::thread_rng();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => Some(urls[dist.sample(&mut rng)].as_str()),
                    Err(_) => urls.choose(&mut rng).map(String::as_str),
                }
            }
        }
    }

    /// Number of URLs currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no URL is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn contains(&self, url: &str) -> bool {
        self.lock().contains(url)
    }
}

/// Uniform choice among `urls`, used when no scores are available.
#[must_use]
pub fn choose_uniform(urls: &[String]) -> Option<&str> {
    urls.choose(&mut rand::thread_rng()).map(String::as_str)
}

/// Seconds a writer must sleep after a chunk of `chunk_len` bytes.
///
/// Returns zero unless `active_speed` exceeds `limit`; otherwise
/// `chunk/limit · active_count − chunk/active_speed`, floored at zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn throttle_delay(limit: f64, chunk_len: usize, active_speed: f64, active_count: usize) -> f64 {
    if limit <= 0.0 || active_speed <= limit || active_speed <= 0.0 {
        return 0.0;
    }
    let chunk = chunk_len as f64;
    (chunk / limit * active_count as f64 - chunk / active_speed).max(0.0)
}

/// Reserves transmission time for `chunk_len` bytes at `limit` bytes/s.
///
/// `next_free` is the instant the previously admitted bytes have been paid
/// for. Returns the new `next_free` and how long the caller must wait.
/// Idle time never accrues credit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn pace(
    next_free: Option<Instant>,
    now: Instant,
    chunk_len: usize,
    limit: f64,
) -> (Instant, Duration) {
    let start = next_free.map_or(now, |at| at.max(now));
    let done = start + Duration::from_secs_f64(chunk_len as f64 / limit);
    (done, done.saturating_duration_since(now))
}

/// Concurrency, speed and URL-health state shared by every job of an engine.
#[derive(Debug)]
pub struct Governor {
    job_gate: Arc<Semaphore>,
    pacer: Mutex<Option<Instant>>,
    part_concurrency: usize,
    speed_limit: Option<f64>,
    scores: UrlScores,
    retry: RetrySchedule,
    progress: Arc<ProgressSurface>,
}

impl Governor {
    /// Creates a governor.
    ///
    /// `stream_retry` seeds the initial URL score.
    #[must_use]
    pub fn new(
        video_concurrency: usize,
        part_concurrency: usize,
        speed_limit: Option<f64>,
        stream_retry: u32,
        retry: RetrySchedule,
        progress: Arc<ProgressSurface>,
    ) -> Self {
        Self {
            job_gate: Arc::new(Semaphore::new(video_concurrency)),
            pacer: Mutex::new(None),
            part_concurrency,
            speed_limit: speed_limit.filter(|limit| *limit > 0.0),
            scores: UrlScores::new(URL_SCORE_CAPACITY, stream_retry),
            retry,
            progress,
        }
    }

    /// Waits for a job slot. The slot is released when the permit drops.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::GateClosed`] if the gate was closed.
    pub async fn acquire_job(&self) -> Result<OwnedSemaphorePermit, DownloadError> {
        Arc::clone(&self.job_gate)
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::GateClosed)
    }

    /// A fresh semaphore sized for one job's parts or segments.
    #[must_use]
    pub fn part_gate(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.part_concurrency))
    }

    /// Number of byte ranges a file is split into.
    #[must_use]
    pub fn part_concurrency(&self) -> usize {
        self.part_concurrency
    }

    /// Configured speed limit in bytes per second.
    #[must_use]
    pub fn speed_limit(&self) -> Option<f64> {
        self.speed_limit
    }

    /// Maximum chunk size for stream writes, set only for small limits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn chunk_limit(&self) -> Option<usize> {
        self.speed_limit
            .filter(|limit| *limit < SMALL_SPEED_LIMIT)
            .map(|limit| ((limit * 0.1) as usize).max(1))
    }

    /// URL health scores.
    #[must_use]
    pub fn scores(&self) -> &UrlScores {
        &self.scores
    }

    /// Retry schedule shared by parts and streams.
    #[must_use]
    pub fn retry(&self) -> &RetrySchedule {
        &self.retry
    }

    /// Progress surface the governor reads speeds from.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressSurface> {
        &self.progress
    }

    /// Sleeps as long as the speed gate requires after writing `chunk_len` bytes.
    ///
    /// The wait is the longer of the active-speed correction
    /// ([`throttle_delay`]) and the pacing reservation ([`pace`]). Speeds are
    /// sampled including the writers' own sleeps, so the correction alone
    /// settles well above the limit.
    #[instrument(level = "trace", skip(self))]
    pub async fn throttle(&self, chunk_len: usize) {
        let Some(limit) = self.speed_limit else {
            return;
        };
        let paced = {
            let mut next_free = self.pacer.lock().unwrap_or_else(PoisonError::into_inner);
            let (done, wait) = pace(*next_free, Instant::now(), chunk_len, limit);
            *next_free = Some(done);
            wait
        };
        let corrected = self.progress.active_speed().map_or(0.0, |active_speed| {
            throttle_delay(limit, chunk_len, active_speed, self.progress.active_count())
        });
        let delay = paced.max(Duration::from_secs_f64(corrected));
        if !delay.is_zero() {
            debug!(limit, delay_secs = delay.as_secs_f64(), "speed gate");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Splits `chunk` into slices of at most `limit` bytes (the whole chunk when unset).
pub(crate) fn reslice(chunk: &[u8], limit: Option<usize>) -> std::slice::Chunks<'_, u8> {
    chunk.chunks(limit.unwrap_or(chunk.len()).max(1))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::progress::{TaskSpec, TaskUpdate};

    fn governor(speed_limit: Option<f64>) -> Governor {
        Governor::new(
            3,
            10,
            speed_limit,
            5,
            RetrySchedule::immediate(),
            Arc::new(ProgressSurface::hidden()),
        )
    }

    #[test]
    fn test_score_starts_at_five_times_retry_cap() {
        let scores = UrlScores::new(10, 5);
        assert_eq!(scores.score("https://a.example/x"), 25);
        assert!(scores.is_empty());
    }

    #[test]
    fn test_penalize_clamps_at_one() {
        let scores = UrlScores::new(10, 1);
        let url = "https://a.example/x";
        scores.penalize(url, FailureKind::HttpStatus(500));
        assert_eq!(scores.score(url), 1);
        scores.penalize(url, FailureKind::Transport);
        assert_eq!(scores.score(url), 1);
    }

    #[test]
    fn test_penalize_is_monotonic() {
        let scores = UrlScores::new(10, 5);
        let url = "https://a.example/x";
        let mut last = scores.score(url);
        for kind in [
            FailureKind::Transport,
            FailureKind::HttpStatus(403),
            FailureKind::Unknown,
            FailureKind::Transport,
        ] {
            scores.penalize(url, kind);
            let now = scores.score(url);
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, 25 - 1 - 4 - 1);
    }

    #[test]
    fn test_lru_bounded_and_evicts_oldest_insert() {
        let scores = UrlScores::new(3, 5);
        for i in 0..3 {
            scores.penalize(&format!("https://a.example/{i}"), FailureKind::Transport);
        }
        // Updating the oldest entry must not refresh its position.
        scores.penalize("https://a.example/0", FailureKind::Transport);
        let _ = scores.score("https://a.example/0");
        scores.penalize("https://a.example/3", FailureKind::Transport);

        assert_eq!(scores.len(), 3);
        assert!(!scores.contains("https://a.example/0"));
        assert!(scores.contains("https://a.example/1"));
        assert!(scores.contains("https://a.example/3"));
    }

    #[test]
    fn test_choose_prefers_healthy_urls() {
        let scores = UrlScores::new(10, 5);
        let urls = vec![
            "https://bad.example/x".to_string(),
            "https://good.example/x".to_string(),
        ];
        for _ in 0..10 {
            scores.penalize(&urls[0], FailureKind::HttpStatus(503));
        }
        let good = (0..200)
            .filter(|_| scores.choose(&urls) == Some("https://good.example/x"))
            .count();
        // weights 1 vs 25
        assert!(good > 150, "good chosen {good} times");
        assert_eq!(scores.choose(&[]), None);
    }

    #[test]
    fn test_throttle_delay_formula() {
        // limit 1 MB/s, one active task at 2 MB/s, 64 KiB chunk
        let delay = throttle_delay(1e6, 65_536, 2e6, 1);
        let expected = 65_536.0 / 1e6 - 65_536.0 / 2e6;
        assert!((delay - expected).abs() < 1e-9);

        assert_eq!(throttle_delay(1e6, 65_536, 5e5, 1), 0.0);
        assert_eq!(throttle_delay(0.0, 65_536, 5e6, 1), 0.0);
    }

    #[test]
    fn test_chunk_limit_only_for_small_limits() {
        assert_eq!(governor(Some(5e4)).chunk_limit(), Some(5000));
        assert_eq!(governor(Some(1e6)).chunk_limit(), None);
        assert_eq!(governor(None).chunk_limit(), None);
        assert_eq!(governor(Some(0.0)).speed_limit(), None);
    }

    #[test]
    fn test_reslice_respects_limit() {
        let data = vec![0u8; 25];
        let sizes: Vec<usize> = reslice(&data, Some(10)).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(reslice(&data, None).count(), 1);
    }

    #[tokio::test]
    async fn test_job_gate_bounds_concurrency() {
        let governor = governor(None);
        let a = governor.acquire_job().await.unwrap();
        let _b = governor.acquire_job().await.unwrap();
        let _c = governor.acquire_job().await.unwrap();
        let fourth =
            tokio::time::timeout(Duration::from_millis(50), governor.acquire_job()).await;
        assert!(fourth.is_err(), "fourth job must wait");
        drop(a);
        assert!(governor.acquire_job().await.is_ok());
    }

    #[test]
    fn test_pace_reserves_back_to_back() {
        let now = Instant::now();
        let (first, wait) = pace(None, now, 500, 1000.0);
        assert_eq!(wait, Duration::from_millis(500));
        let (second, wait) = pace(Some(first), now, 500, 1000.0);
        assert_eq!(wait, Duration::from_secs(1));
        assert_eq!(second, now + Duration::from_secs(1));

        // idle time does not bank credit
        let later = now + Duration::from_secs(10);
        let (_, wait) = pace(Some(second), later, 100, 1000.0);
        assert_eq!(wait, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_throttle_without_limit_returns_immediately() {
        let governor = governor(None);
        tokio::time::timeout(Duration::from_millis(100), governor.throttle(1_000_000))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_paces_aggregate_bytes() {
        let governor = governor(Some(1000.0));
        let started = Instant::now();
        for _ in 0..4 {
            governor.throttle(500).await;
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
