//! Download engine defaults.

/// Connect timeout for media requests.
pub(crate) const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Read timeout for media requests (large ranges stream for a while).
pub(crate) const READ_TIMEOUT_SECS: u64 = 300;

/// Default number of media jobs running at once.
pub const DEFAULT_VIDEO_CONCURRENCY: usize = 3;

/// Default number of ranges or segments fetched at once inside one job.
pub const DEFAULT_PART_CONCURRENCY: usize = 10;

/// Upper bound accepted for either concurrency setting.
pub(crate) const MAX_CONCURRENCY: usize = 100;

/// Capacity of the per-engine URL health score cache.
pub const URL_SCORE_CAPACITY: usize = 1000;

/// Below this limit (bytes/s) stream chunks are clamped to a tenth of the limit.
pub(crate) const SMALL_SPEED_LIMIT: f64 = 1e5;

/// Default attempts used for `path_check` shortening.
pub const PATH_CHECK_RETRY: u32 = 100;
