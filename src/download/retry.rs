//! Failure classification and linear retry schedules.
//!
//! This module provides [`FailureKind`] and [`RetrySchedule`], which together
//! decide whether a failed request is retried and how long to wait first.
//!
//! # Overview
//!
//! Every [`DownloadError`] is classified into a [`FailureKind`]:
//! - [`FailureKind::Transport`] - connect/read timeouts and protocol errors
//! - [`FailureKind::HttpStatus`] - a non-2xx response
//! - [`FailureKind::Unknown`] - anything else
//!
//! Delays grow linearly with the attempt number. Whole-request fetches wait
//! `step * (attempt + 1)`; range parts wait `step * attempt` because their
//! first retry should start right away.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mediadl_core::download::{DownloadError, RetryDecision, RetrySchedule, classify_error};
//!
//! let schedule = RetrySchedule::default();
//! let error = DownloadError::http_status("https://cdn.example.com/a.m4s", 503);
//!
//! match schedule.fetch_decision(classify_error(&error), 0, 5) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(1));
//!         assert_eq!(attempt, 1);
//!     }
//!     RetryDecision::GiveUp { reason } => panic!("unexpected: {reason}"),
//! }
//! ```

use std::time::Duration;

use tracing::{debug, instrument};

use super::DownloadError;

/// Default number of retries for whole-body requests.
pub const DEFAULT_STREAM_RETRY: u32 = 5;

/// A part gives up once its attempt counter exceeds this value.
pub const PART_RETRY_LIMIT: u32 = 5;

const DEFAULT_TRANSPORT_STEP: Duration = Duration::from_millis(100);
const DEFAULT_STATUS_STEP: Duration = Duration::from_secs(1);
const DEFAULT_UNKNOWN_STEP: Duration = Duration::from_millis(500);
const DEFAULT_FORBIDDEN_STEP: Duration = Duration::from_secs(10);

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connect/read/write timeouts and protocol-level failures.
    Transport,

    /// The server answered with a non-2xx status.
    HttpStatus(u16),

    /// Anything else; not retried by whole-request fetches.
    Unknown,
}

impl FailureKind {
    /// Returns true for an HTTP 403 response.
    #[must_use]
    pub fn is_forbidden(self) -> bool {
        self == Self::HttpStatus(403)
    }
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Attempt number of the retry (0-indexed, so the first retry is 1).
        attempt: u32,
    },

    /// Stop and surface the last error.
    GiveUp {
        /// Human-readable reason.
        reason: String,
    },
}

/// Linear backoff steps for each failure kind.
///
/// # Default Values
///
/// - transport: 100 ms
/// - HTTP status: 1 s
/// - unknown (parts only): 500 ms
/// - forbidden (403) extra wait: 10 s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    transport_step: Duration,
    status_step: Duration,
    unknown_step: Duration,
    forbidden_step: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            transport_step: DEFAULT_TRANSPORT_STEP,
            status_step: DEFAULT_STATUS_STEP,
            unknown_step: DEFAULT_UNKNOWN_STEP,
            forbidden_step: DEFAULT_FORBIDDEN_STEP,
        }
    }
}

impl RetrySchedule {
    /// Creates a schedule with custom steps.
    #[must_use]
    pub fn new(
        transport_step: Duration,
        status_step: Duration,
        unknown_step: Duration,
        forbidden_step: Duration,
    ) -> Self {
        Self {
            transport_step,
            status_step,
            unknown_step,
            forbidden_step,
        }
    }

    /// A schedule that never sleeps. Useful for tests against local servers.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        )
    }

    /// Decides whether a whole-request fetch is retried.
    ///
    /// `attempt` is the 0-indexed attempt that just failed; `retries` is the
    /// number of retries allowed after the first attempt.
    #[instrument(skip(self))]
    pub fn fetch_decision(&self, kind: FailureKind, attempt: u32, retries: u32) -> RetryDecision {
        let step = match kind {
            FailureKind::Transport => self.transport_step,
            FailureKind::HttpStatus(_) => self.status_step,
            FailureKind::Unknown => {
                return RetryDecision::GiveUp {
                    reason: "unclassified failure is not retried".to_string(),
                };
            }
        };

        if attempt >= retries {
            debug!(attempt, retries, "retries exhausted");
            return RetryDecision::GiveUp {
                reason: format!("{} attempts exhausted", retries + 1),
            };
        }

        let delay = step * (attempt + 1);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Delay before re-requesting a range part after `kind` at `attempt`.
    ///
    /// Status failures carry no base delay; the 403 rule is applied on top by
    /// [`forbidden_delay`](Self::forbidden_delay).
    #[must_use]
    pub fn part_delay(&self, kind: FailureKind, attempt: u32) -> Duration {
        match kind {
            FailureKind::Transport => self.transport_step * attempt,
            FailureKind::Unknown => self.unknown_step * attempt,
            FailureKind::HttpStatus(_) => Duration::ZERO,
        }
    }

    /// Extra wait after a 403 response at `attempt`.
    #[must_use]
    pub fn forbidden_delay(&self, attempt: u32) -> Duration {
        self.forbidden_step * (attempt + 1)
    }
}

/// Classifies a download error for retry decisions.
///
/// | Error | Kind |
/// |-------|------|
/// | `Transport`, `Timeout` | `Transport` |
/// | `HttpStatus` | `HttpStatus(code)` |
/// | everything else | `Unknown` |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::Transport { source, .. } if !source.is_builder() => FailureKind::Transport,
        DownloadError::Timeout { .. } => FailureKind::Transport,
        DownloadError::HttpStatus { status, .. } => FailureKind::HttpStatus(*status),
        _ => FailureKind::Unknown,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_decision_transport_delay_is_linear() {
        let schedule = RetrySchedule::default();
        assert_eq!(
            schedule.fetch_decision(FailureKind::Transport, 0, 5),
            RetryDecision::Retry {
                delay: Duration::from_millis(100),
                attempt: 1
            }
        );
        assert_eq!(
            schedule.fetch_decision(FailureKind::Transport, 3, 5),
            RetryDecision::Retry {
                delay: Duration::from_millis(400),
                attempt: 4
            }
        );
    }

    #[test]
    fn test_fetch_decision_status_delay_is_one_second_steps() {
        let schedule = RetrySchedule::default();
        match schedule.fetch_decision(FailureKind::HttpStatus(500), 1, 5) {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(attempt, 2);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_decision_unknown_is_not_retried() {
        let schedule = RetrySchedule::default();
        assert!(matches!(
            schedule.fetch_decision(FailureKind::Unknown, 0, 5),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_fetch_decision_gives_up_after_retries() {
        let schedule = RetrySchedule::default();
        match schedule.fetch_decision(FailureKind::Transport, 5, 5) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains('6'), "{reason}"),
            other => panic!("expected give up, got {other:?}"),
        }
    }

    #[test]
    fn test_part_delay_per_kind() {
        let schedule = RetrySchedule::default();
        assert_eq!(
            schedule.part_delay(FailureKind::Transport, 2),
            Duration::from_millis(200)
        );
        assert_eq!(
            schedule.part_delay(FailureKind::Unknown, 3),
            Duration::from_millis(1500)
        );
        assert_eq!(
            schedule.part_delay(FailureKind::HttpStatus(503), 4),
            Duration::ZERO
        );
        assert_eq!(schedule.part_delay(FailureKind::Transport, 0), Duration::ZERO);
    }

    #[test]
    fn test_forbidden_delay_grows_by_ten_seconds() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.forbidden_delay(0), Duration::from_secs(10));
        assert_eq!(schedule.forbidden_delay(2), Duration::from_secs(30));
    }

    #[test]
    fn test_immediate_schedule_never_sleeps() {
        let schedule = RetrySchedule::immediate();
        assert_eq!(schedule.forbidden_delay(4), Duration::ZERO);
        assert_eq!(
            schedule.fetch_decision(FailureKind::HttpStatus(502), 0, 1),
            RetryDecision::Retry {
                delay: Duration::ZERO,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_classify_error_variants() {
        assert_eq!(
            classify_error(&DownloadError::timeout("https://a.example/x")),
            FailureKind::Transport
        );
        assert_eq!(
            classify_error(&DownloadError::http_status("https://a.example/x", 403)),
            FailureKind::HttpStatus(403)
        );
        assert_eq!(
            classify_error(&DownloadError::invalid_url("nope")),
            FailureKind::Unknown
        );
        assert!(FailureKind::HttpStatus(403).is_forbidden());
        assert!(!FailureKind::HttpStatus(404).is_forbidden());
    }
}
