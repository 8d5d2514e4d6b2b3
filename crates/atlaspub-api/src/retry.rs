//! Retry policy for transient API failures
//!
//! Exponential backoff bounded by a per-call attempt count and a total
//! sleep budget. A server-supplied `Retry-After` replaces the computed
//! delay for that attempt but still counts against the budget.

use std::time::Duration;

use atlaspub_core::config::RetryConfig;
use tracing::warn;

/// Longest `Retry-After` honoured from an HTTP-date value
const MAX_RETRY_AFTER_DATE: Duration = Duration::from_secs(3600);

/// Backoff and budget for retrying one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (never less than 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on the sum of all sleeps for one call
    pub max_total_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            max_total_wait: config.max_total_wait(),
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_total_wait: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `initial × 2^(retry-1)`,
    /// capped at `max_backoff`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Decides whether another attempt is allowed after `attempts_made`
    ///
    /// Returns the delay to sleep, or `None` when either the attempt count
    /// or the total wait budget (given the time already `waited`) would be
    /// exceeded.
    pub fn next_delay(
        &self,
        attempts_made: u32,
        waited: Duration,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        let delay = retry_after.unwrap_or_else(|| self.backoff(attempts_made));
        if waited.saturating_add(delay) > self.max_total_wait {
            return None;
        }
        Some(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2027 23:59:59 GMT") - parsed as seconds from now
///
/// Returns `None` if the value cannot be understood, so the caller falls
/// back to its own backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target <= now {
            return Some(Duration::ZERO);
        }
        return (target - now)
            .to_std()
            .ok()
            .filter(|d| *d <= MAX_RETRY_AFTER_DATE);
    }

    warn!(value, "Could not parse Retry-After header, using backoff");
    None
}
