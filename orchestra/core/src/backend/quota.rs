//! Provider quota hints
//!
//! Providers report remaining quota in response headers, each with their own
//! spelling. [`QuotaHint`] is the one normalised shape produced at the
//! executor boundary, so the rate limiter never has to look at raw headers or
//! response bodies.
//!
//! Recognised headers (matched case-insensitively):
//!
//! | Field | Headers |
//! |---|---|
//! | remaining | `x-ratelimit-remaining`, `x-ratelimit-remaining-requests`, `anthropic-ratelimit-requests-remaining`, `ratelimit-remaining` |
//! | limit | `x-ratelimit-limit`, `x-ratelimit-limit-requests`, `anthropic-ratelimit-requests-limit`, `ratelimit-limit` |
//! | reset | `x-ratelimit-reset`, `x-ratelimit-reset-requests`, `anthropic-ratelimit-requests-reset`, `ratelimit-reset` |
//! | retry after | `retry-after`, `retry-after-ms` |
//!
//! Reset values may be plain seconds, epoch seconds, Go-style durations
//! (`6m0s`, `250ms`) or RFC 3339 timestamps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Epoch values above this are absolute timestamps rather than relative seconds
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Longest wait a provider hint may impose
pub const MAX_HINT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Normalised provider quota information
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaHint {
    /// Requests remaining in the provider's current window
    pub remaining: Option<u64>,
    /// Size of the provider's window
    pub limit: Option<u64>,
    /// When the provider's window resets
    pub reset_at: Option<Instant>,
    /// Provider-requested wait before the next call
    pub retry_after: Option<Duration>,
    /// When the hint was observed
    pub observed_at: Instant,
}

impl QuotaHint {
    /// Create an empty hint observed now
    #[must_use]
    pub fn new() -> Self {
        Self {
            remaining: None,
            limit: None,
            reset_at: None,
            retry_after: None,
            observed_at: Instant::now(),
        }
    }

    /// Set remaining requests
    #[must_use]
    pub fn with_remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    /// Set window size
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set reset time relative to observation
    #[must_use]
    pub fn with_reset_in(mut self, reset_in: Duration) -> Self {
        self.reset_at = self.observed_at.checked_add(reset_in.min(MAX_HINT_DELAY));
        self
    }

    /// Set a retry-after delay
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after.min(MAX_HINT_DELAY));
        self
    }

    /// Parse a hint from `(name, value)` header pairs
    ///
    /// Returns `None` when no recognised header is present.
    pub fn from_headers<I, K, V>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let observed_at = Instant::now();
        let wall_now = Utc::now();
        let mut hint = Self {
            observed_at,
            ..Self::new()
        };
        let mut seen = false;

        for (name, value) in headers {
            let name = name.as_ref().to_ascii_lowercase();
            let value = value.as_ref().trim();
            match name.as_str() {
                "x-ratelimit-remaining"
                | "x-ratelimit-remaining-requests"
                | "anthropic-ratelimit-requests-remaining"
                | "ratelimit-remaining" => {
                    if let Some(v) = parse_count(value) {
                        hint.remaining = Some(v);
                        seen = true;
                    }
                }
                "x-ratelimit-limit"
                | "x-ratelimit-limit-requests"
                | "anthropic-ratelimit-requests-limit"
                | "ratelimit-limit" => {
                    if let Some(v) = parse_count(value) {
                        hint.limit = Some(v);
                        seen = true;
                    }
                }
                "x-ratelimit-reset"
                | "x-ratelimit-reset-requests"
                | "anthropic-ratelimit-requests-reset"
                | "ratelimit-reset" => {
                    if let Some(d) = parse_reset(value, wall_now) {
                        if let Some(at) = observed_at.checked_add(d) {
                            hint.reset_at = Some(at);
                            seen = true;
                        }
                    }
                }
                "retry-after" => {
                    if let Some(d) = parse_retry_after(value, wall_now) {
                        hint.retry_after = Some(d);
                        seen = true;
                    }
                }
                "retry-after-ms" => {
                    if let Some(d) = value.parse::<f64>().ok().and_then(|ms| secs_to_delay(ms / 1000.0)) {
                        hint.retry_after = Some(d);
                        seen = true;
                    }
                }
                _ => {}
            }
        }

        seen.then_some(hint)
    }

    /// Parse a hint from a `reqwest` header map
    #[must_use]
    pub fn from_header_map(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        Self::from_headers(
            headers
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        )
    }

    /// Instant until which the provider asked us not to send requests
    #[must_use]
    pub fn blocked_until(&self) -> Option<Instant> {
        let by_quota = if self.remaining == Some(0) {
            self.reset_at
                .or_else(|| self.retry_after.and_then(|d| self.observed_at.checked_add(d)))
        } else {
            None
        };
        let by_retry = self.retry_after.and_then(|d| self.observed_at.checked_add(d));
        by_quota.max(by_retry)
    }

    /// Time left before the provider accepts requests again, if blocked
    #[must_use]
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        self.blocked_until()
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Whether the hint still blocks requests at `now`
    #[must_use]
    pub fn is_blocking(&self, now: Instant) -> bool {
        self.wait_time(now).is_some()
    }
}

impl Default for QuotaHint {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_count(value: &str) -> Option<u64> {
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

/// Convert provider-supplied seconds into a bounded delay
///
/// Rejects NaN, infinities and negative values; clamps to [`MAX_HINT_DELAY`].
fn secs_to_delay(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .map(|d| d.min(MAX_HINT_DELAY))
}

/// Parse a reset header into a duration from now
fn parse_reset(value: &str, wall_now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        if secs > EPOCH_THRESHOLD_SECS {
            let now_secs = wall_now.timestamp_millis() as f64 / 1000.0;
            return secs_to_delay((secs - now_secs).max(0.0));
        }
        return secs_to_delay(secs);
    }
    if let Some(d) = parse_go_duration(value) {
        return Some(d);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| until(at.with_timezone(&Utc), wall_now))
}

fn parse_retry_after(value: &str, wall_now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<f64>() {
        return secs_to_delay(secs);
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| until(at.with_timezone(&Utc), wall_now))
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_HINT_DELAY)
}

/// Parse durations like `1h2m3.5s`, `6m0s`, `250ms`
fn parse_go_duration(value: &str) -> Option<Duration> {
    let mut total = 0.0_f64;
    let mut rest = value;
    let mut matched = false;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let number: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_end] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" | "µs" => 0.000_001,
            "ns" => 0.000_000_001,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += number * factor;
        matched = true;
    }

    if matched {
        secs_to_delay(total)
    } else {
        None
    }
}
