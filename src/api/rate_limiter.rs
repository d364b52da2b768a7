// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MARKET DATA API RATE LIMITING
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Two layers:
//     - A local token bucket (requests/minute with burst headroom)
//     - Server quota feedback from X-RateLimit-* headers and 429 hints
//
// The server signal always wins: the bucket cannot see quota consumed by
// other clients sharing the same API key.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Published plan limit for the market data API
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 100;
const DEFAULT_BURST: u32 = 20;

/// Trailing window used for utilization reporting
const STATS_WINDOW: Duration = Duration::from_secs(60);

/// Warn when the server reports fewer remaining requests than this
const LOW_QUOTA_WARNING: u32 = 10;

/// Reset header values above this are unix timestamps, below are deltas
const EPOCH_RESET_THRESHOLD: f64 = 1_000_000_000.0;

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

/// Server hints asking for a longer wait than this are treated as malformed
pub const MAX_SERVER_WAIT: Duration = Duration::from_secs(3_600);

/// Absorbs float drift when a waiter wakes exactly at its computed deadline
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    request_times: VecDeque<Instant>,
}

/// Token bucket with burst capacity.
///
/// Token math happens inside a short synchronous critical section, so the
/// count is never observed torn. Callers that must wait queue on an async
/// gate (FIFO) and re-validate the bucket after every sleep.
pub struct RateLimiter {
    capacity: u32,
    refill_per_second: f64,
    requests_per_minute: u32,
    state: Mutex<BucketState>,
    gate: tokio::sync::Mutex<()>,
}

/// Result of a non-blocking availability check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Availability {
    pub available: bool,
    pub wait: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let requests_per_minute = config.requests_per_minute.max(1);
        let capacity = config.burst.max(1);

        tracing::info!(
            "🛡️  RateLimiter initialized: {} req/min, burst={}",
            requests_per_minute,
            capacity
        );

        Self {
            capacity,
            refill_per_second: requests_per_minute as f64 / 60.0,
            requests_per_minute,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                request_times: VecDeque::new(),
            }),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Take `tokens` from the bucket, suspending until enough have refilled.
    ///
    /// Requests larger than the bucket are clamped to its capacity.
    /// Dropping the returned future while it waits releases the queue slot
    /// without touching the token count.
    pub async fn acquire(&self, tokens: u32) {
        let requested = self.clamp_request(tokens) as f64;
        let _turn = self.gate.lock().await;

        loop {
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();
                self.refill(&mut state, now);

                if state.tokens + TOKEN_EPSILON >= requested {
                    state.tokens = (state.tokens - requested).max(0.0);
                    Self::record_request(&mut state, now);
                    return;
                }

                Duration::from_secs_f64((requested - state.tokens) / self.refill_per_second)
            };

            tracing::debug!("⏳ Rate limit reached. Waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Probe for a single token without consuming anything.
    pub fn check_availability(&self) -> Availability {
        let current = self.current_tokens();

        if current + TOKEN_EPSILON >= 1.0 {
            Availability {
                available: true,
                wait: Duration::ZERO,
            }
        } else {
            Availability {
                available: false,
                wait: Duration::from_secs_f64((1.0 - current) / self.refill_per_second),
            }
        }
    }

    /// Token count as it would be after a refill right now.
    pub fn current_tokens(&self) -> f64 {
        let state = self.lock_state();
        let elapsed = Instant::now()
            .saturating_duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.refill_per_second).min(self.capacity as f64)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let current_tokens = self.current_tokens();
        let requests_last_minute = {
            let state = self.lock_state();
            let now = Instant::now();
            state
                .request_times
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < STATS_WINDOW)
                .count()
        };

        RateLimiterStats {
            current_tokens,
            max_tokens: self.capacity,
            requests_last_minute,
            rate_limit: self.requests_per_minute,
            utilization_pct: requests_last_minute as f64 / self.requests_per_minute as f64
                * 100.0,
        }
    }

    fn clamp_request(&self, tokens: u32) -> u32 {
        if tokens > self.capacity {
            tracing::warn!(
                "⚠️  Requested {} tokens exceeds bucket capacity {}, clamping",
                tokens,
                self.capacity
            );
            self.capacity
        } else {
            tokens
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity as f64);
        state.last_refill = now;
    }

    fn record_request(state: &mut BucketState, now: Instant) {
        state.request_times.push_back(now);
        while let Some(front) = state.request_times.front() {
            if now.saturating_duration_since(*front) >= STATS_WINDOW {
                state.request_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default)]
struct ServerQuota {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    retry_after_until: Option<Instant>,
}

/// Quota as last reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerQuotaSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_in: Option<Duration>,
    pub backoff_for: Option<Duration>,
}

/// Token bucket that also honours the server's own accounting.
pub struct AdaptiveRateLimiter {
    bucket: RateLimiter,
    quota: Mutex<ServerQuota>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: RateLimiter::new(config),
            quota: Mutex::new(ServerQuota::default()),
        }
    }

    pub fn bucket(&self) -> &RateLimiter {
        &self.bucket
    }

    /// Best-effort read of the `x-ratelimit-*` headers. Header names are
    /// expected lower-cased. Anything missing or malformed is skipped.
    pub fn update_from_headers(&self, headers: &BTreeMap<String, String>) {
        let limit = parse_header::<u32>(headers, HEADER_LIMIT);
        let remaining = parse_header::<u32>(headers, HEADER_REMAINING);
        let reset = parse_header::<f64>(headers, HEADER_RESET).and_then(reset_instant);

        let mut quota = self.lock_quota();
        if let Some(limit) = limit {
            quota.limit = Some(limit);
        }
        if let Some(remaining) = remaining {
            quota.remaining = Some(remaining);
            if remaining < LOW_QUOTA_WARNING {
                tracing::warn!("⚠️  Rate limit warning: {} requests remaining", remaining);
            }
        }
        if let Some(reset) = reset {
            quota.reset_at = Some(reset);
        }
    }

    /// Wait out any server-declared exhaustion, then take from the bucket.
    pub async fn acquire(&self, tokens: u32) {
        if let Some(wait) = self.server_stall(tokens) {
            tracing::warn!("🔴 Server rate limit reached. Waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
        self.bucket.acquire(tokens).await;
    }

    /// A successful response ends any 429-induced backoff.
    pub fn report_success(&self) {
        let mut quota = self.lock_quota();
        if quota.retry_after_until.take().is_some() {
            tracing::info!("🟢 Rate limit backoff cleared");
        }
    }

    pub fn report_rate_limited(&self, retry_after: Option<Duration>) {
        match retry_after {
            Some(delay) => {
                let delay = delay.min(MAX_SERVER_WAIT);
                let until = Instant::now() + delay;
                let mut quota = self.lock_quota();
                quota.retry_after_until = Some(match quota.retry_after_until {
                    Some(existing) if existing > until => existing,
                    _ => until,
                });
                tracing::warn!("🔴 Server returned 429, backing off for {:?}", delay);
            }
            None => tracing::warn!("🔴 Server returned 429 without retry-after hint"),
        }
    }

    pub fn report_error(&self, status: u16) {
        tracing::debug!("API responded with status {}", status);
    }

    pub fn check_availability(&self) -> Availability {
        match self.server_stall(1) {
            Some(wait) => Availability {
                available: false,
                wait: wait.max(self.bucket.check_availability().wait),
            },
            None => self.bucket.check_availability(),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.bucket.stats()
    }

    pub fn server_quota(&self) -> ServerQuotaSnapshot {
        let now = Instant::now();
        let quota = self.lock_quota();
        ServerQuotaSnapshot {
            limit: quota.limit,
            remaining: quota.remaining,
            reset_in: quota.reset_at.map(|r| r.saturating_duration_since(now)),
            backoff_for: quota
                .retry_after_until
                .map(|r| r.saturating_duration_since(now)),
        }
    }

    /// How long the server says we must hold off before using `tokens`.
    fn server_stall(&self, tokens: u32) -> Option<Duration> {
        let now = Instant::now();
        let mut quota = self.lock_quota();

        if let Some(reset_at) = quota.reset_at {
            if reset_at <= now {
                // Window rolled over; the stale remaining count no longer applies
                quota.remaining = None;
                quota.reset_at = None;
            }
        }

        let mut until = None;
        if matches!(quota.remaining, Some(remaining) if remaining < tokens) {
            until = quota.reset_at;
        }
        if let Some(backoff) = quota.retry_after_until {
            until = Some(until.map_or(backoff, |u: Instant| u.max(backoff)));
        }

        until
            .map(|u| u.saturating_duration_since(now))
            .filter(|wait| !wait.is_zero())
    }

    fn lock_quota(&self) -> MutexGuard<'_, ServerQuota> {
        self.quota.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_header<T: std::str::FromStr>(headers: &BTreeMap<String, String>, name: &str) -> Option<T> {
    let raw = headers.get(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::debug!("Could not parse rate limit header {}={:?}", name, raw);
            None
        }
    }
}

/// Seconds from a server header as a wait, or `None` when negative,
/// non-finite or beyond `MAX_SERVER_WAIT`.
pub(crate) fn hint_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|wait| *wait <= MAX_SERVER_WAIT)
}

fn reset_instant(value: f64) -> Option<Instant> {
    let delay = if value > EPOCH_RESET_THRESHOLD {
        let target = UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(value).ok()?)?;
        let delay = target
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        hint_duration(delay.as_secs_f64())?
    } else {
        hint_duration(value)?
    };

    Instant::now().checked_add(delay)
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub current_tokens: f64,
    pub max_tokens: u32,
    pub requests_last_minute: usize,
    pub rate_limit: u32,
    pub utilization_pct: f64,
}

impl RateLimiterStats {
    pub fn is_healthy(&self) -> bool {
        self.utilization_pct < 80.0
    }

    pub fn format_status(&self) -> String {
        let status_icon = if self.utilization_pct < 70.0 {
            "🟢"
        } else if self.utilization_pct < 85.0 {
            "🟡"
        } else {
            "🔴"
        };

        format!(
            "{} Rate Limit: {}/{} req/min ({:.1}%) | Tokens: {:.1}/{}",
            status_icon,
            self.requests_last_minute,
            self.rate_limit,
            self.utilization_pct,
            self.current_tokens,
            self.max_tokens
        )
    }
}
