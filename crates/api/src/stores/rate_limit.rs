//! Rate limiting counters.
//!
//! ```text
//! ratelimit:click:{telegram_id} → per-user click submissions in the window
//! ratelimit:global              → all API requests in the window
//! ```

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::Script;
use tokio::time::Instant;

/// Scope key for global request admission.
pub const GLOBAL_SCOPE: &str = "ratelimit:global";

/// Scope key for a user's click submissions.
pub fn click_scope(user_id: i64) -> String {
    format!("ratelimit:click:{}", user_id)
}

/// Increment, arm expiry on the first hit of the window, compare.
/// Returns the post-increment count, negated when over the limit.
static FIXED_WINDOW_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local current = redis.call('INCR', KEYS[1])
        if current == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        if current > tonumber(ARGV[1]) then
            return -current
        end
        return current
        "#,
    )
});

/// Rate limiter trait for checking and incrementing counters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key`. Allowed while the count within the
    /// current window is at most `limit`.
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult>;
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Under the limit, includes current count.
    Allowed(u64),
    /// Over the limit, includes current count.
    Exceeded(u64),
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed(_))
    }

    /// Requests counted in the window, including this one.
    pub fn count(&self) -> u64 {
        match self {
            RateLimitResult::Allowed(count) | RateLimitResult::Exceeded(count) => *count,
        }
    }

    fn from_script(reply: i64) -> Self {
        if reply < 0 {
            RateLimitResult::Exceeded(reply.unsigned_abs())
        } else {
            RateLimitResult::Allowed(reply as u64)
        }
    }
}

/// Redis implementation of RateLimiter (fixed window, one atomic round trip).
#[derive(Clone)]
pub struct RedisRateLimiter {
    client: redis::Client,
}

impl RedisRateLimiter {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: i64 = FIXED_WINDOW_SCRIPT
            .key(key)
            .arg(limit)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitResult::from_script(reply))
    }
}

/// In-process sliding window limiter.
///
/// Keeps the timestamps of recent requests per scope. Used when no shared
/// store is available; limits are per process in that case.
#[derive(Default)]
pub struct SlidingWindowRateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &str, limit: u64, window: Duration) -> RateLimitResult {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let timestamps = entry.value_mut();

        while timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            timestamps.pop_front();
        }

        let count = timestamps.len() as u64;
        if count >= limit {
            return RateLimitResult::Exceeded(count + 1);
        }

        timestamps.push_back(now);
        RateLimitResult::Allowed(count + 1)
    }

    /// Remove scopes with no requests inside `window` to bound memory.
    pub fn cleanup(&self, window: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, timestamps| {
            timestamps.retain(|t| now.saturating_duration_since(*t) < window);
            !timestamps.is_empty()
        });
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitResult> {
        Ok(self.record(key, limit, window))
    }
}
