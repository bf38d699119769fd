//! Fast stores (Redis, or in-process maps for a single process).
//!
//! These hold the hot, short-lived state of the click pipeline. Nothing here
//! is the system of record: the buffer drains into the durable store, the
//! ranking can be reseeded from it, and caches expire on their own.
//!
//! ## Stores
//!
//! - **buffer** - Two-generation per-user click buffer (active/processing)
//! - **ranking** - Sorted set of user totals for rank and top-N queries
//! - **leaderboard** - Cached top-N snapshot, threshold, recompute lock
//! - **existence** - Tri-state user existence flags with TTL
//! - **rate_limit** - Fixed-window (Redis) and sliding-window (in-process) limiters
//!
//! ## Redis Key Patterns
//!
//! ```text
//! clicks:buffer                  → hash user_id → clicks not yet claimed
//! clicks:processing              → hash user_id → clicks claimed by a flush
//! clicks:ranking                 → sorted set user_id → total clicks
//! leaderboard:top                → top-N snapshot JSON (auto-expires)
//! leaderboard:threshold          → lowest score in the last snapshot
//! leaderboard:lock               → recompute lock token (auto-expires)
//! user:exists:{telegram_id}      → "1" / "0" (auto-expires)
//! ratelimit:click:{telegram_id}  → click submissions in window
//! ratelimit:global               → API requests in window
//! ```

mod buffer;
mod existence;
mod leaderboard;
mod rate_limit;
mod ranking;

pub use buffer::{BufferStore, Generation, MemoryBufferStore, RedisBufferStore};
pub use existence::{Existence, ExistenceCache, MemoryExistenceCache, RedisExistenceCache};
pub use leaderboard::{
    LeaderboardStore, LockToken, MemoryLeaderboardStore, RedisLeaderboardStore,
};
pub use rate_limit::{
    GLOBAL_SCOPE, RateLimiter, RedisRateLimiter, SlidingWindowRateLimiter, click_scope,
};
pub use ranking::{MemoryRankingStore, RankingStore, RedisRankingStore};

#[cfg(test)]
pub use buffer::{MockBufferStore, ScanPage};
#[cfg(test)]
pub use leaderboard::MockLeaderboardStore;
#[cfg(test)]
pub use rate_limit::{MockRateLimiter, RateLimitResult};
#[cfg(test)]
pub use ranking::MockRankingStore;

use std::sync::Arc;
use std::time::Duration;

/// Collection of all fast stores.
#[derive(Clone)]
pub struct Stores {
    pub buffer: Arc<dyn BufferStore>,
    pub ranking: Arc<dyn RankingStore>,
    pub leaderboard: Arc<dyn LeaderboardStore>,
    pub existence: Arc<dyn ExistenceCache>,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

impl Stores {
    /// Stores backed by a shared Redis instance.
    pub fn redis(client: redis::Client, existence_ttl: Duration) -> Self {
        Stores {
            buffer: Arc::new(RedisBufferStore::new(client.clone())),
            ranking: Arc::new(RedisRankingStore::new(client.clone())),
            leaderboard: Arc::new(RedisLeaderboardStore::new(client.clone())),
            existence: Arc::new(RedisExistenceCache::new(client.clone(), existence_ttl)),
            rate_limiter: Arc::new(RedisRateLimiter::new(client)),
        }
    }

    /// Stores held in this process only.
    pub fn memory(existence_ttl: Duration) -> Self {
        Stores {
            buffer: Arc::new(MemoryBufferStore::new()),
            ranking: Arc::new(MemoryRankingStore::new()),
            leaderboard: Arc::new(MemoryLeaderboardStore::new()),
            existence: Arc::new(MemoryExistenceCache::new(existence_ttl)),
            rate_limiter: Arc::new(SlidingWindowRateLimiter::new()),
        }
    }
}
