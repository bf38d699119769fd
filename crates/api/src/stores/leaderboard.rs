//! Leaderboard snapshot storage for Redis.
//!
//! ```text
//! leaderboard:top        → JSON list of LeaderEntry (auto-expires)
//! leaderboard:threshold  → score of the lowest entry in the last snapshot
//! leaderboard:lock       → owner token of the recompute lock (auto-expires)
//! ```

use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use shared::api::LeaderEntry;
use tokio::time::Instant;
use uuid::Uuid;

const SNAPSHOT_KEY: &str = "leaderboard:top";
const THRESHOLD_KEY: &str = "leaderboard:threshold";
const LOCK_KEY: &str = "leaderboard:lock";

/// Deletes the lock only if it still holds the caller's token.
static UNLOCK_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

/// Proof of lock ownership, required to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn generate() -> Self {
        LockToken(Uuid::new_v4().to_string())
    }
}

/// Lowest score in a snapshot, 0 for an empty one.
pub fn snapshot_threshold(leaders: &[LeaderEntry]) -> i64 {
    leaders.last().map_or(0, |entry| entry.clicks)
}

/// Store for the cached top-N view.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// Cached snapshot, None when missing or expired.
    async fn get(&self) -> Result<Option<Vec<LeaderEntry>>>;

    /// Store a snapshot with TTL and record its lowest score as the threshold.
    async fn put(&self, leaders: &[LeaderEntry], ttl: Duration) -> Result<()>;

    /// Threshold recorded by the last `put`, None if never recorded.
    async fn threshold(&self) -> Result<Option<i64>>;

    /// Drop the snapshot. The threshold is kept.
    async fn invalidate(&self) -> Result<()>;

    /// Try to take the recompute lock. None when another holder has it.
    async fn try_lock(&self, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release the lock if `token` still owns it.
    async fn unlock(&self, token: &LockToken) -> Result<()>;
}

/// Redis implementation of LeaderboardStore.
#[derive(Clone)]
pub struct RedisLeaderboardStore {
    client: redis::Client,
}

impl RedisLeaderboardStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LeaderboardStore for RedisLeaderboardStore {
    async fn get(&self) -> Result<Option<Vec<LeaderEntry>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let json: Option<String> = conn.get(SNAPSHOT_KEY).await?;

        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, leaders: &[LeaderEntry], ttl: Duration) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(leaders)?;

        let _: () = redis::pipe()
            .atomic()
            .pset_ex(SNAPSHOT_KEY, json, ttl.as_millis() as u64)
            .set(THRESHOLD_KEY, snapshot_threshold(leaders))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn threshold(&self) -> Result<Option<i64>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let threshold: Option<i64> = conn.get(THRESHOLD_KEY).await?;
        Ok(threshold)
    }

    async fn invalidate(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: () = conn.del(SNAPSHOT_KEY).await?;
        Ok(())
    }

    async fn try_lock(&self, ttl: Duration) -> Result<Option<LockToken>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = LockToken::generate();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg(&token.0)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| token))
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: i64 = UNLOCK_SCRIPT
            .key(LOCK_KEY)
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLeaderboard {
    snapshot: Option<(Vec<LeaderEntry>, Instant)>,
    threshold: Option<i64>,
    lock: Option<(LockToken, Instant)>,
}

/// In-process implementation of LeaderboardStore.
#[derive(Default)]
pub struct MemoryLeaderboardStore {
    inner: Mutex<MemoryLeaderboard>,
}

impl MemoryLeaderboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MemoryLeaderboard> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LeaderboardStore for MemoryLeaderboardStore {
    async fn get(&self) -> Result<Option<Vec<LeaderEntry>>> {
        let inner = self.lock_inner();
        Ok(inner
            .snapshot
            .as_ref()
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(leaders, _)| leaders.clone()))
    }

    async fn put(&self, leaders: &[LeaderEntry], ttl: Duration) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.snapshot = Some((leaders.to_vec(), Instant::now() + ttl));
        inner.threshold = Some(snapshot_threshold(leaders));
        Ok(())
    }

    async fn threshold(&self) -> Result<Option<i64>> {
        Ok(self.lock_inner().threshold)
    }

    async fn invalidate(&self) -> Result<()> {
        self.lock_inner().snapshot = None;
        Ok(())
    }

    async fn try_lock(&self, ttl: Duration) -> Result<Option<LockToken>> {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        if let Some((_, expires_at)) = &inner.lock
            && now < *expires_at
        {
            return Ok(None);
        }

        let token = LockToken::generate();
        inner.lock = Some((token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.lock.as_ref().is_some_and(|(held, _)| held == token) {
            inner.lock = None;
        }
        Ok(())
    }
}
