//! User existence cache for Redis.
//!
//! ```text
//! user:exists:{telegram_id} → "1" present, "0" absent (auto-expires)
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tokio::time::Instant;

/// Cached knowledge about whether a user has a durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    /// A durable record was seen recently.
    Present,
    /// Confirmed missing recently.
    Absent,
    /// Nothing cached; the durable store must be asked.
    Unknown,
}

impl Existence {
    fn from_flag(flag: Option<String>) -> Self {
        match flag.as_deref() {
            Some("1") => Existence::Present,
            Some(_) => Existence::Absent,
            None => Existence::Unknown,
        }
    }
}

/// Store for per-user existence flags with TTL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExistenceCache: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Existence>;

    /// Record that the user does or does not exist.
    async fn set(&self, user_id: i64, exists: bool) -> Result<()>;
}

/// Redis implementation of ExistenceCache.
#[derive(Clone)]
pub struct RedisExistenceCache {
    client: redis::Client,
    ttl: Duration,
}

impl RedisExistenceCache {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn exists_key(user_id: i64) -> String {
        format!("user:exists:{}", user_id)
    }
}

#[async_trait]
impl ExistenceCache for RedisExistenceCache {
    async fn get(&self, user_id: i64) -> Result<Existence> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let flag: Option<String> = conn.get(Self::exists_key(user_id)).await?;
        Ok(Existence::from_flag(flag))
    }

    async fn set(&self, user_id: i64, exists: bool) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let flag = if exists { "1" } else { "0" };

        let _: () = conn
            .set_ex(Self::exists_key(user_id), flag, self.ttl.as_secs())
            .await?;
        Ok(())
    }
}

/// In-process implementation of ExistenceCache.
pub struct MemoryExistenceCache {
    flags: DashMap<i64, (bool, Instant)>,
    ttl: Duration,
}

impl MemoryExistenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flags: DashMap::new(),
            ttl,
        }
    }

    /// Drop expired flags. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.flags.len();
        self.flags.retain(|_, entry| now < entry.1);
        before.saturating_sub(self.flags.len())
    }
}

#[async_trait]
impl ExistenceCache for MemoryExistenceCache {
    async fn get(&self, user_id: i64) -> Result<Existence> {
        let cached = self
            .flags
            .get(&user_id)
            .filter(|entry| Instant::now() < entry.1)
            .map(|entry| entry.0);

        Ok(match cached {
            Some(true) => Existence::Present,
            Some(false) => Existence::Absent,
            None => Existence::Unknown,
        })
    }

    async fn set(&self, user_id: i64, exists: bool) -> Result<()> {
        self.flags.insert(user_id, (exists, Instant::now() + self.ttl));
        Ok(())
    }
}
