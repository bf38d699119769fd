//! Cached top-N view with stampede protection.
//!
//! On a miss only the holder of the recompute lock rebuilds the snapshot.
//! Everyone else polls the cache for a bounded time and, if it is still
//! empty, computes and stores the snapshot without the lock. The lock TTL
//! must be shorter than the poll budget, so a crashed holder never stalls
//! readers for long.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use shared::api::LeaderEntry;

use crate::{
    models::FlushedUser,
    stores::{LeaderboardStore, LockToken},
};

#[derive(Debug, Clone, Copy)]
pub struct LeaderboardSettings {
    /// Number of entries in a snapshot.
    pub size: usize,
    pub ttl: Duration,
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            size: 25,
            ttl: Duration::from_secs(5),
            lock_ttl: Duration::from_millis(400),
            poll_interval: Duration::from_millis(50),
            poll_attempts: 10,
        }
    }
}

impl LeaderboardSettings {
    /// Longest a reader waits for someone else's snapshot.
    pub fn poll_budget(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }
}

/// Decides whether a flushed batch can have changed the top-N ordering.
///
/// A single increment of at least `ratio` times the lowest leaderboard
/// score counts as large enough. This is an approximation, not an exact
/// ordering check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvalidationPolicy {
    pub ratio: f64,
}

impl Default for InvalidationPolicy {
    fn default() -> Self {
        Self { ratio: 0.1 }
    }
}

impl InvalidationPolicy {
    /// `threshold` is None when no snapshot was ever stored.
    pub fn should_invalidate(&self, threshold: Option<i64>, max_added: i64) -> bool {
        match threshold {
            None => true,
            Some(threshold) => max_added as f64 >= threshold as f64 * self.ratio,
        }
    }
}

pub struct LeaderboardCache {
    store: Arc<dyn LeaderboardStore>,
    settings: LeaderboardSettings,
    policy: InvalidationPolicy,
}

impl LeaderboardCache {
    pub fn new(
        store: Arc<dyn LeaderboardStore>,
        settings: LeaderboardSettings,
        policy: InvalidationPolicy,
    ) -> Self {
        Self {
            store,
            settings,
            policy,
        }
    }

    pub fn size(&self) -> usize {
        self.settings.size
    }

    /// Cached snapshot, or one built by `compute`.
    ///
    /// Cache and lock failures are logged and treated as misses; only a
    /// failing `compute` is returned as an error.
    pub async fn get_or_set<F, Fut>(&self, compute: F) -> Result<Vec<LeaderEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<LeaderEntry>>>,
    {
        if let Some(cached) = self.cached().await {
            return Ok(cached);
        }

        let token = match self.store.try_lock(self.settings.lock_ttl).await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(error = ?err, "leaderboard lock unavailable, computing without it");
                return self.compute_and_store(compute).await;
            }
        };

        match token {
            Some(token) => self.populate(token, compute).await,
            None => {
                if let Some(cached) = self.wait_for_cache().await {
                    return Ok(cached);
                }
                tracing::debug!("leaderboard still empty after waiting, computing without lock");
                self.compute_and_store(compute).await
            }
        }
    }

    /// Whether the cached snapshot should be dropped after `batch` was flushed.
    pub async fn should_invalidate(&self, batch: &[FlushedUser]) -> Result<bool> {
        let Some(max_added) = batch.iter().map(|f| f.added).max() else {
            return Ok(false);
        };
        let threshold = self.store.threshold().await?;
        Ok(self.policy.should_invalidate(threshold, max_added))
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.store.invalidate().await
    }

    async fn cached(&self) -> Option<Vec<LeaderEntry>> {
        match self.store.get().await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to read cached leaderboard");
                None
            }
        }
    }

    async fn populate<F, Fut>(&self, token: LockToken, compute: F) -> Result<Vec<LeaderEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<LeaderEntry>>>,
    {
        // Someone may have stored a snapshot while we were taking the lock.
        let result = match self.cached().await {
            Some(cached) => Ok(cached),
            None => self.compute_and_store(compute).await,
        };

        if let Err(err) = self.store.unlock(&token).await {
            tracing::warn!(error = ?err, "failed to release leaderboard lock");
        }

        result
    }

    async fn compute_and_store<F, Fut>(&self, compute: F) -> Result<Vec<LeaderEntry>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<LeaderEntry>>>,
    {
        let leaders = compute().await?;
        if let Err(err) = self.store.put(&leaders, self.settings.ttl).await {
            tracing::warn!(error = ?err, "failed to cache leaderboard");
        }
        Ok(leaders)
    }

    async fn wait_for_cache(&self) -> Option<Vec<LeaderEntry>> {
        for _ in 0..self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            if let Some(cached) = self.cached().await {
                return Some(cached);
            }
        }
        None
    }
}
