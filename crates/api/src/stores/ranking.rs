//! Live ranking for Redis (sorted set of user id → cumulative clicks).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::models::{FlushedUser, RankedUser};

const RANKING_KEY: &str = "clicks:ranking";

/// Store for the score-ordered index over user totals.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Set an absolute score (seed or reseed from the durable store).
    async fn set_score(&self, user_id: i64, total: i64) -> Result<()>;

    /// Add `delta` to a score. Returns the new score.
    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64>;

    /// Current score, 0 when the user is not ranked.
    async fn score(&self, user_id: i64) -> Result<i64>;

    /// 1-based rank by descending score, None when not ranked.
    async fn rank(&self, user_id: i64) -> Result<Option<u64>>;

    /// Rank and score in one round trip.
    async fn rank_with_score(&self, user_id: i64) -> Result<Option<RankedUser>>;

    /// Highest `limit` entries, best first.
    async fn top(&self, limit: usize) -> Result<Vec<RankedUser>>;

    /// Apply independent relative increments in one round trip.
    async fn bulk_increment(&self, flushed: &[FlushedUser]) -> Result<()>;

    /// Absolute-set many scores at once (cold-start seed).
    async fn seed(&self, scores: &[(i64, i64)]) -> Result<()>;

    /// Number of ranked users.
    async fn count(&self) -> Result<u64>;
}

/// Assigns 1-based ranks to a best-first `(member, score)` list.
fn rank_rows(rows: Vec<(String, f64)>) -> Result<Vec<RankedUser>> {
    rows.into_iter()
        .enumerate()
        .map(|(index, (member, score))| {
            Ok(RankedUser {
                user_id: member.parse()?,
                score: score as i64,
                rank: index as u64 + 1,
            })
        })
        .collect()
}

/// Redis implementation of RankingStore.
#[derive(Clone)]
pub struct RedisRankingStore {
    client: redis::Client,
}

impl RedisRankingStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RankingStore for RedisRankingStore {
    async fn set_score(&self, user_id: i64, total: i64) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: () = conn.zadd(RANKING_KEY, user_id, total).await?;
        Ok(())
    }

    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let score: f64 = conn.zincr(RANKING_KEY, user_id, delta).await?;
        Ok(score as i64)
    }

    async fn score(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let score: Option<f64> = conn.zscore(RANKING_KEY, user_id).await?;
        Ok(score.map_or(0, |s| s as i64))
    }

    async fn rank(&self, user_id: i64) -> Result<Option<u64>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let rank: Option<u64> = conn.zrevrank(RANKING_KEY, user_id).await?;
        Ok(rank.map(|r| r + 1))
    }

    async fn rank_with_score(&self, user_id: i64) -> Result<Option<RankedUser>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (rank, score): (Option<u64>, Option<f64>) = redis::pipe()
            .zrevrank(RANKING_KEY, user_id)
            .zscore(RANKING_KEY, user_id)
            .query_async(&mut conn)
            .await?;

        Ok(rank.map(|rank| RankedUser {
            user_id,
            score: score.map_or(0, |s| s as i64),
            rank: rank + 1,
        }))
    }

    async fn top(&self, limit: usize) -> Result<Vec<RankedUser>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let rows: Vec<(String, f64)> = conn
            .zrevrange_withscores(RANKING_KEY, 0, limit as isize - 1)
            .await?;
        rank_rows(rows)
    }

    async fn bulk_increment(&self, flushed: &[FlushedUser]) -> Result<()> {
        if flushed.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut pipe = redis::pipe();
        for entry in flushed {
            pipe.zincr(RANKING_KEY, entry.user_id, entry.added).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn seed(&self, scores: &[(i64, i64)]) -> Result<()> {
        if scores.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let items: Vec<(i64, i64)> = scores.iter().map(|(id, score)| (*score, *id)).collect();
        let _: () = conn.zadd_multiple(RANKING_KEY, &items).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let count: u64 = conn.zcard(RANKING_KEY).await?;
        Ok(count)
    }
}

/// In-process implementation of RankingStore.
///
/// Ties order by descending member id, matching Redis's reverse
/// lexicographic order for equal scores on same-width ids.
#[derive(Default)]
pub struct MemoryRankingStore {
    scores: RwLock<HashMap<i64, i64>>,
}

impl MemoryRankingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered(&self) -> Vec<(i64, i64)> {
        let scores = self.scores.read().unwrap_or_else(|p| p.into_inner());
        let mut rows: Vec<(i64, i64)> = scores.iter().map(|(id, s)| (*id, *s)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        rows
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, i64>> {
        self.scores.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl RankingStore for MemoryRankingStore {
    async fn set_score(&self, user_id: i64, total: i64) -> Result<()> {
        self.write().insert(user_id, total);
        Ok(())
    }

    async fn increment_score(&self, user_id: i64, delta: i64) -> Result<i64> {
        let mut scores = self.write();
        let score = scores.entry(user_id).or_insert(0);
        *score += delta;
        Ok(*score)
    }

    async fn score(&self, user_id: i64) -> Result<i64> {
        let scores = self.scores.read().unwrap_or_else(|p| p.into_inner());
        Ok(scores.get(&user_id).copied().unwrap_or(0))
    }

    async fn rank(&self, user_id: i64) -> Result<Option<u64>> {
        Ok(self.rank_with_score(user_id).await?.map(|r| r.rank))
    }

    async fn rank_with_score(&self, user_id: i64) -> Result<Option<RankedUser>> {
        Ok(self
            .ordered()
            .into_iter()
            .enumerate()
            .find(|(_, (id, _))| *id == user_id)
            .map(|(index, (user_id, score))| RankedUser {
                user_id,
                score,
                rank: index as u64 + 1,
            }))
    }

    async fn top(&self, limit: usize) -> Result<Vec<RankedUser>> {
        Ok(self
            .ordered()
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, (user_id, score))| RankedUser {
                user_id,
                score,
                rank: index as u64 + 1,
            })
            .collect())
    }

    async fn bulk_increment(&self, flushed: &[FlushedUser]) -> Result<()> {
        let mut scores = self.write();
        for entry in flushed {
            *scores.entry(entry.user_id).or_insert(0) += entry.added;
        }
        Ok(())
    }

    async fn seed(&self, seed: &[(i64, i64)]) -> Result<()> {
        let mut scores = self.write();
        for (user_id, score) in seed {
            scores.insert(*user_id, *score);
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.scores.read().unwrap_or_else(|p| p.into_inner()).len() as u64)
    }
}
