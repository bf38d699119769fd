//! Reconciles the three tiers into one displayed total per user.
//!
//! A user's total lives in three places at once: the durable row, the
//! ranking score and the write buffer. The ranking score already contains
//! every flushed increment, so when it is non-zero it wins over the durable
//! row. A zero score next to a non-zero durable total means the ranking was
//! never seeded for that user (or was reset) and gets reseeded.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::api::{
    ClickResponse, LeaderEntry, LeaderboardResponse, MAX_CLICKS_PER_REQUEST,
    MIN_CLICKS_PER_REQUEST, RankResponse, UserResponse,
};

use super::{buffer::FlushListener, buffer::WriteBuffer, leaderboard::LeaderboardCache};
use crate::{
    error::AppError,
    models::{FlushedUser, Profile, User},
    repos::UserRepo,
    stores::{Existence, ExistenceCache, RankingStore},
};

/// First name shown for leaderboard members with no durable row.
const UNKNOWN_FIRST_NAME: &str = "Unknown";

/// Total shown to a user.
///
/// `score` is the ranking score, `durable` the durable total and `buffered`
/// the clicks accepted but not yet durable.
pub fn displayed_total(score: i64, durable: i64, buffered: i64) -> i64 {
    if score > 0 {
        score + buffered
    } else {
        durable + buffered
    }
}

pub struct Reconciler {
    users: Arc<dyn UserRepo>,
    existence: Arc<dyn ExistenceCache>,
    ranking: Arc<dyn RankingStore>,
    buffer: Arc<WriteBuffer>,
    leaderboard: Arc<LeaderboardCache>,
}

impl Reconciler {
    pub fn new(
        users: Arc<dyn UserRepo>,
        existence: Arc<dyn ExistenceCache>,
        ranking: Arc<dyn RankingStore>,
        buffer: Arc<WriteBuffer>,
        leaderboard: Arc<LeaderboardCache>,
    ) -> Self {
        Self {
            users,
            existence,
            ranking,
            buffer,
            leaderboard,
        }
    }

    /// Sign-in: create the user on first sight, otherwise refresh their
    /// profile and return the reconciled total.
    pub async fn identify(&self, profile: Profile) -> Result<UserResponse, AppError> {
        let user_id = profile.telegram_id;
        // A cached "absent" may predate this sign-in, so always look up.
        let existence = self.existence(user_id).await;

        let (user, buffered, score) = tokio::try_join!(
            self.users.find_by_id(user_id),
            self.buffer.buffered_clicks(user_id),
            self.ranking.score(user_id),
        )?;

        let Some(user) = user else {
            return self.register(profile, buffered).await;
        };

        if existence != Existence::Present {
            self.remember(user_id, true).await;
        }

        if score == 0 && user.clicks > 0 {
            self.reseed(user_id, user.clicks);
        }
        if user.profile_differs(&profile) {
            self.refresh_profile(profile.clone());
        }

        let total = displayed_total(score, user.clicks, buffered);

        Ok(profile.into_response(total))
    }

    /// Accept `count` clicks for a user and return the new displayed total.
    pub async fn add_clicks(&self, user_id: i64, count: i64) -> Result<ClickResponse, AppError> {
        if !(MIN_CLICKS_PER_REQUEST..=MAX_CLICKS_PER_REQUEST).contains(&count) {
            return Err(AppError::Validation(format!(
                "count must be between {MIN_CLICKS_PER_REQUEST} and {MAX_CLICKS_PER_REQUEST}"
            )));
        }

        let mut known = None;
        match self.existence(user_id).await {
            Existence::Present => {}
            Existence::Absent => return Err(AppError::user_not_found()),
            Existence::Unknown => {
                let user = self.users.find_by_id(user_id).await?;
                self.remember(user_id, user.is_some()).await;
                match user {
                    Some(user) => known = Some(user),
                    None => return Err(AppError::user_not_found()),
                }
            }
        }

        self.buffer.add_clicks(user_id, count).await?;

        let (score, buffered) = tokio::try_join!(
            self.ranking.score(user_id),
            self.buffer.buffered_clicks(user_id),
        )?;
        if score > 0 {
            return Ok(ClickResponse {
                clicks: displayed_total(score, 0, buffered),
                buffered,
            });
        }

        let durable = match known {
            Some(user) => user.clicks,
            None => self
                .users
                .find_by_id(user_id)
                .await?
                .map_or(0, |user| user.clicks),
        };
        if durable > 0 {
            self.reseed(user_id, durable);
        }

        Ok(ClickResponse {
            clicks: displayed_total(score, durable, buffered),
            buffered,
        })
    }

    /// Profile and reconciled total of a known user.
    pub async fn get_user(&self, user_id: i64) -> Result<UserResponse, AppError> {
        if self.existence(user_id).await == Existence::Absent {
            return Err(AppError::user_not_found());
        }

        let (user, buffered, score) = tokio::try_join!(
            self.users.find_by_id(user_id),
            self.buffer.buffered_clicks(user_id),
            self.ranking.score(user_id),
        )?;
        let Some(user) = user else {
            self.remember(user_id, false).await;
            return Err(AppError::user_not_found());
        };

        if score == 0 && user.clicks > 0 {
            self.reseed(user_id, user.clicks);
        }

        let total = displayed_total(score, user.clicks, buffered);
        Ok(Profile::from(&user).into_response(total))
    }

    /// Rank and reconciled total of a user.
    ///
    /// Falls back to counting durable rows ahead of the user when the
    /// ranking has no usable score for them.
    pub async fn get_rank(&self, user_id: i64) -> Result<RankResponse, AppError> {
        let (ranked, buffered) = tokio::try_join!(
            self.ranking.rank_with_score(user_id),
            self.buffer.buffered_clicks(user_id),
        )?;

        if let Some(ranked) = ranked
            && ranked.score > 0
        {
            return Ok(RankResponse {
                rank: ranked.rank,
                clicks: ranked.score + buffered,
            });
        }

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(AppError::user_not_found)?;
        if ranked.is_none() || user.clicks > 0 {
            self.reseed(user_id, user.clicks);
        }

        let ahead = self.users.count_with_more_clicks(user.clicks).await?;
        Ok(RankResponse {
            rank: ahead.max(0) as u64 + 1,
            clicks: user.clicks + buffered,
        })
    }

    /// Top-N view, served from the leaderboard cache.
    pub async fn leaderboard(&self) -> Result<LeaderboardResponse, AppError> {
        let leaders = self
            .leaderboard
            .get_or_set(move || self.compute_leaderboard())
            .await?;
        Ok(LeaderboardResponse { leaders })
    }

    /// Rebuild ranking scores from the durable store's top users.
    pub async fn seed_ranking(&self, limit: i64) -> Result<usize> {
        let top = self.users.top_by_clicks(limit).await?;
        let scores: Vec<(i64, i64)> = top.iter().map(|u| (u.telegram_id, u.clicks)).collect();
        self.ranking.seed(&scores).await?;
        tracing::info!(seeded = scores.len(), "ranking seeded from durable store");
        Ok(scores.len())
    }

    /// Seed the ranking only when it holds no members at all.
    pub async fn seed_ranking_if_empty(&self, limit: i64) -> Result<usize> {
        if self.ranking.count().await? > 0 {
            return Ok(0);
        }
        self.seed_ranking(limit).await
    }

    async fn compute_leaderboard(&self) -> Result<Vec<LeaderEntry>> {
        let top = self.ranking.top(self.leaderboard.size()).await?;
        let ids: Vec<i64> = top.iter().map(|r| r.user_id).collect();
        let mut users: HashMap<i64, User> = self
            .users
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .map(|u| (u.telegram_id, u))
            .collect();

        Ok(top
            .into_iter()
            .map(|ranked| match users.remove(&ranked.user_id) {
                Some(user) => LeaderEntry {
                    rank: ranked.rank,
                    telegram_id: ranked.user_id,
                    username: user.username,
                    first_name: user.first_name,
                    last_name: user.last_name,
                    clicks: ranked.score,
                },
                None => LeaderEntry {
                    rank: ranked.rank,
                    telegram_id: ranked.user_id,
                    username: None,
                    first_name: UNKNOWN_FIRST_NAME.to_string(),
                    last_name: None,
                    clicks: ranked.score,
                },
            })
            .collect())
    }

    async fn register(&self, profile: Profile, buffered: i64) -> Result<UserResponse, AppError> {
        let user = self.users.create(&profile).await?;
        tracing::info!(user_id = user.telegram_id, "user registered");

        if let Err(err) = self.ranking.set_score(user.telegram_id, user.clicks).await {
            tracing::warn!(error = ?err, user_id = user.telegram_id, "failed to seed ranking for new user");
        }
        self.remember(user.telegram_id, true).await;

        Ok(profile.into_response(user.clicks + buffered))
    }

    async fn existence(&self, user_id: i64) -> Existence {
        match self.existence.get(user_id).await {
            Ok(existence) => existence,
            Err(err) => {
                tracing::warn!(error = ?err, user_id, "existence cache unavailable");
                Existence::Unknown
            }
        }
    }

    async fn remember(&self, user_id: i64, exists: bool) {
        if let Err(err) = self.existence.set(user_id, exists).await {
            tracing::warn!(error = ?err, user_id, "failed to cache user existence");
        }
    }

    /// Detached: the caller's total never waits on the ranking write.
    fn reseed(&self, user_id: i64, total: i64) {
        let ranking = self.ranking.clone();
        tokio::spawn(async move {
            match ranking.set_score(user_id, total).await {
                Ok(()) => tracing::debug!(user_id, total, "ranking reseeded from durable total"),
                Err(err) => tracing::warn!(error = ?err, user_id, "failed to reseed ranking"),
            }
        });
    }

    /// Detached, like `reseed`.
    fn refresh_profile(&self, profile: Profile) {
        let users = self.users.clone();
        tokio::spawn(async move {
            if let Err(err) = users.update_profile(&profile).await {
                tracing::warn!(error = ?err, user_id = profile.telegram_id, "failed to refresh profile");
            }
        });
    }
}

/// Flush listener that applies flushed increments to the ranking and drops
/// the cached leaderboard when the batch is large enough to reorder it.
pub struct RankingSync {
    ranking: Arc<dyn RankingStore>,
    leaderboard: Arc<LeaderboardCache>,
}

impl RankingSync {
    pub fn new(ranking: Arc<dyn RankingStore>, leaderboard: Arc<LeaderboardCache>) -> Self {
        Self {
            ranking,
            leaderboard,
        }
    }
}

#[async_trait]
impl FlushListener for RankingSync {
    async fn on_flush(&self, flushed: &[FlushedUser]) -> Result<()> {
        self.ranking.bulk_increment(flushed).await?;

        if self.leaderboard.should_invalidate(flushed).await? {
            self.leaderboard.invalidate().await?;
            tracing::debug!(batch = flushed.len(), "leaderboard invalidated after flush");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use mockall::predicate::eq;

    use super::*;
    use crate::clicks::{FlushSettings, InvalidationPolicy, LeaderboardSettings};
    use crate::repos::MockUserRepo;
    use crate::stores::{
        LeaderboardStore, MemoryBufferStore, MemoryExistenceCache, MemoryLeaderboardStore,
        MemoryRankingStore, MockRankingStore,
    };
    use crate::test_utils::{FakeUserRepo, leader, mock_user, profile};

    struct Harness {
        users: Arc<FakeUserRepo>,
        existence: Arc<MemoryExistenceCache>,
        ranking: Arc<dyn RankingStore>,
        buffer: Arc<WriteBuffer>,
        board: Arc<MemoryLeaderboardStore>,
        reconciler: Reconciler,
    }

    fn harness_with(users: Arc<FakeUserRepo>, ranking: Arc<dyn RankingStore>) -> Harness {
        let existence = Arc::new(MemoryExistenceCache::new(std::time::Duration::from_secs(300)));
        let board = Arc::new(MemoryLeaderboardStore::new());
        let leaderboard = Arc::new(LeaderboardCache::new(
            board.clone(),
            LeaderboardSettings::default(),
            InvalidationPolicy::default(),
        ));
        let buffer = Arc::new(WriteBuffer::new(
            Arc::new(MemoryBufferStore::new()),
            users.clone(),
            FlushSettings::default(),
        ));
        let reconciler = Reconciler::new(
            users.clone(),
            existence.clone(),
            ranking.clone(),
            buffer.clone(),
            leaderboard,
        );
        Harness {
            users,
            existence,
            ranking,
            buffer,
            board,
            reconciler,
        }
    }

    fn harness(users: &[(i64, i64)]) -> Harness {
        harness_with(
            Arc::new(FakeUserRepo::with_users(users)),
            Arc::new(MemoryRankingStore::new()),
        )
    }

    /// Let detached reseeds and profile refreshes finish.
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn assert_status(err: AppError, expected: StatusCode) {
        match err {
            AppError::External(status, _) => assert_eq!(status, expected),
            other => panic!("expected External({expected}), got {other:?}"),
        }
    }

    #[test]
    fn displayed_total_prefers_ranking_score() {
        assert_eq!(displayed_total(80, 50, 5), 85);
        assert_eq!(displayed_total(0, 50, 5), 55);
        assert_eq!(displayed_total(0, 0, 0), 0);
    }

    #[tokio::test]
    async fn unseeded_ranking_falls_back_to_durable_total_and_reseeds() {
        let users = Arc::new(FakeUserRepo::with_users(&[(1, 50)]));
        let mut ranking = MockRankingStore::new();
        ranking.expect_score().with(eq(1)).returning(|_| Ok(0));
        ranking
            .expect_set_score()
            .with(eq(1), eq(50))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness_with(users, Arc::new(ranking));
        h.buffer.add_clicks(1, 5).await.unwrap();

        let user = h.reconciler.get_user(1).await.unwrap();
        settle().await;

        assert_eq!(user.clicks, 55);
    }

    #[tokio::test]
    async fn seeded_ranking_score_is_used_with_buffer() {
        let h = harness(&[(1, 50)]);
        h.ranking.set_score(1, 70).await.unwrap();
        h.buffer.add_clicks(1, 3).await.unwrap();

        let user = h.reconciler.get_user(1).await.unwrap();

        assert_eq!(user.clicks, 73);
    }

    #[tokio::test]
    async fn identify_creates_new_user_at_zero() {
        let h = harness(&[]);

        let user = h.reconciler.identify(profile(42, "alice")).await.unwrap();

        assert_eq!(user.telegram_id, 42);
        assert_eq!(user.clicks, 0);
        assert_eq!(h.users.clicks(42), 0);
        assert_eq!(h.ranking.rank(42).await.unwrap(), Some(1));
        assert_eq!(h.existence.get(42).await.unwrap(), Existence::Present);
    }

    #[tokio::test]
    async fn identify_refreshes_changed_profile() {
        let h = harness(&[(7, 10)]);
        let mut renamed = profile(7, "bob");
        renamed.username = Some("bobby".to_string());

        let user = h.reconciler.identify(renamed.clone()).await.unwrap();
        settle().await;

        assert_eq!(user.username.as_deref(), Some("bobby"));
        assert_eq!(user.clicks, 10);
        let stored = h.users.find_by_id(7).await.unwrap().unwrap();
        assert_eq!(stored.username.as_deref(), Some("bobby"));
        // Ranking was empty for this user, so it got reseeded.
        assert_eq!(h.ranking.score(7).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn identify_succeeds_when_profile_refresh_fails() {
        let mut users = MockUserRepo::new();
        users
            .expect_find_by_id()
            .returning(|id| Ok(Some(mock_user(id, 10))));
        users
            .expect_update_profile()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("database unavailable")));
        let existence = Arc::new(MemoryExistenceCache::new(std::time::Duration::from_secs(60)));
        let users: Arc<dyn UserRepo> = Arc::new(users);
        let ranking: Arc<dyn RankingStore> = Arc::new(MemoryRankingStore::new());
        ranking.set_score(7, 10).await.unwrap();
        let reconciler = Reconciler::new(
            users.clone(),
            existence,
            ranking,
            Arc::new(WriteBuffer::new(
                Arc::new(MemoryBufferStore::new()),
                users,
                FlushSettings::default(),
            )),
            Arc::new(LeaderboardCache::new(
                Arc::new(MemoryLeaderboardStore::new()),
                LeaderboardSettings::default(),
                InvalidationPolicy::default(),
            )),
        );

        let user = reconciler.identify(profile(7, "dave")).await.unwrap();
        settle().await;

        assert_eq!(user.first_name, "dave");
        assert_eq!(user.clicks, 10);
    }

    #[tokio::test]
    async fn identify_looks_up_even_when_cached_absent() {
        let h = harness(&[(5, 3)]);
        h.existence.set(5, false).await.unwrap();

        let user = h.reconciler.identify(profile(5, "carol")).await.unwrap();

        assert_eq!(user.clicks, 3);
        assert_eq!(h.existence.get(5).await.unwrap(), Existence::Present);
    }

    #[tokio::test]
    async fn add_clicks_rejects_out_of_range_counts() {
        let h = harness(&[(1, 0)]);

        for count in [0, -1, 101] {
            let err = h.reconciler.add_clicks(1, count).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert_eq!(h.buffer.buffered_clicks(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_clicks_for_cached_absent_user_skips_durable_lookup() {
        let existence = Arc::new(MemoryExistenceCache::new(std::time::Duration::from_secs(60)));
        existence.set(9, false).await.unwrap();
        // No expectations: any durable call panics.
        let users: Arc<dyn UserRepo> = Arc::new(MockUserRepo::new());
        let board = Arc::new(MemoryLeaderboardStore::new());
        let reconciler = Reconciler::new(
            users.clone(),
            existence,
            Arc::new(MemoryRankingStore::new()),
            Arc::new(WriteBuffer::new(
                Arc::new(MemoryBufferStore::new()),
                users,
                FlushSettings::default(),
            )),
            Arc::new(LeaderboardCache::new(
                board,
                LeaderboardSettings::default(),
                InvalidationPolicy::default(),
            )),
        );

        let err = reconciler.add_clicks(9, 1).await.unwrap_err();

        assert_status(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_clicks_for_unknown_user_checks_durable_store_and_caches() {
        let h = harness(&[(3, 0)]);

        let response = h.reconciler.add_clicks(3, 4).await.unwrap();
        assert_eq!(response, ClickResponse { clicks: 4, buffered: 4 });
        assert_eq!(h.existence.get(3).await.unwrap(), Existence::Present);

        let err = h.reconciler.add_clicks(404, 1).await.unwrap_err();
        assert_status(err, StatusCode::NOT_FOUND);
        assert_eq!(h.existence.get(404).await.unwrap(), Existence::Absent);
        assert_eq!(h.buffer.buffered_clicks(404).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_clicks_reseeds_from_durable_total() {
        let h = harness(&[(2, 40)]);
        h.existence.set(2, true).await.unwrap();

        let response = h.reconciler.add_clicks(2, 10).await.unwrap();
        settle().await;

        assert_eq!(response, ClickResponse { clicks: 50, buffered: 10 });
        assert_eq!(h.ranking.score(2).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn totals_survive_a_flush() {
        let h = harness(&[(1, 0)]);
        let sync = Arc::new(RankingSync::new(
            h.ranking.clone(),
            Arc::new(LeaderboardCache::new(
                h.board.clone(),
                LeaderboardSettings::default(),
                InvalidationPolicy::default(),
            )),
        ));
        let buffer = WriteBuffer::new(
            Arc::new(MemoryBufferStore::new()),
            h.users.clone(),
            FlushSettings::default(),
        )
        .with_listener(sync);

        buffer.add_clicks(1, 12).await.unwrap();
        buffer.flush().await.unwrap();

        assert_eq!(h.users.clicks(1), 12);
        assert_eq!(h.ranking.score(1).await.unwrap(), 12);
        assert_eq!(buffer.buffered_clicks(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_rank_uses_ranking_when_scored() {
        let h = harness(&[(1, 0), (2, 0)]);
        h.ranking.set_score(1, 100).await.unwrap();
        h.ranking.set_score(2, 80).await.unwrap();
        h.buffer.add_clicks(2, 1).await.unwrap();

        let rank = h.reconciler.get_rank(2).await.unwrap();

        assert_eq!(rank, RankResponse { rank: 2, clicks: 81 });
    }

    #[tokio::test]
    async fn get_rank_falls_back_to_durable_counts() {
        let h = harness(&[(1, 300), (2, 200), (3, 100)]);

        let rank = h.reconciler.get_rank(2).await.unwrap();
        settle().await;

        assert_eq!(rank, RankResponse { rank: 2, clicks: 200 });
        assert_eq!(h.ranking.score(2).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn leaderboard_resolves_names_and_marks_missing_rows() {
        let h = harness(&[(1, 0), (2, 0)]);
        h.ranking.set_score(1, 90).await.unwrap();
        h.ranking.set_score(2, 60).await.unwrap();
        h.ranking.set_score(77, 30).await.unwrap();

        let board = h.reconciler.leaderboard().await.unwrap();

        let names: Vec<&str> = board.leaders.iter().map(|l| l.first_name.as_str()).collect();
        assert_eq!(names, vec!["User1", "User2", "Unknown"]);
        assert_eq!(board.leaders[2].rank, 3);
        assert_eq!(h.board.threshold().await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn ranking_sync_applies_batch_and_invalidates_on_large_jump() {
        let h = harness(&[]);
        h.board.put(&[leader(1, 1, 100)], std::time::Duration::from_secs(5)).await.unwrap();
        let sync = RankingSync::new(
            h.ranking.clone(),
            Arc::new(LeaderboardCache::new(
                h.board.clone(),
                LeaderboardSettings::default(),
                InvalidationPolicy::default(),
            )),
        );

        sync.on_flush(&[FlushedUser { user_id: 4, added: 5 }]).await.unwrap();
        assert!(h.board.get().await.unwrap().is_some());
        assert_eq!(h.ranking.score(4).await.unwrap(), 5);

        sync.on_flush(&[FlushedUser { user_id: 4, added: 15 }]).await.unwrap();
        assert!(h.board.get().await.unwrap().is_none());
        assert_eq!(h.ranking.score(4).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn seed_ranking_only_when_empty() {
        let h = harness(&[(1, 10), (2, 20)]);

        assert_eq!(h.reconciler.seed_ranking_if_empty(25).await.unwrap(), 2);
        assert_eq!(h.ranking.rank(2).await.unwrap(), Some(1));
        assert_eq!(h.reconciler.seed_ranking_if_empty(25).await.unwrap(), 0);
    }
}
