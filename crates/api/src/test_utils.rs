//! Shared test utilities.
//!
//! Provides fixtures, an in-memory `UserRepo` and a `TestStateBuilder` that
//! wires a full `AppState` over in-process stores, so tests only configure
//! the mocks they actually need.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::test_utils::{TestStateBuilder, body_json};
//!
//! let state = TestStateBuilder::new().with_users(&[(42, 100)]).build();
//! let response = get_user(TelegramUser::development(), State(state)).await?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::response::Response;
use chrono::Utc;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use shared::api::LeaderEntry;

use crate::config::{Config, StoreBackend};
use crate::models::{BufferedDelta, Profile, User};
use crate::repos::{MockUserRepo, Repos, UserRepo};
use crate::state::AppState;
use crate::stores::{MockRankingStore, MockRateLimiter, Stores};

/// Creates a test configuration with default knobs and the memory backend.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        database_url: "postgres://test".to_string(),
        redis_url: "redis://test".to_string(),
        env: "test".to_string(),
        sentry_dsn: None,
        bot_token: None,
        store_backend: StoreBackend::Memory,
        flush_interval_ms: 5_000,
        flush_scan_count: 1_000,
        flush_batch_size: 500,
        flush_drain_retries: 10,
        click_rate_limit: 20,
        click_rate_window_ms: 1_000,
        global_rate_limit: 10_000,
        global_rate_window_ms: 1_000,
        leaderboard_size: 25,
        leaderboard_ttl_ms: 5_000,
        leaderboard_lock_ttl_ms: 400,
        leaderboard_poll_interval_ms: 50,
        leaderboard_poll_attempts: 10,
        leaderboard_invalidate_ratio: 0.1,
        existence_ttl_secs: 300,
        init_data_max_age_secs: 3_600,
    }
}

/// Creates a durable user row named `User{id}`.
pub fn mock_user(telegram_id: i64, clicks: i64) -> User {
    User {
        telegram_id,
        username: None,
        first_name: format!("User{telegram_id}"),
        last_name: None,
        clicks,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Creates a sign-in profile.
pub fn profile(telegram_id: i64, first_name: &str) -> Profile {
    Profile {
        telegram_id,
        username: None,
        first_name: first_name.to_string(),
        last_name: None,
    }
}

/// Creates a leaderboard row for `User{id}`.
pub fn leader(rank: u64, telegram_id: i64, clicks: i64) -> LeaderEntry {
    LeaderEntry {
        rank,
        telegram_id,
        username: None,
        first_name: format!("User{telegram_id}"),
        last_name: None,
        clicks,
    }
}

/// Reads a JSON response body.
pub async fn body_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// In-memory durable store.
///
/// `fail_for` makes every bulk increment touching that user fail until
/// `recover` is called.
#[derive(Default)]
pub struct FakeUserRepo {
    users: Mutex<BTreeMap<i64, User>>,
    failing: Mutex<HashSet<i64>>,
}

impl FakeUserRepo {
    pub fn with_users(users: &[(i64, i64)]) -> Self {
        let repo = Self::default();
        {
            let mut rows = repo.users.lock().unwrap();
            for (telegram_id, clicks) in users {
                rows.insert(*telegram_id, mock_user(*telegram_id, *clicks));
            }
        }
        repo
    }

    /// Durable total of a user, 0 when there is no row.
    pub fn clicks(&self, telegram_id: i64) -> i64 {
        self.users
            .lock()
            .unwrap()
            .get(&telegram_id)
            .map_or(0, |u| u.clicks)
    }

    pub fn fail_for(&self, telegram_id: i64) {
        self.failing.lock().unwrap().insert(telegram_id);
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl UserRepo for FakeUserRepo {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn find_by_id(&self, telegram_id: i64) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(&telegram_id).cloned())
    }

    async fn find_by_ids(&self, telegram_ids: &[i64]) -> Result<Vec<User>> {
        let users = self.users.lock().unwrap();
        Ok(telegram_ids
            .iter()
            .filter_map(|id| users.get(id).cloned())
            .collect())
    }

    async fn create(&self, profile: &Profile) -> Result<User> {
        let mut users = self.users.lock().unwrap();
        let user = users.entry(profile.telegram_id).or_insert_with(|| User {
            telegram_id: profile.telegram_id,
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            clicks: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        Ok(user.clone())
    }

    async fn update_profile(&self, profile: &Profile) -> Result<Option<User>> {
        let mut users = self.users.lock().unwrap();
        Ok(users.get_mut(&profile.telegram_id).map(|user| {
            user.username = profile.username.clone();
            user.first_name = profile.first_name.clone();
            user.last_name = profile.last_name.clone();
            user.updated_at = Utc::now();
            user.clone()
        }))
    }

    async fn bulk_increment(&self, deltas: &[BufferedDelta]) -> Result<Vec<i64>> {
        {
            let failing = self.failing.lock().unwrap();
            if let Some(delta) = deltas.iter().find(|d| failing.contains(&d.user_id)) {
                bail!("simulated write failure for user {}", delta.user_id);
            }
        }

        let mut users = self.users.lock().unwrap();
        let mut applied = Vec::new();
        for delta in deltas {
            if let Some(user) = users.get_mut(&delta.user_id) {
                user.clicks += delta.clicks;
                applied.push(delta.user_id);
            }
        }
        Ok(applied)
    }

    async fn top_by_clicks(&self, limit: i64) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.lock().unwrap().values().cloned().collect();
        users.sort_by(|a, b| b.clicks.cmp(&a.clicks));
        users.truncate(limit.max(0) as usize);
        Ok(users)
    }

    async fn count_with_more_clicks(&self, clicks: i64) -> Result<i64> {
        let users = self.users.lock().unwrap();
        Ok(users.values().filter(|u| u.clicks > clicks).count() as i64)
    }
}

/// Builder for constructing test `AppState`.
///
/// Defaults to an empty `FakeUserRepo` and in-process stores.
pub struct TestStateBuilder {
    config: Config,
    user_repo: Option<Arc<dyn UserRepo>>,
    ranking_store: Option<MockRankingStore>,
    rate_limiter: Option<MockRateLimiter>,
}

impl TestStateBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            user_repo: None,
            ranking_store: None,
            rate_limiter: None,
        }
    }

    pub fn with_user_repo(mut self, repo: MockUserRepo) -> Self {
        self.user_repo = Some(Arc::new(repo));
        self
    }

    /// Seed the durable store with `(telegram_id, clicks)` rows.
    pub fn with_users(mut self, users: &[(i64, i64)]) -> Self {
        self.user_repo = Some(Arc::new(FakeUserRepo::with_users(users)));
        self
    }

    pub fn with_ranking_store(mut self, store: MockRankingStore) -> Self {
        self.ranking_store = Some(store);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: MockRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Production mode with signed init data verified against `bot_token`.
    pub fn production(mut self, bot_token: &str) -> Self {
        self.config.env = "production".to_string();
        self.config.bot_token = Some(bot_token.to_string());
        self
    }

    pub fn build(self) -> AppState {
        let repos = Repos {
            users: self
                .user_repo
                .unwrap_or_else(|| Arc::new(FakeUserRepo::default())),
        };

        let mut stores = Stores::memory(self.config.existence_ttl());
        if let Some(ranking) = self.ranking_store {
            stores.ranking = Arc::new(ranking);
        }
        if let Some(limiter) = self.rate_limiter {
            stores.rate_limiter = Arc::new(limiter);
        }

        AppState::new(self.config, repos, stores)
    }
}

impl Default for TestStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
