//! User repository for PostgreSQL.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::models::{BufferedDelta, Profile, User};

const USER_COLUMNS: &str =
    "telegram_id, username, first_name, last_name, clicks, created_at, updated_at";

/// Repository for the durable click records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Health check - verify database connectivity.
    async fn health_check(&self) -> Result<bool>;

    /// Find a user by Telegram id.
    async fn find_by_id(&self, telegram_id: i64) -> Result<Option<User>>;

    /// Find users by id, in the order requested. Missing ids are skipped.
    async fn find_by_ids(&self, telegram_ids: &[i64]) -> Result<Vec<User>>;

    /// Create a user with zero clicks. Returns the existing row if one exists.
    async fn create(&self, profile: &Profile) -> Result<User>;

    /// Overwrite the display fields of a user.
    async fn update_profile(&self, profile: &Profile) -> Result<Option<User>>;

    /// Add many independent increments in one statement.
    /// Returns the ids that matched a row.
    async fn bulk_increment(&self, deltas: &[BufferedDelta]) -> Result<Vec<i64>>;

    /// Users with the highest totals, descending. Only used to seed the ranking.
    async fn top_by_clicks(&self, limit: i64) -> Result<Vec<User>>;

    /// Number of users with strictly more clicks than `clicks`.
    async fn count_with_more_clicks(&self, clicks: i64) -> Result<i64>;
}

/// PostgreSQL implementation of UserRepo.
#[derive(Clone)]
pub struct PgUserRepo {
    pool: Pool<Postgres>,
}

impl PgUserRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Restores request order and drops misses from a `= ANY($1)` lookup.
fn order_by_request(telegram_ids: &[i64], users: Vec<User>) -> Vec<User> {
    let mut by_id: std::collections::HashMap<i64, User> =
        users.into_iter().map(|u| (u.telegram_id, u)).collect();
    telegram_ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

/// Merges repeated ids so one statement never joins a row twice.
fn coalesce(deltas: &[BufferedDelta]) -> (Vec<i64>, Vec<i64>) {
    let mut merged: Vec<BufferedDelta> = Vec::with_capacity(deltas.len());
    for delta in deltas {
        match merged.iter_mut().find(|d| d.user_id == delta.user_id) {
            Some(existing) => existing.clicks += delta.clicks,
            None => merged.push(*delta),
        }
    }
    merged.into_iter().map(|d| (d.user_id, d.clicks)).unzip()
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn health_check(&self) -> Result<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }

    async fn find_by_id(&self, telegram_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE telegram_id = $1"
        ))
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_ids(&self, telegram_ids: &[i64]) -> Result<Vec<User>> {
        if telegram_ids.is_empty() {
            return Ok(Vec::new());
        }

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ANY($1)"
        ))
        .bind(telegram_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(order_by_request(telegram_ids, users))
    }

    async fn create(&self, profile: &Profile) -> Result<User> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (telegram_id, username, first_name, last_name, clicks)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (telegram_id) DO UPDATE SET telegram_id = EXCLUDED.telegram_id
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(profile.telegram_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn update_profile(&self, profile: &Profile) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET username = $2, first_name = $3, last_name = $4, updated_at = now()
            WHERE telegram_id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(profile.telegram_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn bulk_increment(&self, deltas: &[BufferedDelta]) -> Result<Vec<i64>> {
        if deltas.is_empty() {
            return Ok(Vec::new());
        }

        let (ids, amounts) = coalesce(deltas);
        let applied: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE users AS u
            SET clicks = u.clicks + d.delta, updated_at = now()
            FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS d(telegram_id, delta)
            WHERE u.telegram_id = d.telegram_id
            RETURNING u.telegram_id
            "#,
        )
        .bind(&ids)
        .bind(&amounts)
        .fetch_all(&self.pool)
        .await?;
        Ok(applied)
    }

    async fn top_by_clicks(&self, limit: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY clicks DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn count_with_more_clicks(&self, clicks: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE clicks > $1")
            .bind(clicks)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
