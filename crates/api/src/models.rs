use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::api::UserResponse;
use sqlx::FromRow;

/// Durable click record, the system of record for a user's total.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub clicks: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// True when any display field differs from the caller's latest values.
    pub fn profile_differs(&self, profile: &Profile) -> bool {
        self.username != profile.username
            || self.first_name != profile.first_name
            || self.last_name != profile.last_name
    }
}

/// Display fields supplied by the identity provider on every sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
}

impl Profile {
    pub fn into_response(self, clicks: i64) -> UserResponse {
        UserResponse {
            telegram_id: self.telegram_id,
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
            clicks,
        }
    }
}

impl From<&User> for Profile {
    fn from(user: &User) -> Self {
        Profile {
            telegram_id: user.telegram_id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}

/// A pending per-user increment held in one buffer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedDelta {
    pub user_id: i64,
    pub clicks: i64,
}

/// An increment confirmed durable by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushedUser {
    pub user_id: i64,
    pub added: i64,
}

/// Row of the live ranking structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedUser {
    pub user_id: i64,
    pub score: i64,
    /// 1-based position by descending score.
    pub rank: u64,
}
