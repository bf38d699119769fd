//! Shared API request/response types used by the API server and its clients.

use garde::Validate;
use serde::{Deserialize, Serialize};

/// Smallest click count accepted in a single submission.
pub const MIN_CLICKS_PER_REQUEST: i64 = 1;
/// Largest click count accepted in a single submission.
pub const MAX_CLICKS_PER_REQUEST: i64 = 100;

/// Submit a batch of clicks for the authenticated user.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ClickPayload {
    #[garde(range(min = MIN_CLICKS_PER_REQUEST, max = MAX_CLICKS_PER_REQUEST))]
    pub count: i64,
}

/// Returned after clicks are accepted into the write buffer.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClickResponse {
    /// Displayed total, including clicks not yet durably recorded.
    pub clicks: i64,
    /// Clicks currently waiting in the buffer for this user.
    pub buffered: i64,
}

/// Profile and running total for the authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub clicks: i64,
}

/// Rank of the authenticated user.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankResponse {
    /// 1-based position by descending score.
    pub rank: u64,
    pub clicks: i64,
}

/// One row of the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderEntry {
    pub rank: u64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub clicks: i64,
}

/// Top-N view of the ranking.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderboardResponse {
    pub leaders: Vec<LeaderEntry>,
}

/// Error body returned by the API for user-facing failures.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_payload_accepts_bounds() {
        assert!(ClickPayload { count: 1 }.validate().is_ok());
        assert!(ClickPayload { count: 100 }.validate().is_ok());
    }

    #[test]
    fn click_payload_rejects_out_of_range() {
        assert!(ClickPayload { count: 0 }.validate().is_err());
        assert!(ClickPayload { count: 101 }.validate().is_err());
        assert!(ClickPayload { count: -5 }.validate().is_err());
    }

    #[test]
    fn leader_entry_uses_camel_case() {
        let entry = LeaderEntry {
            rank: 1,
            telegram_id: 42,
            username: None,
            first_name: "Ada".into(),
            last_name: None,
            clicks: 7,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["telegramId"], 42);
        assert_eq!(json["firstName"], "Ada");
    }
}
