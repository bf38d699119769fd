use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::clicks::LeaderboardSettings;

/// Which implementation backs the fast stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance, safe for multiple API processes.
    #[default]
    Redis,
    /// In-process maps, for a single process without Redis.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Set to "production" for JSON logging, anything else for human-readable.
    #[serde(default)]
    pub env: String,
    /// Sentry DSN for error tracking
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    /// Bot token used to verify signed init data. Required in production.
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub store_backend: StoreBackend,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_scan_count")]
    pub flush_scan_count: usize,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_drain_retries")]
    pub flush_drain_retries: u32,

    #[serde(default = "default_click_rate_limit")]
    pub click_rate_limit: u64,
    #[serde(default = "default_rate_window_ms")]
    pub click_rate_window_ms: u64,
    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit: u64,
    #[serde(default = "default_rate_window_ms")]
    pub global_rate_window_ms: u64,

    #[serde(default = "default_leaderboard_size")]
    pub leaderboard_size: usize,
    #[serde(default = "default_leaderboard_ttl_ms")]
    pub leaderboard_ttl_ms: u64,
    #[serde(default = "default_leaderboard_lock_ttl_ms")]
    pub leaderboard_lock_ttl_ms: u64,
    #[serde(default = "default_leaderboard_poll_interval_ms")]
    pub leaderboard_poll_interval_ms: u64,
    #[serde(default = "default_leaderboard_poll_attempts")]
    pub leaderboard_poll_attempts: u32,
    /// Fraction of the lowest leaderboard score a single flushed increment
    /// must reach before the cached leaderboard is dropped.
    #[serde(default = "default_leaderboard_invalidate_ratio")]
    pub leaderboard_invalidate_ratio: f64,

    #[serde(default = "default_existence_ttl_secs")]
    pub existence_ttl_secs: u64,
    #[serde(default = "default_init_data_max_age_secs")]
    pub init_data_max_age_secs: u64,
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_flush_scan_count() -> usize {
    1_000
}

fn default_flush_batch_size() -> usize {
    500
}

fn default_flush_drain_retries() -> u32 {
    10
}

fn default_click_rate_limit() -> u64 {
    20
}

fn default_global_rate_limit() -> u64 {
    10_000
}

fn default_rate_window_ms() -> u64 {
    1_000
}

fn default_leaderboard_size() -> usize {
    25
}

fn default_leaderboard_ttl_ms() -> u64 {
    5_000
}

fn default_leaderboard_lock_ttl_ms() -> u64 {
    400
}

fn default_leaderboard_poll_interval_ms() -> u64 {
    50
}

fn default_leaderboard_poll_attempts() -> u32 {
    10
}

fn default_leaderboard_invalidate_ratio() -> f64 {
    0.1
}

fn default_existence_ttl_secs() -> u64 {
    300
}

fn default_init_data_max_age_secs() -> u64 {
    3_600
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn click_rate_window(&self) -> Duration {
        Duration::from_millis(self.click_rate_window_ms)
    }

    pub fn global_rate_window(&self) -> Duration {
        Duration::from_millis(self.global_rate_window_ms)
    }

    pub fn existence_ttl(&self) -> Duration {
        Duration::from_secs(self.existence_ttl_secs)
    }

    pub fn leaderboard_settings(&self) -> LeaderboardSettings {
        LeaderboardSettings {
            size: self.leaderboard_size,
            ttl: Duration::from_millis(self.leaderboard_ttl_ms),
            lock_ttl: Duration::from_millis(self.leaderboard_lock_ttl_ms),
            poll_interval: Duration::from_millis(self.leaderboard_poll_interval_ms),
            poll_attempts: self.leaderboard_poll_attempts,
        }
    }

    /// Reject settings that load fine but cannot work together.
    pub fn validate(&self) -> Result<()> {
        let leaderboard = self.leaderboard_settings();
        ensure!(
            leaderboard.lock_ttl < leaderboard.poll_budget(),
            "leaderboard lock TTL ({:?}) must be shorter than the poll budget ({:?})",
            leaderboard.lock_ttl,
            leaderboard.poll_budget()
        );
        Ok(())
    }
}
