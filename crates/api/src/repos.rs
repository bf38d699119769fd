//! Durable store (PostgreSQL).
//!
//! The durable store is the system of record for click totals. It is written
//! in bulk by the write buffer's flush and read on sign-in, on cache misses,
//! and when resolving leaderboard display fields.
//!
//! ## Usage
//!
//! ```ignore
//! let user = state.repos.users.find_by_id(telegram_id).await?;
//! let applied = state.repos.users.bulk_increment(&deltas).await?;
//! ```

mod users;

pub use users::{PgUserRepo, UserRepo};

#[cfg(test)]
pub use users::MockUserRepo;

use std::sync::Arc;

/// Collection of all database repositories.
#[derive(Clone)]
pub struct Repos {
    pub users: Arc<dyn UserRepo>,
}
