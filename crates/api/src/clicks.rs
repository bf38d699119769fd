//! Click pipeline.
//!
//! Clicks are accepted into the write buffer and shown immediately through
//! reconciliation. A background flush moves them into the durable store and
//! then, through the flush listener, into the ranking.
//!
//! ```text
//! POST /click ─► Reconciler::add_clicks ─► WriteBuffer (active)
//!                                              │ FlushWorker tick
//!                                              ▼
//!                              claim ─► processing ─► UserRepo::bulk_increment
//!                                                           │
//!                                      RankingSync::on_flush ◄┘
//!                                        ├─► RankingStore::bulk_increment
//!                                        └─► LeaderboardCache::invalidate (if large)
//! ```

mod buffer;
mod flusher;
mod leaderboard;
mod reconcile;

pub use buffer::{FlushSettings, WriteBuffer};
pub use flusher::FlushWorker;
pub use leaderboard::{InvalidationPolicy, LeaderboardCache, LeaderboardSettings};
pub use reconcile::{RankingSync, Reconciler};
