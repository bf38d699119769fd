use std::sync::Arc;

use crate::{
    clicks::{
        FlushSettings, InvalidationPolicy, LeaderboardCache, RankingSync, Reconciler, WriteBuffer,
    },
    config::Config,
    repos::Repos,
    stores::Stores,
};

#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Database repositories.
    pub repos: Repos,
    /// Fast stores (Redis or in-process).
    pub stores: Stores,
    /// Write buffer, flushed by the background worker.
    pub buffer: Arc<WriteBuffer>,
    /// Click use cases.
    pub clicks: Arc<Reconciler>,
}

impl AppState {
    /// Wire the click pipeline over the given repos and stores.
    pub fn new(config: Config, repos: Repos, stores: Stores) -> Self {
        let leaderboard = Arc::new(LeaderboardCache::new(
            stores.leaderboard.clone(),
            config.leaderboard_settings(),
            InvalidationPolicy {
                ratio: config.leaderboard_invalidate_ratio,
            },
        ));

        let sync = Arc::new(RankingSync::new(
            stores.ranking.clone(),
            leaderboard.clone(),
        ));
        let buffer = Arc::new(
            WriteBuffer::new(
                stores.buffer.clone(),
                repos.users.clone(),
                FlushSettings {
                    scan_count: config.flush_scan_count,
                    batch_size: config.flush_batch_size,
                },
            )
            .with_listener(sync),
        );

        let clicks = Arc::new(Reconciler::new(
            repos.users.clone(),
            stores.existence.clone(),
            stores.ranking.clone(),
            buffer.clone(),
            leaderboard,
        ));

        AppState {
            config,
            repos,
            stores,
            buffer,
            clicks,
        }
    }
}
