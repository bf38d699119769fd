//! Write buffer: absorbs click bursts and moves them to the durable store.
//!
//! A flush runs in three phases:
//!
//! 1. Replay anything left in `processing` by a flush that died mid-way.
//! 2. Page through `active`, atomically claiming each page into `processing`.
//! 3. Write each claimed page to the durable store in sub-batches, releasing
//!    every sub-batch from `processing` once it is durable.
//!
//! Delivery is at-least-once: a crash after a durable write but before its
//! release replays that sub-batch on the next flush.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    models::{BufferedDelta, FlushedUser},
    repos::UserRepo,
    stores::{BufferStore, Generation},
};

/// Receives the increments confirmed durable by a flush.
///
/// Called at most once per flush, only when something was flushed. The same
/// increment may be delivered twice after a crash.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlushListener: Send + Sync {
    async fn on_flush(&self, flushed: &[FlushedUser]) -> Result<()>;
}

/// Paging and batching knobs for a flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    /// Entries requested per scan page.
    pub scan_count: usize,
    /// Entries per durable bulk write.
    pub batch_size: usize,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            scan_count: 1_000,
            batch_size: 500,
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Increments that are now durable.
    pub flushed: Vec<FlushedUser>,
    /// Entries left in `processing` because their durable write failed.
    pub failed: usize,
}

impl FlushReport {
    pub fn flushed_count(&self) -> usize {
        self.flushed.len()
    }
}

struct WriteOutcome {
    flushed: Vec<FlushedUser>,
    failed: usize,
}

pub struct WriteBuffer {
    store: Arc<dyn BufferStore>,
    users: Arc<dyn UserRepo>,
    settings: FlushSettings,
    listener: Option<Arc<dyn FlushListener>>,
    /// Held for the duration of a flush; a second caller gives up instead of waiting.
    flush_lock: Mutex<()>,
}

impl WriteBuffer {
    pub fn new(
        store: Arc<dyn BufferStore>,
        users: Arc<dyn UserRepo>,
        settings: FlushSettings,
    ) -> Self {
        Self {
            store,
            users,
            settings: FlushSettings {
                scan_count: settings.scan_count.max(1),
                batch_size: settings.batch_size.max(1),
            },
            listener: None,
            flush_lock: Mutex::new(()),
        }
    }

    /// Register the flush-completion callback.
    pub fn with_listener(mut self, listener: Arc<dyn FlushListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Buffer `clicks` for a user. Returns the user's new active amount.
    pub async fn add_clicks(&self, user_id: i64, clicks: i64) -> Result<i64> {
        self.store.increment(user_id, clicks).await
    }

    /// Clicks accepted for a user but not yet durable, including any mid-flush.
    pub async fn buffered_clicks(&self, user_id: i64) -> Result<i64> {
        self.store.buffered(user_id).await
    }

    /// Move buffered clicks to the durable store.
    ///
    /// Returns an empty report without doing anything if another flush is
    /// already running.
    pub async fn flush(&self) -> Result<FlushReport> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            tracing::debug!("flush already in progress, skipping");
            return Ok(FlushReport::default());
        };

        let mut report = FlushReport::default();
        // Whatever became durable before an error still has to reach the listener.
        let result = self.flush_into(&mut report).await;

        if report.failed > 0 {
            tracing::warn!(
                failed = report.failed,
                "some buffered clicks stay in processing until the next flush"
            );
        }

        if !report.flushed.is_empty() {
            tracing::debug!(flushed = report.flushed.len(), "buffered clicks flushed");
            if let Some(listener) = &self.listener
                && let Err(err) = listener.on_flush(&report.flushed).await
            {
                tracing::error!(error = ?err, "flush listener failed");
            }
        }

        result.map(|()| report)
    }

    async fn flush_into(&self, report: &mut FlushReport) -> Result<()> {
        self.recover_processing(report).await?;

        let mut cursor = 0;
        loop {
            let page = self
                .store
                .scan(Generation::Active, cursor, self.settings.scan_count)
                .await?;
            cursor = page.cursor;

            if !page.entries.is_empty() {
                let user_ids: Vec<i64> = page.entries.iter().map(|d| d.user_id).collect();
                let claimed = self.store.claim(&user_ids).await?;

                let outcome = self.write_durable(&claimed).await;
                report.flushed.extend(outcome.flushed);
                report.failed += outcome.failed;
            }

            if cursor == 0 {
                return Ok(());
            }
        }
    }

    /// Flush until a pass flushes nothing or `max_attempts` passes have run.
    /// Errors count as attempts. Returns the number of passes made.
    pub async fn drain(&self, max_attempts: u32) -> u32 {
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            match self.flush().await {
                Ok(report) if report.flushed.is_empty() && report.failed == 0 => break,
                Ok(report) => {
                    tracing::info!(
                        flushed = report.flushed.len(),
                        failed = report.failed,
                        attempt = attempts,
                        "drain pass complete"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = ?err, attempt = attempts, "drain pass failed");
                }
            }
        }
        attempts
    }

    /// Replay `processing` left behind by an interrupted flush into `report`.
    ///
    /// Fails if anything could not be written, so new claims never pile on
    /// top of undelivered ones.
    async fn recover_processing(&self, report: &mut FlushReport) -> Result<()> {
        if !self.store.has_processing().await? {
            return Ok(());
        }

        tracing::warn!("replaying clicks left in processing by an interrupted flush");

        // Only this flush touches processing here, so a repeat is a scan duplicate.
        let mut seen = HashSet::new();
        let mut recovered = 0;
        let mut failed = 0;
        let mut cursor = 0;
        loop {
            let page = self
                .store
                .scan(Generation::Processing, cursor, self.settings.scan_count)
                .await?;
            cursor = page.cursor;

            let fresh: Vec<BufferedDelta> = page
                .entries
                .into_iter()
                .filter(|d| seen.insert(d.user_id))
                .collect();
            let outcome = self.write_durable(&fresh).await;
            recovered += outcome.flushed.len();
            failed += outcome.failed;
            report.flushed.extend(outcome.flushed);
            report.failed += outcome.failed;

            if cursor == 0 {
                break;
            }
        }

        if failed > 0 {
            bail!("{failed} clicks in processing could not be written durably");
        }

        tracing::info!(recovered, "processing recovered");
        Ok(())
    }

    /// Write claimed entries in sub-batches. A failed sub-batch stays in
    /// `processing`; the others go ahead.
    async fn write_durable(&self, entries: &[BufferedDelta]) -> WriteOutcome {
        let mut outcome = WriteOutcome {
            flushed: Vec::with_capacity(entries.len()),
            failed: 0,
        };

        for chunk in entries.chunks(self.settings.batch_size) {
            let applied = match self.users.bulk_increment(chunk).await {
                Ok(applied) => applied,
                Err(err) => {
                    tracing::warn!(error = ?err, entries = chunk.len(), "durable bulk increment failed");
                    outcome.failed += chunk.len();
                    continue;
                }
            };

            if let Err(err) = self.store.release(chunk).await {
                // The write is durable; the next flush will replay this chunk.
                tracing::error!(error = ?err, entries = chunk.len(), "failed to release processing entries");
            }

            let applied: HashSet<i64> = applied.into_iter().collect();
            for delta in chunk {
                if applied.contains(&delta.user_id) {
                    outcome.flushed.push(FlushedUser {
                        user_id: delta.user_id,
                        added: delta.clicks,
                    });
                } else {
                    tracing::warn!(
                        user_id = delta.user_id,
                        clicks = delta.clicks,
                        "dropping buffered clicks for user without durable record"
                    );
                }
            }
        }

        outcome
    }
}
