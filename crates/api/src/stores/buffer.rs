//! Two-generation click buffer for Redis (hashes).
//!
//! Increments land in the `active` hash. A flush claims fields into the
//! `processing` hash before writing them durably, so a crash between claim
//! and write leaves the amounts in `processing` for the next flush to replay.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, Script};

use crate::models::BufferedDelta;

const ACTIVE_KEY: &str = "clicks:buffer";
const PROCESSING_KEY: &str = "clicks:processing";

/// Moves the current value of each field from active to processing.
/// Returns a flat [field, amount, ...] list of what was moved.
static CLAIM_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local moved = {}
        for _, field in ipairs(ARGV) do
            local value = redis.call('HGET', KEYS[1], field)
            if value then
                redis.call('HINCRBY', KEYS[2], field, value)
                redis.call('HDEL', KEYS[1], field)
                table.insert(moved, field)
                table.insert(moved, value)
            end
        end
        return moved
        "#,
    )
});

/// Subtracts written amounts from processing, deleting fields that reach zero.
static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        for i = 1, #ARGV, 2 do
            local left = redis.call('HINCRBY', KEYS[1], ARGV[i], -tonumber(ARGV[i + 1]))
            if left <= 0 then
                redis.call('HDEL', KEYS[1], ARGV[i])
            end
        end
        return 1
        "#,
    )
});

/// Which half of the buffer an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Newly arrived increments, not yet claimed by a flush.
    Active,
    /// Increments claimed by a flush and not yet confirmed durable.
    Processing,
}

/// One page of a cursor scan. A `cursor` of 0 means the scan is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub entries: Vec<BufferedDelta>,
}

/// Store for the buffered click generations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Health check - verify store connectivity.
    async fn health_check(&self) -> Result<bool>;

    /// Add `clicks` to the user's active amount. Returns the new active amount.
    async fn increment(&self, user_id: i64, clicks: i64) -> Result<i64>;

    /// Active plus processing amount for a user, read atomically.
    async fn buffered(&self, user_id: i64) -> Result<i64>;

    /// Scan one page of a generation starting at `cursor` (0 to start).
    async fn scan(&self, generation: Generation, cursor: u64, count: usize) -> Result<ScanPage>;

    /// Atomically move the current amounts of `user_ids` from active to
    /// processing. Returns what was moved; users with nothing active are omitted.
    async fn claim(&self, user_ids: &[i64]) -> Result<Vec<BufferedDelta>>;

    /// Remove durably written amounts from processing.
    async fn release(&self, written: &[BufferedDelta]) -> Result<()>;

    /// True when the processing generation holds anything.
    async fn has_processing(&self) -> Result<bool>;
}

fn generation_key(generation: Generation) -> &'static str {
    match generation {
        Generation::Active => ACTIVE_KEY,
        Generation::Processing => PROCESSING_KEY,
    }
}

/// Parses a flat `[field, value, field, value, ...]` reply into deltas.
fn parse_pairs(flat: Vec<String>) -> Result<Vec<BufferedDelta>> {
    flat.chunks_exact(2)
        .map(|pair| {
            let user_id = pair[0]
                .parse()
                .with_context(|| format!("invalid buffered user id {:?}", pair[0]))?;
            let clicks = pair[1]
                .parse()
                .with_context(|| format!("invalid buffered amount {:?}", pair[1]))?;
            Ok(BufferedDelta { user_id, clicks })
        })
        .collect()
}

/// Redis implementation of BufferStore.
#[derive(Clone)]
pub struct RedisBufferStore {
    client: redis::Client,
}

impl RedisBufferStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(result == "PONG")
    }

    async fn increment(&self, user_id: i64, clicks: i64) -> Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let active: i64 = conn.hincr(ACTIVE_KEY, user_id, clicks).await?;
        Ok(active)
    }

    async fn buffered(&self, user_id: i64) -> Result<i64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // MULTI keeps the two reads consistent with the claim script.
        let (active, processing): (Option<i64>, Option<i64>) = redis::pipe()
            .atomic()
            .hget(ACTIVE_KEY, user_id)
            .hget(PROCESSING_KEY, user_id)
            .query_async(&mut conn)
            .await?;
        Ok(active.unwrap_or(0) + processing.unwrap_or(0))
    }

    async fn scan(&self, generation: Generation, cursor: u64, count: usize) -> Result<ScanPage> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (cursor, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(generation_key(generation))
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(ScanPage {
            cursor,
            entries: parse_pairs(flat)?,
        })
    }

    async fn claim(&self, user_ids: &[i64]) -> Result<Vec<BufferedDelta>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut invocation = CLAIM_SCRIPT.key(ACTIVE_KEY);
        invocation.key(PROCESSING_KEY);
        for user_id in user_ids {
            invocation.arg(*user_id);
        }
        let moved: Vec<String> = invocation.invoke_async(&mut conn).await?;

        parse_pairs(moved)
    }

    async fn release(&self, written: &[BufferedDelta]) -> Result<()> {
        if written.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut invocation = RELEASE_SCRIPT.key(PROCESSING_KEY);
        for delta in written {
            invocation.arg(delta.user_id).arg(delta.clicks);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn has_processing(&self) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let exists: bool = conn.exists(PROCESSING_KEY).await?;
        Ok(exists)
    }
}

#[derive(Default)]
struct Generations {
    active: BTreeMap<i64, i64>,
    processing: BTreeMap<i64, i64>,
}

impl Generations {
    fn map(&self, generation: Generation) -> &BTreeMap<i64, i64> {
        match generation {
            Generation::Active => &self.active,
            Generation::Processing => &self.processing,
        }
    }
}

/// Memory scan cursors map user ids onto `1..=u64::MAX` in key order,
/// keeping 0 free for "scan complete".
fn encode_cursor(after: i64) -> u64 {
    // i64::MAX is the last possible key, so nothing can follow it.
    ((after as u64) ^ (1 << 63)).checked_add(1).unwrap_or(0)
}

fn decode_cursor(cursor: u64) -> i64 {
    ((cursor - 1) ^ (1 << 63)) as i64
}

/// In-process implementation of BufferStore.
///
/// Scans walk the maps in key order; the cursor encodes the last key
/// returned so entries removed between pages never shift later ones.
#[derive(Default)]
pub struct MemoryBufferStore {
    inner: Mutex<Generations>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Generations> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn increment(&self, user_id: i64, clicks: i64) -> Result<i64> {
        let mut inner = self.lock();
        let active = inner.active.entry(user_id).or_insert(0);
        *active += clicks;
        Ok(*active)
    }

    async fn buffered(&self, user_id: i64) -> Result<i64> {
        let inner = self.lock();
        let active = inner.active.get(&user_id).copied().unwrap_or(0);
        let processing = inner.processing.get(&user_id).copied().unwrap_or(0);
        Ok(active + processing)
    }

    async fn scan(&self, generation: Generation, cursor: u64, count: usize) -> Result<ScanPage> {
        let inner = self.lock();
        let map = inner.map(generation);

        let lower = match cursor {
            0 => Bound::Unbounded,
            after => Bound::Excluded(decode_cursor(after)),
        };
        let mut range = map.range((lower, Bound::Unbounded));
        let entries: Vec<BufferedDelta> = range
            .by_ref()
            .take(count.max(1))
            .map(|(user_id, clicks)| BufferedDelta {
                user_id: *user_id,
                clicks: *clicks,
            })
            .collect();

        let cursor = match (range.next(), entries.last()) {
            (Some(_), Some(last)) => encode_cursor(last.user_id),
            _ => 0,
        };
        Ok(ScanPage { cursor, entries })
    }

    async fn claim(&self, user_ids: &[i64]) -> Result<Vec<BufferedDelta>> {
        let mut inner = self.lock();
        let mut moved = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let Some(clicks) = inner.active.remove(user_id) {
                *inner.processing.entry(*user_id).or_insert(0) += clicks;
                moved.push(BufferedDelta {
                    user_id: *user_id,
                    clicks,
                });
            }
        }
        Ok(moved)
    }

    async fn release(&self, written: &[BufferedDelta]) -> Result<()> {
        let mut inner = self.lock();
        for delta in written {
            if let Some(left) = inner.processing.get_mut(&delta.user_id) {
                *left -= delta.clicks;
                if *left <= 0 {
                    inner.processing.remove(&delta.user_id);
                }
            }
        }
        Ok(())
    }

    async fn has_processing(&self) -> Result<bool> {
        Ok(!self.lock().processing.is_empty())
    }
}
