//! Background task that flushes the write buffer on an interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::buffer::WriteBuffer;

/// Handle to the periodic flush task.
pub struct FlushWorker {
    notify: Arc<Notify>,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    /// Spawn the periodic flush. The first tick fires one `every` after start.
    pub fn start(buffer: Arc<WriteBuffer>, every: Duration, drain_attempts: u32) -> Self {
        let notify = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = tokio::spawn(run(buffer, every, drain_attempts, notify.clone(), stop_rx));

        Self {
            notify,
            stop_tx,
            handle,
        }
    }

    /// Ask for a flush without waiting for the next tick.
    pub fn flush_now(&self) {
        self.notify.notify_one();
    }

    /// Stop ticking and drain what is left. Returns once the drain is done.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(err) = self.handle.await {
            tracing::error!(error = ?err, "flush worker panicked");
        }
    }
}

async fn run(
    buffer: Arc<WriteBuffer>,
    every: Duration,
    drain_attempts: u32,
    notify: Arc<Notify>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + every;
    let mut interval = tokio::time::interval_at(start, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_ms = every.as_millis() as u64, "flush worker started");

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = interval.tick() => {}
            _ = notify.notified() => {}
        }

        match buffer.flush().await {
            Ok(report) if report.flushed_count() > 0 || report.failed > 0 => {
                tracing::info!(
                    flushed = report.flushed_count(),
                    failed = report.failed,
                    "periodic flush complete"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = ?err, "periodic flush failed"),
        }
    }

    let passes = buffer.drain(drain_attempts).await;
    tracing::info!(passes, "flush worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clicks::FlushSettings;
    use crate::stores::MemoryBufferStore;
    use crate::test_utils::FakeUserRepo;

    fn write_buffer(users: Arc<FakeUserRepo>) -> Arc<WriteBuffer> {
        Arc::new(WriteBuffer::new(
            Arc::new(MemoryBufferStore::new()),
            users,
            FlushSettings::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_every_tick() {
        let users = Arc::new(FakeUserRepo::with_users(&[(1, 0)]));
        let buffer = write_buffer(users.clone());
        let worker = FlushWorker::start(buffer.clone(), Duration::from_secs(5), 10);

        buffer.add_clicks(1, 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(users.clicks(1), 3);

        buffer.add_clicks(1, 2).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(users.clicks(1), 5);

        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_does_not_wait_for_tick() {
        let users = Arc::new(FakeUserRepo::with_users(&[(1, 0)]));
        let buffer = write_buffer(users.clone());
        let worker = FlushWorker::start(buffer.clone(), Duration::from_secs(60), 10);

        buffer.add_clicks(1, 7).await.unwrap();
        worker.flush_now();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(users.clicks(1), 7);
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_remaining_clicks() {
        let users = Arc::new(FakeUserRepo::with_users(&[(1, 0), (2, 0)]));
        let buffer = write_buffer(users.clone());
        let worker = FlushWorker::start(buffer.clone(), Duration::from_secs(3600), 10);

        buffer.add_clicks(1, 4).await.unwrap();
        buffer.add_clicks(2, 8).await.unwrap();
        worker.stop().await;

        assert_eq!(users.clicks(1), 4);
        assert_eq!(users.clicks(2), 8);
        assert_eq!(buffer.buffered_clicks(1).await.unwrap(), 0);
    }
}
