//! Scheduled rotation.
//!
//! Ticks at a fixed interval and asks the control loop to re-evaluate the
//! target. The request is queued behind pending records, so it never races
//! a send.

use super::accumulator::AccumulatorHandle;
use super::RotationOutcome;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct RotationScheduler<T> {
    handle: AccumulatorHandle<T>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<T: Send + 'static> RotationScheduler<T> {
    pub fn new(handle: AccumulatorHandle<T>, interval: Duration, cancel: CancellationToken) -> Self {
        RotationScheduler {
            handle,
            interval,
            cancel,
        }
    }

    /// Spawn the scheduler. Returns None when the interval is zero.
    pub fn spawn(self) -> Option<tokio::task::JoinHandle<()>> {
        if self.interval.is_zero() {
            debug!("Scheduled rotation disabled");
            return None;
        }
        Some(tokio::spawn(self.run()))
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the client was just connected.
        ticker.tick().await;

        info!("Rotation scheduler running every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.handle.rotate().await {
                        Ok(RotationOutcome::Rotated { from, to }) => {
                            info!("Scheduled rotation {} -> {}", from, to);
                        }
                        Ok(RotationOutcome::NotRotated) => {}
                        Err(e) => error!("Scheduled rotation failed: {}", e),
                    }
                    if self.handle.is_closed() {
                        break;
                    }
                }
            }
        }
        debug!("Rotation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::accumulator::spawn_accumulator;
    use crate::delivery::{BatchConfig, BatchSink, SinkFuture};
    use crate::store::TxId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CountingSink {
        rotations: Arc<Mutex<u32>>,
    }

    impl BatchSink<u32> for CountingSink {
        fn send(&mut self, _batch: Vec<u32>) -> SinkFuture<'_, TxId> {
            Box::pin(async { Ok(TxId(1)) })
        }

        fn rotate(&mut self) -> SinkFuture<'_, RotationOutcome> {
            Box::pin(async move {
                *self.rotations.lock() += 1;
                Ok(RotationOutcome::NotRotated)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled() {
        let sink = CountingSink::default();
        let (handle, _task) =
            spawn_accumulator::<u32, _>(BatchConfig::default(), sink.clone());
        let cancel = CancellationToken::new();

        let task = RotationScheduler::new(handle, Duration::from_secs(60), cancel.clone())
            .spawn()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60 * 3 + 30)).await;
        assert_eq!(*sink.rotations.lock(), 3);

        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(*sink.rotations.lock(), 3);
    }

    #[tokio::test]
    async fn test_zero_interval_disabled() {
        let (handle, _task) =
            spawn_accumulator::<u32, _>(BatchConfig::default(), CountingSink::default());
        let scheduler = RotationScheduler::new(handle, Duration::ZERO, CancellationToken::new());
        assert!(scheduler.spawn().is_none());
    }
}
