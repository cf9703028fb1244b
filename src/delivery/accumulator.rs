//! Batch Accumulator
//!
//! A single control loop owns the pending batch and the sink. Producers talk
//! to it through a bounded channel, so a slow store pushes back on them
//! instead of growing memory without bound.
//!
//! ## Flush triggers
//!
//! - **Size**: the batch reaches `max_records`. Flushed immediately and the
//!   timer is disarmed.
//! - **Time**: no record has arrived for `max_delay`. Every push below the
//!   size threshold rearms the timer to the full delay, so the delay counts
//!   from the last arrival, not from the first.
//!
//! A timer firing on an empty batch does nothing, and the timer then stays
//! disarmed until the next push. The timer starts armed.
//!
//! Delivery is sequential: the loop awaits each send before reading the next
//! message, so batches reach the store in flush order. Rotation requests are
//! queued on the same channel and therefore never overlap a send.

use super::config::BatchConfig;
use super::{BatchSink, DeliveryError, RotationOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Counters exposed on `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub records_received: u64,
    pub batches_flushed_by_size: u64,
    pub batches_flushed_by_timer: u64,
    pub batches_flushed_on_shutdown: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub records_delivered: u64,
    pub rotations: u64,
    pub rotation_failures: u64,
    pub empty_timer_fires: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Timer,
    Shutdown,
}

/// Messages for the control loop
pub enum AccumulatorMessage<T> {
    Record(T),
    Rotate {
        response_tx: oneshot::Sender<Result<RotationOutcome, DeliveryError>>,
    },
    Stats {
        response_tx: oneshot::Sender<PipelineStats>,
    },
    /// Flush what is pending, close the sink and stop. Replies with the
    /// final counters.
    Shutdown {
        response_tx: oneshot::Sender<PipelineStats>,
    },
}

/// Control loop that owns the pending batch and the sink.
pub struct BatchAccumulator<T, S: BatchSink<T>> {
    config: BatchConfig,
    sink: S,
    rx: mpsc::Receiver<AccumulatorMessage<T>>,
    batch: Vec<T>,
    stats: PipelineStats,
}

impl<T: Send + 'static, S: BatchSink<T>> BatchAccumulator<T, S> {
    pub fn new(config: BatchConfig, sink: S) -> (Self, AccumulatorHandle<T>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let accumulator = BatchAccumulator {
            config,
            sink,
            rx,
            batch: Vec::new(),
            stats: PipelineStats::default(),
        };
        (accumulator, AccumulatorHandle { tx })
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let timer = tokio::time::sleep(self.config.max_delay);
        tokio::pin!(timer);
        let mut armed = true;

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(AccumulatorMessage::Record(record)) => {
                        self.stats.records_received += 1;
                        self.batch.push(record);
                        if self.batch.len() >= self.config.max_records {
                            info!("Batch size reached");
                            armed = false;
                            self.flush(FlushReason::Size).await;
                        } else {
                            timer.as_mut().reset(Instant::now() + self.config.max_delay);
                            armed = true;
                        }
                    }
                    Some(AccumulatorMessage::Rotate { response_tx }) => {
                        let result = self.sink.rotate().await;
                        match &result {
                            Ok(RotationOutcome::Rotated { .. }) => self.stats.rotations += 1,
                            Ok(RotationOutcome::NotRotated) => {}
                            Err(_) => self.stats.rotation_failures += 1,
                        }
                        let _ = response_tx.send(result);
                    }
                    Some(AccumulatorMessage::Stats { response_tx }) => {
                        let _ = response_tx.send(self.stats.clone());
                    }
                    Some(AccumulatorMessage::Shutdown { response_tx }) => {
                        self.finish().await;
                        let _ = response_tx.send(self.stats.clone());
                        return;
                    }
                    None => {
                        debug!("All accumulator handles dropped");
                        self.finish().await;
                        return;
                    }
                },
                () = &mut timer, if armed => {
                    armed = false;
                    if self.batch.is_empty() {
                        debug!("Empty timer triggered");
                        self.stats.empty_timer_fires += 1;
                    } else {
                        info!("Timer writing {}", self.batch.len());
                        self.flush(FlushReason::Timer).await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self, reason: FlushReason) {
        if self.batch.is_empty() {
            return;
        }
        match reason {
            FlushReason::Size => self.stats.batches_flushed_by_size += 1,
            FlushReason::Timer => self.stats.batches_flushed_by_timer += 1,
            FlushReason::Shutdown => self.stats.batches_flushed_on_shutdown += 1,
        }

        let batch = std::mem::take(&mut self.batch);
        let len = batch.len() as u64;
        match self.sink.send(batch).await {
            Ok(_) => {
                self.stats.batches_delivered += 1;
                self.stats.records_delivered += len;
            }
            Err(e) => {
                error!("Error while sending batch of {} records: {}", len, e);
                self.stats.batches_failed += 1;
            }
        }
    }

    async fn finish(&mut self) {
        self.flush(FlushReason::Shutdown).await;
        if let Err(e) = self.sink.close().await {
            warn!("Error closing delivery sink: {}", e);
        }
        info!("Accumulator shutting down");
    }
}

/// Handle for sending messages to the control loop
pub struct AccumulatorHandle<T> {
    tx: mpsc::Sender<AccumulatorMessage<T>>,
}

impl<T> Clone for AccumulatorHandle<T> {
    fn clone(&self) -> Self {
        AccumulatorHandle {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> AccumulatorHandle<T> {
    /// Queue a record. Waits while the queue is full; never reports
    /// delivery problems.
    pub async fn push(&self, record: T) {
        if self.tx.send(AccumulatorMessage::Record(record)).await.is_err() {
            warn!("Accumulator is gone, dropping record");
        }
    }

    /// Ask the sink to re-evaluate its target. Runs between flushes.
    pub async fn rotate(&self) -> Result<RotationOutcome, DeliveryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AccumulatorMessage::Rotate { response_tx })
            .await
            .map_err(|_| DeliveryError::Closed)?;
        response_rx.await.unwrap_or(Err(DeliveryError::Closed))
    }

    /// Snapshot of the counters. Answered after every message queued before it.
    pub async fn stats(&self) -> Result<PipelineStats, DeliveryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AccumulatorMessage::Stats { response_tx })
            .await
            .map_err(|_| DeliveryError::Closed)?;
        response_rx.await.map_err(|_| DeliveryError::Closed)
    }

    /// Graceful shutdown: waits for the final flush. Returns the final
    /// counters, or None if the loop had already stopped.
    pub async fn shutdown(&self) -> Option<PipelineStats> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AccumulatorMessage::Shutdown { response_tx })
            .await
            .ok()?;
        response_rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the control loop and return its handle + join handle
pub fn spawn_accumulator<T, S>(
    config: BatchConfig,
    sink: S,
) -> (AccumulatorHandle<T>, tokio::task::JoinHandle<()>)
where
    T: Send + 'static,
    S: BatchSink<T>,
{
    let (accumulator, handle) = BatchAccumulator::new(config, sink);
    let task = tokio::spawn(accumulator.run());
    (handle, task)
}
