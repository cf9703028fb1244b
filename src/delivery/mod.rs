//! Batching and Delivery Pipeline
//!
//! Records flow from any number of producers into one control loop, which
//! groups them into batches and hands each batch to a sink. The production
//! sink is `DeliveryClient`, which turns a batch into one atomic ledger
//! transaction and owns the session to the store.
//!
//! ## Architecture
//!
//! ```text
//! producer ──┐
//! producer ──┤──► BatchAccumulator ──► DeliveryClient::send ──► LedgerStore
//! producer ──┘          ▲
//!                       └── rotate (HTTP / RotationScheduler)
//! ```
//!
//! Rotation requests travel through the same loop as flushes, so a target
//! switch can never interleave with a transaction in flight.

pub mod accumulator;
pub mod client;
pub mod config;
pub mod dst;
pub mod rotation;
pub mod target;
pub mod write_set;

pub use accumulator::{spawn_accumulator, AccumulatorHandle, BatchAccumulator, PipelineStats};
pub use client::DeliveryClient;
pub use config::{BatchConfig, RetryPolicy, RotationConfig, TargetConfig};
pub use rotation::RotationScheduler;
pub use target::{TargetError, TargetNamer};
pub use write_set::build_write_set;

use crate::store::{LedgerError, TxId};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Result of a rotation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RotationOutcome {
    /// The computed target equals the active one.
    NotRotated,
    /// The client switched targets and reconnected.
    Rotated { from: String, to: String },
}

impl RotationOutcome {
    pub fn rotated(&self) -> bool {
        matches!(self, RotationOutcome::Rotated { .. })
    }
}

/// Error type for delivery
#[derive(Debug)]
pub enum DeliveryError {
    /// A record could not be encoded as a ledger value
    Encode(String),
    /// Opening the session to the target failed
    Connect(LedgerError),
    /// Every attempt failed; the batch is dropped
    Exhausted { attempts: u32, source: LedgerError },
    /// The control loop is gone
    Closed,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Encode(msg) => write!(f, "record encoding failed: {}", msg),
            DeliveryError::Connect(e) => write!(f, "connect failed: {}", e),
            DeliveryError::Exhausted { attempts, source } => {
                write!(f, "delivery failed after {} attempts: {}", attempts, source)
            }
            DeliveryError::Closed => write!(f, "delivery pipeline closed"),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Connect(e) => Some(e),
            DeliveryError::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Boxed future returned by `BatchSink` calls.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeliveryError>> + Send + 'a>>;

/// Destination of flushed batches. Owned exclusively by the control loop.
pub trait BatchSink<T>: Send + 'static {
    /// Deliver one batch. Returns the transaction id it was committed under.
    fn send(&mut self, batch: Vec<T>) -> SinkFuture<'_, TxId>;

    /// Re-evaluate the delivery target.
    fn rotate(&mut self) -> SinkFuture<'_, RotationOutcome>;

    /// Release the store session, if any. Called once at shutdown.
    fn close(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
