//! immufluent: batched, tamper-evident log shipping.
//!
//! Log records arrive over HTTP from fluent-bit, are grouped into batches by
//! size and idle time, and each batch is committed as one atomic transaction
//! to an append-only ledger. The target database is named after the current
//! date and rotates without losing in-flight records.

pub mod buggify;
pub mod clock;
pub mod delivery;
pub mod io;
pub mod observability;
pub mod record;
pub mod server;
pub mod store;

pub use clock::{Clock, SimulatedClock, SystemClock, WallTimestamp};
pub use delivery::{
    spawn_accumulator, AccumulatorHandle, BatchAccumulator, BatchConfig, BatchSink,
    DeliveryClient, DeliveryError, PipelineStats, RetryPolicy, RotationOutcome,
    RotationScheduler, TargetNamer,
};
pub use record::{LogRecord, Record};
pub use store::{
    Credentials, InMemoryLedgerStore, LedgerError, LedgerStore, LocalFsLedgerStore, TxId,
    WriteOp,
};
