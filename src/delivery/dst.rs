//! Deterministic Simulation Testing for the delivery pipeline
//!
//! Drives a real accumulator + delivery client against a fault-injecting
//! in-memory ledger, with a simulated wall clock for rotation. After the
//! run, the ledger contents are checked against what was pushed:
//!
//! - no record is committed twice
//! - records are committed in push order
//! - no batch exceeds the size limit
//! - every transaction has the expected write-set shape
//! - the pipeline's counters agree with the ledger
//!
//! ```text
//! for seed in 0..100 {
//!     let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::chaos(seed)).await;
//!     harness.run(500).await;
//!     harness.check_invariants().await;  // Reports the seed on failure
//! }
//! ```
//!
//! Run under a paused tokio clock so backoffs and batch delays cost nothing.

use super::accumulator::{spawn_accumulator, AccumulatorHandle, PipelineStats};
use super::client::DeliveryClient;
use super::config::{BatchConfig, RetryPolicy};
use super::target::TargetNamer;
use crate::clock::{Clock, SimulatedClock};
use crate::io::{Rng, SimulatedRng};
use crate::record::LogRecord;
use crate::store::{
    CommittedTx, Credentials, InMemoryLedgerStore, SimulatedLedgerStore, SimulatedStoreConfig,
    SimulatedStoreStats, TxId, WriteOp, SYSTEM_DATABASE,
};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

/// 2024-01-31T22:00:00Z, two hours before a month boundary.
const START_MS: i64 = 1_706_738_400_000;

/// Configuration for pipeline DST
#[derive(Debug, Clone)]
pub struct PipelineDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub store_config: SimulatedStoreConfig,
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    /// Probability that an operation waits instead of pushing
    pub wait_probability: f64,
    /// Probability of a rotation request
    pub rotate_probability: f64,
    /// Probability that a record carries an assigned id
    pub assigned_id_probability: f64,
}

impl Default for PipelineDSTConfig {
    fn default() -> Self {
        PipelineDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig::moderate(),
            batch: BatchConfig::new(8, Duration::from_millis(500)),
            retry: RetryPolicy::default(),
            wait_probability: 0.1,
            rotate_probability: 0.03,
            assigned_id_probability: 0.3,
        }
    }
}

impl PipelineDSTConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no fault injection
    pub fn calm(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Chaos mode - aggressive fault injection, some batches are lost
    pub fn chaos(seed: u64) -> Self {
        PipelineDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::chaos(),
            rotate_probability: 0.05,
            ..Default::default()
        }
    }
}

/// Pipeline operation type
#[derive(Debug, Clone)]
pub enum PipelineOperation {
    Push(LogRecord),
    /// Sleep, letting the batch timer fire
    Wait(Duration),
    /// Move the wall clock forward, then ask for a rotation
    Rotate { advance: Duration },
}

/// Workload generator
pub struct PipelineWorkload {
    rng: SimulatedRng,
    config: PipelineDSTConfig,
    next_seq: u64,
}

impl PipelineWorkload {
    pub fn new(config: PipelineDSTConfig) -> Self {
        PipelineWorkload {
            rng: SimulatedRng::new(config.seed),
            config,
            next_seq: 0,
        }
    }

    pub fn next_operation(&mut self) -> PipelineOperation {
        let roll = self.rng.next_u64() as f64 / u64::MAX as f64;

        if roll < self.config.rotate_probability {
            let minutes = self.rng.gen_range(1, 120);
            PipelineOperation::Rotate {
                advance: Duration::from_secs(minutes * 60),
            }
        } else if roll < self.config.rotate_probability + self.config.wait_probability {
            let delay_ms = self.config.batch.max_delay.as_millis() as u64;
            let ms = self.rng.gen_range(1, delay_ms.saturating_mul(2).max(2));
            PipelineOperation::Wait(Duration::from_millis(ms))
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            let pod = format!("pod-{}", self.rng.gen_range(0, 4));
            let mut record = LogRecord::new(seq as f64, format!("line {}", seq))
                .with_pod("dst", &pod, "node-1");
            if self.rng.gen_bool(self.config.assigned_id_probability) {
                record = record.with_assigned_id(format!("id-{}", seq));
            }
            PipelineOperation::Push(record)
        }
    }

    pub fn records_generated(&self) -> u64 {
        self.next_seq
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct PipelineDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub records_pushed: u64,
    pub records_committed: u64,
    pub transactions: u64,
    pub rotation_requests: u64,
    pub pipeline_stats: PipelineStats,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl PipelineDSTResult {
    pub fn new(seed: u64) -> Self {
        PipelineDSTResult {
            seed,
            total_operations: 0,
            records_pushed: 0,
            records_committed: 0,
            transactions: 0,
            rotation_requests: 0,
            pipeline_stats: PipelineStats::default(),
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops, {}/{} records committed in {} txs, {} failed batches, {} rotations, {} violations",
            self.seed,
            self.total_operations,
            self.records_committed,
            self.records_pushed,
            self.transactions,
            self.pipeline_stats.batches_failed,
            self.pipeline_stats.rotations,
            self.invariant_violations.len()
        )
    }
}

type DSTStore = SimulatedLedgerStore<InMemoryLedgerStore, SimulatedRng>;

/// Main DST harness for the delivery pipeline
pub struct PipelineDSTHarness {
    config: PipelineDSTConfig,
    store: DSTStore,
    clock: SimulatedClock,
    namer: TargetNamer,
    workload: PipelineWorkload,
    handle: AccumulatorHandle<LogRecord>,
    task: Option<tokio::task::JoinHandle<()>>,
    /// Every target name the clock has mapped to during the run
    targets: BTreeSet<String>,
    result: PipelineDSTResult,
}

impl PipelineDSTHarness {
    pub async fn new(config: PipelineDSTConfig) -> Self {
        let clock = SimulatedClock::new(START_MS);
        let store = SimulatedLedgerStore::new(
            InMemoryLedgerStore::new(),
            SimulatedRng::new(config.seed.wrapping_add(1)), // Different seed for store
            config.store_config.clone(),
        );
        let namer = TargetNamer::new("log_%Y_%m").expect("static target pattern is valid");

        let mut client = DeliveryClient::new(
            store.clone(),
            Credentials::new("immudb", "immudb"),
            namer.clone(),
            clock.clone(),
            config.retry.clone(),
        )
        .with_address("simulated");
        // May fail under faults; the first send reconnects.
        let _ = client.connect().await;

        let (handle, task) = spawn_accumulator(config.batch.clone(), client);

        let mut targets = BTreeSet::new();
        targets.insert(namer.name_at(clock.now()));

        PipelineDSTHarness {
            workload: PipelineWorkload::new(config.clone()),
            result: PipelineDSTResult::new(config.seed),
            config,
            store,
            clock,
            namer,
            handle,
            task: Some(task),
            targets,
        }
    }

    /// Run the workload for a specified number of operations
    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op).await;
        }
    }

    async fn execute_operation(&mut self, op: PipelineOperation) {
        self.result.total_operations += 1;
        match op {
            PipelineOperation::Push(record) => {
                self.handle.push(record).await;
                self.result.records_pushed += 1;
            }
            PipelineOperation::Wait(duration) => {
                tokio::time::sleep(duration).await;
            }
            PipelineOperation::Rotate { advance } => {
                self.clock.advance(advance);
                self.targets.insert(self.namer.name_at(self.clock.now()));
                self.result.rotation_requests += 1;
                // Failures are expected under faults and counted by the pipeline.
                let _ = self.handle.rotate().await;
            }
        }
        // Barrier: the loop has handled everything queued so far, which keeps
        // batch boundaries a pure function of the seed.
        let _ = self.handle.stats().await;
    }

    /// Shut the pipeline down and check the ledger against the workload.
    pub async fn check_invariants(&mut self) {
        match self.handle.shutdown().await {
            Some(stats) => self.result.pipeline_stats = stats,
            None => self.violation("accumulator stopped before shutdown".to_string()),
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                self.violation(format!("accumulator task panicked: {}", e));
            }
        }

        let mut committed: Vec<(String, CommittedTx)> = Vec::new();
        for name in self.store.inner().database_names() {
            if name == SYSTEM_DATABASE {
                continue;
            }
            if !self.targets.contains(&name) {
                self.violation(format!("unexpected database {}", name));
            }
            for tx in self.store.inner().transactions(&name) {
                committed.push((name.clone(), tx));
            }
        }
        self.result.transactions = committed.len() as u64;

        let mut seen = HashSet::new();
        for (db, tx) in &committed {
            self.check_batch_size(db, tx);
            let seqs = self.check_write_set(db, tx);
            let mut last: Option<u64> = None;
            for seq in seqs {
                if !seen.insert(seq) {
                    self.violation(format!("record {} committed twice", seq));
                }
                if let Some(prev) = last {
                    if seq <= prev {
                        self.violation(format!("{} tx {}: {} after {}", db, tx.id, seq, prev));
                    }
                }
                last = Some(seq);
            }
        }
        self.result.records_committed = seen.len() as u64;

        self.check_cross_transaction_order(&committed);
        self.check_accounting();
        self.result.store_stats = self.store.stats();
    }

    fn check_batch_size(&mut self, db: &str, tx: &CommittedTx) {
        let records = tx.ops.iter().filter(|op| !op.is_reference()).count();
        if records == 0 || records > self.config.batch.max_records {
            self.violation(format!("{} tx {} carries {} records", db, tx.id, records));
        }
    }

    /// Check the operation layout of one transaction and return the record
    /// sequence numbers it carries, in order.
    fn check_write_set(&mut self, db: &str, tx: &CommittedTx) -> Vec<u64> {
        let mut seqs = Vec::new();
        let mut ops = tx.ops.iter().peekable();
        let mut index = 0usize;

        while let Some(op) = ops.next() {
            let (key, value) = match op {
                WriteOp::Set { key, value } => (key, value),
                WriteOp::Reference { key, .. } => {
                    self.violation(format!(
                        "{} tx {}: reference {} without primary",
                        db,
                        tx.id,
                        String::from_utf8_lossy(key)
                    ));
                    continue;
                }
            };

            let record: LogRecord = match serde_json::from_slice(value) {
                Ok(r) => r,
                Err(e) => {
                    self.violation(format!("{} tx {}: undecodable value: {}", db, tx.id, e));
                    continue;
                }
            };
            let expected_key = format!(
                "L:dst/{}@node-1:{:.6}:{}",
                record.kubernetes.pod_name, record.date, index
            );
            if key.as_ref() != expected_key.as_bytes() {
                self.violation(format!(
                    "{} tx {}: key {} != {}",
                    db,
                    tx.id,
                    String::from_utf8_lossy(key),
                    expected_key
                ));
            }

            let mut expected_refs = vec![format!("T:{:.6}:{}", record.date, index)];
            if !record.assigned_id.is_empty() {
                expected_refs.push(format!("I:{}", record.assigned_id));
            }
            for expected in expected_refs {
                match ops.next() {
                    Some(WriteOp::Reference {
                        key: ref_key,
                        referenced_key,
                    }) if ref_key.as_ref() == expected.as_bytes()
                        && referenced_key == key => {}
                    other => self.violation(format!(
                        "{} tx {}: expected reference {}, found {:?}",
                        db, tx.id, expected, other
                    )),
                }
            }

            seqs.push(record.date as u64);
            index += 1;
        }
        seqs
    }

    /// `committed` lists databases in name order, which for `log_%Y_%m` is
    /// rotation order, and each database's transactions in commit order. Every
    /// transaction must start after everything committed before it, including
    /// across a rotation boundary.
    fn check_cross_transaction_order(&mut self, committed: &[(String, CommittedTx)]) {
        let mut last: Option<(&str, TxId, u64)> = None;
        for (db, tx) in committed {
            let seqs: Vec<u64> = tx
                .ops
                .iter()
                .filter_map(|op| match op {
                    WriteOp::Set { value, .. } => serde_json::from_slice::<LogRecord>(value).ok(),
                    WriteOp::Reference { .. } => None,
                })
                .map(|r| r.date as u64)
                .collect();
            let (Some(&first), Some(&max)) = (seqs.first(), seqs.iter().max()) else {
                continue;
            };
            if let Some((prev_db, prev_tx, prev_max)) = last {
                if first <= prev_max {
                    self.violation(format!(
                        "{} tx {} starts at {} but {} tx {} already reached {}",
                        db, tx.id, first, prev_db, prev_tx, prev_max
                    ));
                }
            }
            last = Some((db.as_str(), tx.id, max));
        }
    }

    fn check_accounting(&mut self) {
        let stats = self.result.pipeline_stats.clone();
        if stats.records_delivered != self.result.records_committed {
            self.violation(format!(
                "pipeline reports {} delivered records, ledger holds {}",
                stats.records_delivered, self.result.records_committed
            ));
        }
        if self.result.records_committed > self.result.records_pushed {
            self.violation(format!(
                "{} records committed but only {} pushed",
                self.result.records_committed, self.result.records_pushed
            ));
        }
        if self.workload.records_generated() != self.result.records_pushed {
            self.violation("workload and harness disagree on pushes".to_string());
        }
        if self.config.store_config.faults.enabled {
            return;
        }
        if self.result.records_committed != self.result.records_pushed {
            self.violation(format!(
                "without faults every record must land: {}/{}",
                self.result.records_committed, self.result.records_pushed
            ));
        }
    }

    fn violation(&mut self, msg: String) {
        self.result.invariant_violations.push(msg);
    }

    pub fn result(&self) -> &PipelineDSTResult {
        &self.result
    }

    pub fn into_result(self) -> PipelineDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> PipelineDSTConfig,
) -> Vec<PipelineDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = PipelineDSTHarness::new(config_fn(seed)).await;
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[PipelineDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let pushed: u64 = results.iter().map(|r| r.records_pushed).sum();
    let committed: u64 = results.iter().map(|r| r.records_committed).sum();
    let rotations: u64 = results.iter().map(|r| r.pipeline_stats.rotations).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {}/{} records committed, {} rotations",
        passed, total, committed, pushed, rotations
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_dst_harness_calm() {
        let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::calm(42)).await;
        harness.run(300).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert!(result.records_pushed > 0);
        assert_eq!(result.records_committed, result.records_pushed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dst_harness_chaos_keeps_invariants() {
        let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::chaos(7)).await;
        harness.run(400).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "{}: {:?}",
            result.summary(),
            result.invariant_violations
        );
        assert!(result.store_stats.exec_attempts > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dst_deterministic() {
        async fn run(seed: u64) -> (u64, u64, PipelineStats) {
            let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::moderate(seed)).await;
            harness.run(200).await;
            harness.check_invariants().await;
            let r = harness.into_result();
            (r.records_committed, r.transactions, r.pipeline_stats)
        }

        assert_eq!(run(99).await, run(99).await, "Same seed should produce same results");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_crosses_month() {
        let record = |seq: u64| {
            LogRecord::new(seq as f64, format!("line {}", seq)).with_pod("dst", "pod-0", "node-1")
        };

        let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::calm(1)).await;
        harness.execute_operation(PipelineOperation::Push(record(0))).await;
        harness
            .execute_operation(PipelineOperation::Rotate {
                advance: Duration::from_secs(3 * 3600),
            })
            .await;
        harness.execute_operation(PipelineOperation::Push(record(1))).await;
        harness.workload.next_seq = 2;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.pipeline_stats.rotations, 1);
        // The pending batch is flushed after the switch, so both records
        // land in the new month.
        let txs = harness.store.inner().transactions("log_2024_02");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].ops.len(), 4);
        assert!(harness.store.inner().transactions("log_2024_01").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_checked_across_rotation() {
        let record = |seq: u64| {
            LogRecord::new(seq as f64, format!("line {}", seq)).with_pod("dst", "pod-0", "node-1")
        };
        let tx = |id: u64, seqs: &[u64]| {
            let batch: Vec<LogRecord> = seqs.iter().map(|&s| record(s)).collect();
            CommittedTx {
                id: TxId(id),
                ops: crate::delivery::build_write_set(&batch).unwrap(),
            }
        };

        let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::calm(3)).await;
        harness.check_cross_transaction_order(&[
            ("log_2024_01".to_string(), tx(1, &[0, 1])),
            ("log_2024_02".to_string(), tx(1, &[2])),
        ]);
        assert!(harness.result().is_success());

        // A later month starting behind the previous month's last record.
        harness.check_cross_transaction_order(&[
            ("log_2024_01".to_string(), tx(1, &[0, 5])),
            ("log_2024_02".to_string(), tx(1, &[3, 6])),
        ]);
        assert_eq!(harness.result().invariant_violations.len(), 1);
        assert!(harness.result().invariant_violations[0].contains("log_2024_01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_both_sides_of_rotation() {
        let record = |seq: u64| {
            LogRecord::new(seq as f64, format!("line {}", seq)).with_pod("dst", "pod-0", "node-1")
        };

        let mut harness = PipelineDSTHarness::new(PipelineDSTConfig::calm(4)).await;
        harness.execute_operation(PipelineOperation::Push(record(0))).await;
        harness
            .execute_operation(PipelineOperation::Wait(Duration::from_secs(1)))
            .await;
        harness
            .execute_operation(PipelineOperation::Rotate {
                advance: Duration::from_secs(3 * 3600),
            })
            .await;
        harness.execute_operation(PipelineOperation::Push(record(1))).await;
        harness.workload.next_seq = 2;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(harness.store.inner().transactions("log_2024_01").len(), 1);
        assert_eq!(harness.store.inner().transactions("log_2024_02").len(), 1);
    }

    #[test]
    fn test_workload_generator() {
        let mut workload = PipelineWorkload::new(PipelineDSTConfig::new(42));
        let mut pushes = 0;
        let mut waits = 0;
        for _ in 0..1000 {
            match workload.next_operation() {
                PipelineOperation::Push(_) => pushes += 1,
                PipelineOperation::Wait(_) => waits += 1,
                PipelineOperation::Rotate { .. } => {}
            }
        }
        assert!(pushes > 700, "pushes: {}", pushes);
        assert!(waits > 0);
        assert_eq!(workload.records_generated(), pushes);
    }
}
