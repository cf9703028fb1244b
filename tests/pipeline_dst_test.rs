//! Pipeline DST Integration Tests
//!
//! Multi-seed deterministic simulation of the batching pipeline, plus
//! end-to-end scenarios against the fault-injecting and on-disk ledgers.

use chrono::{TimeZone, Utc};
use immufluent::delivery::dst::{run_dst_batch, summarize_batch, PipelineDSTConfig};
use immufluent::delivery::{spawn_accumulator, BatchConfig, DeliveryClient, RetryPolicy, TargetNamer};
use immufluent::io::SimulatedRng;
use immufluent::store::{
    Credentials, InMemoryLedgerStore, LocalFsLedgerStore, SimulatedLedgerStore,
    SimulatedStoreConfig, WriteOp,
};
use immufluent::{LogRecord, SimulatedClock};
use std::time::Duration;

fn record(seq: u64) -> LogRecord {
    LogRecord::new(1_710_000_000.0 + seq as f64, format!("line {}", seq))
        .with_pod("prod", "web-1", "node-a")
}

fn march() -> SimulatedClock {
    SimulatedClock::at(Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_dst_50_seeds_calm() {
    // INVARIANT: without faults every pushed record is committed exactly once, in order.
    let results = run_dst_batch(0, 50, 300, PipelineDSTConfig::calm).await;
    let summary = summarize_batch(&results);

    for r in &results {
        assert!(r.is_success(), "{}: {:?}", r.summary(), r.invariant_violations);
        assert_eq!(
            r.records_committed, r.records_pushed,
            "Seed {}: records lost without faults",
            r.seed
        );
        assert_eq!(r.pipeline_stats.batches_failed, 0);
    }

    println!("{}", summary);
}

#[tokio::test(start_paused = true)]
async fn test_dst_50_seeds_moderate() {
    let results = run_dst_batch(1000, 50, 300, PipelineDSTConfig::moderate).await;
    let summary = summarize_batch(&results);

    for r in &results {
        assert!(r.is_success(), "{}: {:?}", r.summary(), r.invariant_violations);
    }

    println!("{}", summary);
}

#[tokio::test(start_paused = true)]
async fn test_dst_30_seeds_chaos() {
    // Failed batches may be lost, but nothing is duplicated or reordered.
    let results = run_dst_batch(5000, 30, 400, PipelineDSTConfig::chaos).await;
    let summary = summarize_batch(&results);

    for r in &results {
        assert!(r.is_success(), "{}: {:?}", r.summary(), r.invariant_violations);
        assert!(r.records_committed <= r.records_pushed);
    }

    println!("{}", summary);
}

type ScriptedStore = SimulatedLedgerStore<InMemoryLedgerStore, SimulatedRng>;

async fn scripted_pipeline(
    max_records: usize,
) -> (
    ScriptedStore,
    immufluent::AccumulatorHandle<LogRecord>,
) {
    let store = SimulatedLedgerStore::new(
        InMemoryLedgerStore::new(),
        SimulatedRng::new(3),
        SimulatedStoreConfig::no_faults(),
    );
    let mut client = DeliveryClient::new(
        store.clone(),
        Credentials::new("immudb", "immudb"),
        TargetNamer::new("log_%Y_%m").unwrap(),
        march(),
        RetryPolicy::default(),
    );
    client.connect().await.unwrap();
    let (handle, _task) = spawn_accumulator(
        BatchConfig::new(max_records, Duration::from_secs(3)),
        client,
    );
    (store, handle)
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_within_budget() {
    let (store, handle) = scripted_pipeline(3).await;

    store.fail_next_execs(4);
    for seq in 0..3 {
        handle.push(record(seq)).await;
    }
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.batches_delivered, 1);
    assert_eq!(stats.batches_failed, 0);
    assert_eq!(store.stats().exec_attempts, 5);
    assert_eq!(store.inner().transactions("log_2024_03").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_batch_is_dropped_and_pipeline_continues() {
    let (store, handle) = scripted_pipeline(2).await;

    store.fail_next_execs(6);
    handle.push(record(0)).await;
    handle.push(record(1)).await;
    handle.push(record(2)).await;
    handle.push(record(3)).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.batches_delivered, 1);
    assert_eq!(stats.records_delivered, 2);

    // Only the second batch made it.
    let txs = store.inner().transactions("log_2024_03");
    assert_eq!(txs.len(), 1);
    let first_key = String::from_utf8_lossy(txs[0].ops[0].key()).to_string();
    assert!(first_key.ends_with(":0"), "{}", first_key);
    let value = store.inner().get("log_2024_03", txs[0].ops[0].key()).unwrap();
    let decoded: LogRecord = serde_json::from_slice(&value).unwrap();
    assert_eq!(decoded.log, "line 2");
}

#[tokio::test(start_paused = true)]
async fn test_size_batch_commits_before_timer_batch() {
    let (store, handle) = scripted_pipeline(3).await;

    for seq in 0..5 {
        handle.push(record(seq)).await;
    }
    tokio::time::sleep(Duration::from_secs(4)).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.batches_flushed_by_size, 1);
    assert_eq!(stats.batches_flushed_by_timer, 1);

    let txs = store.inner().transactions("log_2024_03");
    assert_eq!(txs.len(), 2);
    assert!(txs[0].id < txs[1].id);
    assert_eq!(txs[0].ops.len(), 6);
    assert_eq!(txs[1].ops.len(), 4);
}

#[tokio::test]
async fn test_local_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = Credentials::new("immudb", "immudb");

    {
        let store = LocalFsLedgerStore::open(dir.path(), credentials.clone())
            .await
            .unwrap();
        let mut client = DeliveryClient::new(
            store,
            credentials.clone(),
            TargetNamer::new("log_%Y_%m").unwrap(),
            march(),
            RetryPolicy::immediate(1),
        );
        client.connect().await.unwrap();
        let (handle, task) =
            spawn_accumulator(BatchConfig::new(4, Duration::from_secs(60)), client);

        for seq in 0..6 {
            handle.push(record(seq).with_assigned_id(format!("req-{}", seq))).await;
        }
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.batches_flushed_by_size, 1);
        assert_eq!(stats.batches_flushed_on_shutdown, 1);
        task.await.unwrap();
    }

    let reopened = LocalFsLedgerStore::open(dir.path(), credentials)
        .await
        .unwrap();
    let frames = reopened.read_transactions("log_2024_03").await.unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].ops.len(), 12);
    assert_eq!(frames[1].ops.len(), 6);
    assert!(frames[0].tx_id < frames[1].tx_id);
    assert!(matches!(frames[1].ops[2], WriteOp::Reference { .. }));
}
