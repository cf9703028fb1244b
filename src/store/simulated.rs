//! Simulated Ledger Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults using buggify. Besides random
//! faults it supports scripted ones ("reject the next N transactions") so
//! that retry behaviour can be pinned down exactly in unit tests.

use super::{Credentials, DatabaseInfo, LedgerError, LedgerFuture, LedgerStore, SessionId, TxId, WriteOp};
use crate::buggify::faults::ledger as faults;
use crate::buggify::{Buggify, BuggifyStats, FaultConfig};
use crate::io::Rng;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    pub faults: FaultConfig,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

impl SimulatedStoreConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            faults: FaultConfig::disabled(),
            latency_range_us: (0, 0),
        }
    }

    pub fn moderate() -> Self {
        SimulatedStoreConfig {
            faults: FaultConfig::moderate(),
            latency_range_us: (100, 5_000),
        }
    }

    /// High chaos configuration for stress testing
    pub fn chaos() -> Self {
        SimulatedStoreConfig {
            faults: FaultConfig::chaos(),
            latency_range_us: (1_000, 50_000),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub exec_attempts: u64,
    pub exec_failures: u64,
    pub exec_timeouts: u64,
    pub session_opens: u64,
    pub session_open_failures: u64,
    pub sessions_expired: u64,
    pub list_failures: u64,
    pub create_failures: u64,
    pub scripted_failures: u64,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    buggify: Buggify,
    fail_next_execs: u32,
    fail_next_session_opens: u32,
    stats: SimulatedStoreStats,
}

/// Simulated ledger store that wraps another store and injects faults.
///
/// Clones share the RNG, the scripted failures and the statistics.
pub struct SimulatedLedgerStore<S: LedgerStore, R: Rng> {
    inner_store: S,
    latency_range_us: (u64, u64),
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: LedgerStore + Clone, R: Rng> Clone for SimulatedLedgerStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedLedgerStore {
            inner_store: self.inner_store.clone(),
            latency_range_us: self.latency_range_us,
            state: self.state.clone(),
        }
    }
}

impl<S: LedgerStore, R: Rng> SimulatedLedgerStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedLedgerStore {
            inner_store,
            latency_range_us: config.latency_range_us,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                buggify: Buggify::new(config.faults),
                fail_next_execs: 0,
                fail_next_session_opens: 0,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Reject the next `n` `exec_all` calls before they reach the store.
    pub fn fail_next_execs(&self, n: u32) {
        self.state.lock().fail_next_execs = n;
    }

    /// Refuse the next `n` `open_session` calls.
    pub fn fail_next_session_opens(&self, n: u32) {
        self.state.lock().fail_next_session_opens = n;
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn buggify_stats(&self) -> BuggifyStats {
        self.state.lock().buggify.stats.clone()
    }

    /// Draw a fault decision; the lock is never held across an await.
    fn should_inject(&self, fault_id: &str) -> bool {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        crate::buggify!(&mut s.buggify, &mut s.rng, fault_id)
    }

    async fn simulate_latency(&self) {
        let (min, max) = self.latency_range_us;
        if min == 0 && max == 0 {
            return;
        }
        let latency_us = {
            let mut s = self.state.lock();
            if max > min {
                s.rng.gen_range(min, max)
            } else {
                min
            }
        };
        if latency_us > 0 {
            tokio::time::sleep(Duration::from_micros(latency_us)).await;
        }
    }
}

impl<S: LedgerStore, R: Rng + 'static> LedgerStore for SimulatedLedgerStore<S, R> {
    fn open_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        database: &'a str,
    ) -> LedgerFuture<'a, SessionId> {
        Box::pin(async move {
            {
                let mut s = self.state.lock();
                s.stats.session_opens += 1;
                if s.fail_next_session_opens > 0 {
                    s.fail_next_session_opens -= 1;
                    s.stats.scripted_failures += 1;
                    return Err(LedgerError::Unavailable("scripted session failure".into()));
                }
            }

            if self.should_inject(faults::SESSION_OPEN_FAIL) {
                self.state.lock().stats.session_open_failures += 1;
                return Err(LedgerError::Unavailable("simulated connection refused".into()));
            }

            self.simulate_latency().await;
            self.inner_store.open_session(credentials, database).await
        })
    }

    fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId> {
        Box::pin(async move {
            {
                let mut s = self.state.lock();
                s.stats.exec_attempts += 1;
                if s.fail_next_execs > 0 {
                    s.fail_next_execs -= 1;
                    s.stats.scripted_failures += 1;
                    return Err(LedgerError::Rejected("scripted exec failure".into()));
                }
            }

            if self.should_inject(faults::EXEC_TIMEOUT) {
                self.state.lock().stats.exec_timeouts += 1;
                return Err(LedgerError::Timeout("simulated exec timeout".into()));
            }

            if self.should_inject(faults::EXEC_FAIL) {
                self.state.lock().stats.exec_failures += 1;
                return Err(LedgerError::Rejected("simulated exec failure".into()));
            }

            if self.should_inject(faults::SESSION_EXPIRED) {
                self.state.lock().stats.sessions_expired += 1;
                // The store forgets the session; the exec below then fails on it.
                let _ = self.inner_store.close_session(session).await;
            }

            self.simulate_latency().await;
            self.inner_store.exec_all(session, ops).await
        })
    }

    fn list_databases(&self, session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>> {
        Box::pin(async move {
            if self.should_inject(faults::LIST_FAIL) {
                self.state.lock().stats.list_failures += 1;
                return Err(LedgerError::Rejected("simulated list failure".into()));
            }
            self.simulate_latency().await;
            self.inner_store.list_databases(session).await
        })
    }

    fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            if self.should_inject(faults::CREATE_FAIL) {
                self.state.lock().stats.create_failures += 1;
                return Err(LedgerError::Rejected("simulated create failure".into()));
            }
            self.simulate_latency().await;
            self.inner_store.create_database(session, name).await
        })
    }

    fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()> {
        Box::pin(async move { self.inner_store.close_session(session).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;
    use crate::store::{InMemoryLedgerStore, SYSTEM_DATABASE};
    use bytes::Bytes;

    fn creds() -> Credentials {
        Credentials::new("immudb", "immudb")
    }

    fn op(key: &str) -> WriteOp {
        WriteOp::Set {
            key: Bytes::from(key.to_string()),
            value: Bytes::from_static(b"v"),
        }
    }

    fn store(config: SimulatedStoreConfig) -> SimulatedLedgerStore<InMemoryLedgerStore, SimulatedRng> {
        SimulatedLedgerStore::new(InMemoryLedgerStore::new(), SimulatedRng::new(42), config)
    }

    #[tokio::test]
    async fn test_no_faults_passes_through() {
        let sim = store(SimulatedStoreConfig::no_faults());
        let session = sim.open_session(&creds(), SYSTEM_DATABASE).await.unwrap();
        for i in 0..50 {
            sim.exec_all(session, &[op(&format!("k{}", i))]).await.unwrap();
        }
        assert_eq!(sim.inner().transactions(SYSTEM_DATABASE).len(), 50);
        assert_eq!(sim.stats().exec_attempts, 50);
    }

    #[tokio::test]
    async fn test_scripted_exec_failures() {
        let sim = store(SimulatedStoreConfig::no_faults());
        let session = sim.open_session(&creds(), SYSTEM_DATABASE).await.unwrap();

        sim.fail_next_execs(2);
        assert!(sim.exec_all(session, &[op("a")]).await.is_err());
        assert!(sim.exec_all(session, &[op("a")]).await.is_err());
        assert_eq!(sim.exec_all(session, &[op("a")]).await.unwrap(), TxId(1));
        assert_eq!(sim.stats().scripted_failures, 2);
    }

    #[tokio::test]
    async fn test_scripted_session_failures() {
        let sim = store(SimulatedStoreConfig::no_faults());
        sim.fail_next_session_opens(1);
        assert!(matches!(
            sim.open_session(&creds(), SYSTEM_DATABASE).await,
            Err(LedgerError::Unavailable(_))
        ));
        assert!(sim.open_session(&creds(), SYSTEM_DATABASE).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_exec_applies_nothing() {
        let config = SimulatedStoreConfig {
            faults: FaultConfig::new().with(faults::EXEC_FAIL, 1.0),
            latency_range_us: (0, 0),
        };
        let sim = store(config);
        let session = sim.open_session(&creds(), SYSTEM_DATABASE).await.unwrap();
        assert!(sim.exec_all(session, &[op("a")]).await.is_err());
        assert!(sim.inner().transactions(SYSTEM_DATABASE).is_empty());
        assert_eq!(sim.buggify_stats().triggered(faults::EXEC_FAIL), 1);
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        async fn run(seed: u64) -> Vec<bool> {
            let sim = SimulatedLedgerStore::new(
                InMemoryLedgerStore::new(),
                SimulatedRng::new(seed),
                SimulatedStoreConfig {
                    faults: FaultConfig::chaos(),
                    latency_range_us: (0, 0),
                },
            );
            let mut results = Vec::new();
            let mut session = None;
            for i in 0..100 {
                let s = match session {
                    Some(s) => s,
                    None => match sim.open_session(&creds(), SYSTEM_DATABASE).await {
                        Ok(s) => {
                            session = Some(s);
                            s
                        }
                        Err(_) => {
                            results.push(false);
                            continue;
                        }
                    },
                };
                let ok = sim.exec_all(s, &[op(&format!("k{}", i))]).await.is_ok();
                if !ok {
                    session = None;
                }
                results.push(ok);
            }
            results
        }

        let a = run(7).await;
        assert_eq!(a, run(7).await);
        assert!(a.iter().any(|ok| !ok), "chaos should inject something");
    }
}
