//! Delivery Client
//!
//! Owns the session to the ledger store and the name of the active target
//! database. Only the accumulator's control loop holds a client, so none of
//! this state needs a lock.

use super::config::RetryPolicy;
use super::target::TargetNamer;
use super::write_set::build_write_set;
use super::{BatchSink, DeliveryError, RotationOutcome, SinkFuture};
use crate::clock::Clock;
use crate::record::Record;
use crate::store::{Credentials, LedgerError, LedgerStore, SessionId, TxId, WriteOp};
use tracing::{debug, error, info, warn};

pub struct DeliveryClient<L: LedgerStore, C: Clock> {
    store: L,
    credentials: Credentials,
    system_database: String,
    namer: TargetNamer,
    clock: C,
    retry: RetryPolicy,
    /// Store address, for logs only.
    address: String,
    target: String,
    session: Option<SessionId>,
}

impl<L: LedgerStore, C: Clock> DeliveryClient<L, C> {
    /// Create a disconnected client whose target is derived from `clock`.
    pub fn new(
        store: L,
        credentials: Credentials,
        namer: TargetNamer,
        clock: C,
        retry: RetryPolicy,
    ) -> Self {
        let target = namer.name_at(clock.now());
        DeliveryClient {
            store,
            credentials,
            system_database: crate::store::SYSTEM_DATABASE.to_string(),
            namer,
            clock,
            retry,
            address: "local".to_string(),
            target,
            session: None,
        }
    }

    pub fn with_system_database(mut self, name: impl Into<String>) -> Self {
        self.system_database = name.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Make sure the target database exists, then open the working session
    /// on it. Any open session is closed first.
    pub async fn connect(&mut self) -> Result<(), DeliveryError> {
        self.close_session().await;
        info!("Connecting to ledger at {} (target {})", self.address, self.target);

        let admin = self
            .store
            .open_session(&self.credentials, &self.system_database)
            .await
            .map_err(DeliveryError::Connect)?;

        let ensured = self.ensure_target(admin).await;
        if let Err(e) = self.store.close_session(admin).await {
            warn!("Failed to close admin session {}: {}", admin, e);
        }
        ensured.map_err(DeliveryError::Connect)?;

        let session = self
            .store
            .open_session(&self.credentials, &self.target)
            .await
            .map_err(DeliveryError::Connect)?;
        self.session = Some(session);
        info!("Connected to {}", self.target);
        Ok(())
    }

    async fn ensure_target(&self, admin: SessionId) -> Result<(), LedgerError> {
        let databases = self.store.list_databases(admin).await?;
        let found = databases
            .iter()
            .any(|db| db.loaded && db.name == self.target);
        if !found {
            debug!("Database {} not found", self.target);
            match self.store.create_database(admin, &self.target).await {
                Ok(()) => info!("Created database {}", self.target),
                // Another writer created it after our listing.
                Err(LedgerError::DatabaseExists(_)) => {
                    debug!("Database {} created concurrently", self.target)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.store.close_session(session).await {
                debug!("Closing {} failed: {}", session, e);
            }
        }
    }

    async fn exec_once(&self, ops: &[WriteOp]) -> Result<TxId, LedgerError> {
        match self.session {
            Some(session) => self.store.exec_all(session, ops).await,
            None => Err(LedgerError::Unavailable("not connected".to_string())),
        }
    }

    /// Commit the batch as one transaction, retrying with reconnects.
    pub async fn send<T: Record>(&mut self, batch: &[T]) -> Result<TxId, DeliveryError> {
        let ops = build_write_set(batch)?;

        for attempt in 0..self.retry.attempts {
            match self.exec_once(&ops).await {
                Ok(tx) => {
                    self.log_sent(batch.len(), tx);
                    return Ok(tx);
                }
                Err(e) => {
                    warn!(
                        "Error sending data to {} (attempt {}): {}",
                        self.target,
                        attempt + 1,
                        e
                    );
                }
            }

            self.close_session().await;
            tokio::time::sleep(self.retry.backoff(attempt)).await;
            if let Err(e) = self.connect().await {
                warn!("Reconnect failed: {}", e);
            }
        }

        match self.exec_once(&ops).await {
            Ok(tx) => {
                self.log_sent(batch.len(), tx);
                Ok(tx)
            }
            Err(source) => Err(DeliveryError::Exhausted {
                attempts: self.retry.max_calls(),
                source,
            }),
        }
    }

    fn log_sent(&self, records: usize, tx: TxId) {
        info!(
            "Sent data, consumed {} messages, tx {} ({})",
            records, tx, self.target
        );
    }

    /// Switch to the target the clock currently maps to, if it changed.
    ///
    /// On failure the new target stays active and the client is left
    /// disconnected; the next send or rotate reconnects. A rotate that finds
    /// the client disconnected reports the reconnect error.
    pub async fn rotate(&mut self) -> Result<RotationOutcome, DeliveryError> {
        let next = self.namer.name_at(self.clock.now());
        if next == self.target {
            if self.session.is_none() {
                // A previous rotation or reconnect left us without a session.
                warn!("Not connected to {}, reconnecting", self.target);
                if let Err(e) = self.connect().await {
                    error!("Reconnect to {} failed: {}", self.target, e);
                    return Err(e);
                }
            }
            debug!("Rotation not necessary");
            return Ok(RotationOutcome::NotRotated);
        }

        self.close_session().await;
        let from = std::mem::replace(&mut self.target, next);
        match self.connect().await {
            Ok(()) => {
                info!("Rotated target {} -> {}", from, self.target);
                Ok(RotationOutcome::Rotated {
                    from,
                    to: self.target.clone(),
                })
            }
            Err(e) => {
                error!("Rotation to {} failed: {}", self.target, e);
                Err(e)
            }
        }
    }

    pub async fn close(&mut self) {
        self.close_session().await;
    }
}

impl<L: LedgerStore, C: Clock, T: Record> BatchSink<T> for DeliveryClient<L, C> {
    fn send(&mut self, batch: Vec<T>) -> SinkFuture<'_, TxId> {
        Box::pin(async move { DeliveryClient::send(self, &batch).await })
    }

    fn rotate(&mut self) -> SinkFuture<'_, RotationOutcome> {
        Box::pin(DeliveryClient::rotate(self))
    }

    fn close(&mut self) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            DeliveryClient::close(self).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::io::SimulatedRng;
    use crate::record::LogRecord;
    use crate::store::{
        DatabaseInfo, InMemoryLedgerStore, LedgerFuture, SimulatedLedgerStore, SimulatedStoreConfig,
    };
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    type SimStore = SimulatedLedgerStore<InMemoryLedgerStore, SimulatedRng>;

    fn setup() -> (DeliveryClient<SimStore, SimulatedClock>, SimStore, SimulatedClock) {
        let clock = SimulatedClock::at(Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 0).unwrap());
        let store = SimulatedLedgerStore::new(
            InMemoryLedgerStore::new(),
            SimulatedRng::new(1),
            SimulatedStoreConfig::no_faults(),
        );
        let client = DeliveryClient::new(
            store.clone(),
            Credentials::new("immudb", "immudb"),
            TargetNamer::new("log_%Y_%m").unwrap(),
            clock.clone(),
            RetryPolicy::default(),
        );
        (client, store, clock)
    }

    fn records(n: usize) -> Vec<LogRecord> {
        (0..n)
            .map(|i| LogRecord::new(1000.0 + i as f64, format!("line {}", i)).with_pod("ns", "p", "h"))
            .collect()
    }

    #[tokio::test]
    async fn test_connect_creates_target() {
        let (mut client, store, _) = setup();
        assert_eq!(client.target(), "log_2024_03");

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert!(store.inner().database_names().contains(&"log_2024_03".to_string()));
        // Admin session closed, working session open.
        assert_eq!(store.inner().open_session_count(), 1);

        // Reconnecting does not recreate the database.
        client.connect().await.unwrap();
        assert_eq!(store.inner().open_session_count(), 1);
    }

    #[tokio::test]
    async fn test_send_commits_write_set() {
        let (mut client, store, _) = setup();
        client.connect().await.unwrap();

        let tx = client.send(&records(3)).await.unwrap();
        assert_eq!(tx, TxId(1));

        let txs = store.inner().transactions("log_2024_03");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].ops.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_fifth_attempt() {
        let (mut client, store, _) = setup();
        client.connect().await.unwrap();

        store.fail_next_execs(4);
        let start = tokio::time::Instant::now();
        let tx = client.send(&records(2)).await.unwrap();

        assert_eq!(tx, TxId(1));
        assert_eq!(store.stats().exec_attempts, 5);
        // 0 + 100 + 200 + 300 ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(600));
        assert_eq!(store.inner().transactions("log_2024_03").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_six_calls() {
        let (mut client, store, _) = setup();
        client.connect().await.unwrap();

        store.fail_next_execs(6);
        let err = client.send(&records(2)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Exhausted { attempts: 6, .. }));
        assert_eq!(store.stats().exec_attempts, 6);
        assert!(store.inner().transactions("log_2024_03").is_empty());

        // The next batch goes through normally.
        assert_eq!(client.send(&records(1)).await.unwrap(), TxId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_reconnects() {
        let (mut client, store, _) = setup();
        let tx = client.send(&records(1)).await.unwrap();
        assert_eq!(tx, TxId(1));
        assert!(client.is_connected());
        // First attempt had no session and never reached the store.
        assert_eq!(store.stats().exec_attempts, 1);
    }

    #[tokio::test]
    async fn test_rotation_is_idempotent() {
        let (mut client, store, clock) = setup();
        client.connect().await.unwrap();

        assert_eq!(client.rotate().await.unwrap(), RotationOutcome::NotRotated);

        clock.advance(Duration::from_secs(120));
        assert_eq!(
            client.rotate().await.unwrap(),
            RotationOutcome::Rotated {
                from: "log_2024_03".to_string(),
                to: "log_2024_04".to_string(),
            }
        );
        assert_eq!(client.rotate().await.unwrap(), RotationOutcome::NotRotated);

        client.send(&records(1)).await.unwrap();
        assert_eq!(store.inner().transactions("log_2024_04").len(), 1);
        assert!(store.inner().transactions("log_2024_03").is_empty());
        assert_eq!(store.inner().open_session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rotation_leaves_client_disconnected() {
        let (mut client, store, clock) = setup();
        client.connect().await.unwrap();

        clock.advance(Duration::from_secs(120));
        store.fail_next_session_opens(1);
        assert!(matches!(
            client.rotate().await,
            Err(DeliveryError::Connect(_))
        ));
        assert!(!client.is_connected());
        assert_eq!(client.target(), "log_2024_04");

        // The next send reconnects against the new target.
        assert_eq!(client.send(&records(1)).await.unwrap(), TxId(1));
        assert_eq!(store.inner().transactions("log_2024_04").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_after_failed_rotation_reconnects() {
        let (mut client, store, clock) = setup();
        client.connect().await.unwrap();

        clock.advance(Duration::from_secs(120));
        store.fail_next_session_opens(1);
        assert!(client.rotate().await.is_err());
        assert!(!client.is_connected());

        // Same target, but the session is gone: a retry must reconnect or fail loudly.
        store.fail_next_session_opens(1);
        assert!(matches!(
            client.rotate().await,
            Err(DeliveryError::Connect(_))
        ));
        assert!(!client.is_connected());

        assert_eq!(client.rotate().await.unwrap(), RotationOutcome::NotRotated);
        assert!(client.is_connected());
        assert_eq!(client.target(), "log_2024_04");
    }

    /// Store whose listing only ever shows the system database, as when a
    /// concurrent writer creates the target right after we list.
    struct StaleListing(InMemoryLedgerStore);

    impl LedgerStore for StaleListing {
        fn open_session<'a>(
            &'a self,
            credentials: &'a Credentials,
            database: &'a str,
        ) -> LedgerFuture<'a, SessionId> {
            self.0.open_session(credentials, database)
        }

        fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId> {
            self.0.exec_all(session, ops)
        }

        fn list_databases(&self, _session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>> {
            Box::pin(async {
                Ok(vec![DatabaseInfo {
                    name: crate::store::SYSTEM_DATABASE.to_string(),
                    loaded: true,
                }])
            })
        }

        fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()> {
            self.0.create_database(session, name)
        }

        fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()> {
            self.0.close_session(session)
        }
    }

    #[tokio::test]
    async fn test_connect_tolerates_concurrently_created_target() {
        let inner = InMemoryLedgerStore::new();
        let clock = SimulatedClock::at(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap());
        let namer = TargetNamer::new("log_%Y_%m").unwrap();

        let mut other = DeliveryClient::new(
            inner.clone(),
            Credentials::new("immudb", "immudb"),
            namer.clone(),
            clock.clone(),
            RetryPolicy::default(),
        );
        other.connect().await.unwrap();

        let mut client = DeliveryClient::new(
            StaleListing(inner.clone()),
            Credentials::new("immudb", "immudb"),
            namer,
            clock,
            RetryPolicy::default(),
        );
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.send(&records(1)).await.unwrap(), TxId(1));
        assert_eq!(inner.transactions("log_2024_03").len(), 1);
    }
}
