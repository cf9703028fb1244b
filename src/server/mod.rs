//! HTTP front end and service wiring.
//!
//! Routes:
//! - `POST /log`: JSON array of records from fluent-bit
//! - `POST /rotate`: re-evaluate the target database now
//! - `GET /ping`: liveness
//! - `GET /stats`: pipeline counters

pub mod config;
mod error;
pub mod handlers;

pub use config::{CliArgs, ConfigError, ServiceConfig, StoreConfig, StoreKind};
pub use error::ServerError;
pub use handlers::AppState;

use crate::clock::SystemClock;
use crate::delivery::{spawn_accumulator, DeliveryClient, RotationScheduler};
use crate::record::LogRecord;
use crate::store::{InMemoryLedgerStore, LedgerStore, LocalFsLedgerStore};
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/log", post(handlers::handle_log))
        .route("/rotate", post(handlers::handle_rotate))
        .route("/ping", get(handlers::handle_ping))
        .route("/stats", get(handlers::handle_stats))
        .with_state(state)
}

/// Open the configured ledger backend.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn LedgerStore>, ServerError> {
    let credentials = config.credentials();
    let store: Arc<dyn LedgerStore> = match config.kind {
        StoreKind::Memory => Arc::new(InMemoryLedgerStore::with_credentials(&credentials)),
        StoreKind::LocalFs => {
            Arc::new(LocalFsLedgerStore::open(&config.data_dir, credentials).await?)
        }
    };
    Ok(store)
}

/// Run the service until `shutdown` resolves.
///
/// Order on the way out: stop accepting HTTP requests, stop the rotation
/// scheduler, then flush the pending batch and close the ledger session.
pub async fn run(
    config: ServiceConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let store = open_store(&config.store).await?;
    let namer = config.target_namer()?;

    let mut client = DeliveryClient::new(
        store,
        config.store.credentials(),
        namer,
        SystemClock,
        config.retry.clone(),
    )
    .with_system_database(config.store.system_database.clone())
    .with_address(config.store.describe());
    client.connect().await.map_err(ServerError::Connect)?;

    let (pipeline, accumulator_task) =
        spawn_accumulator::<LogRecord, _>(config.batch.clone(), client);

    let cancel = CancellationToken::new();
    let scheduler_task =
        RotationScheduler::new(pipeline.clone(), config.rotation.interval, cancel.clone()).spawn();

    let app = router(AppState {
        pipeline: pipeline.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.listen.bind_address()).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped, flushing pipeline");
    cancel.cancel();
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    if let Some(stats) = pipeline.shutdown().await {
        info!(
            "Delivered {} records in {} batches ({} failed)",
            stats.records_delivered, stats.batches_delivered, stats.batches_failed
        );
    }
    let _ = accumulator_task.await;
    Ok(())
}
