//! immufluent server
//!
//! ## Environment Variables
//!
//! Every flag has an `IF_*` fallback:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | IF_ADDRESS | 0.0.0.0 | HTTP listen address |
//! | IF_PORT | 8090 | HTTP listen port |
//! | IF_IMMUDB_HOSTNAME | 127.0.0.1 | Ledger server host |
//! | IF_IMMUDB_PORT | 3322 | Ledger server port |
//! | IF_IMMUDB_USERNAME | immudb | Ledger user |
//! | IF_IMMUDB_PASSWORD | immudb | Ledger password |
//! | IF_IMMUDB_PATTERN | log_%Y_%m | Target database pattern (UTC) |
//! | IF_STORE | localfs | memory or localfs |
//! | IF_DATA_DIR | ./ledger | Local ledger directory |
//! | IF_BATCH_SIZE | 10 | Records per transaction |
//! | IF_BATCH_DELAY_MS | 3000 | Idle flush delay |
//! | IF_ROTATION_INTERVAL_MS | 0 | Scheduled rotation, 0 = off |
//! | IF_LOG_LEVEL | info | Default log filter (RUST_LOG wins) |
//! | IF_LOG_FORMAT | text | text or json |
//! | IF_CONFIG | - | TOML file replacing all of the above |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use immufluent::observability::init_tracing;
use immufluent::server::{self, CliArgs, ServiceConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let config = ServiceConfig::from_args(&args)?;
    init_tracing(&config.log);

    info!(
        "Starting immufluent: store {}, pattern {}, batch {} records / {:?}",
        config.store.describe(),
        config.target.pattern,
        config.batch.max_records,
        config.batch.max_delay
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    if let Err(e) = server::run(config, shutdown).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
