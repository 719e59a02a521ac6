//! CorvusDB server binary.
//!
//! Builds the engine context (catalog, tuple store, transaction manager,
//! traffic cop) and serves the PostgreSQL wire protocol over TCP.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;

use corvus_core::catalog::Catalog;
use corvus_core::storage::TupleStore;
use corvus_core::tcop::TrafficCop;
use corvus_core::txn::TransactionManager;
use corvus_core::types::{CcConfig, CcStrategy};
use corvus_server::CorvusServer;

#[derive(Debug, Parser)]
#[command(name = "corvus-server", about = "CorvusDB: a PostgreSQL-wire relational database")]
struct Args {
    /// Listen address for client connections.
    #[arg(long, default_value = "127.0.0.1:5433")]
    listen: String,

    /// Concurrency-control strategy.
    #[arg(long, value_enum, default_value = "occ")]
    concurrency: Concurrency,

    /// OCC only: validate read sets at commit (serializable isolation
    /// instead of snapshot isolation).
    #[arg(long)]
    occ_serializable: bool,

    /// 2PL only: lock wait deadline in milliseconds.
    #[arg(long, default_value_t = 5000)]
    lock_timeout_ms: u64,

    /// Maximum concurrent client connections.
    #[arg(long, default_value_t = 64)]
    max_connections: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Concurrency {
    /// Optimistic (snapshot) concurrency control.
    Occ,
    /// Strict two-phase locking.
    #[value(name = "2pl")]
    TwoPhase,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = CcConfig {
        strategy: match args.concurrency {
            Concurrency::Occ => CcStrategy::Occ,
            Concurrency::TwoPhase => CcStrategy::TwoPhase,
        },
        occ_serializable: args.occ_serializable,
        lock_wait_timeout: Duration::from_millis(args.lock_timeout_ms),
    };

    let catalog = Arc::new(Catalog::new());
    let store = Arc::new(TupleStore::new());
    let tm = Arc::new(TransactionManager::new(&config, Arc::clone(&store)));
    let tcop = Arc::new(TrafficCop::new(catalog, store, tm));

    info!(
        strategy = ?config.strategy,
        occ_serializable = config.occ_serializable,
        "starting"
    );
    let server = CorvusServer::bind(&args.listen, tcop, args.max_connections)?;
    server.run()?;
    Ok(())
}
