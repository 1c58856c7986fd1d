use clap::{Parser, ValueEnum};
use fundgate_adapters::HttpLedgerClient;
use fundgate_core::{
    bootstrap_store, StorageConfig, SyncConfig, SyncCoordinator, SyncOutcome, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(
    name = "fundgated",
    version,
    about = "Fundgate reconciliation daemon"
)]
struct Cli {
    /// Base URL of the authoritative ledger API
    #[arg(long, env = "FUNDGATE_LEDGER_URL")]
    ledger_url: String,
    /// Governance store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "FUNDGATE_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for the governance store.
    #[arg(long, env = "FUNDGATE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "FUNDGATE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Seconds between reconciliation passes (minimum 5).
    #[arg(long, default_value_t = 60, env = "FUNDGATE_SYNC_INTERVAL_SECS")]
    sync_interval_secs: u64,
    /// Timeout for a single authoritative lookup, in seconds.
    #[arg(long, default_value_t = 10, env = "FUNDGATE_LOOKUP_TIMEOUT_SECS")]
    lookup_timeout_secs: u64,
    /// Lifetime of a cached authoritative snapshot, in seconds (capped at the sync interval).
    #[arg(long, default_value_t = 30, env = "FUNDGATE_SNAPSHOT_TTL_SECS")]
    snapshot_ttl_secs: u64,
    /// Run one pass and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval_secs: self.sync_interval_secs,
            lookup_timeout_secs: self.lookup_timeout_secs,
            snapshot_ttl_secs: self.snapshot_ttl_secs,
        }
    }
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "fundgate_daemon=info,fundgate_core=info,fundgate_adapters=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let sync_config = cli.sync_config();
    info!(backend = storage.label(), ledger = %cli.ledger_url, "Starting fundgated");

    let store = bootstrap_store(storage).await?;
    // the coordinator's per-lookup timeout must fire before the client's
    let ledger = HttpLedgerClient::new(
        &cli.ledger_url,
        sync_config.lookup_timeout() + Duration::from_secs(1),
    )?;
    let (coordinator, trigger_rx) = SyncCoordinator::new(
        store,
        Arc::new(ledger),
        Arc::new(SystemClock),
        sync_config,
    );

    if cli.once {
        match coordinator.run_once().await? {
            SyncOutcome::Completed(report) => info!(
                updated = report.updated,
                unchanged = report.unchanged,
                failed = report.failed.len(),
                cache_hits = report.cache_hits,
                "Single reconciliation pass finished"
            ),
            SyncOutcome::Skipped => warn!("Reconciliation pass skipped"),
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = tokio::spawn(coordinator.clone().start(trigger_rx, shutdown_rx));
    coordinator.trigger();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;
    sync_task.await?;

    Ok(())
}
