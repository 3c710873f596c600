// ABOUTME: CLI entry point for cdc-replicator
// ABOUTME: Parses commands and routes to run, check, and status handlers

use anyhow::Context;
use cdc_replicator::config::{ConfigOverrides, ReplicatorConfig};
use cdc_replicator::postgres::connection::{CONNECT_RETRIES, CONNECT_RETRY_DELAY};
use cdc_replicator::postgres::TlsPolicy;
use cdc_replicator::replica::{load_sync_status, stale_tables, sync_status_exists, PostgresReplicaWriter};
use cdc_replicator::source::{MySqlSource, SourceReader};
use cdc_replicator::utils::{retry_with_backoff, strip_password_from_url};
use cdc_replicator::{ChangeDetector, PollDriver};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cdc-replicator")]
#[command(
    about = "Snapshot-diff replication of MySQL tables into a PostgreSQL change log",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(flatten)]
    settings: SettingsArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct SettingsArgs {
    /// MySQL connection URL of the primary store
    #[arg(long = "source", env = "CDC_SOURCE_URL", global = true)]
    source_url: Option<String>,
    /// PostgreSQL connection URL of the replica store
    #[arg(long = "replica", env = "CDC_REPLICA_URL", global = true)]
    replica_url: Option<String>,
    /// Replica schema holding shadow tables and sync_status (default: cdc)
    #[arg(long = "replica-schema", env = "CDC_REPLICA_SCHEMA", global = true)]
    replica_schema: Option<String>,
    /// Tables to monitor (comma-separated)
    #[arg(long, env = "CDC_TABLES", value_delimiter = ',', global = true)]
    tables: Option<Vec<String>>,
    /// Seconds between polling cycles (default: 60)
    #[arg(long = "interval", env = "POLL_INTERVAL_SECONDS", global = true)]
    poll_interval_seconds: Option<u64>,
    /// Maximum rows per upsert statement (default: 1000)
    #[arg(long = "batch-size", env = "BATCH_SIZE", global = true)]
    batch_size: Option<usize>,
    /// Path to a TOML configuration file
    #[arg(long = "config", env = "CDC_CONFIG", global = true)]
    config_path: Option<PathBuf>,
}

impl From<SettingsArgs> for ConfigOverrides {
    fn from(args: SettingsArgs) -> Self {
        Self {
            source_url: args.source_url,
            replica_url: args.replica_url,
            replica_schema: args.replica_schema,
            tables: args.tables,
            poll_interval_seconds: args.poll_interval_seconds,
            batch_size: args.batch_size,
            config_path: args.config_path,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate continuously until Ctrl+C
    Run,
    /// Validate connectivity, source tables, and replica shadow tables
    Check,
    /// Show per-table sync status recorded in the replica
    Status {
        /// Exit non-zero if any table has not synced successfully within this many seconds.
        /// Sync status is only written when a cycle applies changes, so a table
        /// whose primary rows did not change within the window is also reported
        /// as stale.
        #[arg(long = "max-lag")]
        max_lag: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let tls = TlsPolicy {
        allow_self_signed: cli.allow_self_signed_certs,
    };
    let config = ReplicatorConfig::load(cli.settings.into()).context("Invalid configuration")?;

    match cli.command {
        Commands::Run => run(config, tls).await,
        Commands::Check => check(config, tls).await,
        Commands::Status { max_lag } => status(config, tls, max_lag).await,
    }
}

async fn run(config: ReplicatorConfig, tls: TlsPolicy) -> anyhow::Result<()> {
    tracing::info!("Source: {}", strip_password_from_url(&config.source_url));
    tracing::info!("Replica: {}", strip_password_from_url(&config.replica_url));
    tracing::info!("Tables: {}", config.table_names().join(", "));

    let source = retry_with_backoff(
        || MySqlSource::connect(&config.source_url),
        CONNECT_RETRIES,
        CONNECT_RETRY_DELAY,
    )
    .await
    .context("Failed to connect to source database")?;

    let mut writer = PostgresReplicaWriter::connect(
        &config.replica_url,
        tls,
        config.replica_schema.clone(),
        config.batch_size,
    )
    .await
    .context("Failed to connect to replica database")?;
    writer
        .ensure_sync_status_table()
        .await
        .context("Failed to bootstrap replica schema")?;

    let detector = ChangeDetector::new(
        SourceReader::new(source, config.retry),
        writer,
        config.tables.clone(),
    );
    let mut driver = PollDriver::new(detector, config.poll_interval);

    println!("========================================");
    println!("Starting snapshot-diff replication");
    println!("========================================");
    println!("  Tables: {}", config.table_names().join(", "));
    println!("  Poll interval: {}s", config.poll_interval.as_secs());
    println!("  Press Ctrl+C to stop");
    println!();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so the driver is not stopped.
                std::future::pending::<()>().await;
            }
        }
    });

    let cycles = driver.run(shutdown_rx).await;
    tracing::info!("Replication stopped after {} cycle(s)", cycles);

    let (reader, _writer) = driver.into_detector().into_parts();
    if let Err(e) = reader.into_source().disconnect().await {
        tracing::warn!("Failed to close source pool: {:#}", e);
    }

    Ok(())
}

async fn check(config: ReplicatorConfig, tls: TlsPolicy) -> anyhow::Result<()> {
    let result = cdc_replicator::preflight::run_preflight_checks(&config, tls).await;
    result.print();

    if !result.all_passed() {
        anyhow::bail!("Pre-flight checks failed");
    }
    Ok(())
}

async fn status(config: ReplicatorConfig, tls: TlsPolicy, max_lag: Option<u64>) -> anyhow::Result<()> {
    let client = cdc_replicator::postgres::connect(&config.replica_url, tls)
        .await
        .context("Failed to connect to replica database")?;

    let statuses = if sync_status_exists(&client, &config.replica_schema).await? {
        load_sync_status(&client, &config.replica_schema).await?
    } else {
        Vec::new()
    };

    let now = chrono::Utc::now();
    println!(
        "{:<24} {:<26} {:>10} {:>8} {:<8} {}",
        "TABLE", "LAST SUCCESS", "LAG", "CHANGES", "STATUS", "CHECKSUM"
    );
    for table in config.table_names() {
        match statuses.iter().find(|s| s.table_name == table) {
            Some(s) => {
                let last_success = s
                    .last_success_sync_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let lag = s
                    .lag(now)
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<26} {:>10} {:>8} {:<8} {}",
                    table,
                    last_success,
                    lag,
                    s.row_count,
                    s.status,
                    s.last_checksum.chars().take(12).collect::<String>()
                );
            }
            None => println!(
                "{:<24} {:<26} {:>10} {:>8} {:<8} {}",
                table, "never", "-", "-", "-", "-"
            ),
        }
    }

    if let Some(secs) = max_lag {
        let stale = stale_tables(
            &statuses,
            &config.table_names(),
            now,
            Duration::from_secs(secs),
        );
        if !stale.is_empty() {
            anyhow::bail!(
                "{} table(s) not synced within {}s: {}",
                stale.len(),
                secs,
                stale.join(", ")
            );
        }
        println!();
        println!("All tables synced within {}s", secs);
    }

    Ok(())
}
