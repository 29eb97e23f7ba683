//! Granule ingester service.
//!
//! - `discover` enumerates source files and submits one message per file
//! - `worker` consumes the queue and loads catalog records, with an HTTP status API
//! - `dead-letters` prints messages that will not be retried
//! - `migrate` creates the catalog schema and collections

mod config;
mod pipeline;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::IngesterConfig;
use ingestion::DiscoveryRunner;
use server::{BatchTracker, ServerState};
use storage::WorkQueue;

#[derive(Parser, Debug)]
#[command(name = "ingester")]
#[command(about = "Discovers granules and loads them into the item catalog")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "INGESTER_CONFIG", default_value = "/etc/ingester/config.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every discovered file to the work queue
    Discover,

    /// Process queue batches until interrupted
    Worker {
        /// Process a single batch and exit
        #[arg(long)]
        once: bool,

        /// Port for status HTTP server (overrides config)
        #[arg(long, env = "STATUS_PORT")]
        status_port: Option<u16>,

        /// Disable status HTTP server
        #[arg(long)]
        no_status_server: bool,
    },

    /// Print dead-lettered messages as JSON
    DeadLetters {
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Create the catalog schema and register collections
    Migrate {
        /// Extra collections to register
        #[arg(long = "collection")]
        collections: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = IngesterConfig::load(&args.config)?;
    info!(config = %args.config.display(), "Loaded configuration");

    match args.command {
        Command::Discover => discover(&config).await,
        Command::Worker {
            once,
            status_port,
            no_status_server,
        } => {
            let port = status_port.unwrap_or(config.server.port);
            worker(&config, once, (!no_status_server && !once).then_some(port)).await
        }
        Command::DeadLetters { limit } => dead_letters(&config, limit).await,
        Command::Migrate { collections } => pipeline::migrate(&config, &collections).await,
    }
}

async fn discover(config: &IngesterConfig) -> Result<()> {
    let discovery = config
        .discovery
        .as_ref()
        .context("No discovery section in configuration")?;
    let request = discovery.request()?;
    let discoverer = pipeline::build_discoverer(config)?;
    let queue = pipeline::connect_queue(config).await?;

    info!(collection = %request.collection, "Starting discovery");
    let runner = DiscoveryRunner::new(queue, discovery.template.clone());
    let report = runner.run(discoverer.as_ref(), &request).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn worker(config: &IngesterConfig, once: bool, status_port: Option<u16>) -> Result<()> {
    let (worker, queue) = pipeline::build_worker(config).await?;

    if once {
        let summary = worker.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    info!("Prometheus metrics exporter initialized");

    let tracker = Arc::new(BatchTracker::new(config.server.recent_batches));

    if let Some(port) = status_port {
        let state = Arc::new(ServerState {
            queue: queue.clone(),
            tracker: tracker.clone(),
            metrics: Some(prometheus_handle),
            started_at: Utc::now(),
        });
        tokio::spawn(async move {
            if let Err(e) = server::run_server(state, port).await {
                tracing::error!(error = %e, "Status server failed");
            }
        });
    }

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx_clone.send(()).ok();
    });

    worker
        .run(shutdown_tx.subscribe(), |summary| tracker.record(summary))
        .await;

    let depth = queue.depth().await?;
    info!(
        visible = depth.visible,
        in_flight = depth.in_flight,
        dead_lettered = depth.dead_lettered,
        "Worker stopped"
    );
    Ok(())
}

async fn dead_letters(config: &IngesterConfig, limit: usize) -> Result<()> {
    let queue = pipeline::connect_queue(config).await?;
    let letters: Vec<_> = queue.dead_letters().await?.into_iter().take(limit).collect();
    println!("{}", serde_json::to_string_pretty(&letters)?);
    Ok(())
}
