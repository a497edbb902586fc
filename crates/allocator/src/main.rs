//! Allocator control plane entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use allocator::{AllocatorConfig, ClusterCoordinator, RerouteOptions};

/// Allocator - shard allocation control plane
#[derive(Parser, Debug)]
#[command(name = "allocator")]
#[command(about = "Shard allocation control plane")]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(short, long)]
    cluster: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Periodic reroute interval (seconds)
    #[arg(long)]
    reroute_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AllocatorConfig::from_file(path)?,
        None => AllocatorConfig::default(),
    };
    if let Some(cluster) = args.cluster {
        config.cluster.name = cluster;
    }
    if let Some(data_dir) = args.data_dir {
        config.cluster.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(interval) = args.reroute_interval {
        config.scheduler.reroute_interval_secs = interval;
    }

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
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
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting allocator control plane...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Data dir: {:?}", config.cluster.data_dir);
    info!("  Reroute interval: {}s", config.scheduler.reroute_interval_secs);

    let reroute_interval = config.scheduler.reroute_interval_secs;
    let save_interval = config.scheduler.save_interval_secs;
    let coordinator = Arc::new(ClusterCoordinator::new(config).await?);

    // Recovered primaries start their store fetches here
    let result = coordinator.reroute(&RerouteOptions::default(), "startup").await?;
    info!(
        "Cluster ready: {} indices, health {}",
        result.state.metadata.indices().count(),
        result.health.status
    );

    let _reroute_handle = coordinator.clone().start_periodic_reroute(reroute_interval);
    let _save_handle = coordinator.clone().start_periodic_save(save_interval);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, saving metadata");
    coordinator.save().await?;

    Ok(())
}
