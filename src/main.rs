//! Schoolbus Tracker agent
//!
//! Runs on the bus's device: samples position, delivers it to the tracking
//! backend, queues samples while offline and syncs them on reconnect.
//!
//! # Usage
//!
//! ```bash
//! # Simulated route (default source)
//! schoolbus-tracker --bus-id BUS-001 --driver-id DRV-7
//!
//! # Fixes from an external GPS reader, one JSON object per line
//! gps-reader --json | schoolbus-tracker --stdin --bus-id BUS-001 --driver-id DRV-7
//!
//! # Replay a recorded route
//! schoolbus-tracker --replay route.jsonl --bus-id BUS-001 --driver-id DRV-7
//!
//! # Inspect or flush the persisted backlog
//! schoolbus-tracker queue-status
//! schoolbus-tracker flush
//! ```
//!
//! # Environment Variables
//!
//! - `TRACKER_CONFIG`: path to the TOML config (default: `./tracker.toml`)
//! - `TRACKER_BUS_ID`, `TRACKER_DRIVER_ID`, `TRACKER_ENDPOINT`: CLI fallbacks
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use schoolbus_tracker::api::{create_app, ApiState};
use schoolbus_tracker::config::{defaults, QueueConfig, TrackerConfig};
use schoolbus_tracker::connectivity::{run_link_probe, ConnectivityMonitor, ProbeTarget};
use schoolbus_tracker::delivery::{DeliveryClient, HttpDeliveryClient};
use schoolbus_tracker::queue::{OfflineQueue, SledStore};
use schoolbus_tracker::source::{self, ReplaySource, SharedSource, SimulatedSource, StdinSource};
use schoolbus_tracker::sync::SyncCoordinator;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "schoolbus-tracker")]
#[command(about = "Offline-tolerant school bus location agent")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (overrides the TRACKER_CONFIG search)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bus identifier attached to every sample
    #[arg(long, env = "TRACKER_BUS_ID")]
    bus_id: Option<String>,

    /// Driver identifier attached to every sample
    #[arg(long, env = "TRACKER_DRIVER_ID")]
    driver_id: Option<String>,

    /// Tracking backend base URL
    #[arg(long, env = "TRACKER_ENDPOINT", value_name = "URL")]
    endpoint: Option<String>,

    /// Read JSON fixes from stdin, one per line
    #[arg(long, conflicts_with_all = ["replay", "simulate"])]
    stdin: bool,

    /// Replay fixes from a JSON-lines file
    #[arg(long, value_name = "FILE", conflicts_with = "simulate")]
    replay: Option<PathBuf>,

    /// Drive a simulated route (the default when no source is given)
    #[arg(long)]
    simulate: bool,

    /// Control API bind address (default: 127.0.0.1:8787)
    #[arg(short, long)]
    addr: Option<String>,

    /// Do not probe the endpoint; online state only changes through the API
    #[arg(long)]
    no_probe: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Print the persisted offline queue status as JSON and exit
    QueueStatus,
    /// Run one drain pass against the endpoint and exit
    Flush,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    LinkProbe,
    StatusLog,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::LinkProbe => write!(f, "LinkProbe"),
            TaskName::StatusLog => write!(f, "StatusLog"),
        }
    }
}

// ============================================================================
// Setup
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Load config and apply CLI overrides.
fn load_config(args: &CliArgs) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => TrackerConfig::load(),
    };

    if let Some(bus_id) = &args.bus_id {
        config.device.bus_id.clone_from(bus_id);
    }
    if let Some(driver_id) = &args.driver_id {
        config.device.driver_id.clone_from(driver_id);
    }
    if let Some(endpoint) = &args.endpoint {
        config.endpoint.base_url.clone_from(endpoint);
    }
    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    if args.no_probe {
        config.connectivity.probe_enabled = false;
    }

    config.validate()?;
    Ok(config)
}

fn open_queue(config: &QueueConfig) -> Result<OfflineQueue> {
    if !config.persistent {
        warn!("Persistent queue disabled — backlog is lost on restart");
        return Ok(OfflineQueue::in_memory(config.capacity));
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    let db_path = config.db_path();
    let store = SledStore::open(&db_path)
        .with_context(|| format!("Failed to open queue database {}", db_path.display()))?;
    Ok(OfflineQueue::open(store, config.capacity)?)
}

fn build_source(args: &CliArgs, config: &TrackerConfig) -> Result<SharedSource> {
    let interval = Duration::from_millis(config.sampling.replay_interval_ms);

    if args.stdin {
        info!("📥 Input: stdin (JSON fixes)");
        return Ok(source::shared(StdinSource::new()));
    }
    if let Some(path) = &args.replay {
        info!(path = %path.display(), "📥 Input: replay file");
        return Ok(source::shared(ReplaySource::from_file(path, interval)?));
    }

    info!(
        lat = config.simulation.latitude,
        lon = config.simulation.longitude,
        "📥 Input: simulated route"
    );
    Ok(source::shared(SimulatedSource::new(
        config.simulation.latitude,
        config.simulation.longitude,
        interval,
    )))
}

fn build_coordinator(
    config: &TrackerConfig,
    source: SharedSource,
    queue: Arc<OfflineQueue>,
    monitor: Arc<ConnectivityMonitor>,
) -> Result<SyncCoordinator> {
    let client = HttpDeliveryClient::new(&config.endpoint).context("Failed to build HTTP client")?;
    info!(endpoint = %client.base_url(), "Delivery endpoint");
    let client: Arc<dyn DeliveryClient> = Arc::new(client);
    Ok(SyncCoordinator::new(config, source, queue, monitor, client))
}

// ============================================================================
// Subcommands
// ============================================================================

fn run_queue_status(config: &TrackerConfig) -> Result<()> {
    let queue = open_queue(&config.queue)?;
    let status = queue.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_flush(config: &TrackerConfig) -> Result<()> {
    let queue = Arc::new(open_queue(&config.queue)?);
    let backlog = queue.size();
    let monitor = Arc::new(ConnectivityMonitor::default());
    // Never sampled: flush only drains
    let source = source::shared(ReplaySource::new(Vec::new(), Duration::ZERO));
    let coordinator = build_coordinator(config, source, queue.clone(), monitor)?;

    // The coordinator may already be draining the leftover backlog; this
    // pass runs after it, so the report covers whatever it left behind
    let report = coordinator.drain_when_idle().await;
    let status = queue.status();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "report": report,
            "deliveredTotal": backlog.saturating_sub(status.size),
            "queue": status,
        }))?
    );
    coordinator.shutdown().await;
    Ok(())
}

// ============================================================================
// Background Tasks
// ============================================================================

fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

fn spawn_link_probe(
    task_set: &mut JoinSet<Result<TaskName>>,
    config: &TrackerConfig,
    monitor: Arc<ConnectivityMonitor>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let target = ProbeTarget::from_url(&config.endpoint.base_url)?;
    let interval = Duration::from_secs(config.connectivity.probe_interval_secs);
    let timeout = Duration::from_millis(config.connectivity.probe_timeout_ms);

    task_set.spawn(async move {
        run_link_probe(monitor, target, interval, timeout, cancel_token).await;
        Ok(TaskName::LinkProbe)
    });
    Ok(())
}

fn spawn_status_log(
    task_set: &mut JoinSet<Result<TaskName>>,
    coordinator: Arc<SyncCoordinator>,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(defaults::STATUS_LOG_INTERVAL_SECS));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(TaskName::StatusLog),
                _ = ticker.tick() => {
                    let status = coordinator.status();
                    info!(
                        state = %status.state,
                        backlog = status.queue.size,
                        online = status.connectivity.online,
                        server_reachable = status.connectivity.server_reachable,
                        failures = status.consecutive_failures,
                        "📊 Status"
                    );
                }
            }
        }
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Agent
// ============================================================================

async fn run_agent(args: &CliArgs, config: TrackerConfig) -> Result<()> {
    let queue = Arc::new(open_queue(&config.queue)?);
    let monitor = Arc::new(ConnectivityMonitor::default());
    let source = build_source(args, &config)?;
    let coordinator = Arc::new(build_coordinator(&config, source, queue, monitor.clone())?);

    coordinator
        .start_tracking(&config.device.bus_id, &config.device.driver_id)
        .await
        .context("Failed to start tracking")?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind control API on {}", config.server.addr))?;
    info!(addr = %config.server.addr, "🌐 Control API listening");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    let app = create_app(ApiState::new(Arc::clone(&coordinator)));
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    if config.connectivity.probe_enabled {
        spawn_link_probe(&mut task_set, &config, monitor, cancel_token.clone())?;
    }
    spawn_status_log(&mut task_set, Arc::clone(&coordinator), cancel_token.clone());

    let outcome = run_supervisor(&mut task_set, cancel_token.clone()).await;

    cancel_token.cancel();
    coordinator.shutdown().await;
    while let Some(result) = task_set.join_next().await {
        if let Ok(Err(e)) = result {
            warn!(error = %e, "Task ended with error during shutdown");
        }
    }
    outcome
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;

    match args.command {
        Some(SubCommand::QueueStatus) => return run_queue_status(&config),
        Some(SubCommand::Flush) => return run_flush(&config).await,
        None => {}
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Schoolbus Tracker");
    info!(
        "  Bus: {} | Driver: {}",
        if config.device.bus_id.is_empty() { "unset" } else { &config.device.bus_id },
        if config.device.driver_id.is_empty() { "unset" } else { &config.device.driver_id },
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    run_agent(&args, config).await?;

    info!("✓ Schoolbus Tracker shutdown complete");
    Ok(())
}
