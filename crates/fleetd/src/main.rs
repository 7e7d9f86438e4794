//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles the control plane:
//! - Configuration store (redb)
//! - In-memory cloud engine over the configured static hosts
//! - Control plane (layouts, resource pool, update queue, trackers)
//! - Planning loop (Diff → queue → plan → scale)
//! - Host supervision loop (checkin timeouts, cloud-provider health)
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetgrid/fleetd.toml --data-dir /var/lib/fleetgrid
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetgrid_scheduler::{ControlPlane, Scheduler};
use fleetgrid_state::{ConfigStore, InstanceResources, LocalEngine};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Run {
        /// Path to the daemon settings file.
        #[arg(long, default_value = "/etc/fleetgrid/fleetd.toml")]
        config: PathBuf,

        /// Data directory for the configuration store.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            run(config, data_dir).await
        }
    }
}

async fn run(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    let settings = DaemonConfig::from_file(&config_path)?;
    info!(path = ?config_path, hosts = settings.hosts.len(), apps = settings.apps.len(), "settings loaded");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = ConfigStore::open(&db_path)?;
    info!(path = ?db_path, "configuration store opened");

    let mut engine = LocalEngine::new();
    for host in &settings.hosts {
        engine = engine
            .with_instance_type(
                &host.instance_type,
                InstanceResources::with_totals(host.cpu, host.memory, host.network),
            )
            .with_host(&host.id, &host.ip, &host.instance_type);
    }
    info!(hosts = settings.hosts.len(), "cloud engine initialized");

    let plane = ControlPlane::new(store, Arc::new(engine))
        .with_policy(settings.planner)
        .with_checkin_timeout(settings.scheduler.host_checkin_timeout())
        .with_spawn_timeout(settings.scheduler.spawn_timeout())
        .with_max_crash_details(settings.tracker.max_crash_details);

    for app in &settings.apps {
        plane.configure_app(app)?;
    }
    for forecast in &settings.forecasts {
        if let Err(e) = plane.forecast_needs(
            &forecast.app,
            &forecast.version,
            forecast.day,
            forecast.minute,
            forecast.needs(),
        ) {
            warn!(app = %forecast.app, version = %forecast.version, error = %e, "failed to apply needs forecast");
        }
    }
    for host in &settings.hosts {
        if let Err(e) = plane.register_host(&host.id) {
            warn!(host = %host.id, error = %e, "failed to register static host");
        }
    }

    let scheduler = Scheduler::new(Arc::new(plane));
    info!("scheduler initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let planning_shutdown = shutdown_rx.clone();
    let supervision_shutdown = shutdown_rx;

    // ── Start background tasks ─────────────────────────────────

    let planning_handle = {
        let scheduler = scheduler.clone();
        let interval = settings.scheduler.plan_interval();
        tokio::spawn(async move {
            scheduler.run_planning(interval, planning_shutdown).await;
        })
    };

    let supervision_handle = {
        let scheduler = scheduler.clone();
        let interval = settings.scheduler.host_check_interval();
        tokio::spawn(async move {
            scheduler.run_supervision(interval, supervision_shutdown).await;
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    let _ = planning_handle.await;
    let _ = supervision_handle.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}
