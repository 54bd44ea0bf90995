use anyhow::Result;
use clap::Parser;
use dpm_control::{ControlManager, ControlOptions};
use dpm_power::{EventGroup, NullWatchdog, RtcTimerService, SleepGate, SoftWatchdog, Watchdog};
use dpm_retention::{open_store, RetentionStore};
use dpm_secure::SessionCodec;
use dpm_session::{ManagerOptions, SessionDeps, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[macro_use]
mod logging;
mod app;
mod config;

use app::ManagerApp;
use config::DpmServiceConfig;

#[derive(Parser, Debug)]
#[command(name = "dpm-manager")]
#[command(version)]
#[command(about = "Deep power-down session manager")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level of the DPM crates [default: $DPM_LOG_LEVEL or info]
    #[arg(long)]
    log_level: Option<String>,

    /// Enable DPM regardless of the configuration file
    #[arg(long)]
    dpm: bool,

    /// Retention backend (memory or file)
    #[arg(long)]
    retention_mode: Option<String>,

    /// Retention image file
    #[arg(long)]
    retention_path: Option<PathBuf>,

    /// Retention pool size in bytes
    #[arg(long)]
    retention_capacity: Option<usize>,

    /// Expect retained state from a previous power-down
    #[arg(long)]
    wake: bool,

    /// Power down after this long (e.g. "30s")
    #[arg(long)]
    run_for: Option<humantime::Duration>,

    /// Software watchdog period (e.g. "10s")
    #[arg(long)]
    watchdog: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("DPM_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    logging::init(&log_level)?;

    info!("Starting DPM manager v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DpmServiceConfig::load_from_file(&args.config)?;
    if args.dpm {
        config.enabled = true;
    }
    if let Some(mode) = &args.retention_mode {
        config.retention.mode = mode.clone();
    }
    if let Some(path) = &args.retention_path {
        config.retention.path = path.clone();
    }
    if let Some(capacity) = args.retention_capacity {
        config.retention.capacity = capacity;
    }

    let store = open_store(config.retention.to_mode()?)?;
    info!(
        "Retention: {} backend, {} of {} bytes in use",
        config.retention.mode,
        store.used(),
        store.capacity()
    );

    let soft_watchdog = args
        .watchdog
        .map(|period| Arc::new(SoftWatchdog::new(period.into())));
    let watchdog: Arc<dyn Watchdog> = match &soft_watchdog {
        Some(soft) => soft.clone(),
        None => Arc::new(NullWatchdog),
    };

    let sessions = SessionManager::new(
        SessionDeps {
            gate: Arc::new(SleepGate::new(config.enabled)),
            timers: Arc::new(RtcTimerService::new()),
            events: Arc::new(EventGroup::new()),
            codec: SessionCodec::new(store.clone(), config.enabled),
            watchdog: watchdog.clone(),
        },
        ManagerOptions::default(),
    );

    let options = ControlOptions {
        user_params_size: config.user_params_size,
        expect_wake: args.wake,
    };
    let control = ControlManager::new(store.clone(), sessions.clone(), options)
        .with_init_handler(ManagerApp::new(config.clone()));
    let path = control.run().await?;
    info!("DPM manager running ({:?}, dpm {})", path, if config.enabled { "on" } else { "off" });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut event_manager = control.event_manager();
    if soft_watchdog.is_some() {
        event_manager = event_manager.with_watchdog(watchdog.clone());
    }
    let event_task = tokio::spawn(event_manager.run(shutdown_rx));
    let gate_task = tokio::spawn(watch_sleep_gate(sessions.gate().clone(), shutdown_tx.subscribe()));
    let watchdog_task = soft_watchdog.map(|soft| tokio::spawn(watch_watchdog(soft, shutdown_tx.subscribe())));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;
    let run_for = async {
        match args.run_for {
            Some(limit) => tokio::time::sleep(limit.into()).await,
            None => std::future::pending::<()>().await,
        }
    };

    // A power-down keeps the sessions as they are so their snapshots stay retained;
    // a signal stops them.
    let power_down = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal, stopping sessions");
            false
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal, stopping sessions");
            false
        }
        _ = run_for => {
            info!("Run time elapsed, powering down");
            true
        }
    };

    if power_down && config.enabled {
        if let Err(e) = control.persist() {
            error!("Failed to persist DPM configuration: {}", e);
        }
        if !sessions.gate().sleep_permitted() {
            warn!("Powering down while modules still block sleep");
        }
    } else {
        sessions.stop_all().await;
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = event_task.await {
        warn!("Event manager task failed: {}", e);
    }
    let _ = gate_task.await;
    if let Some(task) = watchdog_task {
        let _ = task.await;
    }

    match serde_json::to_string_pretty(&sessions.session_report()) {
        Ok(report) => info!("Session report:\n{}", report),
        Err(e) => warn!("Failed to render session report: {}", e),
    }
    info!(
        "DPM manager shutdown complete, {} bytes retained",
        store.used()
    );
    Ok(())
}

/// Log transitions of the sleep gate's verdict
async fn watch_sleep_gate(gate: Arc<SleepGate>, mut shutdown: watch::Receiver<bool>) {
    let mut permitted = gate.subscribe();
    loop {
        tokio::select! {
            changed = permitted.changed() => {
                if changed.is_err() {
                    break;
                }
                if *permitted.borrow_and_update() {
                    component_info!("power", "Deep sleep permitted");
                } else {
                    component_debug!("power", "Deep sleep blocked");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Report expiries of the software watchdog, once per lapse
async fn watch_watchdog(watchdog: Arc<SoftWatchdog>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut lapsed = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = watchdog.expired();
                if expired && !lapsed {
                    component_warn!("watchdog", "Watchdog expired after {} kicks", watchdog.kicks());
                }
                lapsed = expired;
            }
            _ = shutdown.changed() => break,
        }
    }
}
