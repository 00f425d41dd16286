//! # SIP Load Simulator
//!
//! Hosts the performance monitoring and overload-control engine of
//! `lib_sip_pmi` and drives it with simulated SIP traffic.
//!
//! ## Functionality:
//! - **Configuration**: compiled defaults, then an optional JSON file, then
//!   environment variables and CLI flags (`SIP_*`).
//! - **Engine wiring**: builds the `LoadManager`, the application registry and
//!   the `PerformanceMgr` on the Tokio runtime, and loads the simulated
//!   applications.
//! - **PMI**: every statistics window is logged as JSON by `LogPmiListener`.
//! - **Traffic**: INVITEs at a fixed rate, jittered answers and hang-ups; new
//!   calls are refused while the load manager asks for messages to be thrown.
//! - **Graceful Shutdown**: `tokio-graceful` on Ctrl+C / SIGTERM, or after
//!   `--run-seconds`; timers are stopped and applications unloaded on the way
//!   out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_graceful::Shutdown;
use tracing::{info, warn};

use lib_sip_pmi::core::{
    AppDescriptor, LoadManager, LoadManagerConfig, LoadedApplicationsContainer, PerformanceMgr, PeriodicScheduler,
};
use lib_sip_pmi::loggers::setup_logging;

mod sim_logic;
use sim_logic::config;
use sim_logic::listener::LogPmiListener;
use sim_logic::traffic::{SimApp, TrafficGenerator, TrafficSettings};

async fn shutdown_signal(run_for: Duration) {
    tokio::select! {
        _ = tokio_graceful::default_signal() => {
            info!("Termination signal received, initiating shutdown.");
        }
        _ = tokio::time::sleep(run_for) => {
            info!(seconds = run_for.as_secs(), "Run time elapsed, initiating shutdown.");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _log_guard =
        setup_logging(config.log_dir(), config.log_level(), "sip_load_sim").context("Failed to initialize logging")?;
    info!("{}", config);

    let perf_config = config.perf_config()?;
    info!("{}", perf_config);

    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(&perf_config)));
    let applications = Arc::new(LoadedApplicationsContainer::new());
    let scheduler = PeriodicScheduler::current()?;
    let mgr = PerformanceMgr::new(load_manager, applications.clone(), Some(scheduler));

    let listener = Arc::new(LogPmiListener::new());
    mgr.set_pmi_listener(listener.clone());
    mgr.init(perf_config);
    if let Some(capacity) = config.queue_capacity {
        mgr.bind_queue_capacity(capacity);
    }

    let descriptors: Vec<AppDescriptor> = (0..config.applications.unwrap_or(1))
        .map(|i| AppDescriptor::new(format!("sim-app-{i}")))
        .collect();
    let apps: Vec<SimApp> = descriptors
        .iter()
        .map(|descriptor| SimApp {
            name: descriptor.name().to_string(),
            index: applications.app_loaded(descriptor.name(), descriptor),
        })
        .collect();

    let settings = TrafficSettings {
        calls_per_second: config.calls_per_second.unwrap_or(100),
        call_hold_ms: config.call_hold_ms.unwrap_or(5_000),
        response_latency_ms: config.response_latency_ms.unwrap_or(20),
    };
    let generator = TrafficGenerator::new(mgr.clone(), apps, settings, StdRng::from_os_rng());

    let shutdown = match config.run_seconds {
        Some(seconds) => Shutdown::new(shutdown_signal(Duration::from_secs(seconds))),
        None => Shutdown::default(),
    };
    shutdown.spawn_task_fn(move |guard| generator.run(guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            warn!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    mgr.stop_timers();
    info!("{}", mgr);
    if let Some(snapshot) = listener.last_snapshot() {
        info!(
            weight = snapshot.server_weight,
            rejected = snapshot.rejected_messages,
            "Last statistics window"
        );
    }
    for descriptor in &descriptors {
        if let Some(index) = descriptor.app_index() {
            applications.app_unloaded(descriptor.name(), index);
        }
    }

    info!("Bye!");
    Ok(())
}
