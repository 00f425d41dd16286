use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lib_sip_pmi::PerfConfig;

const DEFAULT_CONFIG_FILE: &str = "sip_load_sim.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "SIP container load simulator with adaptive overload control", version)]
#[serde(rename_all = "camelCase")]
pub struct SimConfig {
    #[clap(long, env = "SIP_SIM_CONFIG_PATH", help = "Path to the JSON configuration file of the simulator.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SIP_PERF_CONFIG_PATH", help = "Path to the JSON file with the performance thresholds.")]
    pub perf_config_path: Option<PathBuf>,

    #[clap(long, env = "SIP_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SIP_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SIP_APPLICATIONS", help = "Number of simulated applications to load.")]
    pub applications: Option<u32>,

    #[clap(long, env = "SIP_CALLS_PER_SECOND", help = "New calls offered per second.")]
    pub calls_per_second: Option<u64>,

    #[clap(long, env = "SIP_CALL_HOLD_MS", help = "Mean duration of a call in milliseconds.")]
    pub call_hold_ms: Option<u64>,

    #[clap(long, env = "SIP_RESPONSE_LATENCY_MS", help = "Mean time to answer a request in milliseconds.")]
    pub response_latency_ms: Option<u64>,

    #[clap(long, env = "SIP_QUEUE_CAPACITY", help = "Outbound queue capacity bound once the simulator starts.")]
    pub queue_capacity: Option<u64>,

    #[clap(long, env = "SIP_MAX_APP_SESSIONS", help = "Overrides maxAppSessions of the performance thresholds.")]
    pub max_app_sessions: Option<u64>,

    #[clap(long, env = "SIP_MAX_MESSAGE_RATE", help = "Overrides maxMessageRate of the performance thresholds.")]
    pub max_message_rate: Option<u64>,

    #[clap(long, env = "SIP_RUN_SECONDS", help = "Stop after this many seconds instead of waiting for a signal.")]
    pub run_seconds: Option<u64>,
}

impl SimConfig {
    // Merge two configs, where 'other' overrides 'self' for Some values
    fn merge(self, other: SimConfig) -> SimConfig {
        SimConfig {
            config_path: other.config_path.or(self.config_path),
            perf_config_path: other.perf_config_path.or(self.perf_config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            applications: other.applications.or(self.applications),
            calls_per_second: other.calls_per_second.or(self.calls_per_second),
            call_hold_ms: other.call_hold_ms.or(self.call_hold_ms),
            response_latency_ms: other.response_latency_ms.or(self.response_latency_ms),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            max_app_sessions: other.max_app_sessions.or(self.max_app_sessions),
            max_message_rate: other.max_message_rate.or(self.max_message_rate),
            run_seconds: other.run_seconds.or(self.run_seconds),
        }
    }

    fn defaults() -> SimConfig {
        SimConfig {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            applications: Some(3),
            calls_per_second: Some(200),
            call_hold_ms: Some(5_000),
            response_latency_ms: Some(20),
            ..Default::default()
        }
    }

    /// The performance thresholds: the JSON file if given, otherwise the
    /// compiled-in defaults, then the command-line overrides.
    pub fn perf_config(&self) -> Result<PerfConfig> {
        let mut perf = match &self.perf_config_path {
            Some(path) => PerfConfig::from_json_file(path)
                .with_context(|| format!("Failed to load performance config {}", path.display()))?,
            None => PerfConfig::default(),
        };
        if let Some(max) = self.max_app_sessions {
            perf.max_app_sessions = max;
        }
        if let Some(max) = self.max_message_rate {
            perf.max_message_rate = max;
        }
        Ok(perf.normalized())
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

impl fmt::Display for SimConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimConfig
    Applications: {:?},
    Calls per second: {:?},
    Call hold: {:?}ms,
    Response latency: {:?}ms,
    Queue capacity: {:?},
    Run seconds: {:?},
",
            self.applications,
            self.calls_per_second,
            self.call_hold_ms,
            self.response_latency_ms,
            self.queue_capacity,
            self.run_seconds
        )
    }
}

fn read_file_config(path: &Path) -> Option<SimConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults and environment/CLI values");
        return None;
    }
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<SimConfig>(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file, ignoring it");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read config file, ignoring it");
            None
        }
    }
}

/// Defaults, then the JSON file, then environment variables and CLI flags.
pub fn load_config_from<I, T>(args: I) -> Result<SimConfig>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = SimConfig::try_parse_from(args).context("Invalid command line")?;
    let file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = SimConfig::defaults();
    if let Some(file_config) = read_file_config(&file_path) {
        config = config.merge(file_config);
    }
    Ok(config.merge(cli))
}

pub fn load_config() -> Result<SimConfig> {
    load_config_from(std::env::args_os())
}
