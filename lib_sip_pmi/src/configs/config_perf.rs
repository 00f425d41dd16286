//! # Performance Manager Configuration
//!
//! Every threshold the overload-control loop needs, with the fallback rules the
//! container applies to them:
//!
//! - A numeric value `<= 0` (or one that does not parse) is replaced by the
//!   compiled-in default and the substitution is logged at debug level.
//! - `maxResponseTime` treats `0` as "response-time monitoring disabled".
//! - `maxQueueSize` treats `0` as "capacity is bound later" (the outbound
//!   queue reports its size once the transport is up).
//! - `statUpdateRange` is never shorter than `averagingPeriod`.
//! - `weightOverloadMark` is kept inside `1..=maxWeight`.
//!
//! All periods are in milliseconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Property key: maximum number of live SIP application sessions.
pub const MAX_APP_SESSIONS: &str = "maxAppSessions";
/// Property key: maximum number of messages per averaging period.
pub const MAX_MESSAGE_RATE: &str = "maxMessageRate";
/// Property key: maximum average response time (0 disables the dimension).
pub const MAX_RESPONSE_TIME: &str = "maxResponseTime";
/// Property key: capacity of the outbound message queue.
pub const MAX_QUEUE_SIZE: &str = "maxQueueSize";
/// Property key: period of the statistics flush.
pub const STAT_UPDATE_RANGE: &str = "statUpdateRange";
/// Property key: window over which rates are expressed.
pub const AVERAGING_PERIOD: &str = "averagingPeriod";
/// Property key: period of the weight recalculation.
pub const LOAD_UPDATE_PERIOD: &str = "loadUpdatePeriod";
/// Property key: hysteresis band of every counter, in the counter's own units.
pub const LOW_WATER_MARK_SIZE: &str = "lowWaterMarkSize";
/// Property key: whether the weighable counters are active at all.
pub const OVERLOAD_PROTECTION_ENABLED: &str = "overloadProtectionEnabled";
/// Property key: refresh period of the cached time service.
pub const TIMER_SERVICE_GRANULARITY: &str = "timerServiceGranularity";
/// Property key: best (healthiest) weight on the scale.
pub const MAX_WEIGHT: &str = "maxWeight";
/// Property key: weight at which a declared overload is cleared again.
pub const WEIGHT_OVERLOAD_MARK: &str = "weightOverloadMark";
/// Property key: whether new work should be refused while overloaded.
pub const REJECT_IN_OVERLOAD: &str = "rejectInOverload";
/// Property key: whether per-application task durations are collected.
pub const TASK_DURATION_MONITORING: &str = "taskDurationMonitoring";

/// Default for [`MAX_APP_SESSIONS`].
pub const DEFAULT_MAX_APP_SESSIONS: u64 = 120_000;
/// Default for [`MAX_MESSAGE_RATE`].
pub const DEFAULT_MAX_MESSAGE_RATE: u64 = 5_000;
/// Default for [`MAX_RESPONSE_TIME`] (disabled).
pub const DEFAULT_MAX_RESPONSE_TIME: u64 = 0;
/// Default for [`MAX_QUEUE_SIZE`].
pub const DEFAULT_MAX_QUEUE_SIZE: u64 = 3_200;
/// Default for [`STAT_UPDATE_RANGE`].
pub const DEFAULT_STAT_UPDATE_RANGE: u64 = 10_000;
/// Default for [`AVERAGING_PERIOD`].
pub const DEFAULT_AVERAGING_PERIOD: u64 = 1_000;
/// Default for [`LOAD_UPDATE_PERIOD`].
pub const DEFAULT_LOAD_UPDATE_PERIOD: u64 = 1_000;
/// Default for [`LOW_WATER_MARK_SIZE`].
pub const DEFAULT_LOW_WATER_MARK_SIZE: u64 = 100;
/// Default for [`TIMER_SERVICE_GRANULARITY`].
pub const DEFAULT_TIMER_SERVICE_GRANULARITY: u64 = 100;
/// Default for [`MAX_WEIGHT`].
pub const DEFAULT_MAX_WEIGHT: u32 = 3;
/// Default for [`WEIGHT_OVERLOAD_MARK`].
pub const DEFAULT_WEIGHT_OVERLOAD_MARK: u32 = 2;

/// # Config Error
///
/// Failures while reading a configuration file. The property-store path never
/// fails: bad values fall back to defaults instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The file that was being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`PerfConfig`].
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// # Performance Configuration
///
/// The thresholds and periods read by the performance manager at
/// initialisation. Use [`PerfConfig::normalized`] (applied automatically by
/// the loaders) before handing a hand-built value to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerfConfig {
    /// Maximum number of live SIP application sessions.
    pub max_app_sessions: u64,
    /// Maximum number of inbound messages per averaging period.
    pub max_message_rate: u64,
    /// Maximum average response time in milliseconds; 0 disables the dimension.
    pub max_response_time: u64,
    /// Capacity of the outbound queue; 0 means it is bound later.
    pub max_queue_size: u64,
    /// Period of the statistics flush.
    pub stat_update_range: u64,
    /// Window over which reported rates are expressed.
    pub averaging_period: u64,
    /// Period of the weight recalculation.
    pub load_update_period: u64,
    /// Hysteresis band, in each counter's own units.
    pub low_water_mark_size: u64,
    /// Whether the weighable counters are active.
    pub overload_protection_enabled: bool,
    /// Refresh period of the cached time service.
    pub timer_service_granularity: u64,
    /// Best weight on the scale; 0 is always "saturated".
    pub max_weight: u32,
    /// Weight at or above which a declared overload is cleared.
    pub weight_overload_mark: u32,
    /// Whether the admission gate is armed when overload is declared.
    pub reject_in_overload: bool,
    /// Whether per-application task durations are collected.
    pub task_duration_monitoring: bool,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            max_app_sessions: DEFAULT_MAX_APP_SESSIONS,
            max_message_rate: DEFAULT_MAX_MESSAGE_RATE,
            max_response_time: DEFAULT_MAX_RESPONSE_TIME,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            stat_update_range: DEFAULT_STAT_UPDATE_RANGE,
            averaging_period: DEFAULT_AVERAGING_PERIOD,
            load_update_period: DEFAULT_LOAD_UPDATE_PERIOD,
            low_water_mark_size: DEFAULT_LOW_WATER_MARK_SIZE,
            overload_protection_enabled: true,
            timer_service_granularity: DEFAULT_TIMER_SERVICE_GRANULARITY,
            max_weight: DEFAULT_MAX_WEIGHT,
            weight_overload_mark: DEFAULT_WEIGHT_OVERLOAD_MARK,
            reject_in_overload: true,
            task_duration_monitoring: false,
        }
    }
}

impl PerfConfig {
    /// Builds a configuration from the host server's named property store.
    ///
    /// Keys are matched case-insensitively. Missing keys take their default;
    /// values that do not parse, or are `<= 0` for a dimension that cannot be
    /// disabled, take their default and are logged at debug level.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Self {
        let props: BTreeMap<String, &str> = properties
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();

        let config = Self {
            max_app_sessions: numeric(&props, MAX_APP_SESSIONS, DEFAULT_MAX_APP_SESSIONS, false),
            max_message_rate: numeric(&props, MAX_MESSAGE_RATE, DEFAULT_MAX_MESSAGE_RATE, false),
            max_response_time: numeric(&props, MAX_RESPONSE_TIME, DEFAULT_MAX_RESPONSE_TIME, true),
            max_queue_size: numeric(&props, MAX_QUEUE_SIZE, DEFAULT_MAX_QUEUE_SIZE, true),
            stat_update_range: numeric(&props, STAT_UPDATE_RANGE, DEFAULT_STAT_UPDATE_RANGE, false),
            averaging_period: numeric(&props, AVERAGING_PERIOD, DEFAULT_AVERAGING_PERIOD, false),
            load_update_period: numeric(&props, LOAD_UPDATE_PERIOD, DEFAULT_LOAD_UPDATE_PERIOD, false),
            low_water_mark_size: numeric(&props, LOW_WATER_MARK_SIZE, DEFAULT_LOW_WATER_MARK_SIZE, false),
            overload_protection_enabled: flag(&props, OVERLOAD_PROTECTION_ENABLED, true),
            timer_service_granularity: numeric(
                &props,
                TIMER_SERVICE_GRANULARITY,
                DEFAULT_TIMER_SERVICE_GRANULARITY,
                false,
            ),
            max_weight: numeric(&props, MAX_WEIGHT, DEFAULT_MAX_WEIGHT as u64, false)
                .min(u32::MAX as u64) as u32,
            weight_overload_mark: numeric(
                &props,
                WEIGHT_OVERLOAD_MARK,
                DEFAULT_WEIGHT_OVERLOAD_MARK as u64,
                false,
            )
            .min(u32::MAX as u64) as u32,
            reject_in_overload: flag(&props, REJECT_IN_OVERLOAD, true),
            task_duration_monitoring: flag(&props, TASK_DURATION_MONITORING, false),
        };
        config.normalized()
    }

    /// Reads a JSON configuration file. Absent fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PerfConfig = serde_json::from_str(&raw)?;
        Ok(config.normalized())
    }

    /// Applies the fallback rules described in the module documentation.
    pub fn normalized(mut self) -> Self {
        fallback(&mut self.max_app_sessions, MAX_APP_SESSIONS, DEFAULT_MAX_APP_SESSIONS);
        fallback(&mut self.max_message_rate, MAX_MESSAGE_RATE, DEFAULT_MAX_MESSAGE_RATE);
        fallback(&mut self.stat_update_range, STAT_UPDATE_RANGE, DEFAULT_STAT_UPDATE_RANGE);
        fallback(&mut self.averaging_period, AVERAGING_PERIOD, DEFAULT_AVERAGING_PERIOD);
        fallback(&mut self.load_update_period, LOAD_UPDATE_PERIOD, DEFAULT_LOAD_UPDATE_PERIOD);
        fallback(&mut self.low_water_mark_size, LOW_WATER_MARK_SIZE, DEFAULT_LOW_WATER_MARK_SIZE);
        fallback(
            &mut self.timer_service_granularity,
            TIMER_SERVICE_GRANULARITY,
            DEFAULT_TIMER_SERVICE_GRANULARITY,
        );

        if self.max_weight == 0 {
            debug!(key = MAX_WEIGHT, default = DEFAULT_MAX_WEIGHT, "invalid value, using default");
            self.max_weight = DEFAULT_MAX_WEIGHT;
        }
        let mark = self.weight_overload_mark.clamp(1, self.max_weight);
        if mark != self.weight_overload_mark {
            debug!(key = WEIGHT_OVERLOAD_MARK, from = self.weight_overload_mark, to = mark, "clamped");
            self.weight_overload_mark = mark;
        }

        if self.stat_update_range < self.averaging_period {
            debug!(
                stat_update_range = self.stat_update_range,
                averaging_period = self.averaging_period,
                "statistics range shorter than averaging period, raising it"
            );
            self.stat_update_range = self.averaging_period;
        }
        self
    }

    /// True when the response-time dimension is administratively disabled.
    pub fn response_time_disabled(&self) -> bool {
        self.max_response_time == 0
    }
}

impl fmt::Display for PerfConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PerfConfig
    Overload protection: {},
    Max app sessions: {},
    Max message rate: {},
    Max response time: {},
    Max queue size: {},
    Stat update range: {}ms,
    Averaging period: {}ms,
    Load update period: {}ms,
    Low water mark: {},
    Weight scale: 0..={} (clear at {})
",
            self.overload_protection_enabled,
            self.max_app_sessions,
            self.max_message_rate,
            self.max_response_time,
            self.max_queue_size,
            self.stat_update_range,
            self.averaging_period,
            self.load_update_period,
            self.low_water_mark_size,
            self.max_weight,
            self.weight_overload_mark
        )
    }
}

fn fallback(value: &mut u64, key: &str, default: u64) {
    if *value == 0 {
        debug!(key, default, "invalid value, using default");
        *value = default;
    }
}

fn numeric(props: &BTreeMap<String, &str>, key: &str, default: u64, disablable: bool) -> u64 {
    let Some(raw) = props.get(&key.to_ascii_lowercase()) else {
        return default;
    };
    match raw.parse::<i64>() {
        Ok(v) if v > 0 => v as u64,
        Ok(0) if disablable => 0,
        Ok(v) => {
            debug!(key, value = v, default, "invalid value, using default");
            default
        }
        Err(e) => {
            debug!(key, value = %raw, default, error = %e, "unparseable value, using default");
            default
        }
    }
}

fn flag(props: &BTreeMap<String, &str>, key: &str, default: bool) -> bool {
    match props.get(&key.to_ascii_lowercase()) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                debug!(key, value = %raw, default, "unparseable flag, using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_properties_take_defaults() {
        let config = PerfConfig::from_properties(&BTreeMap::new());
        assert_eq!(config, PerfConfig::default());
    }

    #[test]
    fn test_non_positive_values_fall_back() {
        let config = PerfConfig::from_properties(&props(&[
            ("maxAppSessions", "-5"),
            ("maxMessageRate", "0"),
            ("loadUpdatePeriod", "abc"),
        ]));
        assert_eq!(config.max_app_sessions, DEFAULT_MAX_APP_SESSIONS);
        assert_eq!(config.max_message_rate, DEFAULT_MAX_MESSAGE_RATE);
        assert_eq!(config.load_update_period, DEFAULT_LOAD_UPDATE_PERIOD);
    }

    #[test]
    fn test_zero_response_time_means_disabled() {
        let config = PerfConfig::from_properties(&props(&[("maxResponseTime", "0")]));
        assert!(config.response_time_disabled());

        let config = PerfConfig::from_properties(&props(&[("maxResponseTime", "-1")]));
        assert_eq!(config.max_response_time, DEFAULT_MAX_RESPONSE_TIME);

        let config = PerfConfig::from_properties(&props(&[("maxResponseTime", "250")]));
        assert!(!config.response_time_disabled());
        assert_eq!(config.max_response_time, 250);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let config = PerfConfig::from_properties(&props(&[
            ("MAXAPPSESSIONS", "2"),
            ("lowwatermarksize", "1"),
            ("OverloadProtectionEnabled", "false"),
        ]));
        assert_eq!(config.max_app_sessions, 2);
        assert_eq!(config.low_water_mark_size, 1);
        assert!(!config.overload_protection_enabled);
    }

    #[test]
    fn test_stat_range_never_below_averaging_period() {
        let config = PerfConfig::from_properties(&props(&[
            ("statUpdateRange", "500"),
            ("averagingPeriod", "3000"),
        ]));
        assert_eq!(config.stat_update_range, 3000);
    }

    #[test]
    fn test_overload_mark_is_clamped_to_scale() {
        let config = PerfConfig {
            max_weight: 3,
            weight_overload_mark: 9,
            ..PerfConfig::default()
        }
        .normalized();
        assert_eq!(config.weight_overload_mark, 3);

        let config = PerfConfig {
            weight_overload_mark: 0,
            ..PerfConfig::default()
        }
        .normalized();
        assert_eq!(config.weight_overload_mark, 1);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        write!(file, r#"{{ "maxAppSessions": 2, "maxResponseTime": 0, "averagingPeriod": 0 }}"#)
            .unwrap();

        let config = PerfConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_app_sessions, 2);
        assert_eq!(config.averaging_period, DEFAULT_AVERAGING_PERIOD);
        assert_eq!(config.max_queue_size, DEFAULT_MAX_QUEUE_SIZE);
    }

    #[test]
    fn test_from_json_file_reports_errors() {
        let missing = PerfConfig::from_json_file(Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let broken = PerfConfig::from_json_file(file.path());
        assert!(matches!(broken, Err(ConfigError::Parse(_))));
    }
}
