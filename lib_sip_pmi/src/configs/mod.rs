//! # Configuration Modules
//!
//! Thresholds and periods for the performance manager, read either from the
//! host server's named property store or from a JSON file.

/// Typed performance-monitoring configuration and its fallback rules.
pub mod config_perf;

pub use config_perf::{ConfigError, PerfConfig};
