//! # lib_sip_pmi
//!
//! Performance monitoring and adaptive overload control for a SIP container.
//!
//! Protocol and application events flow into a [`crate::core::PerformanceMgr`], which
//! keeps one weighable counter per load dimension and a per-application
//! counter set. Two periodic tasks turn that state into a published server
//! weight (through [`crate::core::LoadManager`]) and into statistics pushed to a
//! monitoring sink.
//!
//! Modules are gated by folder-level features so hosts only pull in what they
//! use:
//!
//! - `configs`: typed thresholds ([`crate::configs::PerfConfig`]).
//! - `core`: counters, load manager, application registry, orchestrator.
//! - `loggers`: `tracing` subscriber setup for binaries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Threshold configuration read from a property store or a JSON file.
#[cfg(feature = "configs")]
pub mod configs;
/// The monitoring and overload-control engine.
#[cfg(feature = "core")]
pub mod core;
/// Logging setup for binaries hosting the engine.
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "configs")]
pub use configs::config_perf::{ConfigError, PerfConfig};
