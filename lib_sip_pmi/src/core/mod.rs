//! # Core Engine Module
//!
//! The monitoring and overload-control engine of the SIP container.
//!
//! ## Core Components:
//!
//! - **`weighable`** and **`counters`**: one counter per load dimension
//!   (application sessions, message rate, response time, queue depth), each
//!   turning its raw measurement into a small integer weight.
//!
//! - **`load_manager`**: holds the published server weight and the overload
//!   flag, with a hysteresis band between declaring and clearing overload.
//!
//! - **`applications`**: the registry of loaded applications and their
//!   per-application counters, keyed by the index assigned at load time.
//!
//! - **`performance_mgr`**: the orchestrator. Receives protocol events, runs
//!   the weight recalculation and the statistics flush, and decides when the
//!   load manager hears about a new weight.
//!
//! - **`scheduler`**, **`cached_time`** and **`pmi`**: the periodic-task
//!   primitive, the cached clock and the monitoring sink interface.

/// Registry of loaded applications and their counters.
pub mod applications;
/// Millisecond clock refreshed by a periodic task.
pub mod cached_time;
/// The concrete weighable counters.
pub mod counters;
/// Published weight and overload state.
pub mod load_manager;
/// The orchestrator.
pub mod performance_mgr;
/// Statistics pushed to the monitoring interface.
pub mod pmi;
/// Fixed-rate periodic tasks with cancellable handles.
pub mod scheduler;
/// Dimensions, weights and the counter trait.
pub mod weighable;

// --- Public API Re-exports ---
pub use applications::{AppDescriptor, AppIndex, AppModule, LoadedApplicationsContainer};
pub use cached_time::CachedClock;
pub use counters::{AppSessionsCounter, DisabledCounter, MessageRateCounter, QueueSizeCounter, ResponseTimeCounter};
pub use load_manager::{LoadManager, LoadManagerConfig, OverloadTransitions};
pub use performance_mgr::{PerfState, PerformanceMgr};
pub use pmi::{normalize_rate, ApplicationSnapshot, PmiListener, PmiSnapshot, QueueStatistics, TaskDurationStats};
pub use scheduler::{PeriodicScheduler, SchedulerError, TaskHandle};
pub use weighable::{Dimension, Weighable, Weight, WeightObserver, WeightSteps, OVERLOADED_WEIGHT};
