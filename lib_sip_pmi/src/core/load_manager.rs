//! # Load Manager
//!
//! Holds the server weight last published by the performance manager and the
//! overload flag derived from it. Overload is declared only when the weight
//! reaches `0` and is cleared only once it climbs back to `weight_overload_mark`,
//! so weights in between never toggle the flag.
//!
//! The manager computes the signal only. Refusing work is left to whoever
//! consults [`LoadManager::should_throw_msgs`].

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use crate::configs::PerfConfig;
use crate::core::weighable::{Dimension, Weight, OVERLOADED_WEIGHT};

/// The thresholds the load manager needs from [`PerfConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadManagerConfig {
    /// Best weight on the scale, reported before anything was published.
    pub max_weight: Weight,
    /// Weight at or above which a declared overload is cleared.
    pub weight_overload_mark: Weight,
    /// Whether the admission gate is armed when overload is declared.
    pub reject_in_overload: bool,
}

impl From<&PerfConfig> for LoadManagerConfig {
    fn from(config: &PerfConfig) -> Self {
        Self {
            max_weight: config.max_weight,
            weight_overload_mark: config.weight_overload_mark,
            reject_in_overload: config.reject_in_overload,
        }
    }
}

impl Default for LoadManagerConfig {
    fn default() -> Self {
        Self::from(&PerfConfig::default())
    }
}

/// How often the overload flag flipped in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverloadTransitions {
    /// Number of times overload was declared.
    pub entered: u64,
    /// Number of times a declared overload was cleared.
    pub cleared: u64,
}

#[derive(Debug, Default)]
struct LoadState {
    last_weight: Option<Weight>,
    last_dimension: Option<Dimension>,
    last_sample: u64,
    overloaded: bool,
    overload_cause: Option<Dimension>,
    throw_msgs: bool,
    transitions: OverloadTransitions,
}

/// # Load Manager
///
/// One instance per server, shared as `Arc<LoadManager>`. A single mutex
/// serialises every state transition.
pub struct LoadManager {
    config: LoadManagerConfig,
    state: Mutex<LoadState>,
}

impl LoadManager {
    /// Creates a manager with nothing published yet.
    pub fn new(config: LoadManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LoadState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a newly published server weight caused by `dimension`.
    ///
    /// Returns `true` iff the overload flag changed as a result.
    pub fn update_new_weight(&self, dimension: Dimension, weight: Weight, load_sample: u64) -> bool {
        let mut state = self.state();
        state.last_weight = Some(weight);
        state.last_dimension = Some(dimension);
        state.last_sample = load_sample;
        self.change_overload_with_water_mark(&mut state, dimension, weight, load_sample)
    }

    fn change_overload_with_water_mark(
        &self,
        state: &mut LoadState,
        dimension: Dimension,
        weight: Weight,
        load_sample: u64,
    ) -> bool {
        if !state.overloaded && weight == OVERLOADED_WEIGHT {
            state.overloaded = true;
            state.overload_cause = Some(dimension);
            state.throw_msgs = self.config.reject_in_overload;
            state.transitions.entered += 1;
            error!(
                dimension = %dimension,
                load_sample,
                reject = state.throw_msgs,
                "Server overloaded"
            );
            return true;
        }
        if state.overloaded && weight >= self.config.weight_overload_mark {
            state.overloaded = false;
            state.overload_cause = None;
            state.throw_msgs = false;
            state.transitions.cleared += 1;
            info!(dimension = %dimension, weight, load_sample, "Server overload cleared");
            return true;
        }
        false
    }

    /// The last published weight, or the best weight if nothing was published.
    pub fn current_weight(&self) -> Weight {
        self.state().last_weight.unwrap_or(self.config.max_weight)
    }

    /// The last published weight, `None` before the first publication.
    pub fn last_weight(&self) -> Option<Weight> {
        self.state().last_weight
    }

    /// The dimension and raw load sample behind the last publication.
    pub fn last_publication(&self) -> Option<(Dimension, u64)> {
        let state = self.state();
        state.last_dimension.map(|dimension| (dimension, state.last_sample))
    }

    /// Whether the server is currently declared overloaded.
    pub fn is_overloaded(&self) -> bool {
        self.state().overloaded
    }

    /// The dimension that caused the current overload.
    pub fn overloaded_dimension(&self) -> Option<Dimension> {
        self.state().overload_cause
    }

    /// Arms or disarms the admission gate.
    pub fn set_throw_msg_in_overload(&self, throw_msgs: bool) {
        self.state().throw_msgs = throw_msgs;
    }

    /// Whether new work should be refused right now.
    pub fn should_throw_msgs(&self) -> bool {
        self.state().throw_msgs
    }

    /// Counts of overload transitions so far.
    pub fn transitions(&self) -> OverloadTransitions {
        self.state().transitions
    }

    /// The thresholds in force.
    pub fn config(&self) -> LoadManagerConfig {
        self.config
    }
}

impl fmt::Display for LoadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        write!(
            f,
            "LoadManager
    Weight: {},
    Overloaded: {},
    Cause: {},
    Reject messages: {},
",
            state
                .last_weight
                .map_or_else(|| "none".to_string(), |w| w.to_string()),
            state.overloaded,
            state
                .overload_cause
                .map_or_else(|| "none".to_string(), |d| d.to_string()),
            state.throw_msgs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LoadManager {
        LoadManager::new(LoadManagerConfig {
            max_weight: 3,
            weight_overload_mark: 2,
            reject_in_overload: true,
        })
    }

    #[test]
    fn test_nothing_published_reports_best_weight() {
        let manager = manager();
        assert_eq!(manager.last_weight(), None);
        assert_eq!(manager.current_weight(), 3);
        assert!(!manager.is_overloaded());
        assert!(!manager.should_throw_msgs());
    }

    #[test]
    fn test_overload_toggles_only_at_zero_and_mark() {
        let manager = manager();
        let weights = [3, 1, 0, 1, 0, 1, 2, 1, 3];
        let changed: Vec<bool> = weights
            .iter()
            .map(|&w| manager.update_new_weight(Dimension::AppSessions, w, 7))
            .collect();
        assert_eq!(
            changed,
            [false, false, true, false, false, false, true, false, false]
        );
        assert!(!manager.is_overloaded());
        assert_eq!(
            manager.transitions(),
            OverloadTransitions { entered: 1, cleared: 1 }
        );
        assert_eq!(manager.current_weight(), 3);
    }

    #[test]
    fn test_entering_overload_arms_the_gate() {
        let manager = manager();
        manager.update_new_weight(Dimension::QueueSize, 0, 3200);
        assert!(manager.is_overloaded());
        assert!(manager.should_throw_msgs());
        assert_eq!(manager.overloaded_dimension(), Some(Dimension::QueueSize));
        assert_eq!(manager.last_publication(), Some((Dimension::QueueSize, 3200)));

        manager.update_new_weight(Dimension::QueueSize, 2, 100);
        assert!(!manager.should_throw_msgs());
        assert_eq!(manager.overloaded_dimension(), None);
    }

    #[test]
    fn test_gate_follows_reject_setting() {
        let manager = LoadManager::new(LoadManagerConfig {
            max_weight: 3,
            weight_overload_mark: 2,
            reject_in_overload: false,
        });
        manager.update_new_weight(Dimension::MessageRate, 0, 9000);
        assert!(manager.is_overloaded());
        assert!(!manager.should_throw_msgs());

        manager.set_throw_msg_in_overload(true);
        assert!(manager.should_throw_msgs());
    }

    #[test]
    fn test_display_names_the_cause() {
        let manager = manager();
        manager.update_new_weight(Dimension::ResponseTime, 0, 800);
        let rendered = manager.to_string();
        assert!(rendered.contains("Overloaded: true"));
        assert!(rendered.contains("Cause: responseTime"));
    }
}
