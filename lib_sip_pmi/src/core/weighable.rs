//! # Weighable Counters
//!
//! A weighable counter tracks one load dimension and converts its raw
//! measurement into a small integer weight: `max_weight` is healthy, `0` is
//! saturated. The performance manager publishes the worst weight across all
//! dimensions as the server weight.
//!
//! ## Step function
//!
//! `weight_for(raw) = max_weight - floor(raw * max_weight / max_allowed)`,
//! clamped to `0..=max_weight`, so only `raw >= max_allowed` yields `0`.
//!
//! ## Hysteresis
//!
//! A worsening weight applies at once. An improving weight is computed as if
//! the load were still `low_water_mark` units higher, so a measurement that
//! wobbles around a step boundary by less than the band never flips the
//! weight back and forth.

use std::fmt;
use std::sync::Weak;

use serde::Serialize;

/// A health score on the `0..=max_weight` scale. Lower is worse.
pub type Weight = u32;

/// The weight of a saturated dimension.
pub const OVERLOADED_WEIGHT: Weight = 0;

/// # Dimension
///
/// The load dimensions tracked by the performance manager. The declaration
/// order is the scan order, which also breaks ties between equally bad
/// dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Dimension {
    /// Live SIP application sessions.
    AppSessions = 0,
    /// Inbound messages per averaging period.
    MessageRate = 1,
    /// Average response time.
    ResponseTime = 2,
    /// Outbound queue depth.
    QueueSize = 3,
}

impl Dimension {
    /// Every dimension, in scan order.
    pub const ALL: [Dimension; 4] = [
        Dimension::AppSessions,
        Dimension::MessageRate,
        Dimension::ResponseTime,
        Dimension::QueueSize,
    ];

    /// Position of the dimension in the counter array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable name used in logs and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::AppSessions => "appSessions",
            Dimension::MessageRate => "messageRate",
            Dimension::ResponseTime => "responseTime",
            Dimension::QueueSize => "queueSize",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives a counter's own weight changes between scheduled recalculations.
///
/// Counters never invoke the observer while holding their internal lock.
pub trait WeightObserver: Send + Sync {
    /// `dimension` now weighs `weight`, derived from the raw `load_sample`.
    fn weight_changed(&self, dimension: Dimension, weight: Weight, load_sample: u64);
}

struct Unobserved;

impl WeightObserver for Unobserved {
    fn weight_changed(&self, _: Dimension, _: Weight, _: u64) {}
}

/// An observer handle that never upgrades, for counters used on their own.
pub fn unobserved() -> Weak<dyn WeightObserver> {
    Weak::<Unobserved>::new()
}

/// Outcome of [`Weighable::calculate_weight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightCalculation {
    /// The weight after the calculation.
    pub weight: Weight,
    /// The raw measurement the weight was derived from.
    pub load_sample: u64,
    /// Whether the weight differs from the one before the calculation.
    pub changed: bool,
}

/// # Weighable
///
/// One load dimension. Implementations own their state and lock it
/// internally; every method takes `&self`.
pub trait Weighable: Send + Sync {
    /// The dimension this counter measures.
    fn dimension(&self) -> Dimension;

    /// Adds one unit to the live raw counter.
    fn increment(&self);

    /// Removes one unit from the live raw counter, never going below zero.
    fn decrement(&self);

    /// Overwrites (or, for sampled dimensions, records) the raw measurement.
    fn set_counter(&self, value: u64);

    /// Recomputes the weight from the accumulated measurement and resets any
    /// windowed accumulation. Never notifies the observer.
    fn calculate_weight(&self) -> WeightCalculation;

    /// The last computed weight.
    fn weight(&self) -> Weight;

    /// The raw measurement behind the last computed weight.
    fn load_sample(&self) -> u64;

    /// The configured ceiling; 0 for an unbounded or disabled dimension.
    fn max_allowed(&self) -> u64;

    /// The hysteresis band, in the counter's own units.
    fn low_water_mark(&self) -> u64;

    /// One-line diagnostic rendering.
    fn current_state(&self) -> String;
}

/// # Weight Steps
///
/// The step function and hysteresis band of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightSteps {
    max_allowed: u64,
    low_water_mark: u64,
    max_weight: Weight,
}

impl WeightSteps {
    /// `max_allowed == 0` describes an unbounded dimension that always reports
    /// `max_weight`.
    ///
    /// The band is capped at [`WeightSteps::band_limit`] so an idle dimension
    /// always climbs back to `max_weight`.
    pub fn new(max_allowed: u64, low_water_mark: u64, max_weight: Weight) -> Self {
        Self {
            max_allowed,
            low_water_mark: low_water_mark.min(Self::band_limit(max_allowed, max_weight)),
            max_weight,
        }
    }

    /// The widest band for which a zero reading still maps to `max_weight`:
    /// `band * max_weight < max_allowed`.
    pub fn band_limit(max_allowed: u64, max_weight: Weight) -> u64 {
        if max_allowed == 0 || max_weight == 0 {
            return u64::MAX;
        }
        (max_allowed - 1) / u64::from(max_weight)
    }

    /// The configured ceiling.
    pub fn max_allowed(&self) -> u64 {
        self.max_allowed
    }

    /// The hysteresis band in effect, after capping.
    pub fn low_water_mark(&self) -> u64 {
        self.low_water_mark
    }

    /// The best weight on the scale.
    pub fn max_weight(&self) -> Weight {
        self.max_weight
    }

    /// The weight of `raw` without hysteresis.
    pub fn weight_for(&self, raw: u64) -> Weight {
        if self.max_allowed == 0 {
            return self.max_weight;
        }
        if raw >= self.max_allowed {
            return OVERLOADED_WEIGHT;
        }
        let consumed = u128::from(raw) * u128::from(self.max_weight) / u128::from(self.max_allowed);
        // raw < max_allowed keeps `consumed` strictly below max_weight.
        self.max_weight - consumed as Weight
    }

    /// The weight that follows `current` once the measurement reads `raw`.
    pub fn next_weight(&self, current: Weight, raw: u64) -> Weight {
        let candidate = self.weight_for(raw);
        if candidate <= current {
            candidate
        } else {
            current.max(self.weight_for(raw.saturating_add(self.low_water_mark)))
        }
    }
}
