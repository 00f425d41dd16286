//! # Counter Variants
//!
//! The concrete [`Weighable`] implementations, one per kind of measurement:
//!
//! - **capacity** counters ([`AppSessionsCounter`], [`QueueSizeCounter`]) hold
//!   a live gauge and recompute their weight on every change, reporting a
//!   changed weight to the observer right away;
//! - **rate** counter ([`MessageRateCounter`]) counts arrivals in the current
//!   recalculation window and expresses them per averaging period;
//! - **latency** counter ([`ResponseTimeCounter`]) averages the response times
//!   sampled in the current window;
//! - [`DisabledCounter`] stands in for a dimension that is switched off.
//!
//! Each counter guards its raw state with its own `Mutex`; the weight and load
//! sample are mirrored in atomics so reading them never blocks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use super::weighable::{
    Dimension, Weighable, WeightCalculation, WeightObserver, WeightSteps, Weight, OVERLOADED_WEIGHT,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every live counter variant.
struct CounterCore {
    dimension: Dimension,
    max_allowed: AtomicU64,
    low_water_mark: u64,
    max_weight: Weight,
    weight: AtomicU32,
    load_sample: AtomicU64,
    observer: Weak<dyn WeightObserver>,
}

impl CounterCore {
    fn new(
        dimension: Dimension,
        max_allowed: u64,
        low_water_mark: u64,
        max_weight: Weight,
        observer: Weak<dyn WeightObserver>,
    ) -> Self {
        let core = Self {
            dimension,
            max_allowed: AtomicU64::new(max_allowed),
            low_water_mark,
            max_weight,
            weight: AtomicU32::new(max_weight),
            load_sample: AtomicU64::new(0),
            observer,
        };
        core.log_band_clamp();
        core
    }

    fn band(&self) -> u64 {
        self.steps().low_water_mark()
    }

    fn log_band_clamp(&self) {
        let band = self.band();
        if band < self.low_water_mark {
            debug!(
                dimension = %self.dimension,
                configured = self.low_water_mark,
                effective = band,
                max_allowed = self.max_allowed.load(Ordering::Relaxed),
                "Low water mark clamped to the step width"
            );
        }
    }

    fn steps(&self) -> WeightSteps {
        WeightSteps::new(
            self.max_allowed.load(Ordering::Relaxed),
            self.low_water_mark,
            self.max_weight,
        )
    }

    /// Callers hold the owning counter's lock, which serialises weight updates.
    fn apply(&self, raw: u64) -> WeightCalculation {
        let current = self.weight.load(Ordering::Relaxed);
        let next = self.steps().next_weight(current, raw);
        self.weight.store(next, Ordering::Relaxed);
        self.load_sample.store(raw, Ordering::Relaxed);
        WeightCalculation {
            weight: next,
            load_sample: raw,
            changed: next != current,
        }
    }

    /// Callers must have released the owning counter's lock.
    fn notify(&self, calculation: WeightCalculation) {
        if !calculation.changed {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.weight_changed(self.dimension, calculation.weight, calculation.load_sample);
        }
    }

    fn weight(&self) -> Weight {
        self.weight.load(Ordering::Relaxed)
    }

    fn load_sample(&self) -> u64 {
        self.load_sample.load(Ordering::Relaxed)
    }

    fn describe(&self, raw: &str) -> String {
        format!(
            "{} weight={} load={} max={} lwm={} {}",
            self.dimension,
            self.weight(),
            self.load_sample(),
            self.max_allowed.load(Ordering::Relaxed),
            self.band(),
            raw
        )
    }
}

/// # App Sessions Counter
///
/// Capacity counter over the number of live SIP application sessions.
pub struct AppSessionsCounter {
    core: CounterCore,
    sessions: Mutex<u64>,
}

impl AppSessionsCounter {
    /// Creates a counter allowing `max_sessions` live sessions.
    pub fn new(
        max_sessions: u64,
        low_water_mark: u64,
        max_weight: Weight,
        observer: Weak<dyn WeightObserver>,
    ) -> Self {
        Self {
            core: CounterCore::new(
                Dimension::AppSessions,
                max_sessions,
                low_water_mark,
                max_weight,
                observer,
            ),
            sessions: Mutex::new(0),
        }
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> u64 {
        *lock(&self.sessions)
    }

    fn update(&self, change: impl FnOnce(&mut u64)) {
        let calculation = {
            let mut sessions = lock(&self.sessions);
            change(&mut sessions);
            self.core.apply(*sessions)
        };
        self.core.notify(calculation);
    }
}

impl Weighable for AppSessionsCounter {
    fn dimension(&self) -> Dimension {
        self.core.dimension
    }

    fn increment(&self) {
        self.update(|sessions| *sessions = sessions.saturating_add(1));
    }

    fn decrement(&self) {
        self.update(|sessions| *sessions = sessions.saturating_sub(1));
    }

    fn set_counter(&self, value: u64) {
        self.update(|sessions| *sessions = value);
    }

    fn calculate_weight(&self) -> WeightCalculation {
        let sessions = lock(&self.sessions);
        self.core.apply(*sessions)
    }

    fn weight(&self) -> Weight {
        self.core.weight()
    }

    fn load_sample(&self) -> u64 {
        self.core.load_sample()
    }

    fn max_allowed(&self) -> u64 {
        self.core.max_allowed.load(Ordering::Relaxed)
    }

    fn low_water_mark(&self) -> u64 {
        self.core.band()
    }

    fn current_state(&self) -> String {
        self.core.describe(&format!("sessions={}", self.sessions()))
    }
}

/// # Message Rate Counter
///
/// Counts inbound messages between two weight recalculations and expresses the
/// count per averaging period: `count * averaging_period / load_update_period`.
pub struct MessageRateCounter {
    core: CounterCore,
    arrivals: Mutex<u64>,
    averaging_period: u64,
    load_update_period: u64,
}

impl MessageRateCounter {
    /// Creates a counter allowing `max_rate` messages per `averaging_period`
    /// when recalculated every `load_update_period` (both in milliseconds).
    pub fn new(
        max_rate: u64,
        low_water_mark: u64,
        max_weight: Weight,
        averaging_period: u64,
        load_update_period: u64,
        observer: Weak<dyn WeightObserver>,
    ) -> Self {
        Self {
            core: CounterCore::new(Dimension::MessageRate, max_rate, low_water_mark, max_weight, observer),
            arrivals: Mutex::new(0),
            averaging_period,
            load_update_period: load_update_period.max(1),
        }
    }

    fn per_averaging_period(&self, arrivals: u64) -> u64 {
        arrivals.saturating_mul(self.averaging_period) / self.load_update_period
    }
}

impl Weighable for MessageRateCounter {
    fn dimension(&self) -> Dimension {
        self.core.dimension
    }

    /// Records an arrival. Once the window alone already exceeds the allowed
    /// rate the counter saturates without waiting for the recalculation.
    fn increment(&self) {
        let saturated = {
            let mut arrivals = lock(&self.arrivals);
            *arrivals = arrivals.saturating_add(1);
            let rate = self.per_averaging_period(*arrivals);
            let max_rate = self.core.max_allowed.load(Ordering::Relaxed);
            if max_rate > 0 && rate >= max_rate && self.core.weight() != OVERLOADED_WEIGHT {
                Some(self.core.apply(rate))
            } else {
                None
            }
        };
        if let Some(calculation) = saturated {
            self.core.notify(calculation);
        }
    }

    fn decrement(&self) {}

    fn set_counter(&self, value: u64) {
        *lock(&self.arrivals) = value;
    }

    fn calculate_weight(&self) -> WeightCalculation {
        let mut arrivals = lock(&self.arrivals);
        let rate = self.per_averaging_period(*arrivals);
        *arrivals = 0;
        self.core.apply(rate)
    }

    fn weight(&self) -> Weight {
        self.core.weight()
    }

    fn load_sample(&self) -> u64 {
        self.core.load_sample()
    }

    fn max_allowed(&self) -> u64 {
        self.core.max_allowed.load(Ordering::Relaxed)
    }

    fn low_water_mark(&self) -> u64 {
        self.core.band()
    }

    fn current_state(&self) -> String {
        self.core.describe(&format!("window_arrivals={}", *lock(&self.arrivals)))
    }
}

#[derive(Debug, Default)]
struct LatencyWindow {
    total_ms: u64,
    samples: u64,
}

/// # Response Time Counter
///
/// Averages the response times sampled since the last recalculation and
/// compares the average against the configured maximum. A window without
/// samples averages to zero.
pub struct ResponseTimeCounter {
    core: CounterCore,
    window: Mutex<LatencyWindow>,
}

impl ResponseTimeCounter {
    /// Creates a counter allowing an average of `max_response_time` ms.
    pub fn new(
        max_response_time: u64,
        low_water_mark: u64,
        max_weight: Weight,
        observer: Weak<dyn WeightObserver>,
    ) -> Self {
        Self {
            core: CounterCore::new(
                Dimension::ResponseTime,
                max_response_time,
                low_water_mark,
                max_weight,
                observer,
            ),
            window: Mutex::new(LatencyWindow::default()),
        }
    }
}

impl Weighable for ResponseTimeCounter {
    fn dimension(&self) -> Dimension {
        self.core.dimension
    }

    fn increment(&self) {}

    fn decrement(&self) {}

    /// Records one response-time sample in milliseconds.
    fn set_counter(&self, value: u64) {
        let mut window = lock(&self.window);
        window.total_ms = window.total_ms.saturating_add(value);
        window.samples += 1;
    }

    fn calculate_weight(&self) -> WeightCalculation {
        let mut window = lock(&self.window);
        let average = match window.samples {
            0 => 0,
            n => window.total_ms / n,
        };
        *window = LatencyWindow::default();
        self.core.apply(average)
    }

    fn weight(&self) -> Weight {
        self.core.weight()
    }

    fn load_sample(&self) -> u64 {
        self.core.load_sample()
    }

    fn max_allowed(&self) -> u64 {
        self.core.max_allowed.load(Ordering::Relaxed)
    }

    fn low_water_mark(&self) -> u64 {
        self.core.band()
    }

    fn current_state(&self) -> String {
        let window = lock(&self.window);
        self.core
            .describe(&format!("window_samples={} window_total_ms={}", window.samples, window.total_ms))
    }
}

/// # Queue Size Counter
///
/// Capacity counter over the outbound queue depth. The capacity may be bound
/// after construction; until then the counter reports the best weight.
pub struct QueueSizeCounter {
    core: CounterCore,
    depth: Mutex<u64>,
}

impl QueueSizeCounter {
    /// Creates a counter for a queue of `capacity` entries (0 = not bound yet).
    pub fn new(
        capacity: u64,
        low_water_mark: u64,
        max_weight: Weight,
        observer: Weak<dyn WeightObserver>,
    ) -> Self {
        Self {
            core: CounterCore::new(Dimension::QueueSize, capacity, low_water_mark, max_weight, observer),
            depth: Mutex::new(0),
        }
    }

    /// Binds (or rebinds) the queue capacity and re-weighs the current depth.
    pub fn bind_capacity(&self, capacity: u64) {
        let calculation = {
            let depth = lock(&self.depth);
            self.core.max_allowed.store(capacity, Ordering::Relaxed);
            self.core.log_band_clamp();
            self.core.apply(*depth)
        };
        self.core.notify(calculation);
    }

    /// The bound capacity, 0 while unbound.
    pub fn capacity(&self) -> u64 {
        self.core.max_allowed.load(Ordering::Relaxed)
    }

    /// The last reported depth.
    pub fn depth(&self) -> u64 {
        *lock(&self.depth)
    }

    fn update(&self, change: impl FnOnce(&mut u64)) {
        let calculation = {
            let mut depth = lock(&self.depth);
            change(&mut depth);
            self.core.apply(*depth)
        };
        self.core.notify(calculation);
    }
}

impl Weighable for QueueSizeCounter {
    fn dimension(&self) -> Dimension {
        self.core.dimension
    }

    fn increment(&self) {
        self.update(|depth| *depth = depth.saturating_add(1));
    }

    fn decrement(&self) {
        self.update(|depth| *depth = depth.saturating_sub(1));
    }

    fn set_counter(&self, value: u64) {
        self.update(|depth| *depth = value);
    }

    fn calculate_weight(&self) -> WeightCalculation {
        let depth = lock(&self.depth);
        self.core.apply(*depth)
    }

    fn weight(&self) -> Weight {
        self.core.weight()
    }

    fn load_sample(&self) -> u64 {
        self.core.load_sample()
    }

    fn max_allowed(&self) -> u64 {
        self.core.max_allowed.load(Ordering::Relaxed)
    }

    fn low_water_mark(&self) -> u64 {
        self.core.band()
    }

    fn current_state(&self) -> String {
        self.core.describe(&format!("depth={}", self.depth()))
    }
}

/// # Disabled Counter
///
/// A switched-off dimension: always the best weight, every update ignored.
pub struct DisabledCounter {
    dimension: Dimension,
    max_weight: Weight,
}

impl DisabledCounter {
    /// Creates a disabled counter for `dimension`.
    pub fn new(dimension: Dimension, max_weight: Weight) -> Self {
        Self { dimension, max_weight }
    }
}

impl Weighable for DisabledCounter {
    fn dimension(&self) -> Dimension {
        self.dimension
    }

    fn increment(&self) {}

    fn decrement(&self) {}

    fn set_counter(&self, _value: u64) {}

    fn calculate_weight(&self) -> WeightCalculation {
        WeightCalculation {
            weight: self.max_weight,
            load_sample: 0,
            changed: false,
        }
    }

    fn weight(&self) -> Weight {
        self.max_weight
    }

    fn load_sample(&self) -> u64 {
        0
    }

    fn max_allowed(&self) -> u64 {
        0
    }

    fn low_water_mark(&self) -> u64 {
        0
    }

    fn current_state(&self) -> String {
        format!("{} disabled weight={}", self.dimension, self.max_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::weighable::unobserved;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(Dimension, Weight, u64)>>,
    }

    impl WeightObserver for Recorder {
        fn weight_changed(&self, dimension: Dimension, weight: Weight, load_sample: u64) {
            self.changes.lock().unwrap().push((dimension, weight, load_sample));
        }
    }

    impl Recorder {
        fn taken(&self) -> Vec<(Dimension, Weight, u64)> {
            std::mem::take(&mut *self.changes.lock().unwrap())
        }
    }

    #[test]
    fn test_app_sessions_notify_only_on_change() {
        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn WeightObserver> = Arc::<Recorder>::downgrade(&recorder);
        // Steps at 10, 20 and 30 sessions.
        let counter = AppSessionsCounter::new(30, 5, 3, observer);

        for _ in 0..9 {
            counter.increment();
        }
        assert!(recorder.taken().is_empty());
        counter.increment();
        assert_eq!(recorder.taken(), vec![(Dimension::AppSessions, 2, 10)]);

        counter.set_counter(30);
        assert_eq!(counter.weight(), 0);
        counter.set_counter(26);
        assert_eq!(counter.weight(), 0, "held by the low water mark");
        counter.set_counter(24);
        assert_eq!(counter.weight(), 1);
        counter.set_counter(0);
        assert_eq!(counter.weight(), 3);
        assert_eq!(
            recorder.taken(),
            vec![
                (Dimension::AppSessions, 0, 30),
                (Dimension::AppSessions, 1, 24),
                (Dimension::AppSessions, 3, 0),
            ]
        );
    }

    #[test]
    fn test_oversized_band_does_not_latch_overload() {
        // The default band of 100 exceeds a ceiling of 50 sessions.
        let counter = AppSessionsCounter::new(50, 100, 3, unobserved());
        assert_eq!(counter.low_water_mark(), 16);
        counter.set_counter(50);
        assert_eq!(counter.weight(), 0);
        counter.set_counter(0);
        assert_eq!(counter.weight(), 3);
        assert!(counter.current_state().contains("lwm=16"));
    }

    #[test]
    fn test_response_time_recovers_with_oversized_band() {
        let counter = ResponseTimeCounter::new(100, 100, 3, unobserved());
        counter.set_counter(150);
        assert_eq!(counter.calculate_weight().weight, 0);
        counter.set_counter(0);
        assert_eq!(counter.calculate_weight().weight, 3);
    }

    #[test]
    fn test_app_sessions_never_go_negative() {
        let counter = AppSessionsCounter::new(10, 0, 3, unobserved());
        counter.decrement();
        assert_eq!(counter.sessions(), 0);
        assert_eq!(counter.weight(), 3);
    }

    #[test]
    fn test_message_rate_is_normalized_and_reset() {
        // 10 arrivals over a 500ms window is 20 per 1000ms averaging period.
        let counter = MessageRateCounter::new(40, 0, 3, 1000, 500, unobserved());
        for _ in 0..10 {
            counter.increment();
        }
        let calculation = counter.calculate_weight();
        assert_eq!(calculation.load_sample, 20);
        assert_eq!(calculation.weight, 2);
        assert!(calculation.changed);

        let calculation = counter.calculate_weight();
        assert_eq!(calculation.load_sample, 0);
        assert_eq!(calculation.weight, 3);
    }

    #[test]
    fn test_message_rate_saturates_before_recalculation() {
        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn WeightObserver> = Arc::<Recorder>::downgrade(&recorder);
        let counter = MessageRateCounter::new(5, 0, 3, 1000, 1000, observer);
        for _ in 0..4 {
            counter.increment();
        }
        assert!(recorder.taken().is_empty());
        counter.increment();
        counter.increment();
        assert_eq!(counter.weight(), 0);
        assert_eq!(recorder.taken(), vec![(Dimension::MessageRate, 0, 5)]);
    }

    #[test]
    fn test_response_time_averages_window() {
        let counter = ResponseTimeCounter::new(100, 0, 3, unobserved());
        counter.set_counter(40);
        counter.set_counter(80);
        let calculation = counter.calculate_weight();
        assert_eq!(calculation.load_sample, 60);
        assert_eq!(calculation.weight, 2);

        counter.set_counter(150);
        assert_eq!(counter.calculate_weight().weight, 0);

        // An empty window averages to zero.
        let calculation = counter.calculate_weight();
        assert_eq!(calculation.load_sample, 0);
        assert_eq!(calculation.weight, 3);
    }

    #[test]
    fn test_queue_capacity_bound_late() {
        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn WeightObserver> = Arc::<Recorder>::downgrade(&recorder);
        let counter = QueueSizeCounter::new(0, 0, 3, observer);

        counter.set_counter(500);
        assert_eq!(counter.weight(), 3, "unbound queue is healthy");

        counter.bind_capacity(400);
        assert_eq!(counter.capacity(), 400);
        assert_eq!(counter.weight(), 0);
        assert_eq!(recorder.taken(), vec![(Dimension::QueueSize, 0, 500)]);
    }

    #[test]
    fn test_disabled_counter_ignores_everything() {
        let counter = DisabledCounter::new(Dimension::ResponseTime, 3);
        counter.increment();
        counter.set_counter(u64::MAX);
        let calculation = counter.calculate_weight();
        assert_eq!(calculation.weight, 3);
        assert!(!calculation.changed);
        assert!(counter.current_state().contains("disabled"));
    }

    #[test]
    fn test_dropped_observer_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn WeightObserver> = Arc::<Recorder>::downgrade(&recorder);
        let counter = AppSessionsCounter::new(1, 0, 3, observer);
        drop(recorder);
        counter.increment();
        assert_eq!(counter.weight(), 0);
    }
}
