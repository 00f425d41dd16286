//! # Performance Manager
//!
//! The orchestrator of the monitoring and overload-control loop.
//!
//! ## Life cycle
//!
//! `Uninitialized -> Initialized -> Running -> Stopped`. [`PerformanceMgr::init`]
//! reads the configuration and builds the counter set. Timers move the
//! manager to `Running`; [`PerformanceMgr::stop_timers`] moves it to
//! `Stopped`. Events arriving outside `Initialized`/`Running` are dropped.
//!
//! ## Periodic tasks
//!
//! - **weight recalculation** (`loadUpdatePeriod`, only with overload
//!   protection on): [`PerformanceMgr::recalculate_weights`].
//! - **cached clock** refresh (`timerServiceGranularity`): created by `init`.
//!   Until it runs, response times are measured against the system clock.
//! - **statistics flush** (`statUpdateRange`): created once both the
//!   configuration and a [`PmiListener`] are present, whichever arrives last.
//!
//! ## Locking
//!
//! The monitor mutex guards the windowed accumulators and the last published
//! weight. It may be held while taking a counter's lock or the load manager's
//! lock, never the other way round. Counters report weight changes through
//! [`WeightObserver`] after releasing their own lock, so event methods release
//! the monitor before touching a counter. Gauges and unrelated counts are
//! plain atomics.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::configs::PerfConfig;
use crate::core::applications::{decrement_floor, AppIndex, LoadedApplicationsContainer};
use crate::core::cached_time::CachedClock;
use crate::core::counters::{
    AppSessionsCounter, DisabledCounter, MessageRateCounter, QueueSizeCounter, ResponseTimeCounter,
};
use crate::core::load_manager::LoadManager;
use crate::core::pmi::{normalize_rate, PmiListener, PmiSnapshot, QueueStatistics, TaskDurationStats};
use crate::core::scheduler::{PeriodicScheduler, TaskHandle};
use crate::core::weighable::{Dimension, Weighable, Weight, WeightObserver};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Life-cycle state of a [`PerformanceMgr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PerfState {
    /// Created, waiting for [`PerformanceMgr::init`].
    Uninitialized = 0,
    /// Configured, no timer running yet.
    Initialized = 1,
    /// At least one periodic task is scheduled.
    Running = 2,
    /// Timers cancelled; events are dropped.
    Stopped = 3,
}

impl PerfState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PerfState::Uninitialized,
            1 => PerfState::Initialized,
            2 => PerfState::Running,
            _ => PerfState::Stopped,
        }
    }
}

impl fmt::Display for PerfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The fixed counter set, one entry per [`Dimension`] in scan order.
struct Counters {
    load: Vec<Arc<dyn Weighable>>,
    queue: Option<Arc<QueueSizeCounter>>,
}

impl Counters {
    fn build(config: &PerfConfig, observer: Weak<dyn WeightObserver>) -> Self {
        let max_weight = config.max_weight;
        let lwm = config.low_water_mark_size;
        let mut load: Vec<Arc<dyn Weighable>> = Vec::with_capacity(Dimension::ALL.len());

        if !config.overload_protection_enabled {
            for dimension in Dimension::ALL {
                load.push(Arc::new(DisabledCounter::new(dimension, max_weight)));
            }
            return Self { load, queue: None };
        }

        load.push(Arc::new(AppSessionsCounter::new(
            config.max_app_sessions,
            lwm,
            max_weight,
            observer.clone(),
        )));
        load.push(Arc::new(MessageRateCounter::new(
            config.max_message_rate,
            lwm,
            max_weight,
            config.averaging_period,
            config.load_update_period,
            observer.clone(),
        )));
        if config.response_time_disabled() {
            load.push(Arc::new(DisabledCounter::new(Dimension::ResponseTime, max_weight)));
        } else {
            load.push(Arc::new(ResponseTimeCounter::new(
                config.max_response_time,
                lwm,
                max_weight,
                observer.clone(),
            )));
        }
        let queue = Arc::new(QueueSizeCounter::new(config.max_queue_size, lwm, max_weight, observer));
        load.push(queue.clone());

        Self {
            load,
            queue: Some(queue),
        }
    }

    fn get(&self, dimension: Dimension) -> &dyn Weighable {
        self.load[dimension.index()].as_ref()
    }

    /// Worst current weight without recalculating, ties to the first dimension.
    fn current_worst(&self) -> Option<(Weight, Dimension, u64)> {
        let mut worst: Option<(Weight, Dimension, u64)> = None;
        for counter in &self.load {
            let weight = counter.weight();
            if worst.map_or(true, |(w, _, _)| weight < w) {
                worst = Some((weight, counter.dimension(), counter.load_sample()));
            }
        }
        worst
    }
}

#[derive(Debug, Default)]
struct Accumulators {
    received_messages: u64,
    new_app_sessions: u64,
    response_time_total_ms: u64,
    response_samples: u64,
    queue_peak: Option<u64>,
    queue_min: Option<u64>,
    task_duration: TaskDurationStats,
}

#[derive(Debug, Default)]
struct Monitor {
    window: Accumulators,
    published: Option<(Weight, Dimension)>,
}

#[derive(Default)]
struct Timers {
    load: Option<TaskHandle>,
    statistics: Option<TaskHandle>,
    clock: Option<TaskHandle>,
}

/// # Performance Manager
///
/// Created with [`PerformanceMgr::new`] and shared as `Arc<PerformanceMgr>`
/// between the protocol layer, the periodic tasks and the admin surface.
pub struct PerformanceMgr {
    self_ref: Weak<PerformanceMgr>,
    load_manager: Arc<LoadManager>,
    applications: Arc<LoadedApplicationsContainer>,
    scheduler: Option<PeriodicScheduler>,
    clock: Arc<CachedClock>,
    clock_ticking: AtomicBool,
    config: OnceLock<PerfConfig>,
    counters: OnceLock<Counters>,
    state: AtomicU8,
    monitor: Mutex<Monitor>,
    timers: Mutex<Timers>,
    listener: RwLock<Option<Arc<dyn PmiListener>>>,
    rejected_messages: AtomicU64,
    sip_timer_invocations: AtomicU64,
    sip_sessions: AtomicU64,
    app_sessions: AtomicU64,
    not_replicated_sip_sessions: AtomicU64,
    active_invocations: AtomicU64,
    last_queue_size: AtomicU64,
    queue_capacity: AtomicU64,
}

impl PerformanceMgr {
    /// Creates an uninitialised manager.
    ///
    /// Without a scheduler nothing runs periodically; the host drives
    /// [`PerformanceMgr::recalculate_weights`] and
    /// [`PerformanceMgr::flush_statistics`] itself.
    pub fn new(
        load_manager: Arc<LoadManager>,
        applications: Arc<LoadedApplicationsContainer>,
        scheduler: Option<PeriodicScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            load_manager,
            applications,
            scheduler,
            clock: Arc::new(CachedClock::new()),
            clock_ticking: AtomicBool::new(false),
            config: OnceLock::new(),
            counters: OnceLock::new(),
            state: AtomicU8::new(PerfState::Uninitialized as u8),
            monitor: Mutex::new(Monitor::default()),
            timers: Mutex::new(Timers::default()),
            listener: RwLock::new(None),
            rejected_messages: AtomicU64::new(0),
            sip_timer_invocations: AtomicU64::new(0),
            sip_sessions: AtomicU64::new(0),
            app_sessions: AtomicU64::new(0),
            not_replicated_sip_sessions: AtomicU64::new(0),
            active_invocations: AtomicU64::new(0),
            last_queue_size: AtomicU64::new(0),
            queue_capacity: AtomicU64::new(0),
        })
    }

    /// Applies `config` and builds the counter set. Only the first call has
    /// any effect; later calls are logged and ignored.
    pub fn init(&self, config: PerfConfig) {
        let config = config.normalized();
        if self.config.set(config.clone()).is_err() {
            warn!("Performance manager already initialised, ignoring new configuration");
            return;
        }

        let observer: Weak<dyn WeightObserver> = self.self_ref.clone();
        let _ = self.counters.set(Counters::build(&config, observer));
        self.queue_capacity.store(config.max_queue_size, Ordering::Relaxed);
        self.applications
            .set_task_duration_monitoring(config.task_duration_monitoring);

        let _ = self.state.compare_exchange(
            PerfState::Uninitialized as u8,
            PerfState::Initialized as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            protection = config.overload_protection_enabled,
            response_time_disabled = config.response_time_disabled(),
            "Performance manager initialised"
        );
        debug!("{config}");

        self.start_clock_timer(&config);
        if config.overload_protection_enabled {
            self.start_load_timer(&config);
        }
        self.start_statistics_timers();
    }

    fn start_clock_timer(&self, config: &PerfConfig) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let mut timers = lock(&self.timers);
        if timers.clock.is_some() || self.state() == PerfState::Stopped {
            return;
        }
        self.clock.refresh();
        let clock = Arc::clone(&self.clock);
        timers.clock = Some(scheduler.schedule_at_fixed_rate(
            "cached-clock",
            Duration::from_millis(config.timer_service_granularity),
            move || {
                clock.refresh();
                ControlFlow::Continue(())
            },
        ));
        self.clock_ticking.store(true, Ordering::Release);
        self.mark_running();
    }

    /// The cached time while the clock task runs, the system time otherwise.
    fn now_millis(&self) -> u64 {
        if self.clock_ticking.load(Ordering::Acquire) {
            self.clock.now_millis()
        } else {
            self.clock.refresh()
        }
    }

    fn start_load_timer(&self, config: &PerfConfig) {
        let Some(scheduler) = &self.scheduler else {
            debug!("No scheduler, weight recalculation is driven by the host");
            return;
        };
        let mut timers = lock(&self.timers);
        if timers.load.is_some() || self.state() == PerfState::Stopped {
            return;
        }
        let this = self.self_ref.clone();
        timers.load = Some(scheduler.schedule_at_fixed_rate(
            "weight-recalculation",
            Duration::from_millis(config.load_update_period),
            move || match this.upgrade() {
                Some(mgr) => {
                    mgr.recalculate_weights();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            },
        ));
        self.mark_running();
    }

    /// Creates the statistics task once the configuration and a listener are
    /// both present.
    ///
    /// Returns `true` only for the call that created them.
    pub fn start_statistics_timers(&self) -> bool {
        let Some(config) = self.config.get() else {
            return false;
        };
        if self.listener().is_none() {
            return false;
        }
        let Some(scheduler) = &self.scheduler else {
            return false;
        };

        let mut timers = lock(&self.timers);
        if timers.statistics.is_some() || self.state() == PerfState::Stopped {
            return false;
        }

        let this = self.self_ref.clone();
        timers.statistics = Some(scheduler.schedule_at_fixed_rate(
            "statistics-flush",
            Duration::from_millis(config.stat_update_range),
            move || match this.upgrade() {
                Some(mgr) => {
                    mgr.flush_statistics();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            },
        ));
        self.mark_running();
        info!(
            stat_update_range_ms = config.stat_update_range,
            "Statistics timers started"
        );
        true
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            PerfState::Initialized as u8,
            PerfState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Cancels every periodic task and moves to `Stopped`. Safe to repeat.
    pub fn stop_timers(&self) {
        let mut timers = lock(&self.timers);
        self.state.store(PerfState::Stopped as u8, Ordering::Release);
        self.clock_ticking.store(false, Ordering::Release);
        for handle in [timers.load.take(), timers.statistics.take(), timers.clock.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
            debug!(task = handle.name(), "Timer cancelled");
        }
        info!("Performance manager timers stopped");
    }

    /// Attaches the monitoring sink and starts the statistics timers if the
    /// manager is already configured.
    pub fn set_pmi_listener(&self, listener: Arc<dyn PmiListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        self.start_statistics_timers();
    }

    /// Detaches the monitoring sink. Windows keep being flushed and dropped.
    pub fn remove_pmi_listener(&self) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn listener(&self) -> Option<Arc<dyn PmiListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn monitor(&self) -> MutexGuard<'_, Monitor> {
        lock(&self.monitor)
    }

    fn publish(&self, monitor: &mut Monitor, weight: Weight, dimension: Dimension, load_sample: u64) {
        let unchanged = matches!(monitor.published, Some((published, _)) if published == weight);
        monitor.published = Some((weight, dimension));
        if !unchanged {
            debug!(weight, dimension = %dimension, load_sample, "Publishing server weight");
            self.load_manager
                .update_new_weight(dimension, weight, load_sample);
        }
    }

    /// Recalculates every counter and publishes the worst weight if it differs
    /// from the last published one. Ties go to the first dimension in scan
    /// order.
    ///
    /// Returns the worst weight and its dimension, `None` before `init`.
    pub fn recalculate_weights(&self) -> Option<(Weight, Dimension)> {
        let counters = self.counters.get()?;
        let mut monitor = self.monitor();
        let mut worst: Option<(Weight, Dimension, u64)> = None;
        for counter in &counters.load {
            let calculation = counter.calculate_weight();
            if worst.map_or(true, |(w, _, _)| calculation.weight < w) {
                worst = Some((calculation.weight, counter.dimension(), calculation.load_sample));
            }
        }
        let (weight, dimension, load_sample) = worst?;
        self.publish(&mut monitor, weight, dimension, load_sample);
        Some((weight, dimension))
    }

    /// Reacts to a single counter's weight change between recalculations.
    ///
    /// A weight worse than the published one is published at once. A better
    /// weight from the dimension holding the published weight triggers a
    /// re-evaluation of all counters. Anything else waits for the next
    /// recalculation.
    pub fn set_new_weight(&self, dimension: Dimension, weight: Weight, load_sample: u64) {
        let Some(counters) = self.counters.get() else {
            return;
        };
        let max_weight = self.load_manager.config().max_weight;
        let mut monitor = self.monitor();
        let (published, holder) = match monitor.published {
            Some((w, d)) => (w, Some(d)),
            None => (max_weight, None),
        };

        if weight < published {
            self.publish(&mut monitor, weight, dimension, load_sample);
        } else if weight > published && holder == Some(dimension) {
            if let Some((worst, worst_dimension, sample)) = counters.current_worst() {
                self.publish(&mut monitor, worst, worst_dimension, sample);
            }
        }
    }

    /// Flushes the statistics window: builds a [`PmiSnapshot`], hands it to
    /// the listener if one is attached, and starts a new window.
    ///
    /// Returns the snapshot, `None` before `init`.
    pub fn flush_statistics(&self) -> Option<PmiSnapshot> {
        let config = self.config.get()?;
        let window = std::mem::take(&mut self.monitor().window);
        let rejected_messages = self.rejected_messages.swap(0, Ordering::Relaxed);
        let sip_timer_invocations = self.sip_timer_invocations.swap(0, Ordering::Relaxed);

        let range = config.stat_update_range;
        let averaging = config.averaging_period;
        let depth = self.last_queue_size.load(Ordering::Relaxed);
        let peak = window.queue_peak.unwrap_or(depth);
        let capacity = self.queue_capacity.load(Ordering::Relaxed);
        let queue = QueueStatistics {
            peak,
            min: window.queue_min.unwrap_or(depth),
            percent_full: if capacity == 0 {
                0
            } else {
                peak.saturating_mul(100) / capacity
            },
        };

        let snapshot = PmiSnapshot {
            taken_at: Utc::now(),
            server_weight: self.load_manager.current_weight(),
            overloaded: self.load_manager.is_overloaded(),
            overloaded_dimension: self.load_manager.overloaded_dimension(),
            sip_sessions: self.sip_sessions.load(Ordering::Relaxed),
            app_sessions: self.app_sessions.load(Ordering::Relaxed),
            not_replicated_sip_sessions: self.not_replicated_sip_sessions.load(Ordering::Relaxed),
            received_messages_rate: normalize_rate(window.received_messages, averaging, range),
            new_app_sessions_rate: normalize_rate(window.new_app_sessions, averaging, range),
            average_response_time_ms: match window.response_samples {
                0 => 0,
                n => window.response_time_total_ms / n,
            },
            rejected_messages,
            sip_timer_invocations,
            active_invocations: self.active_invocations.load(Ordering::Relaxed),
            queue,
            task_duration: window.task_duration,
            applications: self.applications.update_pmi(),
        };

        if let Some(listener) = self.listener() {
            listener.update_counters(&snapshot);
        }
        Some(snapshot)
    }

    fn accepting(&self, event: &'static str) -> bool {
        match self.state() {
            PerfState::Initialized | PerfState::Running => true,
            state => {
                debug!(event, state = %state, "Performance manager not active, event dropped");
                false
            }
        }
    }

    fn counter(&self, dimension: Dimension) -> Option<&dyn Weighable> {
        self.counters.get().map(|counters| counters.get(dimension))
    }

    /// An inbound request arrived.
    pub fn request_received(&self) {
        self.message_received("request_received");
    }

    /// An inbound response arrived.
    pub fn response_received(&self) {
        self.message_received("response_received");
    }

    fn message_received(&self, event: &'static str) {
        if !self.accepting(event) {
            return;
        }
        self.monitor().window.received_messages += 1;
        if let Some(counter) = self.counter(Dimension::MessageRate) {
            counter.increment();
        }
    }

    /// A response was sent for a request that arrived at `arrival_ms`
    /// (milliseconds since the Unix epoch).
    pub fn response_sent(&self, arrival_ms: u64) {
        if !self.accepting("response_sent") {
            return;
        }
        let elapsed = self.now_millis().saturating_sub(arrival_ms);
        {
            let mut monitor = self.monitor();
            monitor.window.response_time_total_ms =
                monitor.window.response_time_total_ms.saturating_add(elapsed);
            monitor.window.response_samples += 1;
        }
        if let Some(counter) = self.counter(Dimension::ResponseTime) {
            counter.set_counter(elapsed);
        }
    }

    /// A SIP session was created for application `name`. The container-wide
    /// gauge moves even for an unknown application.
    pub fn sip_session_created(&self, name: &str, index: Option<AppIndex>) {
        if !self.accepting("sip_session_created") {
            return;
        }
        self.sip_sessions.fetch_add(1, Ordering::Relaxed);
        self.applications.sip_session_created(name, index);
    }

    /// A SIP session of application `name` ended.
    pub fn sip_session_destroyed(&self, name: &str, index: Option<AppIndex>) {
        if !self.accepting("sip_session_destroyed") {
            return;
        }
        decrement_floor(&self.sip_sessions);
        self.applications.sip_session_destroyed(name, index);
    }

    /// A SIP application session was created for application `name`.
    ///
    /// The container-wide gauge and the app-sessions counter move even when
    /// `name`/`index` match no loaded application; only the per-application
    /// update is skipped.
    pub fn sip_app_session_created(&self, name: &str, index: Option<AppIndex>) {
        if !self.accepting("sip_app_session_created") {
            return;
        }
        self.app_sessions.fetch_add(1, Ordering::Relaxed);
        self.monitor().window.new_app_sessions += 1;
        if let Some(counter) = self.counter(Dimension::AppSessions) {
            counter.increment();
        }
        self.applications.sip_app_session_created(name, index);
    }

    /// A SIP application session of application `name` ended.
    ///
    /// Like [`PerformanceMgr::sip_app_session_created`], an unknown
    /// application still updates the container-wide gauge and counter.
    pub fn sip_app_session_destroyed(&self, name: &str, index: Option<AppIndex>) {
        if !self.accepting("sip_app_session_destroyed") {
            return;
        }
        decrement_floor(&self.app_sessions);
        if let Some(counter) = self.counter(Dimension::AppSessions) {
            counter.decrement();
        }
        self.applications.sip_app_session_destroyed(name, index);
    }

    /// Application `name` received a request.
    pub fn in_request(&self, name: &str, index: Option<AppIndex>, method: &str) {
        if self.accepting("in_request") {
            self.applications.in_request(name, index, method);
        }
    }

    /// Application `name` sent a request.
    pub fn out_request(&self, name: &str, index: Option<AppIndex>, method: &str) {
        if self.accepting("out_request") {
            self.applications.out_request(name, index, method);
        }
    }

    /// Application `name` received a response.
    pub fn in_response(&self, name: &str, index: Option<AppIndex>, status: u16) {
        if self.accepting("in_response") {
            self.applications.in_response(name, index, status);
        }
    }

    /// Application `name` sent a response.
    pub fn out_response(&self, name: &str, index: Option<AppIndex>, status: u16) {
        if self.accepting("out_response") {
            self.applications.out_response(name, index, status);
        }
    }

    /// An application invocation started.
    pub fn increment_invoke_counter(&self) {
        if self.accepting("increment_invoke_counter") {
            self.active_invocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// An application invocation finished.
    pub fn decrement_invoke_counter(&self) {
        if self.accepting("decrement_invoke_counter") {
            decrement_floor(&self.active_invocations);
        }
    }

    /// The outbound queue now holds `size` entries.
    pub fn set_queue_size(&self, size: u64) {
        if !self.accepting("set_queue_size") {
            return;
        }
        self.last_queue_size.store(size, Ordering::Relaxed);
        {
            let mut monitor = self.monitor();
            let window = &mut monitor.window;
            window.queue_peak = Some(window.queue_peak.map_or(size, |peak| peak.max(size)));
            window.queue_min = Some(window.queue_min.map_or(size, |min| min.min(size)));
        }
        if let Some(counter) = self.counter(Dimension::QueueSize) {
            counter.set_counter(size);
        }
    }

    /// Binds the outbound queue capacity once the transport knows it.
    pub fn bind_queue_capacity(&self, capacity: u64) {
        self.queue_capacity.store(capacity, Ordering::Relaxed);
        if let Some(queue) = self.counters.get().and_then(|c| c.queue.as_ref()) {
            queue.bind_capacity(capacity);
        }
        debug!(capacity, "Queue capacity bound");
    }

    /// A message was refused while overloaded.
    pub fn update_rejected_messages_counter(&self) {
        if self.accepting("update_rejected_messages_counter") {
            self.rejected_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A SIP timer fired.
    pub fn update_sip_timers_invocations_counter(&self) {
        if self.accepting("update_sip_timers_invocations_counter") {
            self.sip_timer_invocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A SIP session is waiting for replication.
    pub fn increment_not_replicated_sip_sessions_counter(&self) {
        if self.accepting("increment_not_replicated_sip_sessions_counter") {
            self.not_replicated_sip_sessions
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A SIP session finished replicating.
    pub fn decrement_not_replicated_sip_sessions_counter(&self) {
        if self.accepting("decrement_not_replicated_sip_sessions_counter") {
            decrement_floor(&self.not_replicated_sip_sessions);
        }
    }

    /// An application task of `name` took `duration_ms`.
    ///
    /// Always counted for the container; counted for the application only
    /// while task-duration monitoring is on.
    pub fn update_task_duration(&self, name: &str, index: Option<AppIndex>, duration_ms: u64) {
        if !self.accepting("update_task_duration") {
            return;
        }
        self.monitor().window.task_duration.record(duration_ms);
        self.applications
            .update_application_task_duration_statistics(name, index, duration_ms);
    }

    /// The published server weight.
    pub fn current_server_weight(&self) -> Weight {
        self.load_manager.current_weight()
    }

    /// Whether the server is declared overloaded.
    pub fn is_overload(&self) -> bool {
        self.load_manager.is_overloaded()
    }

    /// The dimension that caused the current overload.
    pub fn overloaded_dimension(&self) -> Option<Dimension> {
        self.load_manager.overloaded_dimension()
    }

    /// Whether a monitoring sink is attached.
    pub fn is_pmi_enabled(&self) -> bool {
        self.listener().is_some()
    }

    /// One diagnostic line per counter, in scan order.
    pub fn counter_states(&self) -> Vec<String> {
        self.counters
            .get()
            .map(|counters| counters.load.iter().map(|c| c.current_state()).collect())
            .unwrap_or_default()
    }

    /// Current life-cycle state.
    pub fn state(&self) -> PerfState {
        PerfState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The configuration in force, `None` before `init`.
    pub fn config(&self) -> Option<&PerfConfig> {
        self.config.get()
    }

    /// The cached clock used for response-time measurement. Without a
    /// scheduler it is refreshed on every measurement.
    pub fn clock(&self) -> &CachedClock {
        &self.clock
    }

    /// The load manager this orchestrator publishes to.
    pub fn load_manager(&self) -> &Arc<LoadManager> {
        &self.load_manager
    }

    /// The application registry events are routed to.
    pub fn applications(&self) -> &Arc<LoadedApplicationsContainer> {
        &self.applications
    }
}

impl WeightObserver for PerformanceMgr {
    fn weight_changed(&self, dimension: Dimension, weight: Weight, load_sample: u64) {
        self.set_new_weight(dimension, weight, load_sample);
    }
}

impl fmt::Display for PerformanceMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PerformanceMgr")?;
        writeln!(f, "    State: {},", self.state())?;
        writeln!(f, "    Server weight: {},", self.current_server_weight())?;
        writeln!(f, "    Overloaded: {},", self.is_overload())?;
        for line in self.counter_states() {
            writeln!(f, "    {line},")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::applications::AppDescriptor;
    use crate::core::cached_time::system_millis;
    use crate::core::load_manager::LoadManagerConfig;

    fn manager(config: &PerfConfig, scheduler: Option<PeriodicScheduler>) -> Arc<PerformanceMgr> {
        let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(config)));
        let applications = Arc::new(LoadedApplicationsContainer::new());
        let mgr = PerformanceMgr::new(load_manager, applications, scheduler);
        mgr.init(config.clone());
        mgr
    }

    fn small_config() -> PerfConfig {
        PerfConfig {
            max_app_sessions: 10,
            max_message_rate: 10,
            max_queue_size: 10,
            low_water_mark_size: 1,
            ..PerfConfig::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<PmiSnapshot>>,
    }

    impl PmiListener for Recorder {
        fn update_counters(&self, snapshot: &PmiSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.snapshots.lock().unwrap().len()
        }
    }

    #[test]
    fn test_worst_weight_wins_ties_to_first_dimension() {
        let mgr = manager(&small_config(), None);
        for _ in 0..5 {
            mgr.sip_app_session_created("A", None);
        }
        mgr.set_queue_size(5);
        assert_eq!(mgr.recalculate_weights(), Some((2, Dimension::AppSessions)));
        assert_eq!(mgr.current_server_weight(), 2);

        mgr.set_queue_size(10);
        assert!(mgr.is_overload(), "worsening is published without a recalculation");
        assert_eq!(mgr.overloaded_dimension(), Some(Dimension::QueueSize));
        assert_eq!(mgr.recalculate_weights(), Some((0, Dimension::QueueSize)));
    }

    #[test]
    fn test_overload_enters_and_clears_once() {
        let config = PerfConfig {
            max_app_sessions: 2,
            low_water_mark_size: 1,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        for _ in 0..3 {
            mgr.sip_app_session_created("A", None);
        }
        mgr.recalculate_weights();
        assert_eq!(mgr.current_server_weight(), 0);
        assert!(mgr.is_overload());

        for _ in 0..3 {
            mgr.sip_app_session_destroyed("A", None);
        }
        mgr.recalculate_weights();
        assert!(!mgr.is_overload());
        assert_eq!(mgr.load_manager().transitions().entered, 1);
        assert_eq!(mgr.load_manager().transitions().cleared, 1);
    }

    #[test]
    fn test_improvement_by_non_holder_waits_for_recalculation() {
        let mgr = manager(&small_config(), None);
        mgr.set_queue_size(9);
        assert_eq!(mgr.current_server_weight(), 1);

        for _ in 0..5 {
            mgr.sip_app_session_created("A", None);
        }
        // App sessions at weight 2 are better than the published 1.
        assert_eq!(mgr.current_server_weight(), 1);

        mgr.set_queue_size(0);
        assert_eq!(mgr.current_server_weight(), 2, "holder improved, re-evaluated");
        assert_eq!(
            mgr.load_manager().last_publication().map(|(d, _)| d),
            Some(Dimension::AppSessions)
        );
    }

    #[test]
    fn test_disabled_response_time_never_counts() {
        let config = PerfConfig {
            max_response_time: 0,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        let now = mgr.clock().now_millis();
        for _ in 0..10 {
            mgr.response_sent(now.saturating_sub(60_000));
        }
        assert_eq!(mgr.recalculate_weights(), Some((3, Dimension::AppSessions)));
        assert!(!mgr.is_overload());
        assert!(mgr.counter_states()[Dimension::ResponseTime.index()].contains("disabled"));

        let snapshot = mgr.flush_statistics().unwrap();
        assert!(snapshot.average_response_time_ms >= 60_000);
    }

    #[test]
    fn test_response_time_counter_drives_weight() {
        let config = PerfConfig {
            max_response_time: 100,
            low_water_mark_size: 1,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        let now = mgr.clock().now_millis();
        mgr.response_sent(now - 50);
        assert_eq!(mgr.recalculate_weights(), Some((2, Dimension::ResponseTime)));
    }

    #[test]
    fn test_protection_off_disables_every_counter() {
        let config = PerfConfig {
            max_app_sessions: 1,
            overload_protection_enabled: false,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        for _ in 0..10 {
            mgr.sip_app_session_created("A", None);
        }
        mgr.set_queue_size(u64::MAX);
        mgr.recalculate_weights();
        assert!(!mgr.is_overload());
        assert!(mgr.counter_states().iter().all(|s| s.contains("disabled")));
    }

    #[test]
    fn test_flush_normalizes_rates_and_resets_window() {
        let config = PerfConfig {
            stat_update_range: 5000,
            averaging_period: 3000,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        let recorder = Arc::new(Recorder::default());
        mgr.set_pmi_listener(recorder.clone());
        assert!(mgr.is_pmi_enabled());

        for _ in 0..1000 {
            mgr.request_received();
        }
        mgr.update_rejected_messages_counter();
        mgr.update_sip_timers_invocations_counter();
        mgr.increment_invoke_counter();
        mgr.set_queue_size(800);
        mgr.set_queue_size(400);

        let snapshot = mgr.flush_statistics().unwrap();
        assert_eq!(snapshot.received_messages_rate, 600);
        assert_eq!(snapshot.rejected_messages, 1);
        assert_eq!(snapshot.sip_timer_invocations, 1);
        assert_eq!(snapshot.active_invocations, 1);
        assert_eq!(snapshot.queue, QueueStatistics { peak: 800, min: 400, percent_full: 25 });
        assert_eq!(recorder.count(), 1);

        let snapshot = mgr.flush_statistics().unwrap();
        assert_eq!(snapshot.received_messages_rate, 0);
        assert_eq!(snapshot.rejected_messages, 0);
        assert_eq!(snapshot.active_invocations, 1, "gauges survive the flush");
        assert_eq!(snapshot.queue.peak, 400);

        mgr.remove_pmi_listener();
        mgr.flush_statistics();
        assert_eq!(recorder.count(), 2);
    }

    #[test]
    fn test_events_before_init_are_dropped() {
        let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::default()));
        let mgr = PerformanceMgr::new(load_manager, Arc::new(LoadedApplicationsContainer::new()), None);
        assert_eq!(mgr.state(), PerfState::Uninitialized);
        assert!(mgr.flush_statistics().is_none());
        assert!(mgr.recalculate_weights().is_none());

        mgr.request_received();
        mgr.sip_app_session_created("A", None);
        mgr.init(PerfConfig::default());
        assert_eq!(mgr.state(), PerfState::Initialized);

        let snapshot = mgr.flush_statistics().unwrap();
        assert_eq!(snapshot.app_sessions, 0);
        assert_eq!(snapshot.new_app_sessions_rate, 0);
    }

    #[test]
    fn test_second_init_is_ignored() {
        let mgr = manager(&small_config(), None);
        mgr.init(PerfConfig::default());
        assert_eq!(mgr.config().map(|c| c.max_app_sessions), Some(10));
    }

    #[test]
    fn test_application_events_reach_registry() {
        let mgr = manager(&PerfConfig {
            task_duration_monitoring: true,
            ..PerfConfig::default()
        }, None);
        let descriptor = AppDescriptor::new("AppA");
        let index = mgr.applications().app_loaded("AppA", &descriptor);

        mgr.sip_session_created("AppA", index);
        mgr.sip_app_session_created("AppA", index);
        mgr.in_request("AppA", index, "INVITE");
        mgr.out_response("AppA", index, 200);
        mgr.update_task_duration("AppA", index, 40);
        mgr.update_task_duration("Ghost", None, 20);

        let snapshot = mgr.flush_statistics().unwrap();
        assert_eq!(snapshot.sip_sessions, 1);
        assert_eq!(snapshot.task_duration.count, 2);
        let app = &snapshot.applications[0];
        assert_eq!(app.name, "AppA");
        assert_eq!(app.in_requests.get("INVITE"), Some(&1));
        assert_eq!(app.out_responses.get(&200), Some(&1));
        assert_eq!(app.task_duration.total_ms, 40);
    }

    #[test]
    fn test_late_bound_queue_capacity() {
        let config = PerfConfig {
            max_queue_size: 0,
            low_water_mark_size: 1,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        mgr.set_queue_size(50);
        assert_eq!(mgr.recalculate_weights(), Some((3, Dimension::AppSessions)));

        mgr.bind_queue_capacity(50);
        assert!(mgr.is_overload());
        assert_eq!(mgr.overloaded_dimension(), Some(Dimension::QueueSize));
        assert_eq!(mgr.flush_statistics().unwrap().queue.percent_full, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_timer_created_once_listener_first() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::default()));
        let mgr = PerformanceMgr::new(load_manager, Arc::new(LoadedApplicationsContainer::new()), Some(scheduler));
        let recorder = Arc::new(Recorder::default());

        mgr.set_pmi_listener(recorder.clone());
        assert_eq!(mgr.state(), PerfState::Uninitialized);
        mgr.init(PerfConfig {
            stat_update_range: 1000,
            ..PerfConfig::default()
        });
        assert_eq!(mgr.state(), PerfState::Running);
        mgr.set_pmi_listener(recorder.clone());
        assert!(!mgr.start_statistics_timers());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(recorder.count(), 3);

        mgr.stop_timers();
        mgr.stop_timers();
        assert_eq!(mgr.state(), PerfState::Stopped);
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(recorder.count(), 3);
        assert!(!mgr.start_statistics_timers());
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_timer_created_once_config_first() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let mgr = manager(
            &PerfConfig {
                stat_update_range: 1000,
                ..PerfConfig::default()
            },
            Some(scheduler),
        );
        assert_eq!(mgr.state(), PerfState::Running, "weight recalculation is scheduled");
        assert!(!mgr.start_statistics_timers(), "no listener yet");

        let recorder = Arc::new(Recorder::default());
        mgr.set_pmi_listener(recorder.clone());
        assert!(!mgr.start_statistics_timers());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(recorder.count(), 2);
        mgr.stop_timers();
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_timer_publishes_overload() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let mgr = manager(
            &PerfConfig {
                max_message_rate: 100,
                load_update_period: 1000,
                averaging_period: 1000,
                ..PerfConfig::default()
            },
            Some(scheduler),
        );
        for _ in 0..99 {
            mgr.request_received();
        }
        assert!(!mgr.is_overload());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(mgr.current_server_weight(), 1);

        for _ in 0..40 {
            mgr.request_received();
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(mgr.current_server_weight(), 1, "held by the low water mark");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(mgr.current_server_weight(), 3, "an idle window recovers");
        mgr.stop_timers();
    }

    #[test]
    fn test_app_session_overload_clears_with_default_band() {
        let config = PerfConfig {
            max_app_sessions: 50,
            ..PerfConfig::default()
        };
        assert!(config.low_water_mark_size >= config.max_app_sessions);
        let mgr = manager(&config, None);
        for _ in 0..50 {
            mgr.sip_app_session_created("A", None);
        }
        mgr.recalculate_weights();
        assert!(mgr.is_overload());

        for _ in 0..50 {
            mgr.sip_app_session_destroyed("A", None);
        }
        mgr.recalculate_weights();
        assert!(!mgr.is_overload());
        assert_eq!(mgr.current_server_weight(), 3);
    }

    #[test]
    fn test_unknown_application_still_moves_container_gauges() {
        let mgr = manager(&small_config(), None);
        let descriptor = AppDescriptor::new("AppA");
        mgr.applications().app_loaded("AppA", &descriptor);

        for _ in 0..5 {
            mgr.sip_app_session_created("Ghost", Some(AppIndex(9)));
            mgr.sip_session_created("Ghost", None);
        }
        assert_eq!(mgr.recalculate_weights(), Some((2, Dimension::AppSessions)));

        let snapshot = mgr.flush_statistics().unwrap();
        assert_eq!(snapshot.app_sessions, 5);
        assert_eq!(snapshot.sip_sessions, 5);
        assert_eq!(snapshot.applications[0].app_sessions, 0);
        assert_eq!(snapshot.applications[0].sip_sessions, 0);
    }

    #[test]
    fn test_response_time_measured_against_system_clock() {
        let config = PerfConfig {
            max_response_time: 100,
            low_water_mark_size: 1,
            ..PerfConfig::default()
        };
        let mgr = manager(&config, None);
        let arrival = system_millis();
        std::thread::sleep(Duration::from_millis(300));
        mgr.response_sent(arrival);

        assert_eq!(mgr.recalculate_weights(), Some((0, Dimension::ResponseTime)));
        assert!(mgr.is_overload());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_task_runs_without_listener() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let mgr = manager(
            &PerfConfig {
                timer_service_granularity: 10,
                ..PerfConfig::default()
            },
            Some(scheduler),
        );
        assert!(!mgr.is_pmi_enabled());
        let arrival = system_millis();
        std::thread::sleep(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.clock().now_millis() >= arrival + 50);
        mgr.stop_timers();
    }
}
