//! # Loaded Applications Container
//!
//! Maps the index assigned to each loaded SIP application onto that
//! application's counter bundle ([`AppModule`]). Protocol events carry the
//! index, so routing them is a single map lookup.
//!
//! Every per-event method tolerates an unknown or missing index: the miss is
//! logged at debug level and the event is dropped. Monitoring never fails the
//! message it observes.
//!
//! The registry mutex is held only for lookups, registration changes and the
//! bulk [`LoadedApplicationsContainer::update_pmi`] walk. Module counters are
//! updated after the registry lock is released.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::pmi::{ApplicationSnapshot, TaskDurationStats};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements `counter` without wrapping below zero.
pub(crate) fn decrement_floor(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

/// Opaque key assigned to an application when it is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AppIndex(pub u32);

impl fmt::Display for AppIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # App Descriptor
///
/// The host's view of a deployed application. The container writes the
/// assigned index back here so later events can be routed without a name
/// lookup.
#[derive(Debug)]
pub struct AppDescriptor {
    name: String,
    app_index: Mutex<Option<AppIndex>>,
}

impl AppDescriptor {
    /// A descriptor that has not been loaded yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app_index: Mutex::new(None),
        }
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The index assigned by the last load, if any.
    pub fn app_index(&self) -> Option<AppIndex> {
        *lock(&self.app_index)
    }

    fn set_app_index(&self, index: AppIndex) {
        *lock(&self.app_index) = Some(index);
    }
}

#[derive(Debug, Default)]
struct TrafficWindow {
    in_requests: BTreeMap<String, u64>,
    out_requests: BTreeMap<String, u64>,
    in_responses: BTreeMap<u16, u64>,
    out_responses: BTreeMap<u16, u64>,
    task_duration: TaskDurationStats,
}

/// # App Module
///
/// Counters of one loaded application. Session gauges live for the life of
/// the module; traffic counts and task durations are windowed and reset by
/// [`AppModule::snapshot_and_reset`]. A destroyed module ignores further
/// events.
#[derive(Debug)]
pub struct AppModule {
    name: String,
    index: AppIndex,
    sip_sessions: AtomicU64,
    app_sessions: AtomicU64,
    traffic: Mutex<TrafficWindow>,
    destroyed: AtomicBool,
}

impl AppModule {
    fn new(name: &str, index: AppIndex) -> Self {
        Self {
            name: name.to_string(),
            index,
            sip_sessions: AtomicU64::new(0),
            app_sessions: AtomicU64::new(0),
            traffic: Mutex::new(TrafficWindow::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assigned index.
    pub fn index(&self) -> AppIndex {
        self.index
    }

    /// Live SIP sessions.
    pub fn sip_sessions(&self) -> u64 {
        self.sip_sessions.load(Ordering::Relaxed)
    }

    /// Live SIP application sessions.
    pub fn app_sessions(&self) -> u64 {
        self.app_sessions.load(Ordering::Relaxed)
    }

    /// Whether the module was unloaded.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn live(&self) -> bool {
        !self.is_destroyed()
    }

    /// Counts a new SIP session.
    pub fn sip_session_created(&self) {
        if self.live() {
            self.sip_sessions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts an ended SIP session.
    pub fn sip_session_destroyed(&self) {
        if self.live() {
            decrement_floor(&self.sip_sessions);
        }
    }

    /// Counts a new SIP application session.
    pub fn app_session_created(&self) {
        if self.live() {
            self.app_sessions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts an ended SIP application session.
    pub fn app_session_destroyed(&self) {
        if self.live() {
            decrement_floor(&self.app_sessions);
        }
    }

    /// Counts an inbound request.
    pub fn in_request(&self, method: &str) {
        self.update_traffic(|t| bump(&mut t.in_requests, method));
    }

    /// Counts an outbound request.
    pub fn out_request(&self, method: &str) {
        self.update_traffic(|t| bump(&mut t.out_requests, method));
    }

    /// Counts an inbound response.
    pub fn in_response(&self, status: u16) {
        self.update_traffic(|t| *t.in_responses.entry(status).or_default() += 1);
    }

    /// Counts an outbound response.
    pub fn out_response(&self, status: u16) {
        self.update_traffic(|t| *t.out_responses.entry(status).or_default() += 1);
    }

    /// Records how long one application task took.
    pub fn record_task_duration(&self, duration_ms: u64) {
        self.update_traffic(|t| t.task_duration.record(duration_ms));
    }

    fn update_traffic(&self, change: impl FnOnce(&mut TrafficWindow)) {
        if self.live() {
            change(&mut lock(&self.traffic));
        }
    }

    /// Returns the window's statistics and starts a new window.
    pub fn snapshot_and_reset(&self) -> ApplicationSnapshot {
        let window = std::mem::take(&mut *lock(&self.traffic));
        ApplicationSnapshot {
            name: self.name.clone(),
            index: self.index.0,
            sip_sessions: self.sip_sessions(),
            app_sessions: self.app_sessions(),
            in_requests: window.in_requests,
            out_requests: window.out_requests,
            in_responses: window.in_responses,
            out_responses: window.out_responses,
            task_duration: window.task_duration,
        }
    }

    /// Stops the module from accepting events and drops its window.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        *lock(&self.traffic) = TrafficWindow::default();
    }
}

fn bump(counts: &mut BTreeMap<String, u64>, method: &str) {
    match counts.get_mut(method) {
        Some(count) => *count += 1,
        None => {
            counts.insert(method.to_string(), 1);
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    modules: HashMap<AppIndex, Arc<AppModule>>,
    next_index: u32,
}

/// # Loaded Applications Container
///
/// Registry of [`AppModule`]s keyed by [`AppIndex`]. Indices are assigned
/// sequentially from 0 and never reused.
#[derive(Debug, Default)]
pub struct LoadedApplicationsContainer {
    registry: Mutex<Registry>,
    task_duration_monitoring: AtomicBool,
    task_duration_configured: AtomicBool,
}

impl LoadedApplicationsContainer {
    /// An empty registry with task-duration monitoring off.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    /// Registers `descriptor` and writes the assigned index back onto it.
    ///
    /// Returns the new index, or `None` when the descriptor's index is
    /// already registered (logged as a warning, nothing changes).
    pub fn app_loaded(&self, name: &str, descriptor: &AppDescriptor) -> Option<AppIndex> {
        let mut registry = self.registry();
        if let Some(existing) = descriptor.app_index() {
            if registry.modules.contains_key(&existing) {
                warn!(app = name, index = %existing, "Application already loaded, ignoring");
                return None;
            }
        }
        if registry.modules.is_empty() && self.task_duration_configured.load(Ordering::Relaxed) {
            self.task_duration_monitoring.store(true, Ordering::Relaxed);
        }
        let index = AppIndex(registry.next_index);
        registry.next_index += 1;
        registry.modules.insert(index, Arc::new(AppModule::new(name, index)));
        descriptor.set_app_index(index);
        info!(app = name, index = %index, "Application loaded");
        Some(index)
    }

    /// Removes and destroys the module at `index`.
    ///
    /// Pauses task-duration monitoring once the registry is empty; the next
    /// load resumes it if it is configured on. Returns whether a module was
    /// removed.
    pub fn app_unloaded(&self, name: &str, index: AppIndex) -> bool {
        let mut registry = self.registry();
        let Some(module) = registry.modules.remove(&index) else {
            debug!(app = name, index = %index, "Unload of unknown application");
            return false;
        };
        module.destroy();
        info!(app = name, index = %index, "Application unloaded");
        if registry.modules.is_empty() {
            self.task_duration_monitoring.store(false, Ordering::Relaxed);
            debug!("No applications loaded, task duration monitoring paused");
        }
        true
    }

    /// The module registered at `index`; `None` for a missing or unknown index.
    pub fn get_app_obj(&self, index: Option<AppIndex>) -> Option<Arc<AppModule>> {
        let index = index?;
        self.registry().modules.get(&index).cloned()
    }

    fn dispatch(&self, name: &str, index: Option<AppIndex>, event: &'static str, apply: impl FnOnce(&AppModule)) {
        match self.get_app_obj(index) {
            Some(module) => apply(&module),
            None => debug!(app = name, index = ?index, event, "No application module, event dropped"),
        }
    }

    /// Routes a SIP session creation.
    pub fn sip_session_created(&self, name: &str, index: Option<AppIndex>) {
        self.dispatch(name, index, "sip_session_created", AppModule::sip_session_created);
    }

    /// Routes a SIP session end.
    pub fn sip_session_destroyed(&self, name: &str, index: Option<AppIndex>) {
        self.dispatch(name, index, "sip_session_destroyed", AppModule::sip_session_destroyed);
    }

    /// Routes a SIP application session creation.
    pub fn sip_app_session_created(&self, name: &str, index: Option<AppIndex>) {
        self.dispatch(name, index, "sip_app_session_created", AppModule::app_session_created);
    }

    /// Routes a SIP application session end.
    pub fn sip_app_session_destroyed(&self, name: &str, index: Option<AppIndex>) {
        self.dispatch(name, index, "sip_app_session_destroyed", AppModule::app_session_destroyed);
    }

    /// Routes an inbound request.
    pub fn in_request(&self, name: &str, index: Option<AppIndex>, method: &str) {
        self.dispatch(name, index, "in_request", |m| m.in_request(method));
    }

    /// Routes an outbound request.
    pub fn out_request(&self, name: &str, index: Option<AppIndex>, method: &str) {
        self.dispatch(name, index, "out_request", |m| m.out_request(method));
    }

    /// Routes an inbound response.
    pub fn in_response(&self, name: &str, index: Option<AppIndex>, status: u16) {
        self.dispatch(name, index, "in_response", |m| m.in_response(status));
    }

    /// Routes an outbound response.
    pub fn out_response(&self, name: &str, index: Option<AppIndex>, status: u16) {
        self.dispatch(name, index, "out_response", |m| m.out_response(status));
    }

    /// Routes a task duration, only while task-duration monitoring is on.
    pub fn update_application_task_duration_statistics(
        &self,
        name: &str,
        index: Option<AppIndex>,
        duration_ms: u64,
    ) {
        if !self.is_task_duration_monitoring() {
            return;
        }
        self.dispatch(name, index, "task_duration", |m| m.record_task_duration(duration_ms));
    }

    /// Flushes every module's window, ordered by index.
    ///
    /// Holds the registry lock for the whole walk, so the result is a
    /// consistent view with respect to concurrent loads and unloads.
    pub fn update_pmi(&self) -> Vec<ApplicationSnapshot> {
        let registry = self.registry();
        let mut snapshots: Vec<ApplicationSnapshot> = registry
            .modules
            .values()
            .map(|module| module.snapshot_and_reset())
            .collect();
        snapshots.sort_by_key(|s| s.index);
        snapshots
    }

    /// Number of loaded applications.
    pub fn len(&self) -> usize {
        self.registry().modules.len()
    }

    /// Whether no application is loaded.
    pub fn is_empty(&self) -> bool {
        self.registry().modules.is_empty()
    }

    /// Turns per-application task-duration collection on or off.
    pub fn set_task_duration_monitoring(&self, enabled: bool) {
        let _registry = self.registry();
        self.task_duration_configured.store(enabled, Ordering::Relaxed);
        self.task_duration_monitoring.store(enabled, Ordering::Relaxed);
    }

    /// Whether per-application task durations are collected.
    pub fn is_task_duration_monitoring(&self) -> bool {
        self.task_duration_monitoring.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_assigns_sequential_indices() {
        let container = LoadedApplicationsContainer::new();
        let a = AppDescriptor::new("AppA");
        let b = AppDescriptor::new("AppB");
        assert_eq!(container.app_loaded("AppA", &a), Some(AppIndex(0)));
        assert_eq!(container.app_loaded("AppB", &b), Some(AppIndex(1)));
        assert_eq!(a.app_index(), Some(AppIndex(0)));
        assert_eq!(container.len(), 2);

        assert!(container.app_unloaded("AppA", AppIndex(0)));
        let c = AppDescriptor::new("AppC");
        assert_eq!(container.app_loaded("AppC", &c), Some(AppIndex(2)), "indices are never reused");
    }

    #[test]
    fn test_duplicate_load_is_ignored() {
        let container = LoadedApplicationsContainer::new();
        let a = AppDescriptor::new("AppA");
        container.app_loaded("AppA", &a);
        let module = container.get_app_obj(a.app_index()).unwrap();
        module.sip_session_created();

        assert_eq!(container.app_loaded("AppA", &a), None);
        assert_eq!(container.len(), 1);
        let same = container.get_app_obj(Some(AppIndex(0))).unwrap();
        assert_eq!(same.sip_sessions(), 1, "existing module is kept");
    }

    #[test]
    fn test_reload_after_unload_gets_fresh_index() {
        let container = LoadedApplicationsContainer::new();
        let a = AppDescriptor::new("AppA");
        container.app_loaded("AppA", &a);
        container.app_unloaded("AppA", AppIndex(0));
        assert_eq!(container.app_loaded("AppA", &a), Some(AppIndex(1)));
        assert_eq!(a.app_index(), Some(AppIndex(1)));
    }

    #[test]
    fn test_unload_destroys_module_and_clears_flag() {
        let container = LoadedApplicationsContainer::new();
        container.set_task_duration_monitoring(true);
        let a = AppDescriptor::new("AppA");
        container.app_loaded("AppA", &a);
        let module = container.get_app_obj(Some(AppIndex(0))).unwrap();

        assert!(container.app_unloaded("AppA", AppIndex(0)));
        assert!(module.is_destroyed());
        assert!(container.get_app_obj(Some(AppIndex(0))).is_none());
        assert!(container.is_empty());
        assert!(!container.is_task_duration_monitoring());

        module.sip_session_created();
        assert_eq!(module.sip_sessions(), 0);
        assert!(!container.app_unloaded("AppA", AppIndex(0)));
    }

    #[test]
    fn test_monitoring_resumes_when_registry_refills() {
        let container = LoadedApplicationsContainer::new();
        container.set_task_duration_monitoring(true);
        let a = AppDescriptor::new("AppA");
        container.app_loaded("AppA", &a);
        container.app_unloaded("AppA", AppIndex(0));
        assert!(!container.is_task_duration_monitoring());

        let b = AppDescriptor::new("AppB");
        let index = container.app_loaded("AppB", &b);
        assert!(container.is_task_duration_monitoring());
        container.update_application_task_duration_statistics("AppB", index, 40);
        assert_eq!(container.update_pmi()[0].task_duration.count, 1);
    }

    #[test]
    fn test_monitoring_stays_off_when_not_configured() {
        let container = LoadedApplicationsContainer::new();
        container.app_loaded("AppA", &AppDescriptor::new("AppA"));
        container.app_unloaded("AppA", AppIndex(0));
        container.app_loaded("AppB", &AppDescriptor::new("AppB"));
        assert!(!container.is_task_duration_monitoring());
    }

    #[test]
    fn test_unknown_index_leaves_counters_unchanged() {
        let container = LoadedApplicationsContainer::new();
        container.set_task_duration_monitoring(true);
        let a = AppDescriptor::new("AppA");
        container.app_loaded("AppA", &a);

        for index in [None, Some(AppIndex(42))] {
            container.sip_session_created("Ghost", index);
            container.sip_app_session_created("Ghost", index);
            container.in_request("Ghost", index, "INVITE");
            container.out_request("Ghost", index, "BYE");
            container.in_response("Ghost", index, 200);
            container.out_response("Ghost", index, 486);
            container.update_application_task_duration_statistics("Ghost", index, 10);
            container.sip_session_destroyed("Ghost", index);
        }

        let snapshots = container.update_pmi();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0],
            ApplicationSnapshot {
                name: "AppA".to_string(),
                index: 0,
                ..ApplicationSnapshot::default()
            }
        );
    }

    #[test]
    fn test_update_pmi_flushes_windows_in_index_order() {
        let container = LoadedApplicationsContainer::new();
        for name in ["A", "B", "C"] {
            container.app_loaded(name, &AppDescriptor::new(name));
        }
        container.in_request("C", Some(AppIndex(2)), "INVITE");
        container.in_request("C", Some(AppIndex(2)), "INVITE");
        container.out_response("A", Some(AppIndex(0)), 180);
        container.sip_app_session_created("B", Some(AppIndex(1)));

        let snapshots = container.update_pmi();
        assert_eq!(snapshots.iter().map(|s| s.index).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(snapshots[2].in_requests.get("INVITE"), Some(&2));
        assert_eq!(snapshots[0].out_responses.get(&180), Some(&1));
        assert_eq!(snapshots[1].app_sessions, 1);

        let snapshots = container.update_pmi();
        assert!(snapshots[2].in_requests.is_empty());
        assert_eq!(snapshots[1].app_sessions, 1, "gauges are not windowed");
    }

    #[test]
    fn test_task_durations_only_while_monitoring() {
        let container = LoadedApplicationsContainer::new();
        container.app_loaded("A", &AppDescriptor::new("A"));
        container.update_application_task_duration_statistics("A", Some(AppIndex(0)), 25);
        assert_eq!(container.update_pmi()[0].task_duration.count, 0);

        container.set_task_duration_monitoring(true);
        container.update_application_task_duration_statistics("A", Some(AppIndex(0)), 25);
        assert_eq!(container.update_pmi()[0].task_duration.total_ms, 25);
    }

    #[test]
    fn test_session_gauges_floor_at_zero() {
        let container = LoadedApplicationsContainer::new();
        container.app_loaded("A", &AppDescriptor::new("A"));
        container.sip_session_destroyed("A", Some(AppIndex(0)));
        container.sip_app_session_destroyed("A", Some(AppIndex(0)));
        let module = container.get_app_obj(Some(AppIndex(0))).unwrap();
        assert_eq!(module.sip_sessions(), 0);
        assert_eq!(module.app_sessions(), 0);
    }
}
