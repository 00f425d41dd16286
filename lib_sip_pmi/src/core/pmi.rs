//! # PMI Sink
//!
//! The statistics the performance manager pushes to the monitoring interface
//! once per `statUpdateRange`, and the listener trait that receives them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::weighable::{Dimension, Weight};

/// Receives a [`PmiSnapshot`] after every statistics flush.
///
/// Called from the statistics task; implementations should return quickly.
pub trait PmiListener: Send + Sync {
    /// Publishes one flushed window.
    fn update_counters(&self, snapshot: &PmiSnapshot);
}

/// Expresses `count` events seen over `range` ms as a rate per `averaging` ms.
///
/// Multiplies before dividing so low counts over short windows do not truncate
/// to zero. A zero `range` yields zero.
pub fn normalize_rate(count: u64, averaging: u64, range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    let rate = u128::from(count) * u128::from(averaging) / u128::from(range);
    u64::try_from(rate).unwrap_or(u64::MAX)
}

/// Duration statistics of tasks run during one window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDurationStats {
    /// Number of tasks measured.
    pub count: u64,
    /// Sum of their durations.
    pub total_ms: u64,
    /// Shortest duration, 0 when nothing was measured.
    pub min_ms: u64,
    /// Longest duration.
    pub max_ms: u64,
}

impl TaskDurationStats {
    /// Adds one measured task.
    pub fn record(&mut self, duration_ms: u64) {
        self.min_ms = if self.count == 0 {
            duration_ms
        } else {
            self.min_ms.min(duration_ms)
        };
        self.max_ms = self.max_ms.max(duration_ms);
        self.total_ms = self.total_ms.saturating_add(duration_ms);
        self.count += 1;
    }

    /// Mean duration, 0 when nothing was measured.
    pub fn average_ms(&self) -> u64 {
        match self.count {
            0 => 0,
            n => self.total_ms / n,
        }
    }
}

/// Outbound queue statistics of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatistics {
    /// Deepest reported depth.
    pub peak: u64,
    /// Shallowest reported depth.
    pub min: u64,
    /// `peak` as a percentage of the bound capacity, 0 while unbound.
    pub percent_full: u64,
}

/// Per-application statistics of one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSnapshot {
    /// Application name.
    pub name: String,
    /// Index assigned at load time.
    pub index: u32,
    /// Live SIP sessions.
    pub sip_sessions: u64,
    /// Live SIP application sessions.
    pub app_sessions: u64,
    /// Inbound requests by method.
    pub in_requests: BTreeMap<String, u64>,
    /// Outbound requests by method.
    pub out_requests: BTreeMap<String, u64>,
    /// Inbound responses by status code.
    pub in_responses: BTreeMap<u16, u64>,
    /// Outbound responses by status code.
    pub out_responses: BTreeMap<u16, u64>,
    /// Task durations, empty unless duration monitoring is on.
    pub task_duration: TaskDurationStats,
}

/// # PMI Snapshot
///
/// Everything published for one statistics window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PmiSnapshot {
    /// When the window was flushed.
    pub taken_at: DateTime<Utc>,
    /// Server weight in force at flush time.
    pub server_weight: Weight,
    /// Whether the server was declared overloaded at flush time.
    pub overloaded: bool,
    /// Dimension that caused the overload, if any.
    pub overloaded_dimension: Option<Dimension>,
    /// Live SIP sessions across all applications.
    pub sip_sessions: u64,
    /// Live SIP application sessions across all applications.
    pub app_sessions: u64,
    /// SIP sessions not yet replicated.
    pub not_replicated_sip_sessions: u64,
    /// Received messages per averaging period.
    pub received_messages_rate: u64,
    /// New application sessions per averaging period.
    pub new_app_sessions_rate: u64,
    /// Average response time of the window.
    pub average_response_time_ms: u64,
    /// Messages rejected during the window.
    pub rejected_messages: u64,
    /// SIP timer firings during the window.
    pub sip_timer_invocations: u64,
    /// Application invocations in flight at flush time.
    pub active_invocations: u64,
    /// Outbound queue statistics of the window.
    pub queue: QueueStatistics,
    /// Container-wide task durations of the window.
    pub task_duration: TaskDurationStats,
    /// One entry per loaded application, by index.
    pub applications: Vec<ApplicationSnapshot>,
}
