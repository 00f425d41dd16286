//! # Periodic Scheduler
//!
//! The single primitive behind every periodic task of the engine. Each task is
//! a Tokio task ticking a fixed-rate `interval` and watching a
//! `CancellationToken`. Cancelling a [`TaskHandle`] prevents future runs; a
//! run already in progress completes.

use std::ops::ControlFlow;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Errors raised when creating a scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Called outside a Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// # Periodic Scheduler
///
/// Spawns fixed-rate tasks on a Tokio runtime. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PeriodicScheduler {
    handle: Handle,
}

impl PeriodicScheduler {
    /// A scheduler spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A scheduler spawning onto the runtime of the calling context.
    pub fn current() -> Result<Self, SchedulerError> {
        Ok(Self::new(Handle::try_current()?))
    }

    /// Runs `task` every `period`, first after one full period.
    ///
    /// The task stops when its handle is cancelled or dropped, or when `task`
    /// returns [`ControlFlow::Break`]. Periods below one millisecond are
    /// raised to one millisecond.
    pub fn schedule_at_fixed_rate<F>(&self, name: &'static str, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let join = self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => {
                        debug!(task = name, "Periodic task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if task().is_break() {
                            debug!(task = name, "Periodic task finished");
                            break;
                        }
                    }
                }
            }
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task scheduled");
        TaskHandle { name, token, join }
    }
}

/// # Task Handle
///
/// Cancels its periodic task when asked or when dropped.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Name given at scheduling time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Prevents any further run. Calling it again is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`TaskHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the underlying Tokio task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
