use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_graceful::ShutdownGuard;
use tracing::info;

use lib_sip_pmi::core::{AppIndex, PerformanceMgr};

const TICK: Duration = Duration::from_millis(10);
const TICKS_PER_SECOND: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct TrafficSettings {
    pub calls_per_second: u64,
    pub call_hold_ms: u64,
    pub response_latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SimApp {
    pub name: String,
    pub index: Option<AppIndex>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficTotals {
    pub offered: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub completed: u64,
}

struct PendingResponse {
    due_ms: u64,
    arrival_ms: u64,
    app: usize,
}

struct ActiveCall {
    ends_ms: u64,
    app: usize,
}

/// Offers INVITEs at a fixed rate, answers them after a jittered latency and
/// hangs them up after a jittered hold time. New calls are refused while the
/// load manager asks for messages to be thrown.
pub struct TrafficGenerator<R> {
    mgr: Arc<PerformanceMgr>,
    apps: Vec<SimApp>,
    settings: TrafficSettings,
    rng: R,
    pending: Vec<PendingResponse>,
    calls: Vec<ActiveCall>,
    carry: u64,
    totals: TrafficTotals,
}

impl<R: Rng> TrafficGenerator<R> {
    pub fn new(mgr: Arc<PerformanceMgr>, apps: Vec<SimApp>, settings: TrafficSettings, rng: R) -> Self {
        Self {
            mgr,
            apps,
            settings,
            rng,
            pending: Vec::new(),
            calls: Vec::new(),
            carry: 0,
            totals: TrafficTotals::default(),
        }
    }

    pub fn totals(&self) -> TrafficTotals {
        self.totals
    }

    /// Advances the simulation by one tick ending at `now_ms`.
    pub fn step(&mut self, now_ms: u64) {
        self.carry += self.settings.calls_per_second;
        let offered = self.carry / TICKS_PER_SECOND;
        self.carry %= TICKS_PER_SECOND;

        for _ in 0..offered {
            self.offer_call(now_ms);
        }
        self.answer_due(now_ms);
        self.hang_up_due(now_ms);
        self.mgr.set_queue_size(self.pending.len() as u64);
    }

    fn jitter(&mut self, mean: u64) -> u64 {
        if mean == 0 {
            return 0;
        }
        self.rng.random_range(mean / 2..=mean + mean / 2)
    }

    fn offer_call(&mut self, now_ms: u64) {
        self.totals.offered += 1;
        self.mgr.request_received();
        if self.mgr.load_manager().should_throw_msgs() {
            self.mgr.update_rejected_messages_counter();
            self.totals.rejected += 1;
            return;
        }
        if self.apps.is_empty() {
            return;
        }

        let app = self.rng.random_range(0..self.apps.len());
        let latency = self.jitter(self.settings.response_latency_ms);
        let SimApp { name, index } = &self.apps[app];
        self.mgr.in_request(name, *index, "INVITE");
        self.mgr.sip_app_session_created(name, *index);
        self.mgr.sip_session_created(name, *index);
        self.mgr.increment_invoke_counter();

        self.pending.push(PendingResponse {
            due_ms: now_ms.saturating_add(latency),
            arrival_ms: now_ms,
            app,
        });
        self.totals.admitted += 1;
    }

    fn answer_due(&mut self, now_ms: u64) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|response| response.due_ms <= now_ms);
        self.pending = waiting;

        for response in due {
            let hold = self.jitter(self.settings.call_hold_ms);
            let SimApp { name, index } = &self.apps[response.app];
            self.mgr.response_sent(response.arrival_ms);
            self.mgr.out_response(name, *index, 200);
            self.mgr.decrement_invoke_counter();
            self.mgr
                .update_task_duration(name, *index, now_ms.saturating_sub(response.arrival_ms));
            self.calls.push(ActiveCall {
                ends_ms: now_ms.saturating_add(hold),
                app: response.app,
            });
        }
    }

    fn hang_up_due(&mut self, now_ms: u64) {
        let (ended, active): (Vec<_>, Vec<_>) = std::mem::take(&mut self.calls)
            .into_iter()
            .partition(|call| call.ends_ms <= now_ms);
        self.calls = active;

        for call in ended {
            let SimApp { name, index } = &self.apps[call.app];
            self.mgr.request_received();
            self.mgr.in_request(name, *index, "BYE");
            self.mgr.out_response(name, *index, 200);
            self.mgr.sip_session_destroyed(name, *index);
            self.mgr.sip_app_session_destroyed(name, *index);
            self.mgr.update_sip_timers_invocations_counter();
            self.totals.completed += 1;
        }
    }

    /// Answers every pending request and hangs up every call.
    pub fn drain(&mut self, now_ms: u64) {
        for response in &mut self.pending {
            response.due_ms = now_ms;
        }
        self.answer_due(now_ms);
        for call in &mut self.calls {
            call.ends_ms = now_ms;
        }
        self.hang_up_due(now_ms);
        self.mgr.set_queue_size(0);
    }

    pub async fn run(mut self, shutdown_guard: ShutdownGuard) {
        let mut ticker = tokio::time::interval(TICK);
        info!(
            apps = self.apps.len(),
            calls_per_second = self.settings.calls_per_second,
            "Traffic generator started"
        );
        loop {
            tokio::select! {
                _ = shutdown_guard.cancelled() => {
                    info!("Signal received: stopping traffic generator");
                    break;
                }
                _ = ticker.tick() => {
                    let now = self.mgr.clock().now_millis();
                    self.step(now);
                }
            }
        }
        self.drain(self.mgr.clock().now_millis());
        info!(
            offered = self.totals.offered,
            admitted = self.totals.admitted,
            rejected = self.totals.rejected,
            completed = self.totals.completed,
            "Traffic generator stopped"
        );
    }
}
