use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use lib_sip_pmi::core::{PmiListener, PmiSnapshot};

/// Logs every flushed statistics window as one JSON record and keeps the
/// latest one for the shutdown summary.
#[derive(Default)]
pub struct LogPmiListener {
    last: Mutex<Option<PmiSnapshot>>,
}

impl LogPmiListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_snapshot(&self) -> Option<PmiSnapshot> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PmiListener for LogPmiListener {
    fn update_counters(&self, snapshot: &PmiSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => info!(target: "pmi", weight = snapshot.server_weight, overloaded = snapshot.overloaded, "{json}"),
            Err(e) => warn!(error = %e, "Failed to serialize PMI snapshot"),
        }
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
    }
}
