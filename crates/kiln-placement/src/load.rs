//! Per-runner load observations.
//!
//! Runners report capacity pressure implicitly by rejecting calls; the
//! tracker remembers the rejection for a short decay window so placers
//! deprioritize the runner without any health-check channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks which runners recently rejected work, and consecutive failure
/// counts for implicit health.
pub struct LoadTracker {
    decay: Duration,
    state: Mutex<HashMap<String, RunnerLoad>>,
}

#[derive(Default)]
struct RunnerLoad {
    loaded_until: Option<Instant>,
    consecutive_failures: u32,
}

impl LoadTracker {
    pub fn new(decay: Duration) -> Self {
        Self {
            decay,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// The runner rejected a call for capacity; skip it until the decay
    /// window passes.
    pub fn mark_loaded(&self, address: &str) {
        let mut state = self.lock();
        let entry = state.entry(address.to_string()).or_default();
        entry.loaded_until = Some(Instant::now() + self.decay);
    }

    pub fn is_loaded(&self, address: &str) -> bool {
        let state = self.lock();
        state
            .get(address)
            .and_then(|l| l.loaded_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }

    /// A transport or runner error; repeated failures mark the runner
    /// suspect.
    pub fn record_failure(&self, address: &str) {
        let mut state = self.lock();
        let entry = state.entry(address.to_string()).or_default();
        entry.consecutive_failures += 1;
    }

    pub fn record_success(&self, address: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.get_mut(address) {
            entry.consecutive_failures = 0;
            entry.loaded_until = None;
        }
    }

    pub fn failures(&self, address: &str) -> u32 {
        let state = self.lock();
        state
            .get(address)
            .map(|l| l.consecutive_failures)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunnerLoad>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
