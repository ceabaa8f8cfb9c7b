//! Consistent-hash placer.
//!
//! Hashes the slot key onto a ring of virtual runner points so the same
//! key always lands on the same primary runner for a given snapshot —
//! that is where its warm containers live. On capacity rejections the
//! runner is marked loaded for a short decay window and the probe moves
//! to the ring successors, bounding fan-out for hot keys.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use kiln_core::{ApiError, ApiResult};

use crate::load::LoadTracker;
use crate::{Placer, Runner, RunnerCall, MIN_ATTEMPT_BUDGET};

/// Tuning knobs for the consistent-hash placer.
#[derive(Debug, Clone)]
pub struct ChPlacerConfig {
    /// Virtual points per runner on the ring.
    pub virtual_points: u32,
    /// How long a capacity rejection keeps a runner deprioritized.
    pub loaded_decay: Duration,
    /// Ring walks before giving up.
    pub per_runner_budget: u32,
}

impl Default for ChPlacerConfig {
    fn default() -> Self {
        Self {
            virtual_points: 64,
            loaded_decay: Duration::from_secs(1),
            per_runner_budget: 2,
        }
    }
}

pub struct ChPlacer {
    config: ChPlacerConfig,
    load: LoadTracker,
}

impl ChPlacer {
    pub fn new() -> Self {
        Self::with_config(ChPlacerConfig::default())
    }

    pub fn with_config(config: ChPlacerConfig) -> Self {
        let load = LoadTracker::new(config.loaded_decay);
        Self { config, load }
    }

    pub fn load_tracker(&self) -> &LoadTracker {
        &self.load
    }

    /// Deterministic probe order for a key over a snapshot: primary
    /// first, then ring successors, each runner once.
    fn probe_order(&self, slot_key: &str, count: usize, addresses: &[&str]) -> Vec<usize> {
        let mut ring: Vec<(u64, usize)> = Vec::with_capacity(count * self.config.virtual_points as usize);
        for (idx, addr) in addresses.iter().enumerate() {
            for point in 0..self.config.virtual_points {
                ring.push((hash64(&format!("{addr}#{point}")), idx));
            }
        }
        ring.sort_unstable();

        let key_hash = hash64(slot_key);
        // partition_point == len means the key hashes past the last
        // point and wraps to the ring start.
        let start = ring.partition_point(|(h, _)| *h < key_hash) % ring.len();

        let mut order = Vec::with_capacity(count);
        let mut seen = vec![false; count];
        for i in 0..ring.len() {
            let (_, idx) = ring[(start + i) % ring.len()];
            if !seen[idx] {
                seen[idx] = true;
                order.push(idx);
                if order.len() == count {
                    break;
                }
            }
        }
        order
    }
}

impl Default for ChPlacer {
    fn default() -> Self {
        Self::new()
    }
}

fn hash64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

#[async_trait]
impl Placer for ChPlacer {
    async fn place(
        &self,
        call: &dyn RunnerCall,
        runners: Vec<Arc<dyn Runner>>,
    ) -> ApiResult<()> {
        if runners.is_empty() {
            return Err(ApiError::ResourceUnavailable);
        }
        let addresses: Vec<&str> = runners.iter().map(|r| r.address()).collect();
        let order = self.probe_order(call.slot_key(), runners.len(), &addresses);

        // Hard bound: never more than runners × budget attempts.
        let max_attempts = runners.len() as u32 * self.config.per_runner_budget;
        let mut attempts = 0u32;

        for round in 0..self.config.per_runner_budget {
            // First pass skips runners marked loaded; if everyone is
            // loaded we fall through and probe them anyway.
            for skip_loaded in [true, false] {
                for &idx in &order {
                    let runner = &runners[idx];
                    if skip_loaded && self.load.is_loaded(runner.address()) {
                        continue;
                    }
                    if attempts >= max_attempts {
                        return Err(ApiError::ResourceUnavailable);
                    }
                    if call.deadline().saturating_duration_since(Instant::now())
                        < MIN_ATTEMPT_BUDGET
                    {
                        return Err(ApiError::PlacementTimeout);
                    }
                    attempts += 1;

                    match runner.try_exec(call).await {
                        Ok(true) => {
                            self.load.record_success(runner.address());
                            debug!(
                                runner = runner.address(),
                                key = call.slot_key(),
                                round,
                                "call placed"
                            );
                            return Ok(());
                        }
                        Ok(false) => {
                            self.load.mark_loaded(runner.address());
                            debug!(runner = runner.address(), "runner loaded, probing successor");
                        }
                        Err(e) if e.is_retryable() => {
                            self.load.mark_loaded(runner.address());
                        }
                        Err(e) => {
                            self.load.record_failure(runner.address());
                            warn!(runner = runner.address(), error = %e, "fatal placement error");
                            return Err(e);
                        }
                    }
                }
            }
        }
        Err(ApiError::ResourceUnavailable)
    }
}
