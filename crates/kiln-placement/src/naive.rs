//! Naive placer — rotate through the snapshot from a random offset.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use kiln_core::{ApiError, ApiResult};

use crate::{Placer, Runner, RunnerCall, MIN_ATTEMPT_BUDGET};

/// Tries each runner in rotation, up to a per-runner attempt budget,
/// skipping on retryable rejections and stopping on anything fatal.
pub struct NaivePlacer {
    /// Attempts per runner before giving up.
    per_runner_budget: u32,
}

impl NaivePlacer {
    pub fn new() -> Self {
        Self {
            per_runner_budget: 2,
        }
    }

    pub fn with_budget(per_runner_budget: u32) -> Self {
        Self { per_runner_budget }
    }
}

impl Default for NaivePlacer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Placer for NaivePlacer {
    async fn place(
        &self,
        call: &dyn RunnerCall,
        runners: Vec<Arc<dyn Runner>>,
    ) -> ApiResult<()> {
        if runners.is_empty() {
            return Err(ApiError::ResourceUnavailable);
        }
        let offset = rand::thread_rng().gen_range(0..runners.len());

        for round in 0..self.per_runner_budget {
            for i in 0..runners.len() {
                let runner = &runners[(offset + i) % runners.len()];

                if call.deadline().saturating_duration_since(Instant::now()) < MIN_ATTEMPT_BUDGET
                {
                    return Err(ApiError::PlacementTimeout);
                }

                match runner.try_exec(call).await {
                    Ok(true) => {
                        debug!(runner = runner.address(), round, "call placed");
                        return Ok(());
                    }
                    Ok(false) => {
                        debug!(runner = runner.address(), "runner rejected call, rotating");
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(runner = runner.address(), error = %e, "retryable, rotating");
                    }
                    Err(e) => {
                        warn!(runner = runner.address(), error = %e, "fatal placement error");
                        return Err(e);
                    }
                }
            }
        }
        Err(ApiError::ResourceUnavailable)
    }
}
