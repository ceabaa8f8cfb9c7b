//! kiln-placement — maps an invocation to a pure-runner.
//!
//! A placer is a pure function of (invocation, pool snapshot, load
//! state). The load state is an observable the placer updates from
//! explicit runner responses — there is no back-reference from the
//! placer into the pool, which keeps the agent → pool → placer graph
//! acyclic.

pub mod ch;
pub mod load;
pub mod naive;

#[cfg(test)]
pub(crate) mod tests_support;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use kiln_core::ApiResult;

pub use ch::{ChPlacer, ChPlacerConfig};
pub use load::LoadTracker;
pub use naive::NaivePlacer;

/// The least budget worth spending on another placement attempt.
pub const MIN_ATTEMPT_BUDGET: std::time::Duration = std::time::Duration::from_millis(10);

/// What a placer (and the runner client under it) needs from one
/// invocation.
#[async_trait]
pub trait RunnerCall: Send + Sync {
    /// Hash of the invocation-invariant container configuration.
    fn slot_key(&self) -> &str;
    /// Resolved metadata, serialized for the submit header frame.
    fn metadata_json(&self) -> String;
    /// Absolute local deadline for the whole invocation.
    fn deadline(&self) -> Instant;
    /// The request body.
    fn input(&self) -> bytes::Bytes;
    /// Deliver the runner's response to the caller.
    async fn respond(
        &self,
        status: u16,
        headers: Vec<(String, String)>,
        body: bytes::Bytes,
    ) -> ApiResult<()>;
}

/// One reachable pure-runner.
#[async_trait]
pub trait Runner: Send + Sync {
    fn address(&self) -> &str;

    /// Attempt the call here. `Ok(true)` means the runner accepted and
    /// the call ran to completion (successfully or not — the response
    /// already went to the caller). `Ok(false)` means the runner
    /// rejected the call for capacity and the placer should move on.
    async fn try_exec(&self, call: &dyn RunnerCall) -> ApiResult<bool>;
}

/// The set of reachable runners. Snapshots may churn between calls;
/// placers tolerate that and never rebalance in-flight work.
#[async_trait]
pub trait RunnerPool: Send + Sync {
    async fn runners(&self) -> Vec<Arc<dyn Runner>>;
    async fn shutdown(&self);
}

/// Picks a runner for each invocation, retrying within the deadline.
#[async_trait]
pub trait Placer: Send + Sync {
    async fn place(
        &self,
        call: &dyn RunnerCall,
        runners: Vec<Arc<dyn Runner>>,
    ) -> ApiResult<()>;
}
