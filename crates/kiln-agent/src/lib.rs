//! kiln-agent — the node-local invocation entry points.
//!
//! [`NodeAgent`] serves full and runner nodes: the synchronous submit
//! path through the slot pool, plus enqueue/dequeue for async calls.
//! [`LbAgent`] serves lb nodes: it composes cached data access, the
//! runner pool, and a placer into the dispatch pipeline.

pub mod agent;
pub mod call;
pub mod lb;

use async_trait::async_trait;

use kiln_core::{ApiResult, Call};

pub use agent::{run_async_worker, InvocationResult, NodeAgent};
pub use call::{cancel_channel, CallMetadata, Invocation};
pub use lb::LbAgent;

/// What every execution-capable node exposes to its HTTP layer.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one invocation to completion and return its response.
    async fn submit(&self, invocation: Invocation) -> ApiResult<InvocationResult>;

    /// Persist a queued call and push it onto the message queue.
    /// Returns once the write is durable. Full nodes only.
    async fn enqueue(&self, call: Call) -> ApiResult<()>;

    /// Refuse new submits, wait for in-flight calls, drain the pool.
    async fn close(&self);
}
