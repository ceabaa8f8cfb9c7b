//! The full/runner node agent.
//!
//! `submit` is the synchronous path: resolve a slot, pipe the body,
//! persist the record and log, release. The async path persists a
//! queued record and a worker loop pulls, re-resolves, and re-submits
//! with at-least-once semantics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kiln_core::models::{now_millis, CallStats, CallStatus};
use kiln_core::{ApiError, ApiResult, Call};
use kiln_dataaccess::DataAccess;
use kiln_metrics::Registry;
use kiln_pool::SlotPool;

use crate::call::{CallMetadata, Invocation};
use crate::Agent;

/// Response of one completed invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub call: Call,
}

/// Agent for nodes that execute containers locally (full, runner,
/// pure-runner).
pub struct NodeAgent {
    pool: Arc<SlotPool>,
    da: Arc<dyn DataAccess>,
    metrics: Arc<Registry>,
    closing: AtomicBool,
    inflight: AtomicU64,
    idle: Notify,
    shutdown_wait: Duration,
}

impl NodeAgent {
    pub fn new(pool: Arc<SlotPool>, da: Arc<dyn DataAccess>, metrics: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            da,
            metrics,
            closing: AtomicBool::new(false),
            inflight: AtomicU64::new(0),
            idle: Notify::new(),
            shutdown_wait: Duration::from_secs(30),
        })
    }

    /// Record a call state, tolerating node roles with no catalog.
    async fn persist_call(&self, call: &Call) {
        match self.da.insert_call(call).await {
            Ok(()) => {}
            Err(ApiError::NotSupported) => {}
            Err(e) => warn!(call_id = %call.id, error = %e, "failed to persist call record"),
        }
    }

    async fn persist_log(&self, app_name: &str, call_id: &str, log: &[u8]) {
        if log.is_empty() {
            return;
        }
        match self.da.insert_log(app_name, call_id, log).await {
            Ok(()) | Err(ApiError::NotSupported) => {}
            Err(e) => warn!(call_id, error = %e, "failed to persist call log"),
        }
    }

    async fn run_invocation(&self, mut invocation: Invocation) -> ApiResult<InvocationResult> {
        let spec = invocation.metadata.container_spec();
        let label = invocation.metadata.label.clone();
        let app_name = invocation.metadata.call.app_name.clone();

        let pool = self.pool.clone();
        let slot = pool
            .acquire(
                &spec,
                invocation.slot_key.clone(),
                invocation.idle_timeout(),
                &label,
                invocation.deadline,
                invocation.cancel.clone(),
            )
            .await?;

        // The container has been told to start; the start record lands
        // now, before any log bytes, regardless of what follows.
        let started = invocation.start_record().clone();
        self.persist_call(&started).await;

        let started_at = Instant::now();
        let outcome = slot
            .container()
            .invoke(invocation.input.clone(), invocation.deadline)
            .await;
        let duration = started_at.elapsed();

        let healthy = !matches!(
            outcome,
            Err(ApiError::ContainerError(_)) | Err(ApiError::DeadlineExceeded)
        );
        slot.release(healthy).await;

        let mut call = invocation.metadata.call.clone();
        call.completed_at = Some(now_millis().max(call.started_at.unwrap_or(call.created_at)));
        call.stats = Some(CallStats {
            duration_ms: duration.as_millis() as u64,
            memory_mb: invocation.metadata.memory_mb,
            cpu_shares: invocation.metadata.cpu_shares,
        });

        match outcome {
            Ok(response) => {
                call.status = CallStatus::Success;
                self.persist_call(&call).await;
                self.persist_log(&app_name, &call.id, &response.log).await;
                self.metrics.calls.inc(call.status.as_str());
                Ok(InvocationResult {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    call,
                })
            }
            Err(err) => {
                call.status = match err {
                    ApiError::DeadlineExceeded => CallStatus::Timeout,
                    _ => CallStatus::Error,
                };
                call.error = Some(err.to_string());
                self.persist_call(&call).await;
                self.metrics.calls.inc(call.status.as_str());
                debug!(call_id = %call.id, error = %err, "invocation failed");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Agent for NodeAgent {
    async fn submit(&self, invocation: Invocation) -> ApiResult<InvocationResult> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ApiError::NodeDraining);
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self.run_invocation(invocation).await;
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        result
    }

    async fn enqueue(&self, mut call: Call) -> ApiResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ApiError::NodeDraining);
        }
        call.status = CallStatus::Queued;
        // Record first, then queue: a crash between the two leaves a
        // queued record with no message, which the operator can see;
        // the reverse would run calls with no record.
        self.da.insert_call(&call).await?;
        self.da.enqueue(&call).await?;
        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        debug!(call_id = %call.id, "call enqueued");
        Ok(())
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("agent closing, waiting for in-flight calls");
        let deadline = Instant::now() + self.shutdown_wait;
        loop {
            // Arm before re-checking so the last release is not missed.
            let mut notified = std::pin::pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        inflight = self.inflight.load(Ordering::SeqCst),
                        "shutdown wait elapsed with calls in flight"
                    );
                    break;
                }
            }
        }
        self.pool.drain().await;
        info!("agent closed");
    }
}

/// Backoff applied when an async call fails retryably.
const ASYNC_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Poll interval when the queue is empty.
const ASYNC_IDLE_POLL: Duration = Duration::from_secs(1);

/// The async worker loop for full nodes: pull, re-resolve, submit,
/// settle the queue entry.
pub async fn run_async_worker(
    agent: Arc<NodeAgent>,
    da: Arc<dyn DataAccess>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("async dequeue worker started");
    loop {
        let call = tokio::select! {
            result = da.dequeue_one() => match result {
                Ok(Some(call)) => call,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(ASYNC_IDLE_POLL) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(ASYNC_RETRY_DELAY) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            },
            _ = shutdown.changed() => break,
        };

        agent
            .metrics
            .queue_depth
            .fetch_sub(1, Ordering::Relaxed);

        match execute_async_call(&agent, &da, call.clone()).await {
            Ok(()) => {
                if let Err(e) = da.delete_from_queue(&call.id).await {
                    warn!(call_id = %call.id, error = %e, "failed to settle queue entry");
                }
            }
            Err(e) if e.is_retryable() => {
                info!(call_id = %call.id, error = %e, "async call retryable, returning to queue");
                agent.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = da.return_to_queue(&call.id, ASYNC_RETRY_DELAY).await {
                    warn!(call_id = %call.id, error = %e, "failed to nack queue entry");
                }
            }
            Err(e) => {
                // Terminal failure: the record already says error;
                // drop the message so it is not retried forever.
                warn!(call_id = %call.id, error = %e, "async call failed");
                if let Err(e) = da.delete_from_queue(&call.id).await {
                    warn!(call_id = %call.id, error = %e, "failed to settle queue entry");
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
    info!("async dequeue worker stopped");
}

/// Re-resolve a dequeued call's metadata and run it.
async fn execute_async_call(
    agent: &Arc<NodeAgent>,
    da: &Arc<dyn DataAccess>,
    mut call: Call,
) -> ApiResult<()> {
    // The body travelled on the queue message; the persisted record
    // does not keep it.
    let input = call
        .payload
        .take()
        .map(Bytes::from)
        .unwrap_or_default();

    // Metadata may have changed since enqueue; the queue entry only
    // pins identity.
    let app = da.get_app_by_id(&call.app_id).await?;
    let metadata = match (&call.path, &call.fn_id) {
        (Some(path), _) => {
            let route = da.get_route(&app.name, path).await?;
            CallMetadata::from_route(&app, &route, call.clone())
        }
        (None, Some(fn_id)) => {
            let f = da.get_fn(fn_id).await?;
            CallMetadata::from_fn(&app, &f, call.clone())
        }
        (None, None) => {
            return Err(ApiError::Validation(
                "queued call names neither route nor fn".into(),
            ))
        }
    };

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let invocation = Invocation::new(metadata, input, None, cancel_rx);
    agent.submit(invocation).await.map(|_| ())
}
