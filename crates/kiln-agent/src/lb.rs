//! The lb agent.
//!
//! Composes cached data access, the runner pool, and a placer into the
//! dispatch pipeline: resolve metadata → build the submit header →
//! place on a pure-runner → stream the response back → persist the call
//! record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use kiln_core::models::{now_millis, CallStatus};
use kiln_core::{ApiError, ApiResult, Call};
use kiln_dataaccess::DataAccess;
use kiln_metrics::Registry;
use kiln_placement::{Placer, Runner, RunnerCall, RunnerPool};

use crate::agent::InvocationResult;
use crate::call::Invocation;
use crate::Agent;

/// Agent for lb nodes. Holds no slot pool; execution happens on the
/// pure-runners it dispatches to.
pub struct LbAgent {
    da: Arc<dyn DataAccess>,
    pool: Arc<dyn RunnerPool>,
    placer: Arc<dyn Placer>,
    metrics: Arc<Registry>,
    closing: AtomicBool,
}

impl LbAgent {
    pub fn new(
        da: Arc<dyn DataAccess>,
        pool: Arc<dyn RunnerPool>,
        placer: Arc<dyn Placer>,
        metrics: Arc<Registry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            da,
            pool,
            placer,
            metrics,
            closing: AtomicBool::new(false),
        })
    }
}

/// The [`RunnerCall`] an lb hands to its placer: the header-frame
/// metadata plus a slot the runner client writes the response into.
struct LbCall {
    metadata_json: String,
    slot_key: String,
    deadline: Instant,
    input: Bytes,
    response: tokio::sync::Mutex<Option<(u16, Vec<(String, String)>, Bytes)>>,
}

#[async_trait]
impl RunnerCall for LbCall {
    fn slot_key(&self) -> &str {
        &self.slot_key
    }

    fn metadata_json(&self) -> String {
        self.metadata_json.clone()
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn input(&self) -> Bytes {
        self.input.clone()
    }

    async fn respond(
        &self,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> ApiResult<()> {
        *self.response.lock().await = Some((status, headers, body));
        Ok(())
    }
}

#[async_trait]
impl Agent for LbAgent {
    async fn submit(&self, invocation: Invocation) -> ApiResult<InvocationResult> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ApiError::NodeDraining);
        }

        let metadata = invocation.metadata.clone();
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| ApiError::Internal(format!("encoding submit header: {e}")))?;

        let lb_call = LbCall {
            metadata_json,
            slot_key: invocation.slot_key.as_str().to_string(),
            deadline: invocation.deadline,
            input: invocation.input.clone(),
            response: tokio::sync::Mutex::new(None),
        };

        let runners: Vec<Arc<dyn Runner>> = self.pool.runners().await;
        let placed = self.placer.place(&lb_call, runners).await;

        let mut call = metadata.call.clone();
        call.started_at = Some(now_millis().max(call.created_at));
        call.completed_at = Some(now_millis().max(call.started_at.unwrap_or(0)));

        match placed {
            Ok(()) => {
                let response = lb_call.response.lock().await.take();
                let Some((status, headers, body)) = response else {
                    // The runner claimed success but never streamed a
                    // response; treat the call as broken downstream.
                    call.status = CallStatus::Error;
                    call.error = Some("runner returned no response".into());
                    self.record(&call).await;
                    return Err(ApiError::ContainerError(
                        "runner returned no response".into(),
                    ));
                };
                call.status = CallStatus::Success;
                self.record(&call).await;
                self.metrics.calls.inc(call.status.as_str());
                Ok(InvocationResult {
                    status,
                    headers,
                    body,
                    call,
                })
            }
            Err(err) => {
                call.status = match err {
                    ApiError::DeadlineExceeded | ApiError::PlacementTimeout => CallStatus::Timeout,
                    _ => CallStatus::Error,
                };
                call.error = Some(err.to_string());
                self.record(&call).await;
                self.metrics.calls.inc(call.status.as_str());
                debug!(call_id = %call.id, error = %err, "placement failed");
                Err(err)
            }
        }
    }

    async fn enqueue(&self, call: Call) -> ApiResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ApiError::NodeDraining);
        }
        // Async calls ride the hybrid client to the api tier's queue.
        self.da.insert_call(&call).await?;
        self.da.enqueue(&call).await
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.shutdown().await;
    }
}

impl LbAgent {
    async fn record(&self, call: &Call) {
        match self.da.insert_call(call).await {
            Ok(()) | Err(ApiError::NotSupported) => {}
            Err(e) => warn!(call_id = %call.id, error = %e, "failed to record call"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{cancel_channel, CallMetadata};
    use kiln_core::models::Format;
    use kiln_core::{App, Route, RouteType};
    use kiln_dataaccess::NopAccess;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    /// A runner that accepts and responds with a fixed body.
    struct RespondingRunner {
        address: String,
        accept: bool,
        attempts: AtomicU32,
    }

    impl RespondingRunner {
        fn new(address: &str, accept: bool) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                accept,
                attempts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Runner for RespondingRunner {
        fn address(&self) -> &str {
            &self.address
        }

        async fn try_exec(&self, call: &dyn RunnerCall) -> ApiResult<bool> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            if !self.accept {
                return Ok(false);
            }
            call.respond(200, Vec::new(), Bytes::from_static(b"remote pong"))
                .await?;
            Ok(true)
        }
    }

    struct FixedPool {
        runners: Vec<Arc<dyn Runner>>,
    }

    #[async_trait]
    impl RunnerPool for FixedPool {
        async fn runners(&self) -> Vec<Arc<dyn Runner>> {
            self.runners.clone()
        }

        async fn shutdown(&self) {}
    }

    fn test_invocation() -> Invocation {
        let app = App {
            id: "a-1".into(),
            name: "myapp".into(),
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: 1,
            updated_at: 1,
        };
        let route = Route {
            app_name: "myapp".into(),
            path: "/hello".into(),
            image: "hello:v1".into(),
            memory_mb: 128,
            cpu_shares: 0,
            timeout_secs: 30,
            idle_timeout_secs: 30,
            route_type: RouteType::Sync,
            format: Format::Json,
            config: BTreeMap::new(),
        };
        let call = Call::new("c-1".into(), &app, Some("/hello".into()), None);
        let metadata = CallMetadata::from_route(&app, &route, call);
        let (_tx, rx) = cancel_channel();
        Invocation::new(metadata, Bytes::from_static(b"ping"), None, rx)
    }

    fn lb_with(runners: Vec<Arc<dyn Runner>>) -> Arc<LbAgent> {
        LbAgent::new(
            Arc::new(NopAccess),
            Arc::new(FixedPool { runners }),
            Arc::new(kiln_placement::NaivePlacer::new()),
            Registry::new(),
        )
    }

    #[tokio::test]
    async fn placed_call_streams_the_runner_response() {
        let runner = RespondingRunner::new("r1:9190", true);
        let lb = lb_with(vec![runner.clone()]);

        let result = lb.submit(test_invocation()).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(&result.body[..], b"remote pong");
        assert_eq!(result.call.status, CallStatus::Success);
    }

    #[tokio::test]
    async fn falls_through_to_an_accepting_runner() {
        let loaded = RespondingRunner::new("r1:9190", false);
        let free = RespondingRunner::new("r2:9190", true);
        let lb = lb_with(vec![loaded.clone(), free.clone()]);

        let result = lb.submit(test_invocation()).await.unwrap();
        assert_eq!(&result.body[..], b"remote pong");
        assert_eq!(free.attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_runners_surface_resource_unavailable() {
        let lb = lb_with(vec![
            RespondingRunner::new("r1:9190", false),
            RespondingRunner::new("r2:9190", false),
        ]);

        let err = lb.submit(test_invocation()).await.unwrap_err();
        assert_eq!(err, ApiError::ResourceUnavailable);
    }

    #[tokio::test]
    async fn closed_lb_refuses_submits() {
        let lb = lb_with(vec![RespondingRunner::new("r1:9190", true)]);
        lb.close().await;
        let err = lb.submit(test_invocation()).await.unwrap_err();
        assert_eq!(err, ApiError::NodeDraining);
    }
}
