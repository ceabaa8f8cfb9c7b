//! Scripted container driver for tests.
//!
//! Counts launches and terminations, serves a canned response, and can
//! be told to fail launches, delay invocations, or report containers
//! unhealthy — enough to exercise every pool and agent path without a
//! real supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use kiln_core::{ApiError, ApiResult};

use crate::driver::{ContainerDriver, ContainerHandle, ContainerResponse, ContainerSpec};

#[derive(Default)]
struct Shared {
    launches: AtomicU64,
    terminations: AtomicU64,
    invocations: AtomicU64,
}

/// A driver whose containers are pure fiction.
pub struct MockDriver {
    shared: Arc<Shared>,
    response_body: Bytes,
    fail_launches: AtomicBool,
    invoke_delay: Duration,
    unhealthy_after_invoke: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            response_body: Bytes::from_static(b"pong"),
            fail_launches: AtomicBool::new(false),
            invoke_delay: Duration::ZERO,
            unhealthy_after_invoke: false,
        }
    }

    pub fn with_response(mut self, body: &'static [u8]) -> Self {
        self.response_body = Bytes::from_static(body);
        self
    }

    /// Every invocation takes this long before responding.
    pub fn with_invoke_delay(mut self, delay: Duration) -> Self {
        self.invoke_delay = delay;
        self
    }

    /// Containers report unhealthy after their first invocation.
    pub fn with_single_use_containers(mut self) -> Self {
        self.unhealthy_after_invoke = true;
        self
    }

    /// Make subsequent launches fail.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Relaxed);
    }

    pub fn launch_count(&self) -> u64 {
        self.shared.launches.load(Ordering::Relaxed)
    }

    pub fn termination_count(&self) -> u64 {
        self.shared.terminations.load(Ordering::Relaxed)
    }

    pub fn invocation_count(&self) -> u64 {
        self.shared.invocations.load(Ordering::Relaxed)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn launch(&self, _spec: &ContainerSpec) -> ApiResult<Box<dyn ContainerHandle>> {
        if self.fail_launches.load(Ordering::Relaxed) {
            return Err(ApiError::ContainerError("mock launch failure".into()));
        }
        self.shared.launches.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockHandle {
            shared: self.shared.clone(),
            response_body: self.response_body.clone(),
            invoke_delay: self.invoke_delay,
            unhealthy_after_invoke: self.unhealthy_after_invoke,
            healthy: AtomicBool::new(true),
        }))
    }
}

struct MockHandle {
    shared: Arc<Shared>,
    response_body: Bytes,
    invoke_delay: Duration,
    unhealthy_after_invoke: bool,
    healthy: AtomicBool,
}

#[async_trait]
impl ContainerHandle for MockHandle {
    async fn invoke(&self, _input: Bytes, deadline: Instant) -> ApiResult<ContainerResponse> {
        self.shared.invocations.fetch_add(1, Ordering::Relaxed);
        if !self.invoke_delay.is_zero() {
            let woke = tokio::time::timeout_at(deadline, tokio::time::sleep(self.invoke_delay))
                .await
                .is_ok();
            if !woke {
                return Err(ApiError::DeadlineExceeded);
            }
        }
        if self.unhealthy_after_invoke {
            self.healthy.store(false, Ordering::Relaxed);
        }
        Ok(ContainerResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: self.response_body.clone(),
            log: b"mock container log\n".to_vec(),
        })
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn terminate(&self) {
        self.shared.terminations.fetch_add(1, Ordering::Relaxed);
    }
}
