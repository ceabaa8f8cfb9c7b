//! The per-request invocation object.
//!
//! Built once the catalog metadata is resolved, an [`Invocation`] binds
//! exactly one app, one route-or-function, and one slot key, and carries
//! the deadline and cancellation token through every suspension point.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use kiln_core::models::{now_millis, Format};
use kiln_core::{App, Call, Fn, Route};
use kiln_pool::{ContainerSpec, SlotKey};

/// The invocation-invariant metadata an lb resolves and a pure-runner
/// trusts. This is the payload of the submit protocol's header frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    pub call: Call,
    pub image: String,
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub format: Format,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Route path or fn name, used for metric labels.
    pub label: String,
}

impl CallMetadata {
    pub fn from_route(app: &App, route: &Route, call: Call) -> Self {
        let mut env = app.config.clone();
        env.extend(route.config.clone());
        CallMetadata {
            call,
            image: route.image.clone(),
            memory_mb: route.memory_mb,
            cpu_shares: route.cpu_shares,
            timeout_secs: route.timeout_secs,
            idle_timeout_secs: route.idle_timeout_secs,
            format: route.format,
            env,
            label: route.path.clone(),
        }
    }

    pub fn from_fn(app: &App, f: &Fn, call: Call) -> Self {
        let mut env = app.config.clone();
        env.extend(f.config.clone());
        CallMetadata {
            call,
            image: f.image.clone(),
            memory_mb: f.memory_mb,
            cpu_shares: f.cpu_shares,
            timeout_secs: f.timeout_secs,
            idle_timeout_secs: f.idle_timeout_secs,
            format: f.format,
            env,
            label: f.name.clone(),
        }
    }

    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            memory_mb: self.memory_mb,
            cpu_shares: self.cpu_shares,
            format: self.format,
            env: self.env.clone(),
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::derive(
            &self.image,
            self.memory_mb,
            self.cpu_shares,
            self.timeout_secs,
            self.idle_timeout_secs,
            self.format,
            &self.env,
        )
    }
}

/// One in-flight invocation on an execution node.
pub struct Invocation {
    pub metadata: CallMetadata,
    pub slot_key: SlotKey,
    pub deadline: Instant,
    pub cancel: watch::Receiver<bool>,
    pub input: Bytes,
}

impl Invocation {
    /// Bind metadata to a request. The effective deadline is the lesser
    /// of the caller's remaining budget and the function's own timeout.
    pub fn new(
        metadata: CallMetadata,
        input: Bytes,
        request_budget: Option<Duration>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let fn_budget = Duration::from_secs(metadata.timeout_secs);
        let budget = match request_budget {
            Some(req) => req.min(fn_budget),
            None => fn_budget,
        };
        let slot_key = metadata.slot_key();
        Invocation {
            metadata,
            slot_key,
            deadline: Instant::now() + budget,
            cancel,
            input,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.idle_timeout_secs)
    }

    /// Mark the call started, preserving timestamp ordering.
    pub fn start_record(&mut self) -> &Call {
        let call = &mut self.metadata.call;
        call.status = kiln_core::CallStatus::Running;
        call.started_at = Some(now_millis().max(call.created_at));
        call
    }
}

/// A cancellation token pair; the sender side trips when the client
/// goes away.
pub fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
