//! Scripted runners and calls shared by the placer tests.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::time::Instant;

use kiln_core::{ApiError, ApiResult};

use crate::{Runner, RunnerCall};

pub enum Script {
    Accept,
    Reject,
    Fail(ApiError),
}

pub struct ScriptedRunner {
    address: String,
    script: Script,
    attempts: AtomicU32,
}

impl ScriptedRunner {
    pub fn accepting(address: &str) -> Self {
        Self::new(address, Script::Accept)
    }

    pub fn rejecting(address: &str) -> Self {
        Self::new(address, Script::Reject)
    }

    pub fn failing(address: &str, err: ApiError) -> Self {
        Self::new(address, Script::Fail(err))
    }

    fn new(address: &str, script: Script) -> Self {
        Self {
            address: address.to_string(),
            script,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn try_exec(&self, _call: &dyn RunnerCall) -> ApiResult<bool> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match &self.script {
            Script::Accept => Ok(true),
            Script::Reject => Ok(false),
            Script::Fail(err) => Err(err.clone()),
        }
    }
}

pub struct TestCall {
    slot_key: String,
    deadline: Instant,
}

impl TestCall {
    pub fn new(slot_key: &str) -> Self {
        Self::with_deadline(slot_key, Instant::now() + std::time::Duration::from_secs(10))
    }

    pub fn with_deadline(slot_key: &str, deadline: Instant) -> Self {
        Self {
            slot_key: slot_key.to_string(),
            deadline,
        }
    }
}

#[async_trait]
impl RunnerCall for TestCall {
    fn slot_key(&self) -> &str {
        &self.slot_key
    }

    fn metadata_json(&self) -> String {
        "{}".to_string()
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn input(&self) -> bytes::Bytes {
        bytes::Bytes::new()
    }

    async fn respond(
        &self,
        _status: u16,
        _headers: Vec<(String, String)>,
        _body: bytes::Bytes,
    ) -> ApiResult<()> {
        Ok(())
    }
}
