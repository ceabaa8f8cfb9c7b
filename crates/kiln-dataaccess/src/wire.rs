//! JSON bodies of the hybrid control-plane protocol.
//!
//! Shared between the [`HybridClient`](crate::HybridClient) and the api
//! tier's `/v1/runner/...` handlers so both sides agree on the shapes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kiln_core::Call;

/// POST /v1/runner/finish — completion record plus the log blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishBody {
    pub call: Call,
    /// Function output log; functions write text, so a lossy string is
    /// the wire form.
    #[serde(default)]
    pub log: String,
}

/// POST /v1/runner/logs/{call_id} — a log blob on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBody {
    pub log: String,
}

/// POST /v1/runner/async/{call_id}/nack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackBody {
    pub delay_ms: u64,
}

impl NackBody {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Error payload every kiln HTTP surface returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine-readable kind, e.g. `not-found`.
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            error: ErrorInfo {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        }
    }
}
