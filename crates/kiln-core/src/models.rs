//! Catalog data model.
//!
//! Apps own routes (v1), functions (v2), and triggers. Call records are
//! written once per invocation attempt and are immutable after completion.
//! All entities serialize to JSON for storage and for the hybrid
//! control-plane wire format.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Default memory limit for a route or function, in MiB.
pub const DEFAULT_MEMORY_MB: u64 = 128;
/// Default execution timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default hot-container idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
/// Longest permitted execution timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Current Unix epoch in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Applications ───────────────────────────────────────────────

/// An application: the ownership root for routes, functions, and triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl App {
    /// Validate fields that must hold before the app is persisted.
    pub fn validate(&self) -> ApiResult<()> {
        validate_name("app name", &self.name)?;
        Ok(())
    }
}

// ── Routes (v1) ────────────────────────────────────────────────

/// Dispatch mode for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Sync,
    Async,
}

impl Default for RouteType {
    fn default() -> Self {
        RouteType::Sync
    }
}

/// I/O framing between the platform and the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Default,
    Http,
    #[serde(rename = "cloudevent")]
    CloudEvent,
    Json,
}

impl Default for Format {
    fn default() -> Self {
        Format::Default
    }
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Default => "default",
            Format::Http => "http",
            Format::CloudEvent => "cloudevent",
            Format::Json => "json",
        }
    }
}

/// A v1 route: an invocable unit addressed by (app name, path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub app_name: String,
    pub path: String,
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_shares: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default, rename = "type")]
    pub route_type: RouteType,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_MB
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl Route {
    pub fn validate(&self) -> ApiResult<()> {
        if !self.path.starts_with('/') {
            return Err(ApiError::Validation("route path must begin with '/'".into()));
        }
        if self.image.is_empty() {
            return Err(ApiError::Validation("route image must be set".into()));
        }
        validate_limits(self.memory_mb, self.timeout_secs)
    }
}

// ── Functions (v2) ─────────────────────────────────────────────

/// A v2 function: an invocable unit addressed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fn {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_shares: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub format: Format,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Fn {
    pub fn validate(&self) -> ApiResult<()> {
        validate_name("fn name", &self.name)?;
        if self.image.is_empty() {
            return Err(ApiError::Validation("fn image must be set".into()));
        }
        validate_limits(self.memory_mb, self.timeout_secs)
    }
}

// ── Triggers ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Http,
}

/// A trigger exposes a function at a public source path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub app_id: String,
    pub fn_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Annotation key under which a trigger's public invocation URL is exposed.
pub const TRIGGER_ENDPOINT_ANNOTATION: &str = "kiln.io/trigger/httpEndpoint";

impl Trigger {
    pub fn validate(&self) -> ApiResult<()> {
        validate_name("trigger name", &self.name)?;
        if !self.source.starts_with('/') {
            return Err(ApiError::Validation(
                "trigger source must begin with '/'".into(),
            ));
        }
        Ok(())
    }
}

// ── Calls ──────────────────────────────────────────────────────

/// Lifecycle state of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Success,
    Error,
    Timeout,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Running => "running",
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Timeout => "timeout",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Success | CallStatus::Error | CallStatus::Timeout
        )
    }
}

/// Resource usage observed for one completed call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub duration_ms: u64,
    pub memory_mb: u64,
    pub cpu_shares: u64,
}

/// One invocation attempt. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub app_id: String,
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fn_id: Option<String>,
    pub status: CallStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CallStats>,
    /// Request body for async calls; rides the queue message and is
    /// dropped from the record once the call runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Call {
    /// A fresh call record in `Queued` state.
    pub fn new(id: String, app: &App, path: Option<String>, fn_id: Option<String>) -> Self {
        Call {
            id,
            app_id: app.id.clone(),
            app_name: app.name.clone(),
            path,
            fn_id,
            status: CallStatus::Queued,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            error: None,
            stats: None,
            payload: None,
        }
    }
}

// ── Validation helpers ─────────────────────────────────────────

fn validate_name(what: &str, name: &str) -> ApiResult<()> {
    if name.is_empty() {
        return Err(ApiError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > 255 {
        return Err(ApiError::Validation(format!("{what} is too long")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::Validation(format!(
            "{what} may only contain [a-zA-Z0-9_-]"
        )));
    }
    Ok(())
}

fn validate_limits(memory_mb: u64, timeout_secs: u64) -> ApiResult<()> {
    if memory_mb == 0 {
        return Err(ApiError::Validation("memory must be positive".into()));
    }
    if timeout_secs == 0 || timeout_secs > MAX_TIMEOUT_SECS {
        return Err(ApiError::Validation(format!(
            "timeout must be in 1..={MAX_TIMEOUT_SECS} seconds"
        )));
    }
    Ok(())
}
