//! kiln-dataaccess — one capability set for catalog, logs, and queue.
//!
//! Every node role reads and writes platform state through [`DataAccess`];
//! the variant wired in depends on the role:
//!
//! - [`DirectAccess`] binds the local stores (full and api nodes)
//! - [`HybridClient`] speaks HTTP+JSON to an api node (runner and lb)
//! - [`CachedAccess`] wraps either with a short-TTL read cache
//! - [`NopAccess`] rejects everything (pure-runner nodes hold no catalog)

pub mod cached;
pub mod direct;
pub mod hybrid;
pub mod nop;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;

use kiln_core::{ApiResult, App, Call, Fn, Route, Trigger};

pub use cached::{CacheConfig, CacheInvalidator, CachedAccess};
pub use direct::DirectAccess;
pub use hybrid::HybridClient;
pub use nop::NopAccess;

/// Unified read/write of catalog + logs + queue from any node role.
///
/// Getters resolve to the entity or `ApiError::NotFound`; infrastructure
/// failures surface as `ApiError::Upstream` (remote) or
/// `ApiError::Internal` (local store).
#[async_trait]
pub trait DataAccess: Send + Sync {
    async fn get_app_by_id(&self, id: &str) -> ApiResult<App>;
    async fn get_app_by_name(&self, name: &str) -> ApiResult<App>;
    async fn get_route(&self, app_name: &str, path: &str) -> ApiResult<Route>;
    async fn get_fn(&self, fn_id: &str) -> ApiResult<Fn>;
    async fn get_trigger_by_source(&self, app_id: &str, source: &str) -> ApiResult<Trigger>;

    /// Insert or update a call record. Ordering contract: the start
    /// record is written before any log bytes, the completion record
    /// last.
    async fn insert_call(&self, call: &Call) -> ApiResult<()>;
    async fn insert_log(&self, app_name: &str, call_id: &str, log: &[u8]) -> ApiResult<()>;

    async fn enqueue(&self, call: &Call) -> ApiResult<()>;
    async fn dequeue_one(&self) -> ApiResult<Option<Call>>;
    async fn delete_from_queue(&self, call_id: &str) -> ApiResult<bool>;
    /// Return a reserved message for redelivery after `delay`.
    async fn return_to_queue(&self, call_id: &str, delay: Duration) -> ApiResult<()>;
}
