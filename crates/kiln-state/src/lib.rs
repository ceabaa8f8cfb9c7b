//! kiln-state — storage for the catalog, call logs, and the async queue.
//!
//! Three capabilities with trait seams so concrete drivers stay
//! swappable:
//!
//! - [`Datastore`] — catalog CRUD (apps, routes, fns, triggers, calls)
//! - [`LogStore`] — opaque per-call log blobs
//! - [`MessageQueue`] — at-least-once delivery for async calls
//!
//! The default datastore/logstore driver is redb with JSON values (one
//! store can serve both capabilities); the default queue is in-memory
//! with reservation-based redelivery. Drivers are chosen by url scheme:
//! `redb:///path/to/db` or `mem://`.

pub mod error;
pub mod queue;
pub mod store;
mod tables;

use std::sync::Arc;

pub use error::{StoreError, StoreResult};
pub use queue::{MemoryQueue, MessageQueue};
pub use store::{Datastore, LogStore, RedbStore};

/// Open a datastore from a url.
///
/// Schemes: `redb://<path>` (on-disk) and `mem://` (ephemeral, testing).
pub fn datastore_from_url(url: &str) -> StoreResult<Arc<RedbStore>> {
    if let Some(path) = url.strip_prefix("redb://") {
        return Ok(Arc::new(RedbStore::open(std::path::Path::new(path))?));
    }
    if url == "mem://" || url.starts_with("mem://") {
        return Ok(Arc::new(RedbStore::open_in_memory()?));
    }
    Err(StoreError::Open(format!(
        "unsupported datastore url scheme: {url}"
    )))
}

/// Open a message queue from a url. Only `mem://` ships in-tree.
pub fn queue_from_url(url: &str) -> StoreResult<Arc<MemoryQueue>> {
    if url == "mem://" || url.starts_with("mem://") {
        return Ok(Arc::new(MemoryQueue::new()));
    }
    Err(StoreError::Open(format!(
        "unsupported message queue url scheme: {url}"
    )))
}
