//! Direct data access — binds the node-local stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kiln_core::models::TriggerType;
use kiln_core::{ApiError, ApiResult, App, Call, Fn, Route, Trigger};
use kiln_state::{Datastore, LogStore, MessageQueue};

use crate::DataAccess;

/// Data access bound to local datastore, log store, and queue. Used on
/// full and api nodes.
pub struct DirectAccess {
    datastore: Arc<dyn Datastore>,
    logstore: Arc<dyn LogStore>,
    queue: Arc<dyn MessageQueue>,
}

impl DirectAccess {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        logstore: Arc<dyn LogStore>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            datastore,
            logstore,
            queue,
        }
    }
}

#[async_trait]
impl DataAccess for DirectAccess {
    async fn get_app_by_id(&self, id: &str) -> ApiResult<App> {
        self.datastore
            .get_app(id)?
            .ok_or(ApiError::NotFound("app"))
    }

    async fn get_app_by_name(&self, name: &str) -> ApiResult<App> {
        self.datastore
            .get_app_by_name(name)?
            .ok_or(ApiError::NotFound("app"))
    }

    async fn get_route(&self, app_name: &str, path: &str) -> ApiResult<Route> {
        self.datastore
            .get_route(app_name, path)?
            .ok_or(ApiError::NotFound("route"))
    }

    async fn get_fn(&self, fn_id: &str) -> ApiResult<Fn> {
        self.datastore.get_fn(fn_id)?.ok_or(ApiError::NotFound("fn"))
    }

    async fn get_trigger_by_source(&self, app_id: &str, source: &str) -> ApiResult<Trigger> {
        self.datastore
            .get_trigger_by_source(app_id, TriggerType::Http, source)?
            .ok_or(ApiError::NotFound("trigger"))
    }

    async fn insert_call(&self, call: &Call) -> ApiResult<()> {
        self.datastore.upsert_call(call)?;
        Ok(())
    }

    async fn insert_log(&self, _app_name: &str, call_id: &str, log: &[u8]) -> ApiResult<()> {
        self.logstore.insert_log(call_id, log)?;
        Ok(())
    }

    async fn enqueue(&self, call: &Call) -> ApiResult<()> {
        self.queue
            .push(call.clone())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    async fn dequeue_one(&self) -> ApiResult<Option<Call>> {
        self.queue
            .pop()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    async fn delete_from_queue(&self, call_id: &str) -> ApiResult<bool> {
        self.queue
            .delete(call_id)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    async fn return_to_queue(&self, call_id: &str, delay: Duration) -> ApiResult<()> {
        self.queue
            .nack(call_id, delay)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }
}
