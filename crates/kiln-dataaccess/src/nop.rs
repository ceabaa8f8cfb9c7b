//! Nop data access — pure-runner nodes carry no catalog.

use std::time::Duration;

use async_trait::async_trait;

use kiln_core::{ApiError, ApiResult, App, Call, Fn, Route, Trigger};

use crate::DataAccess;

/// Rejects every operation with `NotSupported`. A pure-runner trusts
/// the metadata in the submit header frame instead.
pub struct NopAccess;

#[async_trait]
impl DataAccess for NopAccess {
    async fn get_app_by_id(&self, _id: &str) -> ApiResult<App> {
        Err(ApiError::NotSupported)
    }

    async fn get_app_by_name(&self, _name: &str) -> ApiResult<App> {
        Err(ApiError::NotSupported)
    }

    async fn get_route(&self, _app_name: &str, _path: &str) -> ApiResult<Route> {
        Err(ApiError::NotSupported)
    }

    async fn get_fn(&self, _fn_id: &str) -> ApiResult<Fn> {
        Err(ApiError::NotSupported)
    }

    async fn get_trigger_by_source(&self, _app_id: &str, _source: &str) -> ApiResult<Trigger> {
        Err(ApiError::NotSupported)
    }

    async fn insert_call(&self, _call: &Call) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    async fn insert_log(&self, _app_name: &str, _call_id: &str, _log: &[u8]) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    async fn enqueue(&self, _call: &Call) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    async fn dequeue_one(&self) -> ApiResult<Option<Call>> {
        Err(ApiError::NotSupported)
    }

    async fn delete_from_queue(&self, _call_id: &str) -> ApiResult<bool> {
        Err(ApiError::NotSupported)
    }

    async fn return_to_queue(&self, _call_id: &str, _delay: Duration) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }
}
