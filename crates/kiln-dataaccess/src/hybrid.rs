//! Hybrid client — HTTP+JSON access to an api node's control plane.
//!
//! Runner and lb nodes resolve catalog metadata and persist call state
//! through the api tier's `/v1/runner/...` endpoints instead of holding
//! a datastore themselves.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use kiln_core::{ApiError, ApiResult, App, Call, Fn, Route, Trigger};

use crate::wire::{FinishBody, LogBody, NackBody};
use crate::DataAccess;

/// HTTP+JSON client for a remote api node.
pub struct HybridClient {
    base: String,
    client: reqwest::Client,
}

impl HybridClient {
    /// `base` is the api node's root url, e.g. `http://api:8080`.
    pub fn new(base: &str) -> ApiResult<Self> {
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ApiError::Validation(format!(
                "runner api url must be http(s): {base}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &'static str) -> ApiResult<T> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(what)),
            status if status.is_success() => resp
                .json::<T>()
                .await
                .map_err(|e| ApiError::Upstream(format!("decoding {what}: {e}"))),
            status => Err(ApiError::Upstream(format!(
                "api node returned {status} for {path}"
            ))),
        }
    }

    async fn send_json<B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> ApiResult<reqwest::Response> {
        let mut req = self.client.request(method, self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(transport_err)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(ApiError::Upstream(format!(
                "api node returned {} for {path}",
                resp.status()
            )))
        }
    }
}

fn transport_err(e: reqwest::Error) -> ApiError {
    ApiError::Upstream(format!("api node unreachable: {e}"))
}

#[async_trait]
impl DataAccess for HybridClient {
    async fn get_app_by_id(&self, id: &str) -> ApiResult<App> {
        self.get_json(&format!("/v1/runner/apps/{id}"), "app").await
    }

    async fn get_app_by_name(&self, name: &str) -> ApiResult<App> {
        self.get_json(&format!("/v1/runner/apps/{name}?by=name"), "app")
            .await
    }

    async fn get_route(&self, app_name: &str, path: &str) -> ApiResult<Route> {
        let trimmed = path.trim_start_matches('/');
        self.get_json(
            &format!("/v1/runner/apps/{app_name}/routes/{trimmed}"),
            "route",
        )
        .await
    }

    async fn get_fn(&self, fn_id: &str) -> ApiResult<Fn> {
        self.get_json(&format!("/v1/runner/fns/{fn_id}"), "fn").await
    }

    async fn get_trigger_by_source(&self, app_id: &str, source: &str) -> ApiResult<Trigger> {
        let trimmed = source.trim_start_matches('/');
        self.get_json(
            &format!("/v1/runner/apps/{app_id}/triggers/{trimmed}"),
            "trigger",
        )
        .await
    }

    async fn insert_call(&self, call: &Call) -> ApiResult<()> {
        debug!(call_id = %call.id, status = call.status.as_str(), "reporting call to api node");
        if call.status.is_terminal() {
            // Completion goes through /finish so the api node can pair
            // the record with its log in one write.
            let body = FinishBody {
                call: call.clone(),
                log: String::new(),
            };
            self.send_json(reqwest::Method::POST, "/v1/runner/finish", Some(&body))
                .await?;
        } else {
            self.send_json(reqwest::Method::POST, "/v1/runner/start", Some(call))
                .await?;
        }
        Ok(())
    }

    async fn insert_log(&self, _app_name: &str, call_id: &str, log: &[u8]) -> ApiResult<()> {
        let body = LogBody {
            log: String::from_utf8_lossy(log).into_owned(),
        };
        self.send_json(
            reqwest::Method::POST,
            &format!("/v1/runner/logs/{call_id}"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn enqueue(&self, call: &Call) -> ApiResult<()> {
        self.send_json(reqwest::Method::PUT, "/v1/runner/async", Some(call))
            .await?;
        Ok(())
    }

    async fn dequeue_one(&self) -> ApiResult<Option<Call>> {
        let resp = self
            .client
            .get(self.url("/v1/runner/async"))
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let call = resp
                    .json::<Call>()
                    .await
                    .map_err(|e| ApiError::Upstream(format!("decoding call: {e}")))?;
                Ok(Some(call))
            }
            status => Err(ApiError::Upstream(format!(
                "api node returned {status} for dequeue"
            ))),
        }
    }

    async fn delete_from_queue(&self, call_id: &str) -> ApiResult<bool> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/runner/async/{call_id}")))
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ApiError::Upstream(format!(
                "api node returned {status} for queue delete"
            ))),
        }
    }

    async fn return_to_queue(&self, call_id: &str, delay: Duration) -> ApiResult<()> {
        let body = NackBody {
            delay_ms: delay.as_millis() as u64,
        };
        self.send_json(
            reqwest::Method::POST,
            &format!("/v1/runner/async/{call_id}/nack"),
            Some(&body),
        )
        .await?;
        Ok(())
    }
}
