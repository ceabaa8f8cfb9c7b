//! kiln-api — every HTTP surface a kiln node can mount.
//!
//! Routers are built per concern and composed by the binary according
//! to the node role:
//!
//! - [`catalog_router`] — `/v1` + `/v2` CRUD and the `/v1/runner`
//!   hybrid control plane (api and full nodes)
//! - [`invoke_router`] — `/r/{app}[/{route...}]` (full, runner, lb)
//! - [`admin_router`] — `/version`, `/metrics`, `/debug` (every node)
//! - [`cache_admin_router`] — cache invalidation on runner/lb nodes

pub mod admin;
pub mod error;
pub mod hybrid;
pub mod invoke;
pub mod trigger;
pub mod v1;
pub mod v2;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use kiln_agent::Agent;
use kiln_dataaccess::DataAccess;
use kiln_metrics::Registry;
use kiln_state::{Datastore, LogStore, MessageQueue};

pub use error::HttpError;
pub use trigger::{RequestBase, RequestBasedAnnotator, StaticUrlAnnotator, TriggerAnnotator};

/// State for the catalog surfaces (api and full nodes).
#[derive(Clone)]
pub struct CatalogState {
    pub datastore: Arc<dyn Datastore>,
    pub logstore: Arc<dyn LogStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub annotator: Arc<dyn TriggerAnnotator>,
}

/// State for the invocation surface (full, runner, lb nodes).
#[derive(Clone)]
pub struct InvokeState {
    pub da: Arc<dyn DataAccess>,
    pub agent: Arc<dyn Agent>,
    /// Header carrying the client-supplied request id, when configured.
    pub rid_header: Option<String>,
}

/// State for the admin surface.
#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Registry>,
    pub tracked_processes: Vec<String>,
    pub node_type: &'static str,
}

/// `/v1` + `/v2` + `/v1/runner` for nodes that own the catalog.
pub fn catalog_router(state: CatalogState) -> Router {
    Router::new()
        .merge(v1::router())
        .merge(v2::router())
        .merge(hybrid::router())
        .with_state(state)
}

/// `/r/...` for nodes that execute or dispatch invocations.
pub fn invoke_router(state: InvokeState) -> Router {
    invoke::router().with_state(state)
}

/// `/version`, `/metrics`, `/debug/...`.
pub fn admin_router(state: AdminState) -> Router {
    admin::router().with_state(state)
}

/// Cache invalidation endpoint mounted on runner and lb nodes.
pub fn cache_admin_router(invalidator: Arc<dyn kiln_dataaccess::cached::CacheInvalidator>) -> Router {
    hybrid::cache_admin(invalidator)
}

/// The root ping every node answers.
pub fn ping_router() -> Router {
    Router::new().route(
        "/",
        get(|| async { axum::Json(serde_json::json!({"hello": "kiln"})) }),
    )
}

/// Build a CORS layer from the configured origin and header lists.
/// `None` when CORS is not configured.
pub fn cors_layer(origins: &str, headers: &str) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let origin = if origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };
    let mut layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(tower_http::cors::AllowMethods::mirror_request());
    layer = if headers.is_empty() {
        layer.allow_headers(AllowHeaders::mirror_request())
    } else {
        let parsed: Vec<axum::http::HeaderName> = headers
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .filter_map(|h| h.parse().ok())
            .collect();
        layer.allow_headers(AllowHeaders::list(parsed))
    };
    Some(layer)
}
