//! The hybrid control plane.
//!
//! Api nodes serve `/v1/runner/...` for runner and lb nodes: catalog
//! resolution by id, call-record start/finish, log ingestion, and the
//! async queue. Runner-side nodes mount the small cache-admin router so
//! an operator (or the api tier) can force-refresh cached entries.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

use kiln_core::models::TriggerType;
use kiln_core::{ApiError, Call};
use kiln_dataaccess::wire::{FinishBody, LogBody, NackBody};
use kiln_dataaccess::CacheInvalidator;

use crate::error::HttpError;
use crate::CatalogState;

pub fn router() -> Router<CatalogState> {
    // One parameter name per tree position; matchit rejects mixed
    // capture names at the same depth.
    Router::new()
        .route("/v1/runner/apps/:app", get(resolve_app))
        .route("/v1/runner/apps/:app/routes/*route", get(resolve_route))
        .route("/v1/runner/fns/:fn_id", get(resolve_fn))
        .route(
            "/v1/runner/apps/:app/triggers/*source",
            get(resolve_trigger),
        )
        .route("/v1/runner/start", post(start_call))
        .route("/v1/runner/finish", post(finish_call))
        .route("/v1/runner/logs/:call_id", post(insert_log))
        .route("/v1/runner/async", put(enqueue).get(dequeue))
        .route("/v1/runner/async/:call_id", delete(delete_queued))
        .route("/v1/runner/async/:call_id/nack", post(nack_queued))
}

#[derive(Deserialize)]
struct ResolveParams {
    by: Option<String>,
}

async fn resolve_app(
    State(st): State<CatalogState>,
    Path(key): Path<String>,
    Query(params): Query<ResolveParams>,
) -> Result<impl IntoResponse, HttpError> {
    let app = match params.by.as_deref() {
        Some("name") => st.datastore.get_app_by_name(&key)?,
        _ => st.datastore.get_app(&key)?,
    };
    let app = app.ok_or(ApiError::NotFound("app"))?;
    Ok(Json(app))
}

async fn resolve_route(
    State(st): State<CatalogState>,
    Path((app_name, route)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    let path = if route.starts_with('/') {
        route
    } else {
        format!("/{route}")
    };
    let route = st
        .datastore
        .get_route(&app_name, &path)?
        .ok_or(ApiError::NotFound("route"))?;
    Ok(Json(route))
}

async fn resolve_fn(
    State(st): State<CatalogState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let func = st
        .datastore
        .get_fn(&fn_id)?
        .ok_or(ApiError::NotFound("fn"))?;
    Ok(Json(func))
}

async fn resolve_trigger(
    State(st): State<CatalogState>,
    Path((app_id, source)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    let source = if source.starts_with('/') {
        source
    } else {
        format!("/{source}")
    };
    let trigger = st
        .datastore
        .get_trigger_by_source(&app_id, TriggerType::Http, &source)?
        .ok_or(ApiError::NotFound("trigger"))?;
    Ok(Json(trigger))
}

async fn start_call(
    State(st): State<CatalogState>,
    Json(call): Json<Call>,
) -> Result<impl IntoResponse, HttpError> {
    debug!(call_id = %call.id, "runner reported call start");
    st.datastore.upsert_call(&call)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn finish_call(
    State(st): State<CatalogState>,
    Json(body): Json<FinishBody>,
) -> Result<impl IntoResponse, HttpError> {
    st.datastore.upsert_call(&body.call)?;
    if !body.log.is_empty() {
        st.logstore.insert_log(&body.call.id, body.log.as_bytes())?;
    }
    debug!(call_id = %body.call.id, status = body.call.status.as_str(), "runner reported call finish");
    Ok(StatusCode::NO_CONTENT)
}

async fn insert_log(
    State(st): State<CatalogState>,
    Path(call_id): Path<String>,
    Json(body): Json<LogBody>,
) -> Result<impl IntoResponse, HttpError> {
    st.logstore.insert_log(&call_id, body.log.as_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enqueue(
    State(st): State<CatalogState>,
    Json(call): Json<Call>,
) -> Result<impl IntoResponse, HttpError> {
    st.queue
        .push(call)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dequeue(State(st): State<CatalogState>) -> Result<impl IntoResponse, HttpError> {
    match st
        .queue
        .pop()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        Some(call) => Ok(Json(call).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn delete_queued(
    State(st): State<CatalogState>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let existed = st
        .queue
        .delete(&call_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("queued call").into())
    }
}

async fn nack_queued(
    State(st): State<CatalogState>,
    Path(call_id): Path<String>,
    Json(body): Json<NackBody>,
) -> Result<impl IntoResponse, HttpError> {
    st.queue
        .nack(&call_id, body.delay())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Runner-side cache admin ────────────────────────────────────

/// `DELETE /v1/runner/apps/{app_id}` on a runner or lb node drops that
/// app's cached entries so the next lookup refetches.
pub fn cache_admin(invalidator: Arc<dyn CacheInvalidator>) -> Router {
    Router::new()
        .route("/v1/runner/apps/:app_id", delete(invalidate_app))
        .with_state(invalidator)
}

async fn invalidate_app(
    State(invalidator): State<Arc<dyn CacheInvalidator>>,
    Path(app_id): Path<String>,
) -> StatusCode {
    invalidator.invalidate_app(&app_id).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::RequestBasedAnnotator;
    use kiln_core::models::CallStatus;
    use kiln_core::App;
    use kiln_state::{Datastore, LogStore, MemoryQueue, RedbStore};
    use std::collections::BTreeMap;

    fn state() -> CatalogState {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        CatalogState {
            datastore: store.clone(),
            logstore: store,
            queue: Arc::new(MemoryQueue::new()),
            annotator: Arc::new(RequestBasedAnnotator),
        }
    }

    fn seed_app(st: &CatalogState) -> App {
        let app = App {
            id: "a-1".into(),
            name: "myapp".into(),
            config: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_at: 1,
            updated_at: 1,
        };
        st.datastore.insert_app(&app).unwrap();
        app
    }

    #[tokio::test]
    async fn resolves_apps_by_id_and_by_name() {
        let st = state();
        seed_app(&st);

        let ok = resolve_app(
            State(st.clone()),
            Path("a-1".to_string()),
            Query(ResolveParams { by: None }),
        )
        .await;
        assert!(ok.is_ok());

        let ok = resolve_app(
            State(st.clone()),
            Path("myapp".to_string()),
            Query(ResolveParams {
                by: Some("name".to_string()),
            }),
        )
        .await;
        assert!(ok.is_ok());

        let err = resolve_app(
            State(st),
            Path("missing".to_string()),
            Query(ResolveParams { by: None }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err.0, ApiError::NotFound("app")));
    }

    #[tokio::test]
    async fn finish_persists_record_and_log_together() {
        let st = state();
        let app = seed_app(&st);
        let mut call = Call::new("c-1".into(), &app, Some("/hello".into()), None);
        call.status = CallStatus::Success;

        finish_call(
            State(st.clone()),
            Json(FinishBody {
                call: call.clone(),
                log: "line\n".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            st.datastore.get_call("myapp", "c-1").unwrap().unwrap().status,
            CallStatus::Success
        );
        assert_eq!(st.logstore.get_log("c-1").unwrap().unwrap(), b"line\n");
    }

    #[tokio::test]
    async fn queue_endpoints_roundtrip() {
        let st = state();
        let app = seed_app(&st);
        let call = Call::new("c-1".into(), &app, Some("/hello".into()), None);

        enqueue(State(st.clone()), Json(call)).await.unwrap();

        let response = dequeue(State(st.clone())).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);

        delete_queued(State(st.clone()), Path("c-1".to_string()))
            .await
            .unwrap();
        let response = dequeue(State(st)).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn nack_delays_a_reserved_call() {
        let st = state();
        let app = seed_app(&st);
        let call = Call::new("c-1".into(), &app, Some("/hello".into()), None);

        enqueue(State(st.clone()), Json(call)).await.unwrap();
        dequeue(State(st.clone())).await.unwrap();
        nack_queued(
            State(st.clone()),
            Path("c-1".to_string()),
            Json(NackBody { delay_ms: 50 }),
        )
        .await
        .unwrap();

        let response = dequeue(State(st.clone())).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        tokio::time::sleep(std::time::Duration::from_millis(70)).await;
        let response = dequeue(State(st)).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
