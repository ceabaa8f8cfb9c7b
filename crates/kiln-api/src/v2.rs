//! Current by-id CRUD: `/v2/apps`, `/v2/fns`, `/v2/triggers`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use kiln_core::models::{now_millis, TriggerType};
use kiln_core::{id, ApiError, Fn, Trigger};

use crate::error::HttpError;
use crate::trigger::RequestBase;
use crate::v1::{ListBody, PageParams};
use crate::CatalogState;

pub fn router() -> Router<CatalogState> {
    Router::new()
        .route("/v2/apps", get(list_apps).post(create_app))
        .route(
            "/v2/apps/:app_id",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/v2/fns", get(list_fns).post(create_fn))
        .route("/v2/fns/:fn_id", get(get_fn).put(update_fn).delete(delete_fn))
        .route("/v2/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/v2/triggers/:trigger_id",
            get(get_trigger).put(update_trigger).delete(delete_trigger),
        )
}

/// Derive the annotation base from the inbound request headers.
fn request_base(headers: &HeaderMap) -> Option<(String, String)> {
    let host = headers.get("host")?.to_str().ok()?.to_string();
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    Some((scheme, host))
}

fn annotate(st: &CatalogState, trigger: &mut Trigger, headers: &HeaderMap) {
    let base = request_base(headers);
    let request = base
        .as_ref()
        .map(|(scheme, host)| RequestBase { scheme, host });
    st.annotator.annotate(trigger, request);
}

// ── Apps ───────────────────────────────────────────────────────

async fn list_apps(
    State(st): State<CatalogState>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, HttpError> {
    let apps = st
        .datastore
        .list_apps(page.cursor.as_deref(), page.limit())?;
    let next_cursor = (apps.len() == page.limit())
        .then(|| apps.last().map(|a| a.id.clone()))
        .flatten();
    Ok(Json(ListBody {
        items: apps,
        next_cursor,
    }))
}

#[derive(Deserialize)]
struct AppBody {
    name: String,
    #[serde(default)]
    config: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, serde_json::Value>,
}

async fn create_app(
    State(st): State<CatalogState>,
    Json(body): Json<AppBody>,
) -> Result<impl IntoResponse, HttpError> {
    let now = now_millis();
    let app = kiln_core::App {
        id: id::new_call_id(),
        name: body.name,
        config: body.config,
        annotations: body.annotations,
        created_at: now,
        updated_at: now,
    };
    app.validate()?;
    st.datastore.insert_app(&app)?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn get_app(
    State(st): State<CatalogState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let app = st
        .datastore
        .get_app(&app_id)?
        .ok_or(ApiError::NotFound("app"))?;
    Ok(Json(app))
}

async fn update_app(
    State(st): State<CatalogState>,
    Path(app_id): Path<String>,
    Json(body): Json<AppBody>,
) -> Result<impl IntoResponse, HttpError> {
    let mut app = st
        .datastore
        .get_app(&app_id)?
        .ok_or(ApiError::NotFound("app"))?;
    app.config = body.config;
    app.annotations = body.annotations;
    app.updated_at = now_millis();
    st.datastore.update_app(&app)?;
    Ok(Json(app))
}

async fn delete_app(
    State(st): State<CatalogState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    if !st.datastore.delete_app(&app_id)? {
        return Err(ApiError::NotFound("app").into());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Fns ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FnBody {
    #[serde(flatten)]
    func: Fn,
}

// Query structs spell the paging fields out: serde(flatten) breaks
// non-string types under urlencoded deserialization.
#[derive(Deserialize)]
struct FnListParams {
    cursor: Option<String>,
    per_page: Option<usize>,
    app_id: Option<String>,
}

impl FnListParams {
    fn page(&self) -> PageParams {
        PageParams {
            cursor: self.cursor.clone(),
            per_page: self.per_page,
        }
    }
}

async fn list_fns(
    State(st): State<CatalogState>,
    Query(params): Query<FnListParams>,
) -> Result<impl IntoResponse, HttpError> {
    let page = params.page();
    let fns = st
        .datastore
        .list_fns(params.app_id.as_deref(), page.cursor.as_deref(), page.limit())?;
    let next_cursor = (fns.len() == page.limit())
        .then(|| fns.last().map(|f| f.id.clone()))
        .flatten();
    Ok(Json(ListBody {
        items: fns,
        next_cursor,
    }))
}

async fn create_fn(
    State(st): State<CatalogState>,
    Json(body): Json<FnBody>,
) -> Result<impl IntoResponse, HttpError> {
    let mut func = body.func;
    st.datastore
        .get_app(&func.app_id)?
        .ok_or(ApiError::NotFound("app"))?;
    func.id = id::new_call_id();
    let now = now_millis();
    func.created_at = now;
    func.updated_at = now;
    func.validate()?;
    st.datastore.insert_fn(&func)?;
    Ok((StatusCode::CREATED, Json(func)))
}

async fn get_fn(
    State(st): State<CatalogState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let func = st.datastore.get_fn(&fn_id)?.ok_or(ApiError::NotFound("fn"))?;
    Ok(Json(func))
}

async fn update_fn(
    State(st): State<CatalogState>,
    Path(fn_id): Path<String>,
    Json(body): Json<FnBody>,
) -> Result<impl IntoResponse, HttpError> {
    let existing = st.datastore.get_fn(&fn_id)?.ok_or(ApiError::NotFound("fn"))?;
    let mut func = body.func;
    func.id = existing.id;
    func.app_id = existing.app_id;
    func.created_at = existing.created_at;
    func.updated_at = now_millis();
    func.validate()?;
    st.datastore.update_fn(&func)?;
    Ok(Json(func))
}

async fn delete_fn(
    State(st): State<CatalogState>,
    Path(fn_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    if !st.datastore.delete_fn(&fn_id)? {
        return Err(ApiError::NotFound("fn").into());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Triggers ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct TriggerBody {
    #[serde(flatten)]
    trigger: Trigger,
}

#[derive(Deserialize)]
struct TriggerListParams {
    cursor: Option<String>,
    per_page: Option<usize>,
    app_id: String,
}

async fn list_triggers(
    State(st): State<CatalogState>,
    headers: HeaderMap,
    Query(params): Query<TriggerListParams>,
) -> Result<impl IntoResponse, HttpError> {
    let page = PageParams {
        cursor: params.cursor.clone(),
        per_page: params.per_page,
    };
    let mut triggers =
        st.datastore
            .list_triggers(&params.app_id, page.cursor.as_deref(), page.limit())?;
    for trigger in &mut triggers {
        annotate(&st, trigger, &headers);
    }
    let next_cursor = (triggers.len() == page.limit())
        .then(|| triggers.last().map(|t| t.id.clone()))
        .flatten();
    Ok(Json(ListBody {
        items: triggers,
        next_cursor,
    }))
}

async fn create_trigger(
    State(st): State<CatalogState>,
    headers: HeaderMap,
    Json(body): Json<TriggerBody>,
) -> Result<impl IntoResponse, HttpError> {
    let mut trigger = body.trigger;
    st.datastore
        .get_app(&trigger.app_id)?
        .ok_or(ApiError::NotFound("app"))?;
    let func = st
        .datastore
        .get_fn(&trigger.fn_id)?
        .ok_or(ApiError::NotFound("fn"))?;
    if func.app_id != trigger.app_id {
        return Err(ApiError::Validation("fn belongs to a different app".into()).into());
    }
    trigger.id = id::new_call_id();
    trigger.trigger_type = TriggerType::Http;
    let now = now_millis();
    trigger.created_at = now;
    trigger.updated_at = now;
    trigger.validate()?;
    st.datastore.insert_trigger(&trigger)?;
    annotate(&st, &mut trigger, &headers);
    Ok((StatusCode::CREATED, Json(trigger)))
}

async fn get_trigger(
    State(st): State<CatalogState>,
    headers: HeaderMap,
    Path(trigger_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let mut trigger = st
        .datastore
        .get_trigger(&trigger_id)?
        .ok_or(ApiError::NotFound("trigger"))?;
    annotate(&st, &mut trigger, &headers);
    Ok(Json(trigger))
}

async fn update_trigger(
    State(st): State<CatalogState>,
    headers: HeaderMap,
    Path(trigger_id): Path<String>,
    Json(body): Json<TriggerBody>,
) -> Result<impl IntoResponse, HttpError> {
    let existing = st
        .datastore
        .get_trigger(&trigger_id)?
        .ok_or(ApiError::NotFound("trigger"))?;
    let mut trigger = body.trigger;
    trigger.id = existing.id;
    trigger.app_id = existing.app_id;
    trigger.fn_id = existing.fn_id;
    trigger.created_at = existing.created_at;
    trigger.updated_at = now_millis();
    trigger.validate()?;
    st.datastore.update_trigger(&trigger)?;
    annotate(&st, &mut trigger, &headers);
    Ok(Json(trigger))
}

async fn delete_trigger(
    State(st): State<CatalogState>,
    Path(trigger_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    if !st.datastore.delete_trigger(&trigger_id)? {
        return Err(ApiError::NotFound("trigger").into());
    }
    Ok(StatusCode::NO_CONTENT)
}
