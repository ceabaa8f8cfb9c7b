//! Legacy by-name CRUD: `/v1/apps`, routes, and call records.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use kiln_core::models::now_millis;
use kiln_core::{id, ApiError, App, Call, Route};
use kiln_state::Datastore;

use crate::error::HttpError;
use crate::CatalogState;

/// `?cursor` and `?per_page`, clamped to 1..=100 with a default of 30.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    pub per_page: Option<usize>,
}

impl PageParams {
    pub fn limit(&self) -> usize {
        self.per_page.unwrap_or(30).clamp(1, 100)
    }
}

#[derive(Serialize)]
pub struct ListBody<T: Serialize> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub fn router() -> Router<CatalogState> {
    Router::new()
        .route("/v1/apps", get(list_apps).post(create_app))
        .route(
            "/v1/apps/:app_name",
            get(get_app).patch(update_app).delete(delete_app),
        )
        .route(
            "/v1/apps/:app_name/routes",
            get(list_routes).post(create_route),
        )
        .route(
            "/v1/apps/:app_name/routes/*route",
            get(get_route).patch(update_route).delete(delete_route).put(upsert_route),
        )
        .route("/v1/apps/:app_name/calls", get(list_calls))
        .route("/v1/apps/:app_name/calls/:call_id", get(get_call))
        .route("/v1/apps/:app_name/calls/:call_id/log", get(get_call_log))
}

// ── Apps ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AppBody {
    name: String,
    #[serde(default)]
    config: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, serde_json::Value>,
}

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

async fn create_app(
    State(st): State<CatalogState>,
    Json(body): Json<AppBody>,
) -> Result<impl IntoResponse, HttpError> {
    let now = now_millis();
    let app = App {
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
    Path(app_name): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let app = require_app(&*st.datastore, &app_name)?;
    Ok(Json(app))
}

async fn update_app(
    State(st): State<CatalogState>,
    Path(app_name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, HttpError> {
    let mut app = require_app(&*st.datastore, &app_name)?;
    if let Some(config) = body.get("config").and_then(|v| v.as_object()) {
        for (k, v) in config {
            match v.as_str() {
                Some(s) => {
                    app.config.insert(k.clone(), s.to_string());
                }
                None => {
                    app.config.remove(k);
                }
            }
        }
    }
    app.updated_at = now_millis();
    st.datastore.update_app(&app)?;
    Ok(Json(app))
}

async fn delete_app(
    State(st): State<CatalogState>,
    Path(app_name): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let app = require_app(&*st.datastore, &app_name)?;
    st.datastore.delete_app(&app.id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn require_app(ds: &dyn Datastore, app_name: &str) -> Result<App, HttpError> {
    Ok(ds
        .get_app_by_name(app_name)?
        .ok_or(ApiError::NotFound("app"))?)
}

// ── Routes ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RouteBody {
    #[serde(flatten)]
    route: Route,
}

async fn list_routes(
    State(st): State<CatalogState>,
    Path(app_name): Path<String>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, HttpError> {
    require_app(&*st.datastore, &app_name)?;
    let routes = st
        .datastore
        .list_routes(&app_name, page.cursor.as_deref(), page.limit())?;
    let next_cursor = (routes.len() == page.limit())
        .then(|| routes.last().map(|r| r.path.clone()))
        .flatten();
    Ok(Json(ListBody {
        items: routes,
        next_cursor,
    }))
}

async fn create_route(
    State(st): State<CatalogState>,
    Path(app_name): Path<String>,
    Json(body): Json<RouteBody>,
) -> Result<impl IntoResponse, HttpError> {
    require_app(&*st.datastore, &app_name)?;
    let mut route = body.route;
    route.app_name = app_name;
    route.validate()?;
    st.datastore.insert_route(&route)?;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn get_route(
    State(st): State<CatalogState>,
    Path((app_name, route)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    let path = rooted(&route);
    let route = st
        .datastore
        .get_route(&app_name, &path)?
        .ok_or(ApiError::NotFound("route"))?;
    Ok(Json(route))
}

async fn update_route(
    State(st): State<CatalogState>,
    Path((app_name, route)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, HttpError> {
    let path = rooted(&route);
    let mut route = st
        .datastore
        .get_route(&app_name, &path)?
        .ok_or(ApiError::NotFound("route"))?;
    if let Some(image) = body.get("image").and_then(|v| v.as_str()) {
        route.image = image.to_string();
    }
    if let Some(memory) = body.get("memory_mb").and_then(|v| v.as_u64()) {
        route.memory_mb = memory;
    }
    if let Some(timeout) = body.get("timeout_secs").and_then(|v| v.as_u64()) {
        route.timeout_secs = timeout;
    }
    if let Some(idle) = body.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
        route.idle_timeout_secs = idle;
    }
    route.validate()?;
    st.datastore.update_route(&route)?;
    Ok(Json(route))
}

async fn upsert_route(
    State(st): State<CatalogState>,
    Path((app_name, route)): Path<(String, String)>,
    Json(body): Json<RouteBody>,
) -> Result<impl IntoResponse, HttpError> {
    require_app(&*st.datastore, &app_name)?;
    let path = rooted(&route);
    let mut new_route = body.route;
    new_route.app_name = app_name.clone();
    new_route.path = path.clone();
    new_route.validate()?;

    if st.datastore.get_route(&app_name, &path)?.is_some() {
        st.datastore.update_route(&new_route)?;
        Ok((StatusCode::OK, Json(new_route)))
    } else {
        st.datastore.insert_route(&new_route)?;
        Ok((StatusCode::CREATED, Json(new_route)))
    }
}

async fn delete_route(
    State(st): State<CatalogState>,
    Path((app_name, route)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    let path = rooted(&route);
    if !st.datastore.delete_route(&app_name, &path)? {
        return Err(ApiError::NotFound("route").into());
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Wildcard captures drop the leading slash; route paths keep it.
fn rooted(captured: &str) -> String {
    if captured.starts_with('/') {
        captured.to_string()
    } else {
        format!("/{captured}")
    }
}

// ── Calls ──────────────────────────────────────────────────────

async fn list_calls(
    State(st): State<CatalogState>,
    Path(app_name): Path<String>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, HttpError> {
    require_app(&*st.datastore, &app_name)?;
    let calls = st
        .datastore
        .list_calls(&app_name, page.cursor.as_deref(), page.limit())?;
    let next_cursor = (calls.len() == page.limit())
        .then(|| calls.last().map(|c| c.id.clone()))
        .flatten();
    Ok(Json(ListBody {
        items: calls,
        next_cursor,
    }))
}

async fn get_call(
    State(st): State<CatalogState>,
    Path((app_name, call_id)): Path<(String, String)>,
) -> Result<Json<Call>, HttpError> {
    let call = st
        .datastore
        .get_call(&app_name, &call_id)?
        .ok_or(ApiError::NotFound("call"))?;
    Ok(Json(call))
}

async fn get_call_log(
    State(st): State<CatalogState>,
    Path((app_name, call_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    st.datastore
        .get_call(&app_name, &call_id)?
        .ok_or(ApiError::NotFound("call"))?;
    let log = st
        .logstore
        .get_log(&call_id)?
        .ok_or(ApiError::NotFound("log"))?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        log,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::RequestBasedAnnotator;
    use kiln_state::{MemoryQueue, RedbStore};
    use std::sync::Arc;

    fn state() -> CatalogState {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        CatalogState {
            datastore: store.clone(),
            logstore: store,
            queue: Arc::new(MemoryQueue::new()),
            annotator: Arc::new(RequestBasedAnnotator),
        }
    }

    fn app_body(name: &str) -> Json<AppBody> {
        Json(AppBody {
            name: name.to_string(),
            config: Default::default(),
            annotations: Default::default(),
        })
    }

    #[tokio::test]
    async fn app_create_get_delete_roundtrip() {
        let st = state();

        create_app(State(st.clone()), app_body("myapp")).await.unwrap();
        let app = require_app(&*st.datastore, "myapp").unwrap();
        assert_eq!(app.name, "myapp");

        delete_app(State(st.clone()), Path("myapp".to_string()))
            .await
            .unwrap();
        let err = get_app(State(st), Path("myapp".to_string()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err.0, ApiError::NotFound("app")));
    }

    #[tokio::test]
    async fn duplicate_app_name_conflicts() {
        let st = state();
        create_app(State(st.clone()), app_body("myapp")).await.unwrap();
        let err = create_app(State(st), app_body("myapp")).await.err().unwrap();
        assert!(matches!(err.0, ApiError::Conflict("app")));
    }

    #[tokio::test]
    async fn invalid_app_name_is_rejected() {
        let st = state();
        let err = create_app(State(st), app_body("bad name"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err.0, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn route_lifecycle_under_an_app() {
        let st = state();
        create_app(State(st.clone()), app_body("myapp")).await.unwrap();

        let route = Route {
            app_name: String::new(), // set from the path
            path: "/hello".into(),
            image: "hello:v1".into(),
            memory_mb: 128,
            cpu_shares: 0,
            timeout_secs: 30,
            idle_timeout_secs: 30,
            route_type: kiln_core::RouteType::Sync,
            format: kiln_core::Format::Default,
            config: Default::default(),
        };
        create_route(
            State(st.clone()),
            Path("myapp".to_string()),
            Json(RouteBody { route }),
        )
        .await
        .unwrap();

        let got = st.datastore.get_route("myapp", "/hello").unwrap().unwrap();
        assert_eq!(got.app_name, "myapp");

        delete_route(
            State(st.clone()),
            Path(("myapp".to_string(), "hello".to_string())),
        )
        .await
        .unwrap();
        assert!(st.datastore.get_route("myapp", "/hello").unwrap().is_none());
    }

    #[tokio::test]
    async fn update_app_merges_and_removes_config() {
        let st = state();
        create_app(State(st.clone()), app_body("myapp")).await.unwrap();

        update_app(
            State(st.clone()),
            Path("myapp".to_string()),
            Json(serde_json::json!({"config": {"A": "1", "B": "2"}})),
        )
        .await
        .unwrap();
        let app = require_app(&*st.datastore, "myapp").unwrap();
        assert_eq!(app.config["A"], "1");

        // Null removes a key.
        update_app(
            State(st.clone()),
            Path("myapp".to_string()),
            Json(serde_json::json!({"config": {"A": null}})),
        )
        .await
        .unwrap();
        let app = require_app(&*st.datastore, "myapp").unwrap();
        assert!(!app.config.contains_key("A"));
        assert_eq!(app.config["B"], "2");
    }

    #[test]
    fn page_params_clamp() {
        assert_eq!(PageParams::default().limit(), 30);
        assert_eq!(
            PageParams {
                cursor: None,
                per_page: Some(1000)
            }
            .limit(),
            100
        );
        assert_eq!(
            PageParams {
                cursor: None,
                per_page: Some(0)
            }
            .limit(),
            1
        );
    }
}
