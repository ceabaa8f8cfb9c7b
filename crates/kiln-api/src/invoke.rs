//! The invocation surface: `/r/{app}` and `/r/{app}/{route...}`.
//!
//! Any method is accepted; the request body is the function input and
//! the function's response frame becomes the HTTP response. Sync routes
//! run inline through the node's agent; async routes are enqueued and
//! answered with 202 and the call id.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use tracing::{debug, info_span, Instrument};

use kiln_agent::{cancel_channel, CallMetadata, Invocation};
use kiln_core::{id, ApiError, Call, RouteType};

use crate::error::HttpError;
use crate::InvokeState;

/// Response header carrying the call id.
pub const CALL_ID_HEADER: &str = "kiln-call-id";

pub fn router() -> Router<InvokeState> {
    Router::new()
        .route("/r/:app_name", any(invoke_root))
        .route("/r/:app_name/*route", any(invoke_route))
}

async fn invoke_root(
    State(st): State<InvokeState>,
    Path(app_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    invoke(st, app_name, "/".to_string(), headers, body).await
}

async fn invoke_route(
    State(st): State<InvokeState>,
    Path((app_name, route)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let path = if route.starts_with('/') {
        route
    } else {
        format!("/{route}")
    };
    invoke(st, app_name, path, headers, body).await
}

async fn invoke(
    st: InvokeState,
    app_name: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let rid = st
        .rid_header
        .as_deref()
        .and_then(|name| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(id::new_call_id);
    let span = info_span!("invoke", app = %app_name, path = %path, rid = %rid);

    async move {
        let app = st.da.get_app_by_name(&app_name).await?;
        let call_id = id::new_call_id();

        // A route wins; with no route the path may be a trigger source.
        let (metadata, route_type) = match st.da.get_route(&app.name, &path).await {
            Ok(route) => {
                let call = Call::new(call_id, &app, Some(route.path.clone()), None);
                let rt = route.route_type;
                (CallMetadata::from_route(&app, &route, call), rt)
            }
            Err(ApiError::NotFound(_)) => {
                let trigger = st.da.get_trigger_by_source(&app.id, &path).await.map_err(
                    |e| match e {
                        // Neither a route nor a trigger at this path.
                        ApiError::NotFound(_) => ApiError::NotFound("route"),
                        other => other,
                    },
                )?;
                let func = st.da.get_fn(&trigger.fn_id).await?;
                let call = Call::new(call_id, &app, None, Some(func.id.clone()));
                (CallMetadata::from_fn(&app, &func, call), RouteType::Sync)
            }
            Err(other) => return Err(other.into()),
        };

        if route_type == RouteType::Async {
            let mut call = metadata.call.clone();
            // The body rides the queue message to whichever node runs
            // the call.
            call.payload = Some(String::from_utf8_lossy(&body).into_owned());
            let call_id = call.id.clone();
            st.agent.enqueue(call).await?;
            debug!(call_id = %call_id, "async call accepted");
            return Ok((
                StatusCode::ACCEPTED,
                [(CALL_ID_HEADER, call_id.as_str())],
                Json(serde_json::json!({ "call_id": call_id })),
            )
                .into_response());
        }

        let (_cancel_tx, cancel_rx) = cancel_channel();
        let invocation = Invocation::new(metadata, body, None, cancel_rx);
        let call_id = invocation.metadata.call.id.clone();

        let result = st.agent.submit(invocation).await?;

        let mut response = Response::builder().status(result.status);
        for (name, value) in &result.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                response = response.header(name, value);
            }
        }
        response = response.header(CALL_ID_HEADER, &call_id);
        response
            .body(axum::body::Body::from(result.body))
            .map_err(|e| ApiError::Internal(format!("building response: {e}")).into())
    }
    .instrument(span)
    .await
}
