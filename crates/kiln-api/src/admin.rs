//! Admin surface: `/version`, `/metrics`, `/debug/...`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::AdminState;

/// Version reported by `/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router() -> Router<AdminState> {
    Router::new()
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/debug/vars", get(debug_vars))
}

async fn version(State(st): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": VERSION,
        "node_type": st.node_type,
    }))
}

async fn metrics(State(st): State<AdminState>) -> impl IntoResponse {
    let mut body = st.metrics.render();
    body.push_str(&kiln_metrics::process::render(&st.tracked_processes));
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn debug_vars(State(st): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": VERSION,
        "node_type": st.node_type,
        "queue_depth": st.metrics.queue_depth.load(std::sync::atomic::Ordering::Relaxed),
        "pool_memory_mb_in_use": st.metrics.pool_memory_mb.load(std::sync::atomic::Ordering::Relaxed),
        "slot_waiters": st.metrics.slot_waiters.load(std::sync::atomic::Ordering::Relaxed),
        "idle_slots": st.metrics.idle_slots.load(std::sync::atomic::Ordering::Relaxed),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_metrics::Registry;

    fn state() -> AdminState {
        AdminState {
            metrics: Registry::new(),
            tracked_processes: Vec::new(),
            node_type: "full",
        }
    }

    #[tokio::test]
    async fn version_reports_node_type() {
        let response = version(State(state())).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["node_type"], "full");
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn metrics_render_in_text_exposition_format() {
        let st = state();
        st.metrics.calls.inc("success");
        let response = metrics(State(st)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("kiln_calls_total{status=\"success\"} 1"));
    }
}
