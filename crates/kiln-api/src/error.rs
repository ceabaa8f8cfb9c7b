//! The single error-to-response mapping.
//!
//! Every handler funnels domain errors through [`HttpError`], so the
//! HTTP status for a given failure is decided in exactly one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use kiln_core::ApiError;
use kiln_dataaccess::wire::ErrorBody;
use kiln_state::StoreError;

/// Wrapper giving `ApiError` an HTTP rendering.
#[derive(Debug)]
pub struct HttpError(pub ApiError);

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        HttpError(err)
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        HttpError(err.into())
    }
}

/// Status code for each error kind in the taxonomy.
pub fn status_for(err: &ApiError) -> StatusCode {
    match err {
        ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        ApiError::Conflict(_) => StatusCode::CONFLICT,
        ApiError::ResourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::SlotTimeout => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::PlacementTimeout => StatusCode::GATEWAY_TIMEOUT,
        ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ApiError::ContainerError(_) => StatusCode::BAD_GATEWAY,
        ApiError::FunctionError { .. } => StatusCode::BAD_GATEWAY,
        ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ApiError::NodeDraining => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::NotSupported => StatusCode::NOT_IMPLEMENTED,
        ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody::new(self.0.kind(), &self.0.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_documented_statuses() {
        assert_eq!(
            status_for(&ApiError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&ApiError::NotFound("app")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ApiError::Conflict("app")), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&ApiError::ResourceUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ApiError::PlacementTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&ApiError::FunctionError { exit: 1 }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ApiError::NodeDraining),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
