use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pool_proto::PoolError;
use serde_json::json;

/// Wraps [`PoolError`] so handlers can return it directly; the status-code
/// mapping is `PoolError::status_code` (§7), the body is always
/// `{error: {kind, message}}`.
pub struct ApiError(pub PoolError);

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "error": { "kind": self.0.kind(), "message": self.0.to_string() } }));
        (status, body).into_response()
    }
}
