use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::state::AppState;

/// Requires a valid `Authorization: Bearer <token>` header. No other
/// scheme is accepted; the shared secret is the only credential the
/// control plane knows.
pub async fn require_bearer_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == state.bearer_token.as_str() => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({ "error": { "kind": "unauthorized", "message": "missing or invalid bearer token" } })),
        )
            .into_response(),
    }
}
