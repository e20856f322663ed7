//! Control-plane HTTP surface (§6.1): reads from the cache and drives the
//! claim coordinator and reconciler. Every authenticated route shares one
//! bearer token; there is no per-caller identity.

#![forbid(unsafe_code)]

mod auth;
mod error;
mod handlers;
mod state;

pub use state::AppState;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use pool_reconcile::Reconciler;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the full router: unauthenticated routes, bearer-gated routes, and
/// an ambient `/metrics` scrape endpoint.
pub fn build_app(reconciler: Arc<Reconciler>, bearer_token: String, environment_tag: String) -> Router {
    let state = AppState {
        reconciler,
        bearer_token: Arc::new(bearer_token),
        environment_tag: Arc::new(environment_tag),
    };

    let authenticated = Router::new()
        .route("/pool/claim", post(handlers::claim))
        .route("/pool/replenish", post(handlers::replenish))
        .route("/pool/drain", post(handlers::drain))
        .route("/pool/reconcile", post(handlers::reconcile))
        .route("/pool/instances/:id", delete(handlers::delete_instance))
        .route("/pool/instances/:id/destroy", delete(handlers::destroy_instance))
        .route("/pool/crashed/:id", delete(handlers::dismiss_crashed))
        .route("/pool/status", get(handlers::pool_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer_token));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .route("/pool/counts", get(handlers::pool_counts))
        .route("/pool/agents", get(handlers::pool_agents))
        .route("/metrics", get(handlers::metrics))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pool_config::Settings;
    use pool_observe::{AuditLog, PoolMetrics};
    use pool_provider::Provider;
    use pool_store::MetadataStore;
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    const TEST_TOKEN: &str = "test-token";

    struct NoopProvider;

    #[async_trait::async_trait]
    impl Provider for NoopProvider {
        fn name(&self) -> &str {
            "noop"
        }
        async fn create_service(&self, _name: &str, _env: &pool_proto::ServiceEnv) -> pool_proto::PoolResult<String> {
            Err(pool_proto::PoolError::ProviderFatal("not wired in tests".into()))
        }
        async fn create_domain(&self, _service_id: &str) -> pool_proto::PoolResult<String> {
            Err(pool_proto::PoolError::ProviderFatal("not wired in tests".into()))
        }
        async fn list_services(&self) -> Option<Vec<pool_proto::ServiceListing>> {
            Some(Vec::new())
        }
        async fn delete_service(&self, _service_id: &str) -> pool_proto::PoolResult<()> {
            Ok(())
        }
        async fn rename_service(&self, _service_id: &str, _name: &str) -> pool_proto::PoolResult<()> {
            Ok(())
        }
        async fn exec(&self, _service_id: &str, _shell_script: &str) -> pool_proto::PoolResult<pool_proto::ExecOutput> {
            Err(pool_proto::PoolError::ProviderFatal("not wired in tests".into()))
        }
        async fn start_detached(&self, _service_id: &str, _command: &str) -> pool_proto::PoolResult<()> {
            Ok(())
        }
        async fn create_checkpoint(&self, _service_id: &str, _label: &str) -> pool_proto::PoolResult<String> {
            Err(pool_proto::PoolError::ProviderFatal("not wired in tests".into()))
        }
        async fn restore_checkpoint(&self, _service_id: &str, _checkpoint_id: &str) -> pool_proto::PoolResult<()> {
            Ok(())
        }
    }

    fn test_settings() -> Settings {
        let vars: HashMap<String, String> = [
            ("BEARER_TOKEN", TEST_TOKEN),
            ("PROVIDER_TOKEN", "t"),
            ("PROVIDER_PROJECT_ID", "p"),
            ("PROVIDER_ENVIRONMENT_ID", "e"),
            ("MODEL_API_KEY", "k"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Settings::from_map(&vars).expect("settings")
    }

    fn test_app() -> Router {
        let dir = tempfile::tempdir().expect("tempdir");
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(NoopProvider),
            Arc::new(MetadataStore::new(dir.path())),
            Arc::new(pool_reconcile::PoolCache::new()),
            test_settings(),
            Arc::new(PoolMetrics::new()),
            Arc::new(AuditLog::default_capacity()),
        ));
        build_app(reconciler, TEST_TOKEN.to_string(), "test".to_string())
    }

    #[tokio::test]
    async fn health_is_unauthenticated_and_ok() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_is_unauthenticated_and_ok() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn claim_without_token_is_unauthorized() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pool/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"agentName":"tokyo","instructions":"plan trips"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn claim_with_no_idle_instances_returns_503() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pool/claim")
                    .header("content-type", "application/json")
                    .header("Authorization", format!("Bearer {TEST_TOKEN}"))
                    .body(Body::from(r#"{"agentName":"tokyo","instructions":"plan trips"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn pool_status_requires_auth() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/pool/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pool_counts_is_unauthenticated() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/pool/counts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
