//! Shared fakes for black-box reconciler tests: an in-memory [`Provider`]
//! and a minimal agent-gateway stand-in served over a loopback socket.

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use pool_config::Settings;
use pool_observe::{AuditLog, PoolMetrics};
use pool_proto::{DeployStatus, ExecOutput, PoolError, PoolResult, ServiceEnv, ServiceListing};
use pool_reconcile::{PoolCache, Reconciler};
use pool_store::MetadataStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// ─── Fake provider ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct FakeServiceRecord {
    name: String,
    deploy_status: DeployStatus,
}

/// An in-memory [`Provider`] that never touches the network. `list_services`
/// returns `None` whenever `unavailable` is set, modeling a provider
/// listing outage.
pub struct FakeProvider {
    services: Mutex<HashMap<String, FakeServiceRecord>>,
    next_id: AtomicU32,
    pub unavailable: AtomicBool,
    pub delete_calls: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            delete_calls: AtomicU32::new(0),
        }
    }

    pub fn seed(&self, service_id: &str, name: &str, deploy_status: DeployStatus) {
        self.services.lock().insert(
            service_id.to_string(),
            FakeServiceRecord {
                name: name.to_string(),
                deploy_status,
            },
        );
    }

    pub fn set_deploy_status(&self, service_id: &str, status: DeployStatus) {
        if let Some(rec) = self.services.lock().get_mut(service_id) {
            rec.deploy_status = status;
        }
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.lock().contains_key(service_id)
    }
}

#[async_trait]
impl pool_provider::Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_service(&self, name: &str, _env: &ServiceEnv) -> PoolResult<String> {
        let id = format!("svc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.seed(&id, name, DeployStatus::Queued);
        Ok(id)
    }

    async fn create_domain(&self, _service_id: &str) -> PoolResult<String> {
        Ok("instance.invalid".to_string())
    }

    async fn list_services(&self) -> Option<Vec<ServiceListing>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            self.services
                .lock()
                .iter()
                .map(|(id, rec)| ServiceListing {
                    service_id: id.clone(),
                    name: rec.name.clone(),
                    created_at: Utc::now(),
                    environment_id: "env-test".to_string(),
                    deploy_status: Some(rec.deploy_status),
                })
                .collect(),
        )
    }

    async fn delete_service(&self, service_id: &str) -> PoolResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.services.lock().remove(service_id);
        Ok(())
    }

    async fn rename_service(&self, service_id: &str, name: &str) -> PoolResult<()> {
        if let Some(rec) = self.services.lock().get_mut(service_id) {
            rec.name = name.to_string();
        }
        Ok(())
    }

    async fn exec(&self, service_id: &str, _shell_script: &str) -> PoolResult<ExecOutput> {
        if !self.contains(service_id) {
            return Err(PoolError::NotFound(service_id.to_string()));
        }
        Ok(ExecOutput {
            stdout: "clean".to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn start_detached(&self, _service_id: &str, _command: &str) -> PoolResult<()> {
        Ok(())
    }

    async fn create_checkpoint(&self, _service_id: &str, _label: &str) -> PoolResult<String> {
        Ok("cp-fake".to_string())
    }

    async fn restore_checkpoint(&self, _service_id: &str, _checkpoint_id: &str) -> PoolResult<()> {
        Ok(())
    }
}

// ─── Fake gateway ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct GatewayState {
    conversation_id: Arc<str>,
    bind_status: Arc<str>,
}

/// Start a minimal stand-in for the agent gateway contract (§6.2) on a
/// loopback socket and return its base URL. The server answers `ready:true`
/// on `/status` and accepts `/conversation` and `/join`.
pub async fn spawn_fake_gateway(conversation_id: &str, bind_status: &str) -> String {
    let state = GatewayState {
        conversation_id: Arc::from(conversation_id),
        bind_status: Arc::from(bind_status),
    };

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/conversation", post(bind_handler))
        .route("/join", post(bind_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}")
}

async fn status_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "ready": true,
        "conversation": { "id": state.conversation_id.as_ref() },
        "streaming": false,
    }))
}

async fn bind_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "conversationId": state.conversation_id.as_ref(),
        "inviteUrl": "https://gateway.invalid/i=xyz",
        "status": state.bind_status.as_ref(),
    }))
}

// ─── Reconciler wiring ──────────────────────────────────────────────────────────

pub fn test_settings(min_idle: u32, max_total: u32) -> Settings {
    let vars: HashMap<String, String> = [
        ("BEARER_TOKEN", "t"),
        ("PROVIDER_TOKEN", "t"),
        ("PROVIDER_PROJECT_ID", "p"),
        ("PROVIDER_ENVIRONMENT_ID", "env-test"),
        ("MODEL_API_KEY", "k"),
        ("MIN_IDLE", &min_idle.to_string()),
        ("MAX_TOTAL", &max_total.to_string()),
        ("POOL_PREFIX", "svc-"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Settings::from_map(&vars).expect("settings")
}

/// Build a reconciler over a fresh store and cache, handing back the store
/// and cache handles so tests can seed durable metadata or pre-populate
/// cache entries directly.
pub fn build_reconciler(
    provider: Arc<FakeProvider>,
    settings: Settings,
    state_dir: &std::path::Path,
) -> (Arc<Reconciler>, Arc<MetadataStore>, Arc<PoolCache>) {
    let store = Arc::new(MetadataStore::new(state_dir));
    let cache = Arc::new(PoolCache::new());
    let reconciler = Arc::new(Reconciler::new(
        provider,
        Arc::clone(&store),
        Arc::clone(&cache),
        settings,
        Arc::new(PoolMetrics::new()),
        Arc::new(AuditLog::default_capacity()),
    ));
    (reconciler, store, cache)
}
