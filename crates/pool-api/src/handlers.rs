use axum::extract::{Path, State};
use axum::Json;
use pool_observe::MetricsExporter;
use pool_proto::PoolError;
use pool_reconcile::ClaimRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

// ─── Unauthenticated ────────────────────────────────────────────────────────────

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn version(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.environment_tag.as_str(),
    }))
}

pub async fn pool_counts(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.reconciler.cache().counts()))
}

pub async fn pool_agents(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.reconciler.cache().claimed_entries()))
}

pub async fn metrics(State(state): State<AppState>) -> String {
    MetricsExporter::new(state.reconciler.metrics()).render()
}

// ─── Claim ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    pub agent_name: String,
    pub instructions: String,
    pub join_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite_url: Option<String>,
    pub joined: bool,
}

pub async fn claim(State(state): State<AppState>, Json(body): Json<ClaimBody>) -> Result<Json<ClaimResponse>, ApiError> {
    if body.agent_name.trim().is_empty() {
        return Err(PoolError::BadRequest("agentName must not be empty".into()).into());
    }

    let outcome = state
        .reconciler
        .claim(ClaimRequest {
            agent_name: body.agent_name,
            instructions: body.instructions,
            join_url: body.join_url,
        })
        .await?;

    Ok(Json(ClaimResponse {
        instance_id: outcome.instance_id,
        conversation_id: outcome.conversation_id,
        invite_url: outcome.invite_url,
        joined: outcome.joined,
    }))
}

// ─── Replenish / drain ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CountBody {
    pub count: u32,
}

pub async fn replenish(State(state): State<AppState>, Json(body): Json<CountBody>) -> Result<Json<Value>, ApiError> {
    if body.count == 0 {
        return Err(PoolError::BadRequest("count must be positive".into()).into());
    }
    let total = state.reconciler.cache().len() as u32;
    let room = state.reconciler.settings().max_total.saturating_sub(total);
    let to_create = body.count.min(room);

    let mut created = 0u32;
    let mut errors = Vec::new();
    for _ in 0..to_create {
        match state.reconciler.create_instance().await {
            Ok(id) => {
                created += 1;
                tracing::info!(instance_id = %id, "replenish created instance");
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    Ok(Json(json!({ "requested": body.count, "created": created, "errors": errors })))
}

pub async fn drain(State(state): State<AppState>, Json(body): Json<CountBody>) -> Result<Json<Value>, ApiError> {
    if body.count == 0 {
        return Err(PoolError::BadRequest("count must be positive".into()).into());
    }

    let idle: Vec<_> = state
        .reconciler
        .cache()
        .all()
        .into_iter()
        .filter(|i| i.state.is_available_for_claim())
        .take(body.count as usize)
        .collect();

    let mut destroyed = 0u32;
    let mut errors = Vec::new();
    for instance in idle {
        match state.reconciler.destroy(&instance.id).await {
            Ok(()) => destroyed += 1,
            Err(e) => errors.push(e.to_string()),
        }
    }

    Ok(Json(json!({ "requested": body.count, "destroyed": destroyed, "errors": errors })))
}

// ─── Reconcile ──────────────────────────────────────────────────────────────────

pub async fn reconcile(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.reconciler.tick().await;
    Json(json!(outcome))
}

// ─── Instance lifecycle ─────────────────────────────────────────────────────────

pub async fn delete_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.reconciler.recycle(&id).await?;
    Ok(Json(json!({ "instance_id": id, "outcome": "recycled_or_destroyed" })))
}

pub async fn destroy_instance(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.reconciler.destroy(&id).await?;
    Ok(Json(json!({ "instance_id": id, "outcome": "destroyed" })))
}

pub async fn dismiss_crashed(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    state.reconciler.dismiss_crashed(&id).await?;
    Ok(Json(json!({ "instance_id": id, "outcome": "dismissed" })))
}

// ─── Status ─────────────────────────────────────────────────────────────────────

pub async fn pool_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "counts": state.reconciler.cache().counts(),
        "instances": state.reconciler.cache().all(),
    }))
}
