//! Claim coordinator (§4.5): serializes the `idle` → `claimed` transition.

use crate::Reconciler;
use chrono::Utc;
use pool_observe::{OperationKind, OperationOutcome};
use pool_proto::{MetadataRow, PoolError, PoolResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub agent_name: String,
    pub instructions: String,
    /// `Some` selects join mode (`POST /join`); `None` selects create mode
    /// (`POST /conversation`).
    pub join_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub instance_id: String,
    pub conversation_id: Option<String>,
    pub invite_url: Option<String>,
    /// `true` iff the gateway responded to `/join` with `status: "joined"`;
    /// `waiting_for_acceptance` also reports `joined: false` (§9).
    pub joined: bool,
}

impl Reconciler {
    /// Takes `&Arc<Self>` because a successful claim fires a detached
    /// backfill task that must own a `'static` handle to the reconciler.
    pub async fn claim(self: &Arc<Self>, req: ClaimRequest) -> PoolResult<ClaimOutcome> {
        let start = Instant::now();

        // Step 1: select a candidate, then synchronously reserve its
        // service id before any awaiting I/O. The insertion itself is the
        // sole source of atomicity for the idle -> claimed race (§4.5 step 1,
        // §9).
        let candidate = self.cache.pick_idle(|sid| self.claim_guard.contains(sid));
        let Some(instance) = candidate else {
            self.metrics.claims_rejected_no_idle.inc();
            return Err(PoolError::NoIdleAvailable);
        };

        let Some(ticket) = self.claim_guard.try_acquire(&instance.service_id) else {
            // Lost the race between pick_idle and try_acquire.
            self.metrics.claims_rejected_no_idle.inc();
            return Err(PoolError::NoIdleAvailable);
        };

        let result = self.claim_inner(&instance, &req).await;

        match &result {
            Ok(outcome) => {
                self.metrics.claims_total.inc();
                self.audit.log(
                    OperationKind::Claim,
                    Some(&outcome.instance_id),
                    OperationOutcome::Success,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::from([("agent_name".to_string(), req.agent_name.clone())]),
                );
            }
            Err(e) => {
                self.metrics.claims_failed.inc();
                self.audit.log(
                    OperationKind::Claim,
                    Some(&instance.id),
                    OperationOutcome::Failure,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::from([("error".to_string(), e.to_string())]),
                );
            }
        }

        // Step 8: always release, win or lose.
        drop(ticket);

        // Step 7: trigger (without awaiting) a backfill if there's room.
        if result.is_ok() && (self.cache.len() as u32) < self.settings.max_total {
            self.spawn_backfill();
        }

        result
    }

    async fn claim_inner(&self, instance: &pool_proto::Instance, req: &ClaimRequest) -> PoolResult<ClaimOutcome> {
        let public_url = instance
            .public_url
            .as_deref()
            .ok_or_else(|| PoolError::Internal(format!("instance {} has no public url", instance.id)))?;

        // Step 2: write the instructions file into the workspace.
        let script = format!(
            "mkdir -p /var/lib/agent/workspace && cat > /var/lib/agent/workspace/instructions.txt <<'EOF'\n{}\nEOF\n",
            req.instructions
        );
        self.provider.exec(&instance.service_id, &script).await?;

        // Step 3: bind the conversation.
        let env = serde_json::json!({});
        let bind = match &req.join_url {
            Some(join_url) => self.gateway.join(public_url, join_url, &req.agent_name, &env).await?,
            None => self.gateway.create_conversation(public_url, &req.agent_name, &req.agent_name, &env).await?,
        };

        // `joined` is only meaningful for join mode; create mode always
        // reports false (§6.1, §8 scenario 2).
        let joined = req.join_url.is_some() && bind.status.as_deref() == Some("joined");
        let conversation_id = bind.conversation_id.clone().unwrap_or_default();

        // Step 4: upsert metadata in the same logical act as the claim.
        let row = MetadataRow {
            instance_id: instance.id.clone(),
            provider_service_id: instance.service_id.clone(),
            agent_name: req.agent_name.clone(),
            conversation_id: conversation_id.clone(),
            invite_url: bind.invite_url.clone(),
            instructions: req.instructions.clone(),
            checkpoint_id: instance.checkpoint_id.clone(),
            created_at: instance.created_at,
            claimed_at: Utc::now(),
        };
        self.store.upsert(row.clone());

        // Step 5: best-effort rename for dashboard visibility.
        let display_name = format!("{}-{}", instance.display_name, req.agent_name);
        if let Err(e) = self.provider.rename_service(&instance.service_id, &display_name).await {
            warn!(instance_id = %instance.id, error = %e, "rename after claim failed, ignoring");
        }

        // Step 6: update the cache entry.
        let mut updated = instance.clone();
        updated.state = pool_proto::PoolState::Claimed;
        updated.enrich_from_metadata(&row);
        self.cache.insert(updated);

        info!(instance_id = %instance.id, agent_name = %req.agent_name, "claim completed");

        Ok(ClaimOutcome {
            instance_id: instance.id.clone(),
            conversation_id: bind.conversation_id,
            invite_url: bind.invite_url,
            joined,
        })
    }

    fn spawn_backfill(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.create_instance().await {
                warn!(error = %e, "claim backfill create failed, next tick will replenish");
            }
        });
    }
}
