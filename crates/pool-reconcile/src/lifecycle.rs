//! Recycle and destroy (§4.6).

use crate::{Reconciler, RECYCLE_POLL_TIMEOUT};
use pool_observe::{OperationKind, OperationOutcome};
use pool_proto::{PoolError, PoolResult, PoolState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

impl Reconciler {
    /// Return a claimed instance to `idle` using its golden checkpoint.
    /// Falls through to [`Reconciler::destroy`] if no checkpoint was ever
    /// recorded, or if the restore/rewake sequence fails.
    pub async fn recycle(self: &Arc<Self>, instance_id: &str) -> PoolResult<()> {
        let start = Instant::now();
        self.metrics.recycles_total.inc();

        let Some(instance) = self.cache.get(instance_id) else {
            return Err(PoolError::NotFound(instance_id.to_string()));
        };

        let Some(checkpoint_id) = instance.checkpoint_id.clone() else {
            info!(instance_id, "no checkpoint recorded, falling back to destroy");
            self.metrics.recycles_fallen_back_to_destroy.inc();
            return self.destroy(instance_id).await;
        };

        let result = self.recycle_inner(&instance, &checkpoint_id).await;

        match &result {
            Ok(()) => self.audit.log(
                OperationKind::Recycle,
                Some(instance_id),
                OperationOutcome::Success,
                Some(start.elapsed().as_millis() as u64),
                HashMap::new(),
            ),
            Err(e) => {
                warn!(instance_id, error = %e, "recycle failed, falling back to destroy");
                self.metrics.recycles_fallen_back_to_destroy.inc();
                self.audit.log(
                    OperationKind::Recycle,
                    Some(instance_id),
                    OperationOutcome::Failure,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::from([("error".to_string(), e.to_string())]),
                );
                return self.destroy(instance_id).await;
            }
        }

        result
    }

    async fn recycle_inner(&self, instance: &pool_proto::Instance, checkpoint_id: &str) -> PoolResult<()> {
        self.provider.restore_checkpoint(&instance.service_id, checkpoint_id).await?;

        if let Err(e) = self.provider.start_detached(&instance.service_id, "agent-gateway").await {
            warn!(instance_id = %instance.id, error = %e, "explicit restart after restore failed, relying on provider auto-restart");
        }

        if let Some(public_url) = &instance.public_url {
            self.poll_until_ready(public_url, RECYCLE_POLL_TIMEOUT).await?;
        }

        self.store.delete(&instance.id);

        let mut refreshed = instance.clone();
        refreshed.state = PoolState::Idle;
        refreshed.claimed_agent_name = None;
        refreshed.claimed_at = None;
        refreshed.conversation_id = None;
        refreshed.invite_url = None;
        refreshed.instructions = None;
        self.cache.insert(refreshed);

        Ok(())
    }

    /// Unconditional destroy: delete metadata, delete the provider service,
    /// remove the cache entry, and trigger backfill.
    pub async fn destroy(self: &Arc<Self>, instance_id: &str) -> PoolResult<()> {
        let start = Instant::now();
        self.metrics.destroys_total.inc();

        let service_id = self
            .cache
            .get(instance_id)
            .map(|i| i.service_id)
            .or_else(|| self.store.get(instance_id).map(|r| r.provider_service_id));

        self.store.delete(instance_id);

        if let Some(service_id) = &service_id {
            self.audit.log(
                OperationKind::Destroy,
                Some(instance_id),
                OperationOutcome::Attempted,
                None,
                HashMap::new(),
            );
            if let Err(e) = self.provider.delete_service(service_id).await {
                self.audit.log(
                    OperationKind::Destroy,
                    Some(instance_id),
                    OperationOutcome::Failure,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::from([("error".to_string(), e.to_string())]),
                );
                return Err(e);
            }
        }

        self.cache.remove(instance_id);
        self.audit.log(
            OperationKind::Destroy,
            Some(instance_id),
            OperationOutcome::Success,
            Some(start.elapsed().as_millis() as u64),
            HashMap::new(),
        );

        if (self.cache.len() as u32) < self.settings.max_total {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.create_instance().await {
                    warn!(error = %e, "post-destroy backfill create failed");
                }
            });
        }

        Ok(())
    }

    /// Dismiss a user-visible crashed entry: same as destroy, but never
    /// falls back if the provider service is already gone.
    pub async fn dismiss_crashed(self: &Arc<Self>, instance_id: &str) -> PoolResult<()> {
        let result = self.destroy(instance_id).await;
        self.audit.log(
            OperationKind::Dismiss,
            Some(instance_id),
            if result.is_ok() {
                OperationOutcome::Success
            } else {
                OperationOutcome::Failure
            },
            None,
            HashMap::new(),
        );
        result
    }
}
