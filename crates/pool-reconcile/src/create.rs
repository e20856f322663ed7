//! Instance creation (§4.4): the cold path used by the reconciler and by
//! manual replenish. Every step failure triggers a best-effort full
//! rollback.

use crate::{generate_instance_id, Reconciler, CREATE_POLL_INTERVAL, CREATE_TIMEOUT};
use pool_observe::{OperationKind, OperationOutcome};
use pool_proto::{Instance, PoolError, PoolResult};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

impl Reconciler {
    /// Create one new instance end to end. On any failure after
    /// `create_service`, best-effort rolls back the provider service.
    pub async fn create_instance(&self) -> PoolResult<String> {
        let start = Instant::now();
        self.metrics.creates_total.inc();

        let result = self.create_instance_inner().await;

        match &result {
            Ok(id) => {
                self.breaker.lock().record_success();
                self.audit.log(
                    OperationKind::Create,
                    Some(id),
                    OperationOutcome::Success,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::new(),
                );
            }
            Err(e) => {
                self.metrics.creates_failed.inc();
                if self.breaker.lock().record_failure() {
                    self.metrics.circuit_breaker_trips.inc();
                    warn!("creation circuit breaker tripped after repeated failures");
                }
                self.audit.log(
                    OperationKind::Create,
                    None,
                    OperationOutcome::Failure,
                    Some(start.elapsed().as_millis() as u64),
                    HashMap::from([("error".to_string(), e.to_string())]),
                );
            }
        }

        result
    }

    async fn create_instance_inner(&self) -> PoolResult<String> {
        // Step 1: generate id, compose provider-facing name.
        let instance_id = generate_instance_id();
        let name = format!(
            "{}{}-{}",
            self.settings.pool_prefix, self.settings.environment_tag, instance_id
        );

        // Step 2: create the service; insert a `starting` cache entry as
        // soon as the service id is known, even before the rest completes.
        let env = gateway_env(&self.settings, &instance_id);
        let service_id = match self.provider.create_service(&name, &env).await {
            Ok(id) => id,
            Err(e) => return Err(e),
        };
        self.cache.insert(Instance::starting(instance_id.clone(), service_id.clone(), name.clone()));

        if let Err(e) = self.finish_create(&instance_id, &service_id).await {
            self.rollback(&service_id, &instance_id).await;
            return Err(e);
        }

        Ok(instance_id)
    }

    async fn finish_create(&self, instance_id: &str, service_id: &str) -> PoolResult<()> {
        // Step 3 (cancel-then-deploy) is performed inside `create_service`
        // itself; nothing further to do here.

        // Step 4: write config + dotenv before the gateway ever starts, so
        // restart/restore paths always find a valid config.
        let config_script = render_config_script(&self.settings, instance_id);
        pool_provider::with_retries(3, || self.provider.exec(service_id, &config_script)).await?;

        // Step 5: register the long-lived gateway process.
        pool_provider::with_retries(3, || self.provider.start_detached(service_id, "agent-gateway")).await?;

        // Step 6: poll until ready or timeout. No internal retry beyond the
        // poll loop itself — a failure here escalates straight to rollback.
        let public_url = self.resolve_public_url(service_id).await?;
        self.poll_until_ready(&public_url, CREATE_TIMEOUT).await?;

        if let Some(entry) = self.cache.get(instance_id) {
            let mut entry = entry;
            entry.public_url = Some(public_url);
            self.cache.insert(entry);
        }

        // Step 7: pre-checkpoint audit. A non-empty identity/conversation
        // directory poisons every future recycle with a duplicate identity.
        let audit = self.provider.exec(service_id, PRE_CHECKPOINT_AUDIT_SCRIPT).await?;
        if !audit.success() || audit.stdout.trim() != "clean" {
            return Err(PoolError::Internal(format!(
                "pre-checkpoint audit failed for {instance_id}: identity or conversation state present"
            )));
        }

        // Step 8: checkpoint if supported.
        if self.provider.supports_checkpoints() {
            let checkpoint_id = self.provider.create_checkpoint(service_id, "golden").await?;
            if let Some(mut entry) = self.cache.get(instance_id) {
                entry.checkpoint_id = Some(checkpoint_id);
                self.cache.insert(entry);
            }
        }

        info!(instance_id, service_id, "instance created and ready");
        Ok(())
    }

    pub(crate) async fn resolve_public_url(&self, service_id: &str) -> PoolResult<String> {
        self.provider
            .create_domain(service_id)
            .await
            .map(|fqdn| format!("https://{fqdn}"))
    }

    pub(crate) async fn poll_until_ready(&self, public_url: &str, timeout: std::time::Duration) -> PoolResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(probe) = self.gateway.status(public_url).await
                && probe.ready
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PoolError::TimedOut(format!("gateway at {public_url} never became ready")));
            }
            tokio::time::sleep(CREATE_POLL_INTERVAL).await;
        }
    }

    async fn rollback(&self, service_id: &str, instance_id: &str) {
        warn!(instance_id, service_id, "rolling back failed instance creation");
        if let Err(e) = self.provider.delete_service(service_id).await {
            warn!(service_id, error = %e, "rollback delete_service failed, provider may leak this service");
        }
        self.store.delete(instance_id);
        self.cache.remove(instance_id);
        self.audit.log(
            pool_observe::OperationKind::Create,
            Some(instance_id),
            pool_observe::OperationOutcome::RolledBack,
            None,
            HashMap::new(),
        );
    }
}

const PRE_CHECKPOINT_AUDIT_SCRIPT: &str = r#"
if [ -d /var/lib/agent/identity ] && [ "$(ls -A /var/lib/agent/identity 2>/dev/null)" ]; then
  echo "dirty"
  exit 1
fi
if [ -d /var/lib/agent/conversations ] && [ "$(ls -A /var/lib/agent/conversations 2>/dev/null)" ]; then
  echo "dirty"
  exit 1
fi
echo "clean"
"#;

fn gateway_env(settings: &pool_config::Settings, instance_id: &str) -> pool_proto::ServiceEnv {
    let mut env = HashMap::new();
    env.insert("AGENT_MODEL_API_KEY".to_string(), settings.model_api_key.clone());
    env.insert("AGENT_INSTANCE_ID".to_string(), instance_id.to_string());
    env.insert("AGENT_LISTEN_PORT".to_string(), "8787".to_string());
    env
}

fn render_config_script(settings: &pool_config::Settings, instance_id: &str) -> String {
    let config = serde_json::json!({
        "instanceId": instance_id,
        "channel": "agent-gateway",
        "authToken": settings.bearer_token,
        "listenPort": 8787,
        "bindScope": "public",
    });
    format!(
        "mkdir -p /etc/agent && cat > /etc/agent/config.json <<'EOF'\n{config}\nEOF\ncat > /etc/agent/.env <<'EOF'\nMODEL_API_KEY={key}\nEOF\n",
        key = settings.model_api_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_script_embeds_instance_id_and_key() {
        let settings = test_settings();
        let script = render_config_script(&settings, "abc123xyz987");
        assert!(script.contains("abc123xyz987"));
        assert!(script.contains("MODEL_API_KEY=shh"));
    }

    #[test]
    fn gateway_env_has_required_keys() {
        let settings = test_settings();
        let env = gateway_env(&settings, "abc123xyz987");
        assert_eq!(env.get("AGENT_INSTANCE_ID").unwrap(), "abc123xyz987");
        assert_eq!(env.get("AGENT_MODEL_API_KEY").unwrap(), "shh");
    }

    fn test_settings() -> pool_config::Settings {
        let vars: HashMap<String, String> = [
            ("BEARER_TOKEN", "t"),
            ("PROVIDER_TOKEN", "t"),
            ("PROVIDER_PROJECT_ID", "p"),
            ("PROVIDER_ENVIRONMENT_ID", "e"),
            ("MODEL_API_KEY", "shh"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        pool_config::Settings::from_map(&vars).expect("settings")
    }
}
