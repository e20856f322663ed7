//! Provider client: the uniform surface over the external compute provider
//! (§4.1). Defines the [`Provider`] trait plus one concrete backend,
//! [`HttpProvider`], that speaks a GraphQL-style deploy API over `reqwest`.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use pool_proto::{ExecOutput, PoolError, PoolResult, ServiceEnv, ServiceListing};
use std::time::Duration;
use tracing::{info, warn};

/// Uniform surface to the compute provider (§4.1). All operations fail with
/// one of the `Provider*` variants of [`PoolError`]; `list_services`
/// returns `None` (the `Unavailable` sentinel) rather than erroring so
/// callers can distinguish "no services" from "couldn't read the provider."
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Create a service from the provider's fixed source, seed `env`, and
    /// return a stable service id. Implementations must cancel any
    /// auto-initiated deployment and issue exactly one controlled deploy.
    async fn create_service(&self, name: &str, env: &ServiceEnv) -> PoolResult<String>;

    /// Allocate a public hostname for `service_id`.
    async fn create_domain(&self, service_id: &str) -> PoolResult<String>;

    /// Single batched listing of all services visible to this provider
    /// credential. `None` means the provider could not be read — callers
    /// must never take destructive action on that basis (§4.3 step 1).
    async fn list_services(&self) -> Option<Vec<ServiceListing>>;

    /// Idempotent delete; also purges orphan volumes attached to the
    /// service. A missing service is success, not `NotFound`.
    async fn delete_service(&self, service_id: &str) -> PoolResult<()>;

    /// Dashboard-visibility rename. Never load-bearing for correctness.
    async fn rename_service(&self, service_id: &str, name: &str) -> PoolResult<()>;

    /// Synchronous command execution inside the instance. Retries a small
    /// bounded number of times on transient transport errors.
    async fn exec(&self, service_id: &str, shell_script: &str) -> PoolResult<ExecOutput>;

    /// Fire-and-forget long-lived process start.
    async fn start_detached(&self, service_id: &str, command: &str) -> PoolResult<()>;

    /// Whether this provider backend supports filesystem checkpoints.
    fn supports_checkpoints(&self) -> bool {
        true
    }

    /// Streaming checkpoint creation; parses the checkpoint id from the
    /// terminal event and fails if none arrives.
    async fn create_checkpoint(&self, service_id: &str, label: &str) -> PoolResult<String>;

    /// Reset the filesystem and kill processes, then restore `checkpoint_id`.
    async fn restore_checkpoint(&self, service_id: &str, checkpoint_id: &str) -> PoolResult<()>;
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client builder with static config never fails")
}

/// Run `f` up to `attempts` times, treating every error as transient and
/// backing off with a short bounded delay between tries (§4.1, §4.4 steps
/// 4–5). The final attempt's error is returned unwrapped.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut f: F) -> PoolResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PoolResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(attempt, error = %e, "provider call failed, retrying");
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| PoolError::Internal("retry loop ran zero times".into())))
}

fn classify_reqwest_err(e: reqwest::Error) -> PoolError {
    if e.is_timeout() || e.is_connect() {
        PoolError::ProviderTransient(e.to_string())
    } else if let Some(status) = e.status() {
        if status.as_u16() == 404 {
            PoolError::NotFound(e.to_string())
        } else if status.is_server_error() {
            PoolError::ProviderTransient(e.to_string())
        } else {
            PoolError::ProviderFatal(e.to_string())
        }
    } else {
        PoolError::ProviderFatal(e.to_string())
    }
}

/// GraphQL-style HTTP backend for the compute provider. Deploy statuses,
/// service listings, and domain allocation all go over a single GraphQL
/// endpoint; `exec`/checkpoint operations go over a sibling REST-ish API
/// on the instance's own control sidecar.
pub struct HttpProvider {
    client: reqwest::Client,
    api_base: String,
    token: String,
    project_id: String,
    environment_id: String,
    source_image: String,
    deploy_commit: String,
}

#[derive(serde::Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

impl HttpProvider {
    pub fn new(
        api_base: String,
        token: String,
        project_id: String,
        environment_id: String,
        source_image: String,
        deploy_commit: String,
    ) -> Self {
        Self {
            client: build_client(Duration::from_secs(30)),
            api_base,
            token,
            project_id,
            environment_id,
            source_image,
            deploy_commit,
        }
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> PoolResult<serde_json::Value> {
        let body = GraphQlRequest { query, variables };
        let resp = self
            .client
            .post(format!("{}/graphql/v2", self.api_base))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_err)?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.map_err(classify_reqwest_err)?;

        if !status.is_success() {
            return Err(PoolError::ProviderFatal(format!(
                "graphql call returned {status}: {payload}"
            )));
        }
        if let Some(errors) = payload.get("errors").filter(|e| !e.is_null()) {
            return Err(PoolError::ProviderFatal(format!("graphql errors: {errors}")));
        }
        Ok(payload["data"].clone())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http-graphql"
    }

    async fn create_service(&self, name: &str, env: &ServiceEnv) -> PoolResult<String> {
        let data = self
            .graphql(
                "mutation($projectId: String!, $name: String!, $source: ServiceSourceInput!) {
                    serviceCreate(input: { projectId: $projectId, name: $name, source: $source }) { id }
                }",
                serde_json::json!({
                    "projectId": self.project_id,
                    "name": name,
                    "source": { "image": self.source_image },
                }),
            )
            .await?;
        let service_id = data["serviceCreate"]["id"]
            .as_str()
            .ok_or_else(|| PoolError::ProviderFatal("missing serviceCreate.id in response".into()))?
            .to_string();

        // Cancel any auto-initiated deployment, then issue exactly one
        // controlled deploy from the configured commit (§4.1, §4.4 step 3).
        let _ = self
            .graphql(
                "mutation($serviceId: String!) { deploymentCancelAll(serviceId: $serviceId) }",
                serde_json::json!({ "serviceId": service_id }),
            )
            .await;

        for (key, value) in env.iter() {
            self.graphql(
                "mutation($serviceId: String!, $environmentId: String!, $name: String!, $value: String!) {
                    variableUpsert(input: { serviceId: $serviceId, environmentId: $environmentId, name: $name, value: $value })
                }",
                serde_json::json!({
                    "serviceId": service_id,
                    "environmentId": self.environment_id,
                    "name": key,
                    "value": value,
                }),
            )
            .await?;
        }

        self.graphql(
            "mutation($serviceId: String!, $environmentId: String!, $commitSha: String!) {
                serviceInstanceDeploy(serviceId: $serviceId, environmentId: $environmentId, commitSha: $commitSha)
            }",
            serde_json::json!({
                "serviceId": service_id,
                "environmentId": self.environment_id,
                "commitSha": self.deploy_commit,
            }),
        )
        .await?;

        info!(service_id, name, "created service and issued controlled deploy");
        Ok(service_id)
    }

    async fn create_domain(&self, service_id: &str) -> PoolResult<String> {
        let data = self
            .graphql(
                "mutation($serviceId: String!, $environmentId: String!) {
                    serviceDomainCreate(input: { serviceId: $serviceId, environmentId: $environmentId }) { domain }
                }",
                serde_json::json!({ "serviceId": service_id, "environmentId": self.environment_id }),
            )
            .await?;
        data["serviceDomainCreate"]["domain"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PoolError::ProviderFatal("missing domain in response".into()))
    }

    async fn list_services(&self) -> Option<Vec<ServiceListing>> {
        let result = self
            .graphql(
                "query($projectId: String!) {
                    project(id: $projectId) {
                        services { edges { node {
                            id name createdAt
                            serviceInstances { edges { node { environmentId latestDeployment { status } } } }
                        } } }
                    }
                }",
                serde_json::json!({ "projectId": self.project_id }),
            )
            .await;

        let data = match result {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "provider listing unavailable");
                return None;
            }
        };

        let edges = data["project"]["services"]["edges"].as_array()?;
        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            let node = &edge["node"];
            let id = node["id"].as_str()?.to_string();
            let name = node["name"].as_str().unwrap_or_default().to_string();
            let created_at = node["createdAt"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(chrono::Utc::now);

            let instance_edges = node["serviceInstances"]["edges"].as_array();
            let (environment_id, deploy_status) = instance_edges
                .and_then(|edges| edges.first())
                .map(|e| {
                    let inst = &e["node"];
                    let env_id = inst["environmentId"].as_str().unwrap_or_default().to_string();
                    let status = inst["latestDeployment"]["status"]
                        .as_str()
                        .and_then(parse_deploy_status);
                    (env_id, status)
                })
                .unwrap_or_default();

            out.push(ServiceListing {
                service_id: id,
                name,
                created_at,
                environment_id,
                deploy_status,
            });
        }
        Some(out)
    }

    async fn delete_service(&self, service_id: &str) -> PoolResult<()> {
        let result = self
            .graphql(
                "mutation($id: String!) { serviceDelete(id: $id) }",
                serde_json::json!({ "id": service_id }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(PoolError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename_service(&self, service_id: &str, name: &str) -> PoolResult<()> {
        self.graphql(
            "mutation($id: String!, $name: String!) { serviceUpdate(id: $id, input: { name: $name }) { id } }",
            serde_json::json!({ "id": service_id, "name": name }),
        )
        .await?;
        Ok(())
    }

    async fn exec(&self, service_id: &str, shell_script: &str) -> PoolResult<ExecOutput> {
        with_retries(3, || async {
            let resp = self
                .client
                .post(format!("{}/services/{}/exec", self.api_base, service_id))
                .bearer_auth(&self.token)
                .json(&serde_json::json!({ "script": shell_script }))
                .send()
                .await
                .map_err(classify_reqwest_err)?
                .error_for_status()
                .map_err(classify_reqwest_err)?;
            resp.json::<ExecOutput>().await.map_err(classify_reqwest_err)
        })
        .await
    }

    async fn start_detached(&self, service_id: &str, command: &str) -> PoolResult<()> {
        with_retries(3, || async {
            self.client
                .post(format!("{}/services/{}/start-detached", self.api_base, service_id))
                .bearer_auth(&self.token)
                .json(&serde_json::json!({ "command": command }))
                .send()
                .await
                .map_err(classify_reqwest_err)?
                .error_for_status()
                .map_err(classify_reqwest_err)?;
            Ok(())
        })
        .await
    }

    async fn create_checkpoint(&self, service_id: &str, label: &str) -> PoolResult<String> {
        let mut stream = self
            .client
            .post(format!("{}/services/{}/checkpoint", self.api_base, service_id))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "label": label }))
            .send()
            .await
            .map_err(classify_reqwest_err)?
            .error_for_status()
            .map_err(classify_reqwest_err)?;

        let mut checkpoint_id = None;
        while let Some(chunk) = stream.chunk().await.map_err(classify_reqwest_err)? {
            for line in chunk.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                if let Ok(event) = serde_json::from_slice::<serde_json::Value>(line) {
                    if let Some(id) = event["checkpointId"].as_str() {
                        checkpoint_id = Some(id.to_string());
                    }
                }
            }
        }

        checkpoint_id.ok_or_else(|| {
            PoolError::ProviderFatal(format!("checkpoint stream for {service_id} ended without an id"))
        })
    }

    async fn restore_checkpoint(&self, service_id: &str, checkpoint_id: &str) -> PoolResult<()> {
        self.client
            .post(format!("{}/services/{}/restore", self.api_base, service_id))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "checkpointId": checkpoint_id }))
            .send()
            .await
            .map_err(classify_reqwest_err)?
            .error_for_status()
            .map_err(classify_reqwest_err)?;
        Ok(())
    }
}

fn parse_deploy_status(raw: &str) -> Option<pool_proto::DeployStatus> {
    use pool_proto::DeployStatus::*;
    Some(match raw {
        "QUEUED" => Queued,
        "WAITING" | "INITIALIZING" => Waiting,
        "BUILDING" => Building,
        "DEPLOYING" => Deploying,
        "SUCCESS" | "ACTIVE" => Success,
        "FAILED" => Failed,
        "CRASHED" => Crashed,
        "REMOVED" => Removed,
        "SKIPPED" => Skipped,
        "SLEEPING" => Sleeping,
        _ => Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_deploy_statuses() {
        assert_eq!(parse_deploy_status("BUILDING"), Some(pool_proto::DeployStatus::Building));
        assert_eq!(parse_deploy_status("SUCCESS"), Some(pool_proto::DeployStatus::Success));
        assert_eq!(parse_deploy_status("bogus"), Some(pool_proto::DeployStatus::Unknown));
    }

    #[tokio::test]
    async fn with_retries_succeeds_after_transient_failures() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: PoolResult<u32> = with_retries(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PoolError::ProviderTransient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retries_exhausts_and_returns_last_error() {
        let result: PoolResult<u32> =
            with_retries(2, || async { Err(PoolError::ProviderTransient("still broken".into())) }).await;
        assert!(matches!(result, Err(PoolError::ProviderTransient(_))));
    }
}
