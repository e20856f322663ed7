//! Configuration (§6.3). All inputs are environment variables; there is no
//! config file, matching a process that's deployed as a single long-lived
//! container alongside the instances it manages.

#![forbid(unsafe_code)]

use pool_proto::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resolved settings for one control-plane process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub port: u16,
    pub bearer_token: String,
    pub environment_tag: String,
    pub provider_token: String,
    pub provider_api_base: String,
    pub provider_project_id: String,
    pub provider_environment_id: String,
    pub source_image: String,
    pub deploy_commit: String,
    pub model_api_key: String,

    pub min_idle: u32,
    pub max_total: u32,
    pub tick_interval: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub stuck_timeout: Duration,
    pub orphan_grace: Duration,
    pub failure_threshold: u32,
    pub cool_down: Duration,

    pub pool_prefix: String,
    pub state_dir: std::path::PathBuf,
}

fn lookup(vars: &HashMap<String, String>, key: &str) -> PoolResult<String> {
    vars.get(key)
        .cloned()
        .ok_or_else(|| PoolError::Internal(format!("missing required env var {key}")))
}

fn lookup_or<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    vars.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn lookup_secs(vars: &HashMap<String, String>, key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(lookup_or(vars, key, default_secs))
}

impl Settings {
    /// Load from the enumerated environment inputs of §6.3. Fails closed on
    /// any missing required credential rather than falling back to an
    /// insecure default.
    pub fn from_env() -> PoolResult<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Pure variant of [`Settings::from_env`] taking an explicit variable
    /// map, so resolution logic is unit-testable without touching process
    /// environment.
    pub fn from_map(vars: &HashMap<String, String>) -> PoolResult<Self> {
        let heartbeat_secs: u64 = lookup_or(vars, "HEARTBEAT_INTERVAL_SECS", 0);

        Ok(Self {
            port: lookup_or(vars, "CONTROL_PLANE_PORT", 8080),
            bearer_token: lookup(vars, "BEARER_TOKEN")?,
            environment_tag: lookup_or(vars, "ENVIRONMENT_TAG", "production".to_string()),
            provider_token: lookup(vars, "PROVIDER_TOKEN")?,
            provider_api_base: lookup_or(vars, "PROVIDER_API_BASE", "https://api.provider.example".to_string()),
            provider_project_id: lookup(vars, "PROVIDER_PROJECT_ID")?,
            provider_environment_id: lookup(vars, "PROVIDER_ENVIRONMENT_ID")?,
            source_image: lookup_or(vars, "SOURCE_IMAGE", "ghcr.io/agentpool/agent-gateway:latest".to_string()),
            deploy_commit: lookup_or(vars, "DEPLOY_COMMIT", "main".to_string()),
            model_api_key: lookup(vars, "MODEL_API_KEY")?,

            min_idle: lookup_or(vars, "MIN_IDLE", 1),
            max_total: lookup_or(vars, "MAX_TOTAL", 10),
            tick_interval: lookup_secs(vars, "TICK_INTERVAL_SECS", 30),
            heartbeat_interval: if heartbeat_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(heartbeat_secs))
            },
            stuck_timeout: lookup_secs(vars, "STUCK_TIMEOUT_SECS", 15 * 60),
            orphan_grace: lookup_secs(vars, "ORPHAN_GRACE_SECS", 10 * 60),
            failure_threshold: lookup_or(vars, "FAILURE_THRESHOLD", 3),
            cool_down: lookup_secs(vars, "COOL_DOWN_SECS", 5 * 60),

            pool_prefix: lookup_or(vars, "POOL_PREFIX", "convos-agent-".to_string()),
            state_dir: lookup_or(vars, "STATE_DIR", "/var/lib/agentpool".to_string()).into(),
        })
    }
}
