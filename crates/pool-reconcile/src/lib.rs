//! Reconciliation engine: the tick loop, claim coordinator, and instance
//! lifecycle operations that keep the pool's remote instances consistent
//! with desired shape (§4.3–§4.7).

#![forbid(unsafe_code)]

pub mod cache;
pub mod circuit_breaker;

mod claim;
mod create;
mod heartbeat;
mod lifecycle;
mod tick;

pub use cache::PoolCache;
pub use circuit_breaker::CircuitBreaker;
pub use claim::{ClaimOutcome, ClaimRequest};
pub use heartbeat::HeartbeatTracker;
pub use tick::TickOutcome;

use parking_lot::Mutex;
use pool_config::Settings;
use pool_gateway::GatewayClient;
use pool_observe::{AuditLog, PoolMetrics};
use pool_provider::Provider;
use pool_store::{ClaimGuard, MetadataStore};
use std::sync::Arc;

/// Create-path polling cadence and timeout (§4.4 step 6). Not one of the
/// enumerated §6.3 settings since it is a create-path implementation
/// detail, not an operator-tunable pool parameter.
const CREATE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);
const CREATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const RECYCLE_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Owns every shared resource the control loop touches: the provider
/// client, the gateway client, the durable metadata store, the in-memory
/// cache, the claim-in-progress guard, and the creation circuit breaker.
pub struct Reconciler {
    provider: Arc<dyn Provider>,
    gateway: GatewayClient,
    store: Arc<MetadataStore>,
    cache: Arc<PoolCache>,
    claim_guard: ClaimGuard,
    settings: Settings,
    breaker: Mutex<CircuitBreaker>,
    metrics: Arc<PoolMetrics>,
    audit: Arc<AuditLog>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<MetadataStore>,
        cache: Arc<PoolCache>,
        settings: Settings,
        metrics: Arc<PoolMetrics>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let cool_down = chrono::Duration::from_std(settings.cool_down).unwrap_or(chrono::Duration::minutes(5));
        let breaker = CircuitBreaker::new(settings.failure_threshold, cool_down);
        Self {
            provider,
            gateway: GatewayClient::new(),
            store,
            cache,
            claim_guard: ClaimGuard::new(),
            settings,
            breaker: Mutex::new(breaker),
            metrics,
            audit,
        }
    }

    pub fn cache(&self) -> &PoolCache {
        &self.cache
    }

    pub fn claim_guard(&self) -> &ClaimGuard {
        &self.claim_guard
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// A 12-char lowercase alphanumeric id (§4.4 step 1).
pub(crate) fn generate_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
