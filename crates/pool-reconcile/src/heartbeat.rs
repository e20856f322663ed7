//! Optional, provider-dependent heartbeat (§4.7). Pings `idle` and
//! `claimed` instances independently of the reconciler tick; never mutates
//! derived state directly, only triggers the same cleanup primitives the
//! tick uses.

use crate::Reconciler;
use parking_lot::Mutex;
use pool_observe::{OperationKind, OperationOutcome};
use pool_proto::PoolState;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const FAILURE_THRESHOLD: u32 = 3;
const RECOVERY_ATTEMPT_CAP: u32 = 3;

#[derive(Default)]
struct InstanceHeartbeatState {
    consecutive_failures: u32,
    recovery_attempts: u32,
}

/// Per-instance failure/recovery counters the heartbeat tracks across
/// pings. Lives alongside the reconciler rather than in the cache, since
/// it's heartbeat-private bookkeeping, not derived pool state.
#[derive(Default)]
pub struct HeartbeatTracker {
    state: Mutex<HashMap<String, InstanceHeartbeatState>>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reconciler {
    /// Run a single heartbeat sweep over `idle` and `claimed` instances.
    pub async fn heartbeat_sweep(self: &Arc<Self>, tracker: &HeartbeatTracker) {
        let targets: Vec<_> = self
            .cache
            .all()
            .into_iter()
            .filter(|i| matches!(i.state, PoolState::Idle | PoolState::Claimed))
            .collect();

        for instance in targets {
            let Some(public_url) = instance.public_url.clone() else { continue };
            let reachable = self.gateway.status(&public_url).await.is_some();

            let mut map = tracker.state.lock();
            let entry = map.entry(instance.id.clone()).or_default();

            if reachable {
                entry.consecutive_failures = 0;
                continue;
            }

            entry.consecutive_failures += 1;
            if entry.consecutive_failures < FAILURE_THRESHOLD {
                info!(instance_id = %instance.id, failures = entry.consecutive_failures, "heartbeat miss, below threshold");
                continue;
            }

            match instance.state {
                PoolState::Idle => {
                    drop(map);
                    self.metrics.heartbeat_cleanups.inc();
                    warn!(instance_id = %instance.id, "idle instance failed heartbeat threshold, cleaning up");
                    if let Err(e) = self.destroy(&instance.id).await {
                        warn!(instance_id = %instance.id, error = %e, "heartbeat cleanup of idle instance failed");
                    }
                    self.audit.log(
                        OperationKind::HeartbeatCleanup,
                        Some(&instance.id),
                        OperationOutcome::Success,
                        None,
                        HashMap::new(),
                    );
                    tracker.state.lock().remove(&instance.id);
                }
                PoolState::Claimed => {
                    let recovery_attempts = entry.recovery_attempts;
                    drop(map);

                    if recovery_attempts >= RECOVERY_ATTEMPT_CAP {
                        self.metrics.heartbeat_cleanups.inc();
                        warn!(instance_id = %instance.id, "claimed instance exhausted recovery attempts, cleaning up");
                        if let Err(e) = self.destroy(&instance.id).await {
                            warn!(instance_id = %instance.id, error = %e, "heartbeat cleanup of claimed instance failed");
                        }
                        tracker.state.lock().remove(&instance.id);
                        continue;
                    }

                    match self.provider.start_detached(&instance.service_id, "agent-gateway").await {
                        Ok(()) => {
                            let mut map = tracker.state.lock();
                            if let Some(e) = map.get_mut(&instance.id) {
                                e.recovery_attempts += 1;
                                e.consecutive_failures = 0;
                            }
                            info!(instance_id = %instance.id, "recovery attempt issued for claimed instance");
                        }
                        Err(e) => {
                            warn!(instance_id = %instance.id, error = %e, "recovery attempt failed");
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
