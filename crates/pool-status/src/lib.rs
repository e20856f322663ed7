//! Pure status derivation (§4.2). `derive_state` is total and deterministic
//! over its inputs; contextual rewrites that depend on metadata (the
//! `dead`/`sleeping` → `crashed` promotion) live in the reconciler, not here.

#![forbid(unsafe_code)]

use chrono::Duration;
use pool_proto::{DeployStatus, PoolState, ProbeResult};

/// Age beyond which an unreachable `SUCCESS` deploy, or a null/unknown
/// deploy status, is considered `dead` rather than still `starting`.
pub const DEFAULT_STUCK_TIMEOUT_SECS: i64 = 15 * 60;

/// Map `(deploy_status, probe, age)` to a pool state per the table in §4.2.
/// `stuck_timeout` is a config value, default [`DEFAULT_STUCK_TIMEOUT_SECS`].
pub fn derive_state(
    deploy_status: DeployStatus,
    probe: Option<&ProbeResult>,
    age: Duration,
    stuck_timeout: Duration,
) -> PoolState {
    use DeployStatus::*;

    match deploy_status {
        Queued | Waiting | Building | Deploying => PoolState::Starting,
        Sleeping => PoolState::Sleeping,
        Failed | Crashed | Removed | Skipped => PoolState::Dead,
        Success => match probe {
            Some(p) if p.ready && p.conversation_id.is_none() => PoolState::Idle,
            Some(p) if p.ready && p.conversation_id.is_some() => PoolState::Claimed,
            Some(_) => {
                // ready=false with a status response: treat like unreachable,
                // age-gated the same as a missing probe.
                if age >= stuck_timeout {
                    PoolState::Dead
                } else {
                    PoolState::Starting
                }
            }
            None => {
                if age >= stuck_timeout {
                    PoolState::Dead
                } else {
                    PoolState::Starting
                }
            }
        },
        Unknown => {
            if age >= stuck_timeout {
                PoolState::Dead
            } else {
                PoolState::Starting
            }
        }
    }
}

/// Apply the reconciler-only `dead`/`sleeping` → `crashed` rewrite (§4.2,
/// §9): a terminal state is promoted to `crashed` iff a metadata row exists
/// for the instance, since only a claimed instance's disappearance is
/// user-visible.
pub fn promote_crashed_if_claimed(state: PoolState, has_metadata_row: bool) -> PoolState {
    if has_metadata_row && matches!(state, PoolState::Dead | PoolState::Sleeping) {
        PoolState::Crashed
    } else {
        state
    }
}
