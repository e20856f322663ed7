//! Shared types for the agent pool control loop.
//!
//! Defines the provider deploy-status vocabulary, the derived pool state,
//! the in-memory cache entry, the durable metadata row, and the unified
//! error enum used across crate boundaries.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Provider deploy status ───────────────────────────────────────────────────

/// Raw deploy status as reported by the provider's listing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    Queued,
    Waiting,
    Building,
    Deploying,
    Success,
    Failed,
    Crashed,
    Removed,
    Skipped,
    Sleeping,
    /// The provider returned a status string we don't recognize, or none.
    Unknown,
}

impl DeployStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Crashed | Self::Removed | Self::Skipped
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Waiting | Self::Building | Self::Deploying
        )
    }
}

// ─── Pool state ────────────────────────────────────────────────────────────────

/// Derived pool state for a single instance (§4.2 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Starting,
    Idle,
    Claimed,
    Sleeping,
    Dead,
    /// Rewritten from `Dead`/`Sleeping` by the reconciler when a metadata
    /// row exists — never produced by the pure deriver in isolation.
    Crashed,
}

impl PoolState {
    pub fn is_available_for_claim(self) -> bool {
        matches!(self, Self::Idle)
    }
}

// ─── Probe result ──────────────────────────────────────────────────────────────

/// Outcome of a `GET /status` probe against an instance's gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ready: bool,
    pub conversation_id: Option<String>,
    pub streaming: Option<bool>,
}

// ─── Cache entry ───────────────────────────────────────────────────────────────

/// An instance as tracked by the in-memory state cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub service_id: String,
    pub display_name: String,
    pub public_url: Option<String>,
    pub state: PoolState,
    pub deploy_status: DeployStatus,
    pub created_at: DateTime<Utc>,

    pub claimed_agent_name: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub conversation_id: Option<String>,
    pub invite_url: Option<String>,
    pub instructions: Option<String>,
    pub checkpoint_id: Option<String>,
}

impl Instance {
    pub fn starting(id: String, service_id: String, display_name: String) -> Self {
        Self {
            id,
            service_id,
            display_name,
            public_url: None,
            state: PoolState::Starting,
            deploy_status: DeployStatus::Queued,
            created_at: Utc::now(),
            claimed_agent_name: None,
            claimed_at: None,
            conversation_id: None,
            invite_url: None,
            instructions: None,
            checkpoint_id: None,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Merge display fields recorded at claim time into this cache entry.
    pub fn enrich_from_metadata(&mut self, row: &MetadataRow) {
        self.claimed_agent_name = Some(row.agent_name.clone());
        self.claimed_at = Some(row.claimed_at);
        self.conversation_id = Some(row.conversation_id.clone());
        self.invite_url = row.invite_url.clone();
        self.instructions = Some(row.instructions.clone());
        if row.checkpoint_id.is_some() {
            self.checkpoint_id = row.checkpoint_id.clone();
        }
    }
}

// ─── Metadata row (durable) ────────────────────────────────────────────────────

/// Durable record written only on successful claim (§3, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRow {
    pub instance_id: String,
    pub provider_service_id: String,
    pub agent_name: String,
    pub conversation_id: String,
    pub invite_url: Option<String>,
    pub instructions: String,
    pub checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
}

// ─── Provider-facing types ──────────────────────────────────────────────────────

/// A single row from the provider's service listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceListing {
    pub service_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub environment_id: String,
    pub deploy_status: Option<DeployStatus>,
}

/// Environment seeded into a newly created service.
pub type ServiceEnv = std::collections::HashMap<String, String>;

/// Result of a synchronous `exec` call inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────────

/// The unified error type for the pool control loop.
///
/// Variants map to the error kinds of the design's §7; `status_code` gives
/// the HTTP status the control-plane API should answer with.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no idle instance available")]
    NoIdleAvailable,

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("fatal provider error: {0}")]
    ProviderFatal(String),

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("instance already bound: {0}")]
    Conflict(String),

    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::NoIdleAvailable => 503,
            Self::ProviderTransient(_) => 503,
            Self::TimedOut(_) => 504,
            Self::ProviderFatal(_) | Self::GatewayUnavailable(_) | Self::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::NoIdleAvailable => "no_idle_available",
            Self::ProviderTransient(_) => "provider_transient",
            Self::ProviderFatal(_) => "provider_fatal",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::Conflict(_) => "conflict",
            Self::TimedOut(_) => "timed_out",
            Self::Internal(_) => "internal",
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

// ─── Pool counts ────────────────────────────────────────────────────────────────

/// Summary counts exposed by `GET /pool/counts`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolCounts {
    pub starting: u32,
    pub idle: u32,
    pub claimed: u32,
    pub crashed: u32,
}

impl PoolCounts {
    pub fn total(&self) -> u32 {
        self.starting + self.idle + self.claimed
    }
}
