//! HTTP client for the agent gateway contract each instance exposes on its
//! public URL (§6.2). Every call carries a short, fixed timeout — probes
//! are meant to feed the status deriver, not to block a tick.

#![forbid(unsafe_code)]

use pool_proto::{PoolError, PoolResult, ProbeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one instance's gateway, bound to its public base URL.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("reqwest client builder with static config never fails"),
        }
    }

    /// `GET /status`. An unreachable gateway is `Ok(None)`, not an error —
    /// the reconciler treats it as "no probe" and falls back to age (§4.2).
    pub async fn status(&self, base_url: &str) -> Option<ProbeResult> {
        let resp = self
            .client
            .get(format!("{base_url}/status"))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: StatusResponse = resp.json().await.ok()?;
        Some(ProbeResult {
            ready: body.ready,
            conversation_id: body.conversation.map(|c| c.id),
            streaming: body.streaming,
        })
    }

    /// `POST /conversation` (create mode, §4.5 step 3). 409 maps to
    /// [`PoolError::Conflict`]; any other non-2xx is [`PoolError::GatewayUnavailable`].
    pub async fn create_conversation(
        &self,
        base_url: &str,
        name: &str,
        profile_name: &str,
        env: &serde_json::Value,
    ) -> PoolResult<ConversationResponse> {
        let resp = self
            .client
            .post(format!("{base_url}/conversation"))
            .json(&serde_json::json!({
                "name": name,
                "profileName": profile_name,
                "env": env,
            }))
            .send()
            .await
            .map_err(|e| PoolError::GatewayUnavailable(e.to_string()))?;

        self.parse_bind_response(resp).await
    }

    /// `POST /join` (join mode, §4.5 step 3). Same conflict semantics as
    /// `create_conversation`; `status` may come back `waiting_for_acceptance`
    /// with a null conversation id (§9 open question).
    pub async fn join(
        &self,
        base_url: &str,
        join_url: &str,
        profile_name: &str,
        env: &serde_json::Value,
    ) -> PoolResult<ConversationResponse> {
        let resp = self
            .client
            .post(format!("{base_url}/join"))
            .json(&serde_json::json!({
                "inviteUrl": join_url,
                "profileName": profile_name,
                "env": env,
            }))
            .send()
            .await
            .map_err(|e| PoolError::GatewayUnavailable(e.to_string()))?;

        self.parse_bind_response(resp).await
    }

    async fn parse_bind_response(&self, resp: reqwest::Response) -> PoolResult<ConversationResponse> {
        if resp.status().as_u16() == 409 {
            return Err(PoolError::Conflict("instance already bound".into()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(PoolError::GatewayUnavailable(format!("gateway returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| PoolError::GatewayUnavailable(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    ready: bool,
    conversation: Option<ConversationRef>,
    streaming: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ConversationRef {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(rename = "inviteUrl")]
    pub invite_url: Option<String>,
    /// Only present for `/join`: `"joined"` or `"waiting_for_acceptance"`.
    pub status: Option<String>,
}

impl ConversationResponse {
    pub fn is_waiting_for_acceptance(&self) -> bool {
        self.status.as_deref() == Some("waiting_for_acceptance")
    }
}
