//! HTTP peer clients.
//!
//! Two RPC surfaces live here: operation launch against a peer (with inline
//! or deferred results) and the locker prevent/lock/unlock endpoints used by
//! the distributed handshake. The server side of both is the web layer's
//! business; only the narrow 2xx set below counts as success.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{ConvoyError, Result};
use crate::lock::{Applicant, LockRegistry, LockTransport, ParticipantError, Scope};
use crate::task::{CompletedProcess, Operation};

/// Response statuses accepted as a successful RPC.
const SUCCESS_CODES: [u16; 4] = [200, 201, 202, 204];

/// A resolved fleet participant: identity plus where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHandle {
    pub node_id: String,
    pub base_url: String,
}

impl PeerHandle {
    pub fn new<N: Into<String>, U: Into<String>>(node_id: N, base_url: U) -> Self {
        Self {
            node_id: node_id.into(),
            base_url: base_url.into(),
        }
    }
}

/// Wire payload for `POST /launch/operation`. `timeout` is in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub operation_payload: Operation,
    pub variable_context_payload: HashMap<String, Value>,
    pub timeout: Option<u64>,
    pub step_id: String,
    pub correlation_id: String,
}

/// Result a peer reports back, either inline or via the events callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCompletion {
    pub result: CompletedProcess,
    #[serde(default)]
    pub variable_context_payload: HashMap<String, Value>,
}

/// Outcome of a launch call: the peer either answered inline (200) or
/// accepted the work for deferred completion (202).
#[derive(Debug, Clone)]
pub enum LaunchResponse {
    Inline(RemoteCompletion),
    Accepted,
}

/// Client used by remote tasks to delegate execution to a peer.
#[async_trait]
pub trait PeerExecClient: Send + Sync {
    async fn launch_operation(
        &self,
        peer: &PeerHandle,
        request: LaunchRequest,
    ) -> Result<LaunchResponse>;
}

/// reqwest-backed [`PeerExecClient`].
#[derive(Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerExecClient for HttpPeerClient {
    async fn launch_operation(
        &self,
        peer: &PeerHandle,
        request: LaunchRequest,
    ) -> Result<LaunchResponse> {
        let url = format!("{}/launch/operation", peer.base_url.trim_end_matches('/'));
        debug!(peer = %peer.node_id, %url, step = %request.step_id, "launching operation on peer");

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ConvoyError::Network {
                operation: "launch_operation".to_string(),
                peer: peer.node_id.clone(),
                status: None,
                source: Some(Box::new(e)),
            })?;

        let status = response.status().as_u16();
        match status {
            200 => {
                let completion: RemoteCompletion =
                    response.json().await.map_err(|e| ConvoyError::Network {
                        operation: "launch_operation".to_string(),
                        peer: peer.node_id.clone(),
                        status: Some(status),
                        source: Some(Box::new(e)),
                    })?;
                Ok(LaunchResponse::Inline(completion))
            }
            202 => Ok(LaunchResponse::Accepted),
            _ => Err(ConvoyError::network(
                "launch_operation",
                peer.node_id.clone(),
                Some(status),
            )),
        }
    }
}

/// Wire payload for `POST /locker/prevent`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreventRequest<'a> {
    scope: Scope,
    applicant: &'a Applicant,
    datemark: Option<chrono::DateTime<Utc>>,
}

/// Wire payload for `POST /locker/lock`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockRequest<'a> {
    scope: Scope,
    applicant: &'a Applicant,
}

/// Wire payload for `POST /locker/unlock`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnlockRequest<'a> {
    scope: Scope,
    applicant: &'a Applicant,
    force: bool,
}

/// [`LockTransport`] that talks HTTP to peers and dispatches calls addressed
/// to the local node straight into the process-wide lock registry.
pub struct HttpLockTransport {
    http: reqwest::Client,
    local_node_id: String,
    registry: Arc<LockRegistry>,
}

impl HttpLockTransport {
    pub fn new<S: Into<String>>(local_node_id: S, registry: Arc<LockRegistry>) -> Self {
        Self {
            http: reqwest::Client::new(),
            local_node_id: local_node_id.into(),
            registry,
        }
    }

    fn is_local(&self, peer: &PeerHandle) -> bool {
        peer.node_id == self.local_node_id
    }

    async fn post<B: Serialize>(
        &self,
        peer: &PeerHandle,
        endpoint: &str,
        body: &B,
    ) -> std::result::Result<(), ParticipantError> {
        let url = format!("{}/locker/{}", peer.base_url.trim_end_matches('/'), endpoint);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ParticipantError {
                status: None,
                detail: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        if SUCCESS_CODES.contains(&status) {
            Ok(())
        } else {
            Err(ParticipantError {
                status: Some(status),
                detail: format!("peer answered {status} to /locker/{endpoint}"),
            })
        }
    }
}

#[async_trait]
impl LockTransport for HttpLockTransport {
    async fn prevent(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
    ) -> std::result::Result<(), ParticipantError> {
        if self.is_local(peer) {
            return self
                .registry
                .preventing_lock(scope, applicant)
                .map_err(ParticipantError::from);
        }
        let body = PreventRequest {
            scope,
            applicant,
            datemark: Some(Utc::now()),
        };
        self.post(peer, "prevent", &body).await
    }

    async fn lock(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
    ) -> std::result::Result<(), ParticipantError> {
        if self.is_local(peer) {
            return self
                .registry
                .lock(scope, applicant)
                .map_err(ParticipantError::from);
        }
        let body = LockRequest { scope, applicant };
        self.post(peer, "lock", &body).await
    }

    async fn unlock(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
        force: bool,
    ) -> std::result::Result<(), ParticipantError> {
        if self.is_local(peer) {
            return self
                .registry
                .unlock(scope, applicant, force)
                .map_err(ParticipantError::from);
        }
        let body = UnlockRequest {
            scope,
            applicant,
            force,
        };
        self.post(peer, "unlock", &body).await
    }
}
