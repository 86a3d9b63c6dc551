//! Distributed two-phase lock handshake.
//!
//! Acquisition broadcasts `prevent` to every participant (the local node
//! included), and only when all ack does it broadcast `lock`. Any failure at
//! either phase triggers a best-effort compensating `unlock` to the
//! participants that had already acked, then surfaces an aggregated error
//! naming every participant that did not. Release broadcasts `unlock` to
//! everyone and never fails the caller; individual rejections are logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

use super::locker::LockError;
use super::scope::{Applicant, Scope};
use crate::core::fanout::fan_out;
use crate::net::PeerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    Prevent,
    Lock,
    Unlock,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockPhase::Prevent => "prevent",
            LockPhase::Lock => "lock",
            LockPhase::Unlock => "unlock",
        };
        f.write_str(name)
    }
}

/// One participant's rejection of one RPC.
#[derive(Debug, Clone)]
pub struct ParticipantError {
    pub status: Option<u16>,
    pub detail: String,
}

impl ParticipantError {
    pub fn timed_out() -> Self {
        Self {
            status: None,
            detail: "phase timed out before the participant answered".to_string(),
        }
    }
}

impl From<LockError> for ParticipantError {
    fn from(err: LockError) -> Self {
        Self {
            status: None,
            detail: err.to_string(),
        }
    }
}

/// A participant failure as carried by the aggregated handshake error.
#[derive(Debug, Clone)]
pub struct ParticipantFailure {
    pub node_id: String,
    pub phase: LockPhase,
    pub status: Option<u16>,
    pub detail: String,
}

impl fmt::Display for ParticipantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} phase): {}", self.node_id, self.phase, self.detail)
    }
}

/// Carries a single handshake phase to one participant. Implementations
/// route calls addressed to the local node into the lock registry and
/// everything else over HTTP.
#[async_trait]
pub trait LockTransport: Send + Sync {
    async fn prevent(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
    ) -> Result<(), ParticipantError>;

    async fn lock(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
    ) -> Result<(), ParticipantError>;

    async fn unlock(
        &self,
        peer: &PeerHandle,
        scope: Scope,
        applicant: &Applicant,
        force: bool,
    ) -> Result<(), ParticipantError>;
}

pub struct LockCoordinator {
    transport: Arc<dyn LockTransport>,
    /// Per-phase deadline for the participant fan-out.
    phase_timeout: Option<Duration>,
}

impl LockCoordinator {
    pub fn new(transport: Arc<dyn LockTransport>) -> Self {
        Self {
            transport,
            phase_timeout: None,
        }
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    async fn broadcast(
        &self,
        phase: LockPhase,
        scope: Scope,
        participants: &[PeerHandle],
        applicant: &Applicant,
    ) -> Vec<Result<(), ParticipantError>> {
        let futs: Vec<_> = participants
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                async move {
                    match phase {
                        LockPhase::Prevent => transport.prevent(peer, scope, applicant).await,
                        LockPhase::Lock => transport.lock(peer, scope, applicant).await,
                        LockPhase::Unlock => transport.unlock(peer, scope, applicant, false).await,
                    }
                }
            })
            .collect();

        fan_out(futs, self.phase_timeout)
            .await
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(ParticipantError::timed_out())))
            .collect()
    }

    fn split_failures(
        phase: LockPhase,
        participants: &[PeerHandle],
        results: Vec<Result<(), ParticipantError>>,
    ) -> (Vec<PeerHandle>, Vec<ParticipantFailure>) {
        let mut acked = Vec::new();
        let mut failures = Vec::new();
        for (peer, result) in participants.iter().zip(results) {
            match result {
                Ok(()) => acked.push(peer.clone()),
                Err(e) => failures.push(ParticipantFailure {
                    node_id: peer.node_id.clone(),
                    phase,
                    status: e.status,
                    detail: e.detail,
                }),
            }
        }
        (acked, failures)
    }

    /// Best-effort compensating unlock after a failed phase.
    async fn compensate(&self, scope: Scope, acked: &[PeerHandle], applicant: &Applicant) {
        if acked.is_empty() {
            return;
        }
        warn!(
            %scope,
            participants = acked.len(),
            "handshake failed; sending compensating unlock to acked participants"
        );
        let results = self
            .broadcast(LockPhase::Unlock, scope, acked, applicant)
            .await;
        for (peer, result) in acked.iter().zip(results) {
            if let Err(e) = result {
                warn!(%scope, peer = %peer.node_id, "compensating unlock failed: {}", e.detail);
            }
        }
    }

    /// Run the two-phase handshake across all participants. On success the
    /// scope is locked fleet-wide under `applicant`; on failure nothing is
    /// left reserved (modulo compensation failures, which are only logged)
    /// and the aggregated error names every participant that did not ack.
    pub async fn acquire(
        &self,
        scope: Scope,
        participants: &[PeerHandle],
        applicant: &Applicant,
    ) -> Result<(), LockError> {
        info!(%scope, %applicant, participants = participants.len(), "acquiring fleet-wide lock");

        let results = self
            .broadcast(LockPhase::Prevent, scope, participants, applicant)
            .await;
        let (acked, failures) = Self::split_failures(LockPhase::Prevent, participants, results);
        if !failures.is_empty() {
            self.compensate(scope, &acked, applicant).await;
            return Err(LockError::Handshake {
                scope,
                applicant: applicant.clone(),
                failures,
            });
        }

        let results = self
            .broadcast(LockPhase::Lock, scope, participants, applicant)
            .await;
        let (_, failures) = Self::split_failures(LockPhase::Lock, participants, results);
        if !failures.is_empty() {
            // Every participant passed prevent, so all of them get the
            // compensating unlock.
            self.compensate(scope, participants, applicant).await;
            return Err(LockError::Handshake {
                scope,
                applicant: applicant.clone(),
                failures,
            });
        }

        info!(%scope, %applicant, "fleet-wide lock acquired");
        Ok(())
    }

    /// Broadcast unlock to every participant. Always at-least-attempted:
    /// individual failures are logged and do not fail the release.
    pub async fn release(&self, scope: Scope, participants: &[PeerHandle], applicant: &Applicant) {
        info!(%scope, %applicant, participants = participants.len(), "releasing fleet-wide lock");
        let results = self
            .broadcast(LockPhase::Unlock, scope, participants, applicant)
            .await;
        for (peer, result) in participants.iter().zip(results) {
            if let Err(e) = result {
                warn!(%scope, peer = %peer.node_id, "unlock failed during release: {}", e.detail);
            }
        }
    }
}
