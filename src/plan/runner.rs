//! End-to-end orchestration runs.
//!
//! The runner owns the data flow around a plan: acquire the
//! ORCHESTRATION-scope lock across every involved participant, invoke the
//! root composite, mirror the walk in reverse when the run failed and
//! rollback was requested, and release the lock whatever the outcome.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::core::errors::Result;
use crate::lock::{Applicant, LockCoordinator, Scope};
use crate::net::PeerHandle;
use crate::task::{CompositeTask, StepReport, Task};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run-wide timeout budget handed to the root composite.
    pub timeout: Option<Duration>,
    /// Whether a failed run triggers the compensating walk.
    pub undo_on_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            undo_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    /// The root composite's result: unset when nothing ran.
    pub success: Option<bool>,
    /// The compensating walk's result, when one was triggered.
    pub undo_success: Option<bool>,
    pub steps: Vec<StepReport>,
}

pub struct OrchestrationRunner {
    coordinator: LockCoordinator,
}

impl OrchestrationRunner {
    pub fn new(coordinator: LockCoordinator) -> Self {
        Self { coordinator }
    }

    /// Run `plan` under the fleet-wide orchestration lock. A failed
    /// acquisition aborts before any step is attempted; the release always
    /// happens, success or not.
    pub async fn run(
        &self,
        plan: &CompositeTask,
        participants: &[PeerHandle],
        options: RunOptions,
    ) -> Result<RunOutcome> {
        let run_id = cuid2::create_id();
        let applicant =
            Applicant::from_participants(participants.iter().map(|p| p.node_id.clone()));

        self.coordinator
            .acquire(Scope::Orchestration, participants, &applicant)
            .await?;
        info!(%run_id, plan = %plan.id(), "orchestration lock held; starting run");

        let success = plan.invoke(options.timeout).await;

        let undo_success = if success == Some(false) && options.undo_on_failure {
            warn!(%run_id, "run failed; walking compensations");
            plan.undo(options.timeout).await
        } else {
            None
        };

        self.coordinator
            .release(Scope::Orchestration, participants, &applicant)
            .await;
        info!(%run_id, success = ?success, "run finished; lock released");

        Ok(RunOutcome {
            run_id,
            success,
            undo_success,
            steps: plan.step_reports(),
        })
    }
}
