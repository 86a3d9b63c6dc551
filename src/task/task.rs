//! The task abstraction.
//!
//! A task is the unit of schedulable work: an opaque operation reference, a
//! layered variable context, policy flags and a result slot. Four variants
//! implement the same trait: local (in-process execution), remote (proxied to
//! a peer), undo (compensating leaf) and composite (wraps a dependency graph
//! of child tasks).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::warn;

use super::outcome::{CompletedProcess, ExpectedOutcome, StepTimings};
use crate::context::VariableContext;

/// Task identity: the (target node, step) pair an orchestration template
/// instantiates into a concrete task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub target: String,
    pub step: String,
}

impl TaskId {
    pub fn new<T: Into<String>, S: Into<String>>(target: T, step: S) -> Self {
        Self {
            target: target.into(),
            step: step.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Local,
    Remote,
    Undo,
    Composite,
}

/// Per-task policy overrides. `None` falls back to the owning run's default
/// (`stop_on_error`, `stop_undo_on_error`) or to `false` (`undo_on_error`)
/// when the task runs outside a composite.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPolicy {
    #[serde(default)]
    pub stop_on_error: Option<bool>,
    #[serde(default)]
    pub stop_undo_on_error: Option<bool>,
    #[serde(default)]
    pub undo_on_error: Option<bool>,
}

/// An opaque operation reference: named body plus expectations. What the
/// payload means (shell, HTTP, script) is the execution collaborator's
/// business.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub expected: Option<ExpectedOutcome>,
}

impl Operation {
    pub fn new<S: Into<String>>(name: S, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            expected: None,
        }
    }

    pub fn with_expected(mut self, expected: ExpectedOutcome) -> Self {
        self.expected = Some(expected);
        self
    }
}

/// Flattened per-step snapshot reported to callers after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: TaskId,
    pub kind: TaskKind,
    pub process: CompletedProcess,
}

/// The schedulable unit of work.
///
/// `invoke` never returns an error for business failures: anything that goes
/// wrong during pre-processing, variable resolution, execution or
/// post-processing is captured into the result slot (`success = Some(false)`,
/// diagnostic in stderr). `None` means the task was never actually invoked.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &TaskId;

    fn kind(&self) -> TaskKind;

    fn policy(&self) -> &TaskPolicy;

    /// Snapshot of the result slot.
    fn result(&self) -> CompletedProcess;

    /// The linked compensating task, if any.
    fn undo_task(&self) -> Option<Arc<dyn Task>>;

    async fn invoke(&self, timeout: Option<Duration>) -> Option<bool>;

    /// Run the linked compensating task. `None` when no undo task is linked,
    /// when this task never ran, or when the failure policy makes it
    /// ineligible; otherwise the undo task's own success.
    async fn undo(&self, timeout: Option<Duration>) -> Option<bool>;

    /// Collect per-step reports, recursing through composites.
    fn report_into(&self, out: &mut Vec<StepReport>) {
        out.push(StepReport {
            id: self.id().clone(),
            kind: self.kind(),
            process: self.result(),
        });
    }
}

/// Shared undo semantics for leaf variants: run the linked undo task iff this
/// task succeeded, or failed with `undo_on_error` in effect.
pub(crate) async fn run_linked_undo(task: &dyn Task, timeout: Option<Duration>) -> Option<bool> {
    let linked = task.undo_task()?;
    let undo_on_error = task.policy().undo_on_error.unwrap_or(false);
    let eligible = match task.result().success {
        Some(true) => true,
        Some(false) => undo_on_error,
        None => false,
    };
    if !eligible {
        return None;
    }
    linked.invoke(timeout).await
}

/// Executes operation bodies for local tasks. The collaborator owns whatever
/// sandboxing or interpretation the body requires and may leave `success`
/// unset for the task to evaluate via expected-output matching.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn execute(
        &self,
        operation: &Operation,
        context: &VariableContext,
        timeout: Option<Duration>,
    ) -> anyhow::Result<CompletedProcess>;
}

/// Evaluates opaque pre/post hook expressions against the variable context.
/// The expression language is the engine's choice; the engine is expected to
/// limit side effects to the context itself.
#[async_trait]
pub trait HookEngine: Send + Sync {
    async fn evaluate(&self, expression: &str, context: &VariableContext) -> anyhow::Result<()>;
}

/// Pre/post hooks attached to a task, evaluated around the operation body.
#[derive(Clone)]
pub struct TaskHooks {
    pub engine: Arc<dyn HookEngine>,
    pub pre: Option<String>,
    pub post: Option<String>,
}

/// Persists step execution records. The core calls this but owns none of the
/// persistence; recorder failures are logged, never propagated.
#[async_trait]
pub trait ExecutionRecorder: Send + Sync {
    async fn create_step_record(&self, id: &TaskId, kind: TaskKind) -> anyhow::Result<String>;

    async fn finish_step_record(
        &self,
        record_id: &str,
        process: &CompletedProcess,
        timings: &StepTimings,
        resolved_input: &Value,
    ) -> anyhow::Result<()>;
}

/// Report a step start, swallowing recorder failures.
pub(crate) async fn record_start(
    recorder: &Option<Arc<dyn ExecutionRecorder>>,
    id: &TaskId,
    kind: TaskKind,
) -> Option<String> {
    let recorder = recorder.as_ref()?;
    match recorder.create_step_record(id, kind).await {
        Ok(record_id) => Some(record_id),
        Err(e) => {
            warn!(task = %id, "failed to create step record: {e:#}");
            None
        }
    }
}

/// Report a step finish, swallowing recorder failures.
pub(crate) async fn record_finish(
    recorder: &Option<Arc<dyn ExecutionRecorder>>,
    record_id: Option<String>,
    id: &TaskId,
    process: &CompletedProcess,
    timings: &StepTimings,
    resolved_input: &Value,
) {
    let (Some(recorder), Some(record_id)) = (recorder.as_ref(), record_id) else {
        return;
    };
    if let Err(e) = recorder
        .finish_step_record(&record_id, process, timings, resolved_input)
        .await
    {
        warn!(task = %id, "failed to finish step record: {e:#}");
    }
}
