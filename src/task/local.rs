//! In-process task execution.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use super::outcome::{CompletedProcess, StepTimings};
use super::task::{
    record_finish, record_start, run_linked_undo, ExecutionRecorder, Operation, OperationRunner,
    Task, TaskHooks, TaskId, TaskKind, TaskPolicy,
};
use crate::context::VariableContext;

/// A task whose operation body runs in-process through the configured
/// [`OperationRunner`] collaborator.
pub struct LocalTask {
    id: TaskId,
    kind: TaskKind,
    operation: Operation,
    context: VariableContext,
    policy: TaskPolicy,
    undo: Option<Arc<dyn Task>>,
    runner: Arc<dyn OperationRunner>,
    hooks: Option<TaskHooks>,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
    result: RwLock<CompletedProcess>,
}

impl LocalTask {
    pub fn new(
        id: TaskId,
        operation: Operation,
        context: VariableContext,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        Self {
            id,
            kind: TaskKind::Local,
            operation,
            context,
            policy: TaskPolicy::default(),
            undo: None,
            runner,
            hooks: None,
            recorder: None,
            result: RwLock::new(CompletedProcess::default()),
        }
    }

    /// Same body, but recorded and scheduled as a compensating leaf.
    pub(crate) fn compensating(
        id: TaskId,
        operation: Operation,
        context: VariableContext,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        let mut task = Self::new(id, operation, context, runner);
        task.kind = TaskKind::Undo;
        task
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_undo(mut self, undo: Arc<dyn Task>) -> Self {
        self.undo = Some(undo);
        self
    }

    pub fn with_hooks(mut self, hooks: TaskHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn context(&self) -> &VariableContext {
        &self.context
    }

    async fn run_pipeline(&self, timeout: Option<Duration>) -> (CompletedProcess, StepTimings, Value) {
        let mut timings = StepTimings::default();
        let mut resolved_input = Value::Null;

        // Pre-process: pre hook, then input resolution.
        let phase = Instant::now();
        let pre: Result<Value, String> = async {
            if let Some(hooks) = &self.hooks {
                if let Some(expr) = &hooks.pre {
                    hooks
                        .engine
                        .evaluate(expr, &self.context)
                        .await
                        .map_err(|e| format!("pre-process hook failed: {e:#}"))?;
                }
            }
            self.context
                .resolve_payload(&self.operation.payload)
                .map_err(|e| format!("variable resolution failed: {e}"))
        }
        .await;
        timings.pre_process_ms = phase.elapsed().as_millis() as u64;

        let resolved = match pre {
            Ok(v) => v,
            Err(diag) => return (CompletedProcess::failure(diag), timings, resolved_input),
        };
        resolved_input = resolved.clone();

        // Execution through the collaborator, capped by the caller's budget.
        let phase = Instant::now();
        let op = Operation {
            name: self.operation.name.clone(),
            payload: resolved,
            expected: self.operation.expected.clone(),
        };
        let executed: Result<CompletedProcess, String> = match timeout {
            Some(t) => match tokio::time::timeout(t, self.runner.execute(&op, &self.context, timeout)).await
            {
                Ok(res) => res.map_err(|e| format!("execution failed: {e:#}")),
                Err(_) => Err(format!("execution timed out after {}ms", t.as_millis())),
            },
            None => self
                .runner
                .execute(&op, &self.context, None)
                .await
                .map_err(|e| format!("execution failed: {e:#}")),
        };
        timings.execution_ms = phase.elapsed().as_millis() as u64;

        let mut process = match executed {
            Ok(p) => p,
            Err(diag) => return (CompletedProcess::failure(diag), timings, resolved_input),
        };

        // Post-process: expected-output evaluation, then post hook.
        let phase = Instant::now();
        let mut post_diag: Option<String> = None;
        if process.success.is_none() {
            match &self.operation.expected {
                Some(expected) if !expected.is_empty() => match expected.evaluate(&process) {
                    Ok(ok) => process.success = Some(ok),
                    Err(e) => post_diag = Some(format!("post-process failed: {e}")),
                },
                _ => process.success = Some(process.return_code == Some(0)),
            }
        }
        if post_diag.is_none() {
            if let Some(hooks) = &self.hooks {
                if let Some(expr) = &hooks.post {
                    if let Err(e) = hooks.engine.evaluate(expr, &self.context).await {
                        post_diag = Some(format!("post-process hook failed: {e:#}"));
                    }
                }
            }
        }
        timings.post_process_ms = phase.elapsed().as_millis() as u64;

        if let Some(diag) = post_diag {
            process.success = Some(false);
            if !process.stderr.is_empty() {
                process.stderr.push('\n');
            }
            process.stderr.push_str(&diag);
        }

        (process, timings, resolved_input)
    }
}

#[async_trait]
impl Task for LocalTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    fn result(&self) -> CompletedProcess {
        self.result
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn undo_task(&self) -> Option<Arc<dyn Task>> {
        self.undo.clone()
    }

    async fn invoke(&self, timeout: Option<Duration>) -> Option<bool> {
        debug!(task = %self.id, operation = %self.operation.name, "invoking local task");
        let started_at = Utc::now();
        let record_id = record_start(&self.recorder, &self.id, self.kind).await;

        let (mut process, timings, resolved_input) = self.run_pipeline(timeout).await;
        process.start_time = Some(started_at);
        process.end_time = Some(Utc::now());
        let success = process.success;

        *self.result.write().unwrap_or_else(|e| e.into_inner()) = process.clone();
        record_finish(
            &self.recorder,
            record_id,
            &self.id,
            &process,
            &timings,
            &resolved_input,
        )
        .await;

        info!(task = %self.id, success = ?success, "local task finished");
        success
    }

    async fn undo(&self, timeout: Option<Duration>) -> Option<bool> {
        run_linked_undo(self, timeout).await
    }
}
