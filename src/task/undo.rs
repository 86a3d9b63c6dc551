//! Compensating leaf tasks.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;

use super::local::LocalTask;
use super::outcome::CompletedProcess;
use super::task::{
    ExecutionRecorder, Operation, OperationRunner, Task, TaskHooks, TaskId, TaskKind, TaskPolicy,
};
use crate::context::VariableContext;

/// A terminal compensating task. Runs only as a rollback step; its own
/// `undo` is a no-op reporting success, since there is nothing further to
/// compensate behind it.
pub struct UndoTask {
    inner: LocalTask,
}

impl UndoTask {
    pub fn new(
        id: TaskId,
        operation: Operation,
        context: VariableContext,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        Self {
            inner: LocalTask::compensating(id, operation, context, runner),
        }
    }

    pub fn with_hooks(mut self, hooks: TaskHooks) -> Self {
        self.inner = self.inner.with_hooks(hooks);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.inner = self.inner.with_recorder(recorder);
        self
    }
}

#[async_trait]
impl Task for UndoTask {
    fn id(&self) -> &TaskId {
        self.inner.id()
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Undo
    }

    fn policy(&self) -> &TaskPolicy {
        self.inner.policy()
    }

    fn result(&self) -> CompletedProcess {
        self.inner.result()
    }

    fn undo_task(&self) -> Option<Arc<dyn Task>> {
        None
    }

    async fn invoke(&self, timeout: Option<Duration>) -> Option<bool> {
        self.inner.invoke(timeout).await
    }

    async fn undo(&self, _timeout: Option<Duration>) -> Option<bool> {
        Some(true)
    }
}
