//! Remote (proxy) tasks.
//!
//! A remote task delegates execution to a peer: it ships the operation
//! reference and the flattened variable context, then either consumes an
//! inline result or parks on a completion signal keyed by the correlation id
//! until the peer calls back or the timeout elapses. A timed-out wait is
//! abandoned locally; the in-flight remote operation is not cancelled.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::outcome::{CompletedProcess, StepTimings};
use super::task::{
    record_finish, record_start, run_linked_undo, ExecutionRecorder, Operation, Task, TaskId,
    TaskKind, TaskPolicy,
};
use crate::context::VariableContext;
use crate::net::{
    CompletionRegistry, LaunchRequest, LaunchResponse, PeerExecClient, PeerHandle, RemoteCompletion,
};

pub struct RemoteTask {
    id: TaskId,
    operation: Operation,
    context: VariableContext,
    policy: TaskPolicy,
    undo: Option<Arc<dyn Task>>,
    peer: PeerHandle,
    client: Arc<dyn PeerExecClient>,
    completions: Arc<CompletionRegistry>,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
    result: RwLock<CompletedProcess>,
}

impl RemoteTask {
    pub fn new(
        id: TaskId,
        operation: Operation,
        context: VariableContext,
        peer: PeerHandle,
        client: Arc<dyn PeerExecClient>,
        completions: Arc<CompletionRegistry>,
    ) -> Self {
        Self {
            id,
            operation,
            context,
            policy: TaskPolicy::default(),
            undo: None,
            peer,
            client,
            completions,
            recorder: None,
            result: RwLock::new(CompletedProcess::default()),
        }
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_undo(mut self, undo: Arc<dyn Task>) -> Self {
        self.undo = Some(undo);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn context(&self) -> &VariableContext {
        &self.context
    }

    /// Fold a peer-reported completion into this task: merge produced
    /// variables, evaluate expectations if the peer left success unset.
    fn apply_completion(&self, completion: RemoteCompletion) -> CompletedProcess {
        self.context.merge(completion.variable_context_payload);
        let mut process = completion.result;
        if process.success.is_none() {
            match &self.operation.expected {
                Some(expected) if !expected.is_empty() => match expected.evaluate(&process) {
                    Ok(ok) => process.success = Some(ok),
                    Err(e) => {
                        process.success = Some(false);
                        process.stderr.push_str(&format!("post-process failed: {e}"));
                    }
                },
                _ => process.success = Some(process.return_code == Some(0)),
            }
        }
        process
    }

    async fn launch_and_wait(
        &self,
        timeout: Option<Duration>,
        timings: &mut StepTimings,
        resolved_input: &mut Value,
    ) -> CompletedProcess {
        // Pre-process: resolve the payload we ship to the peer.
        let phase = Instant::now();
        let resolved = match self.context.resolve_payload(&self.operation.payload) {
            Ok(v) => v,
            Err(e) => {
                timings.pre_process_ms = phase.elapsed().as_millis() as u64;
                return CompletedProcess::failure(format!("variable resolution failed: {e}"));
            }
        };
        *resolved_input = resolved.clone();
        timings.pre_process_ms = phase.elapsed().as_millis() as u64;

        let correlation_id = Uuid::new_v4().to_string();
        let request = LaunchRequest {
            operation_payload: Operation {
                name: self.operation.name.clone(),
                payload: resolved,
                expected: self.operation.expected.clone(),
            },
            variable_context_payload: self.context.flatten(),
            timeout: timeout.map(|t| t.as_millis() as u64),
            step_id: self.id.to_string(),
            correlation_id: correlation_id.clone(),
        };

        let phase = Instant::now();
        let receiver = self.completions.register(&correlation_id);
        let launched = self.client.launch_operation(&self.peer, request).await;

        let process = match launched {
            Err(e) => {
                self.completions.abandon(&correlation_id);
                CompletedProcess::failure(format!("peer launch failed: {e}"))
            }
            Ok(LaunchResponse::Inline(completion)) => {
                self.completions.abandon(&correlation_id);
                self.apply_completion(completion)
            }
            Ok(LaunchResponse::Accepted) => {
                debug!(task = %self.id, peer = %self.peer.node_id, %correlation_id, "peer accepted; waiting for callback");
                let completion = match timeout {
                    Some(t) => match tokio::time::timeout(t, receiver).await {
                        Ok(Ok(c)) => Ok(c),
                        Ok(Err(_)) => {
                            Err("completion signal dropped before a callback arrived".to_string())
                        }
                        Err(_) => {
                            warn!(task = %self.id, peer = %self.peer.node_id, %correlation_id, "peer callback timed out; abandoning local wait");
                            Err(format!(
                                "peer did not call back within {}ms; local wait abandoned",
                                t.as_millis()
                            ))
                        }
                    },
                    None => receiver
                        .await
                        .map_err(|_| "completion signal dropped before a callback arrived".to_string()),
                };
                match completion {
                    Ok(c) => self.apply_completion(c),
                    Err(diag) => {
                        self.completions.abandon(&correlation_id);
                        CompletedProcess::failure(diag)
                    }
                }
            }
        };
        timings.execution_ms = phase.elapsed().as_millis() as u64;
        process
    }
}

#[async_trait]
impl Task for RemoteTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Remote
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
        debug!(task = %self.id, peer = %self.peer.node_id, "invoking remote task");
        let started_at = Utc::now();
        let record_id = record_start(&self.recorder, &self.id, TaskKind::Remote).await;

        let mut timings = StepTimings::default();
        let mut resolved_input = Value::Null;
        let mut process = self
            .launch_and_wait(timeout, &mut timings, &mut resolved_input)
            .await;
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

        info!(task = %self.id, peer = %self.peer.node_id, success = ?success, "remote task finished");
        success
    }

    async fn undo(&self, timeout: Option<Duration>) -> Option<bool> {
        run_linked_undo(self, timeout).await
    }
}
