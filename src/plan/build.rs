//! Template instantiation.
//!
//! Expands an orchestration template against a resolved role-to-host mapping
//! into a composite task tree: one task per (step, target host), remote
//! proxies for hosts other than the local node, undo leaves wired per step,
//! and a dependency edge between every pair of tasks whose steps depend on
//! each other. Every task gets its own forked variable layer so same-level
//! execution never races on writes.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::template::{OrchestrationTemplate, StepTemplate};
use crate::context::VariableContext;
use crate::core::errors::{ConvoyError, Result};
use crate::net::{CompletionRegistry, PeerExecClient, PeerHandle};
use crate::task::{
    CompositeTask, ExecutionRecorder, HookEngine, LocalTask, Operation, OperationRunner,
    RemoteTask, RunConfig, Task, TaskHooks, TaskId, TaskPolicy, UndoTask,
};

/// Resolved fleet membership for one run: the local node's identity plus the
/// hosts behind each target role.
#[derive(Debug, Clone, Default)]
pub struct HostMap {
    local_node_id: String,
    roles: HashMap<String, Vec<PeerHandle>>,
}

impl HostMap {
    pub fn new<S: Into<String>>(local_node_id: S) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            roles: HashMap::new(),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn with_role<S: Into<String>>(mut self, role: S, hosts: Vec<PeerHandle>) -> Self {
        self.roles.insert(role.into(), hosts);
        self
    }

    fn resolve(&self, role: &str) -> Result<&[PeerHandle]> {
        self.roles
            .get(role)
            .map(Vec::as_slice)
            .ok_or_else(|| ConvoyError::validation_field("unknown target role", role))
    }

    /// Distinct hosts across the given roles, first-seen order preserved.
    fn resolve_many(&self, roles: &[String]) -> Result<Vec<&PeerHandle>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for role in roles {
            for host in self.resolve(role)? {
                if seen.insert(&host.node_id) {
                    out.push(host);
                }
            }
        }
        Ok(out)
    }

    /// Every distinct host in the mapping, sorted by node id. This is the
    /// participant set a run's lock handshake covers.
    pub fn participants(&self) -> Vec<PeerHandle> {
        let mut by_id: HashMap<&str, &PeerHandle> = HashMap::new();
        for hosts in self.roles.values() {
            for host in hosts {
                by_id.entry(&host.node_id).or_insert(host);
            }
        }
        let mut out: Vec<PeerHandle> = by_id.into_values().cloned().collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }
}

/// Builds composite task trees out of templates.
pub struct PlanAssembler {
    runner: Arc<dyn OperationRunner>,
    client: Arc<dyn PeerExecClient>,
    completions: Arc<CompletionRegistry>,
    recorder: Option<Arc<dyn ExecutionRecorder>>,
    hook_engine: Option<Arc<dyn HookEngine>>,
}

impl PlanAssembler {
    pub fn new(
        runner: Arc<dyn OperationRunner>,
        client: Arc<dyn PeerExecClient>,
        completions: Arc<CompletionRegistry>,
    ) -> Self {
        Self {
            runner,
            client,
            completions,
            recorder: None,
            hook_engine: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_hook_engine(mut self, engine: Arc<dyn HookEngine>) -> Self {
        self.hook_engine = Some(engine);
        self
    }

    /// Instantiate `template` against `hosts`, layering `initials` over the
    /// template defaults in every task's context.
    pub fn instantiate(
        &self,
        template: &OrchestrationTemplate,
        hosts: &HostMap,
        initials: HashMap<String, serde_json::Value>,
    ) -> Result<CompositeTask> {
        template.validate()?;
        let config = template.config.clone().unwrap_or_default();

        let root_context = VariableContext::builder()
            .initials(initials)
            .defaults(template.defaults.clone())
            .build();

        let mut builder = CompositeTask::builder(TaskId::new(
            hosts.local_node_id().to_string(),
            template.name.clone(),
        ))
        .config(config.clone());

        let mut tasks_by_step: HashMap<&str, Vec<TaskId>> = HashMap::new();
        for step in &template.steps {
            let resolved = hosts.resolve_many(&step.targets)?;
            if resolved.is_empty() {
                return Err(ConvoyError::validation_field(
                    "step's target roles resolve to no hosts",
                    step.id.clone(),
                ));
            }
            for host in resolved {
                let task = self.build_task(step, host, hosts, &root_context, &config);
                tasks_by_step
                    .entry(step.id.as_str())
                    .or_default()
                    .push(task.id().clone());
                builder = builder.add_task(task);
            }
        }

        for step in &template.steps {
            let dependents = &tasks_by_step[step.id.as_str()];
            for dep in &step.dependencies {
                let prerequisites = &tasks_by_step[dep.as_str()];
                for u in prerequisites {
                    for v in dependents {
                        builder = builder.add_dependency(u, v)?;
                    }
                }
            }
        }

        debug!(
            template = %template.name,
            tasks = tasks_by_step.values().map(Vec::len).sum::<usize>(),
            "instantiated orchestration template"
        );
        builder.build()
    }

    fn task_context(&self, root: &VariableContext, host: &PeerHandle) -> VariableContext {
        let context = root.fork();
        context.set("target_node", json!(host.node_id));
        context
    }

    fn build_task(
        &self,
        step: &StepTemplate,
        host: &PeerHandle,
        hosts: &HostMap,
        root_context: &VariableContext,
        config: &RunConfig,
    ) -> Arc<dyn Task> {
        let id = TaskId::new(host.node_id.clone(), step.id.clone());
        let policy = TaskPolicy {
            stop_on_error: step.policy.stop_on_error,
            stop_undo_on_error: step.policy.stop_undo_on_error,
            // Resolved here so the leaf's undo eligibility check needs no
            // knowledge of the owning run.
            undo_on_error: step.policy.undo_on_error.or(Some(config.undo_on_error)),
        };
        let local = host.node_id == hosts.local_node_id();

        let undo_task = step.undo.as_ref().map(|operation| {
            self.build_undo_leaf(step, operation.clone(), host, root_context, local)
        });

        if local {
            let mut task = LocalTask::new(
                id,
                step.operation.clone(),
                self.task_context(root_context, host),
                self.runner.clone(),
            )
            .with_policy(policy);
            if let Some(undo) = undo_task {
                task = task.with_undo(undo);
            }
            if let Some(hooks) = self.step_hooks(step) {
                task = task.with_hooks(hooks);
            }
            if let Some(recorder) = &self.recorder {
                task = task.with_recorder(recorder.clone());
            }
            Arc::new(task)
        } else {
            let mut task = RemoteTask::new(
                id,
                step.operation.clone(),
                self.task_context(root_context, host),
                host.clone(),
                self.client.clone(),
                self.completions.clone(),
            )
            .with_policy(policy);
            if let Some(undo) = undo_task {
                task = task.with_undo(undo);
            }
            if let Some(recorder) = &self.recorder {
                task = task.with_recorder(recorder.clone());
            }
            Arc::new(task)
        }
    }

    /// The compensating leaf: local hosts get an undo task, remote hosts get
    /// a proxy so the compensation runs where the step ran.
    fn build_undo_leaf(
        &self,
        step: &StepTemplate,
        operation: Operation,
        host: &PeerHandle,
        root_context: &VariableContext,
        local: bool,
    ) -> Arc<dyn Task> {
        let id = TaskId::new(host.node_id.clone(), format!("{}.undo", step.id));
        if local {
            let mut task = UndoTask::new(
                id,
                operation,
                self.task_context(root_context, host),
                self.runner.clone(),
            );
            if let Some(recorder) = &self.recorder {
                task = task.with_recorder(recorder.clone());
            }
            Arc::new(task)
        } else {
            let mut task = RemoteTask::new(
                id,
                operation,
                self.task_context(root_context, host),
                host.clone(),
                self.client.clone(),
                self.completions.clone(),
            );
            if let Some(recorder) = &self.recorder {
                task = task.with_recorder(recorder.clone());
            }
            Arc::new(task)
        }
    }

    fn step_hooks(&self, step: &StepTemplate) -> Option<TaskHooks> {
        let engine = self.hook_engine.as_ref()?;
        if step.pre_hook.is_none() && step.post_hook.is_none() {
            return None;
        }
        Some(TaskHooks {
            engine: engine.clone(),
            pre: step.pre_hook.clone(),
            post: step.post_hook.clone(),
        })
    }
}
