//! Composite tasks: a dependency graph of children plus the level-parallel
//! scheduler that walks it.
//!
//! Children at the same level run concurrently through the composite's
//! bounded executor; the next level starts only once the whole level has
//! joined. A failed child halts the walk after its level when the effective
//! stop-on-error policy (child override, else run default) says so. Undo
//! mirrors the walk from the deepest level back to the roots.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::executor::{RunConfig, TaskExecutor};
use super::outcome::CompletedProcess;
use super::task::{StepReport, Task, TaskId, TaskKind, TaskPolicy};
use crate::core::errors::Result;
use crate::graph::{Graph, GraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkAction {
    Invoke,
    Undo,
}

pub struct CompositeTask {
    id: TaskId,
    policy: TaskPolicy,
    graph: Graph<TaskId>,
    children: HashMap<TaskId, Arc<dyn Task>>,
    stop_on_error: bool,
    stop_undo_on_error: bool,
    executor: TaskExecutor,
    poll_interval: Duration,
    total_timeout: Option<Duration>,
    result: RwLock<CompletedProcess>,
}

/// Builder for composites. `build` fails fast on an unset
/// `stop_undo_on_error` and on a cyclic dependency graph, so neither ever
/// reaches the scheduler.
pub struct CompositeTaskBuilder {
    id: TaskId,
    policy: TaskPolicy,
    config: RunConfig,
    graph: Graph<TaskId>,
    children: HashMap<TaskId, Arc<dyn Task>>,
}

impl CompositeTaskBuilder {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            policy: TaskPolicy::default(),
            config: RunConfig::default(),
            graph: Graph::new(),
            children: HashMap::new(),
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        self.graph.add_node(task.id().clone());
        self.children.insert(task.id().clone(), task);
        self
    }

    /// Declare that `dependent` runs after `prerequisite`. Both tasks must
    /// already have been added.
    pub fn add_dependency(mut self, prerequisite: &TaskId, dependent: &TaskId) -> Result<Self> {
        for id in [prerequisite, dependent] {
            if !self.children.contains_key(id) {
                return Err(GraphError::NodeNotFound(id.to_string()).into());
            }
        }
        self.graph.add_edge(prerequisite.clone(), dependent.clone());
        Ok(self)
    }

    pub fn build(self) -> Result<CompositeTask> {
        self.config.validate()?;
        if self.graph.is_cyclic() {
            return Err(GraphError::CycleDetected.into());
        }
        let total_timeout = self.config.timeout_seconds.map(Duration::from_secs);
        Ok(CompositeTask {
            id: self.id,
            policy: self.policy,
            graph: self.graph,
            children: self.children,
            stop_on_error: self.config.stop_on_error,
            // validate() guarantees the field is set.
            stop_undo_on_error: self.config.stop_undo_on_error.unwrap_or(false),
            executor: TaskExecutor::new(self.config.max_parallel),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            total_timeout,
            result: RwLock::new(CompletedProcess::default()),
        })
    }
}

impl CompositeTask {
    pub fn builder(id: TaskId) -> CompositeTaskBuilder {
        CompositeTaskBuilder::new(id)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Child lookup, mostly for inspecting results after a run.
    pub fn child(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.children.get(id)
    }

    /// Per-step result snapshots in graph insertion order, recursing through
    /// nested composites.
    pub fn step_reports(&self) -> Vec<StepReport> {
        let mut out = Vec::new();
        self.report_into(&mut out);
        out
    }

    fn group_levels(&self) -> std::result::Result<Vec<Vec<TaskId>>, GraphError> {
        let levels = self.graph.levels()?;
        let depth = levels.values().copied().max().unwrap_or(0);
        let mut grouped: Vec<Vec<TaskId>> = vec![Vec::new(); depth];
        for id in self.graph.nodes() {
            if let Some(&l) = levels.get(id) {
                grouped[l - 1].push(id.clone());
            }
        }
        Ok(grouped)
    }

    async fn run_one(task: Arc<dyn Task>, action: WalkAction, timeout: Option<Duration>) -> Option<bool> {
        let outcome = match action {
            WalkAction::Invoke => AssertUnwindSafe(task.invoke(timeout)).catch_unwind().await,
            WalkAction::Undo => AssertUnwindSafe(task.undo(timeout)).catch_unwind().await,
        };
        match outcome {
            Ok(res) => res,
            Err(_) => {
                error!(task = %task.id(), "task panicked; treating as a failed invoke");
                Some(false)
            }
        }
    }

    /// Run one multi-node level through the bounded pool, polling so the
    /// run-wide budget stays enforced. Returns the collected outcomes and
    /// whether the budget ran out while tasks were still in flight.
    async fn run_level_pooled(
        &self,
        ids: &[TaskId],
        action: WalkAction,
        remaining: Option<Duration>,
        started: Instant,
        total: Option<Duration>,
    ) -> (Vec<(TaskId, Option<bool>)>, bool) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut submitted = 0usize;
        for id in ids {
            let Some(task) = self.children.get(id).cloned() else {
                error!(task = %id, "graph node has no registered task");
                continue;
            };
            let tx = tx.clone();
            let id = id.clone();
            self.executor.spawn_bounded(async move {
                let res = Self::run_one(task, action, remaining).await;
                let _ = tx.send((id, res));
            });
            submitted += 1;
        }
        drop(tx);

        let mut collected = Vec::with_capacity(submitted);
        let mut abandoned = false;
        while collected.len() < submitted {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(pair) => collected.push(pair),
                    None => break,
                },
                _ = sleep(self.poll_interval) => {
                    if let Some(total) = total {
                        if started.elapsed() >= total {
                            warn!(
                                composite = %self.id,
                                outstanding = submitted - collected.len(),
                                "run timeout budget exhausted; abandoning in-flight tasks"
                            );
                            abandoned = true;
                            break;
                        }
                    }
                }
            }
        }
        (collected, abandoned)
    }

    async fn walk(
        &self,
        levels: Vec<Vec<TaskId>>,
        action: WalkAction,
        timeout: Option<Duration>,
    ) -> Option<bool> {
        let started = Instant::now();
        let mut any_ran = false;
        let mut all_ok = true;

        for (i, ids) in levels.iter().enumerate() {
            if ids.is_empty() {
                continue;
            }
            let remaining = match timeout {
                None => None,
                Some(total) => match total.checked_sub(started.elapsed()) {
                    Some(r) if !r.is_zero() => Some(r),
                    _ => {
                        warn!(
                            composite = %self.id,
                            level = i + 1,
                            "run timeout budget exhausted; not submitting further levels"
                        );
                        break;
                    }
                },
            };

            debug!(composite = %self.id, level = i + 1, tasks = ids.len(), action = ?action, "walking level");

            let (collected, abandoned) = if ids.len() == 1 {
                let id = &ids[0];
                match self.children.get(id).cloned() {
                    Some(task) => {
                        let res = Self::run_one(task, action, remaining).await;
                        (vec![(id.clone(), res)], false)
                    }
                    None => {
                        error!(task = %id, "graph node has no registered task");
                        (Vec::new(), false)
                    }
                }
            } else {
                self.run_level_pooled(ids, action, remaining, started, timeout)
                    .await
            };

            // The halt decision happens only after the whole level joined;
            // nothing is interrupted mid-flight.
            let mut halt = false;
            for (id, res) in &collected {
                if res.is_some() {
                    any_ran = true;
                }
                if *res == Some(false) {
                    all_ok = false;
                    let child_policy = self
                        .children
                        .get(id)
                        .map(|t| t.policy().clone())
                        .unwrap_or_default();
                    let stop = match action {
                        WalkAction::Invoke => {
                            child_policy.stop_on_error.unwrap_or(self.stop_on_error)
                        }
                        WalkAction::Undo => child_policy
                            .stop_undo_on_error
                            .unwrap_or(self.stop_undo_on_error),
                    };
                    if stop {
                        info!(composite = %self.id, task = %id, action = ?action, "failure with stop policy in effect; halting walk");
                        halt = true;
                    }
                }
            }

            if halt || abandoned {
                break;
            }
        }

        if any_ran {
            Some(all_ok)
        } else {
            None
        }
    }
}

#[async_trait]
impl Task for CompositeTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Composite
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
        None
    }

    async fn invoke(&self, timeout: Option<Duration>) -> Option<bool> {
        let started_at = Utc::now();
        let levels = match self.group_levels() {
            Ok(levels) => levels,
            Err(e) => {
                // The builder rejects cycles, so this is unreachable through
                // the public surface; fail the run rather than panic.
                error!(composite = %self.id, "level computation failed: {e}");
                let process = CompletedProcess::failure(format!("level computation failed: {e}"));
                *self.result.write().unwrap_or_else(|p| p.into_inner()) = process;
                return Some(false);
            }
        };

        let timeout = timeout.or(self.total_timeout);
        let overall = self.walk(levels, WalkAction::Invoke, timeout).await;

        let mut process = CompletedProcess {
            success: overall,
            ..Default::default()
        };
        process.start_time = Some(started_at);
        process.end_time = Some(Utc::now());
        *self.result.write().unwrap_or_else(|p| p.into_inner()) = process;

        info!(composite = %self.id, success = ?overall, "composite finished");
        overall
    }

    async fn undo(&self, timeout: Option<Duration>) -> Option<bool> {
        let levels = match self.group_levels() {
            Ok(mut levels) => {
                levels.reverse();
                levels
            }
            Err(e) => {
                error!(composite = %self.id, "level computation failed: {e}");
                return Some(false);
            }
        };

        let timeout = timeout.or(self.total_timeout);
        let overall = self.walk(levels, WalkAction::Undo, timeout).await;
        info!(composite = %self.id, success = ?overall, "composite undo finished");
        overall
    }

    fn report_into(&self, out: &mut Vec<StepReport>) {
        for id in self.graph.nodes() {
            if let Some(child) = self.children.get(id) {
                child.report_into(out);
            }
        }
    }
}
