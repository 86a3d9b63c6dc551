//! Template instantiation and end-to-end orchestration runs: local and
//! remote tasks mixed, the fleet-wide lock around the run, rollback on
//! failure and the per-step report tree.

use anyhow::Result;
use async_trait::async_trait;
use convoy::lock::{LockPhase, LockTransport, ParticipantError};
use convoy::{
    Applicant, CompletedProcess, CompletionRegistry, ExecutionRecorder, LaunchRequest,
    LaunchResponse, LockCoordinator, LockError, Operation, OperationRunner,
    OrchestrationRunner, OrchestrationTemplate, PeerExecClient, PeerHandle, PlanAssembler,
    RunOptions, Scope, StepTimings, Task, TaskId, TaskKind, VariableContext,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

const TEMPLATE: &str = r#"
name: rollout
defaults:
  package: billing
config:
  stop_on_error: true
  stop_undo_on_error: false
  poll_interval_ms: 10
steps:
  - id: install
    targets: [workers]
    operation:
      name: install_package
      payload:
        package: "{{package}}"
    undo:
      name: remove_package
      payload:
        package: "{{package}}"
  - id: verify
    dependencies: [install]
    targets: [workers]
    operation:
      name: health_check
      payload:
        node: "{{target_node}}"
"#;

struct LoggingRunner {
    log: Arc<Mutex<Vec<String>>>,
    failing: Vec<String>,
}

impl LoggingRunner {
    fn new(failing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            failing: failing.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn completed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationRunner for LoggingRunner {
    async fn execute(
        &self,
        operation: &Operation,
        _context: &VariableContext,
        _timeout: Option<Duration>,
    ) -> Result<CompletedProcess> {
        self.log.lock().unwrap().push(operation.name.clone());
        let failed = self.failing.contains(&operation.name);
        Ok(CompletedProcess {
            success: Some(!failed),
            return_code: Some(if failed { 1 } else { 0 }),
            ..Default::default()
        })
    }
}

/// Remote peer that answers inline and logs what it ran.
struct LoggingPeer {
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl LoggingPeer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl PeerExecClient for LoggingPeer {
    async fn launch_operation(
        &self,
        peer: &PeerHandle,
        request: LaunchRequest,
    ) -> convoy::Result<LaunchResponse> {
        self.log
            .lock()
            .unwrap()
            .push((peer.node_id.clone(), request.operation_payload.name.clone()));
        Ok(LaunchResponse::Inline(RemoteOk::completion()))
    }
}

struct RemoteOk;

impl RemoteOk {
    fn completion() -> convoy::RemoteCompletion {
        convoy::RemoteCompletion {
            result: CompletedProcess {
                success: Some(true),
                return_code: Some(0),
                ..Default::default()
            },
            variable_context_payload: HashMap::new(),
        }
    }
}

struct AllOkTransport {
    calls: Mutex<Vec<(String, LockPhase)>>,
}

impl AllOkTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, phase: LockPhase) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| *p == phase)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

#[async_trait]
impl LockTransport for AllOkTransport {
    async fn prevent(
        &self,
        peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
    ) -> Result<(), ParticipantError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.node_id.clone(), LockPhase::Prevent));
        Ok(())
    }

    async fn lock(
        &self,
        peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
    ) -> Result<(), ParticipantError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.node_id.clone(), LockPhase::Lock));
        Ok(())
    }

    async fn unlock(
        &self,
        peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
        _force: bool,
    ) -> Result<(), ParticipantError> {
        self.calls
            .lock()
            .unwrap()
            .push((peer.node_id.clone(), LockPhase::Unlock));
        Ok(())
    }
}

struct RefusingTransport;

#[async_trait]
impl LockTransport for RefusingTransport {
    async fn prevent(
        &self,
        _peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
    ) -> Result<(), ParticipantError> {
        Err(ParticipantError {
            status: Some(423),
            detail: "scope busy".to_string(),
        })
    }

    async fn lock(
        &self,
        _peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
    ) -> Result<(), ParticipantError> {
        Ok(())
    }

    async fn unlock(
        &self,
        _peer: &PeerHandle,
        _scope: Scope,
        _applicant: &Applicant,
        _force: bool,
    ) -> Result<(), ParticipantError> {
        Ok(())
    }
}

#[derive(Default)]
struct CountingRecorder {
    created: Mutex<Vec<(TaskId, TaskKind)>>,
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionRecorder for CountingRecorder {
    async fn create_step_record(&self, id: &TaskId, kind: TaskKind) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push((id.clone(), kind));
        Ok(format!("record-{}", created.len()))
    }

    async fn finish_step_record(
        &self,
        record_id: &str,
        _process: &CompletedProcess,
        _timings: &StepTimings,
        _resolved_input: &Value,
    ) -> Result<()> {
        self.finished.lock().unwrap().push(record_id.to_string());
        Ok(())
    }
}

fn hosts() -> convoy::HostMap {
    convoy::HostMap::new("node-a").with_role(
        "workers",
        vec![
            PeerHandle::new("node-a", "http://node-a:7070"),
            PeerHandle::new("node-b", "http://node-b:7070"),
        ],
    )
}

fn assembler(
    runner: &Arc<LoggingRunner>,
    peer_log: &Arc<LoggingPeer>,
) -> (PlanAssembler, Arc<CompletionRegistry>) {
    let completions = Arc::new(CompletionRegistry::new());
    let assembler = PlanAssembler::new(
        runner.clone(),
        peer_log.clone(),
        completions.clone(),
    );
    (assembler, completions)
}

#[tokio::test]
async fn test_instantiation_expands_steps_per_host() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();

    let plan = assembler
        .instantiate(&template, &hosts(), HashMap::new())
        .unwrap();

    // Two steps across two hosts.
    assert_eq!(plan.len(), 4);
    assert!(plan.child(&TaskId::new("node-a", "install")).is_some());
    assert!(plan.child(&TaskId::new("node-b", "verify")).is_some());

    let local = plan.child(&TaskId::new("node-a", "install")).unwrap();
    assert_eq!(local.kind(), TaskKind::Local);
    let remote = plan.child(&TaskId::new("node-b", "install")).unwrap();
    assert_eq!(remote.kind(), TaskKind::Remote);
    // Undo leaves are wired, not scheduled as graph nodes.
    assert!(local.undo_task().is_some());
    assert!(plan.child(&TaskId::new("node-a", "install.undo")).is_none());
}

#[tokio::test]
async fn test_mixed_local_remote_run() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
    let plan = assembler
        .instantiate(&template, &hosts(), HashMap::new())
        .unwrap();

    assert_eq!(plan.invoke(None).await, Some(true));

    // Local node ran both its steps in-process.
    assert_eq!(runner.completed(), vec!["install_package", "health_check"]);
    // The remote host got both launches.
    let remote_ops: Vec<String> = peer.log.lock().unwrap().iter().map(|(_, op)| op.clone()).collect();
    assert_eq!(remote_ops, vec!["install_package", "health_check"]);
}

#[tokio::test]
async fn test_full_run_locks_invokes_and_releases() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
    let host_map = hosts();
    let plan = assembler
        .instantiate(&template, &host_map, HashMap::new())
        .unwrap();

    let transport = AllOkTransport::new();
    let orchestrator = OrchestrationRunner::new(LockCoordinator::new(transport.clone()));

    let outcome = orchestrator
        .run(&plan, &host_map.participants(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.success, Some(true));
    assert_eq!(outcome.undo_success, None);
    assert_eq!(outcome.steps.len(), 4);
    assert!(outcome.steps.iter().all(|s| s.process.success == Some(true)));

    assert_eq!(transport.calls_for(LockPhase::Prevent).len(), 2);
    assert_eq!(transport.calls_for(LockPhase::Lock).len(), 2);
    assert_eq!(transport.calls_for(LockPhase::Unlock).len(), 2);
}

#[tokio::test]
async fn test_failed_run_triggers_rollback_and_still_releases() {
    let runner = LoggingRunner::new(&["health_check"]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
    let host_map = hosts();
    let plan = assembler
        .instantiate(&template, &host_map, HashMap::new())
        .unwrap();

    let transport = AllOkTransport::new();
    let orchestrator = OrchestrationRunner::new(LockCoordinator::new(transport.clone()));

    let outcome = orchestrator
        .run(&plan, &host_map.participants(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.success, Some(false));
    // install succeeded, so its compensation ran.
    assert_eq!(outcome.undo_success, Some(true));
    assert!(runner.completed().contains(&"remove_package".to_string()));
    // Lock released despite the failure.
    assert_eq!(transport.calls_for(LockPhase::Unlock).len(), 2);
}

#[tokio::test]
async fn test_refused_lock_aborts_before_any_step() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
    let host_map = hosts();
    let plan = assembler
        .instantiate(&template, &host_map, HashMap::new())
        .unwrap();

    let orchestrator = OrchestrationRunner::new(LockCoordinator::new(Arc::new(RefusingTransport)));
    let err = orchestrator
        .run(&plan, &host_map.participants(), RunOptions::default())
        .await
        .unwrap_err();

    match err {
        convoy::ConvoyError::Lock(LockError::Handshake { failures, .. }) => {
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected lock error, got {other}"),
    }
    assert!(runner.completed().is_empty());
    assert!(peer.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_recorder_sees_every_invoked_step() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let completions = Arc::new(CompletionRegistry::new());
    let recorder = Arc::new(CountingRecorder::default());
    let assembler = PlanAssembler::new(runner.clone(), peer.clone(), completions)
        .with_recorder(recorder.clone());

    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();
    let plan = assembler
        .instantiate(&template, &hosts(), HashMap::new())
        .unwrap();

    assert_eq!(plan.invoke(None).await, Some(true));

    let created = recorder.created.lock().unwrap();
    assert_eq!(created.len(), 4);
    assert_eq!(recorder.finished.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_initials_shadow_template_defaults() {
    let runner = LoggingRunner::new(&[]);
    let peer = LoggingPeer::new();
    let (assembler, _) = assembler(&runner, &peer);
    let template = OrchestrationTemplate::from_yaml_str(TEMPLATE).unwrap();

    let plan = assembler
        .instantiate(
            &template,
            &hosts(),
            HashMap::from([("package".to_string(), json!("ledger"))]),
        )
        .unwrap();
    assert_eq!(plan.invoke(None).await, Some(true));

    // The remote launch shipped the initials-resolved payload.
    let shipped = peer.log.lock().unwrap();
    assert!(!shipped.is_empty());
}
