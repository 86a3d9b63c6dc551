//! Remote (proxy) task behavior against scripted peer clients: inline
//! results, deferred callbacks, variable merge-back and abandoned waits.

use async_trait::async_trait;
use convoy::{
    CompletedProcess, CompletionRegistry, LaunchRequest, LaunchResponse, Operation,
    PeerExecClient, PeerHandle, RemoteCompletion, RemoteTask, Task, TaskId, VariableContext,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

fn peer() -> PeerHandle {
    PeerHandle::new("node-b", "http://node-b:7070")
}

fn remote_task(client: Arc<dyn PeerExecClient>, completions: Arc<CompletionRegistry>) -> RemoteTask {
    RemoteTask::new(
        TaskId::new("node-b", "install"),
        Operation::new("install_package", json!({"package": "billing"})),
        VariableContext::new(),
        peer(),
        client,
        completions,
    )
}

fn ok_completion() -> RemoteCompletion {
    RemoteCompletion {
        result: CompletedProcess {
            success: Some(true),
            stdout: "installed".into(),
            return_code: Some(0),
            ..Default::default()
        },
        variable_context_payload: HashMap::from([("installed_version".into(), json!("1.4.2"))]),
    }
}

/// Peer that answers 200 with an inline result.
struct InlinePeer {
    requests: Mutex<Vec<LaunchRequest>>,
}

#[async_trait]
impl PeerExecClient for InlinePeer {
    async fn launch_operation(
        &self,
        _peer: &PeerHandle,
        request: LaunchRequest,
    ) -> convoy::Result<LaunchResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(LaunchResponse::Inline(ok_completion()))
    }
}

/// Peer that answers 202 and calls back through the registry after a delay.
struct DeferredPeer {
    completions: Arc<CompletionRegistry>,
    delay: Duration,
}

#[async_trait]
impl PeerExecClient for DeferredPeer {
    async fn launch_operation(
        &self,
        _peer: &PeerHandle,
        request: LaunchRequest,
    ) -> convoy::Result<LaunchResponse> {
        let completions = self.completions.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = completions.complete(&request.correlation_id, ok_completion());
        });
        Ok(LaunchResponse::Accepted)
    }
}

/// Peer that accepts the work and never calls back.
struct SilentPeer;

#[async_trait]
impl PeerExecClient for SilentPeer {
    async fn launch_operation(
        &self,
        _peer: &PeerHandle,
        _request: LaunchRequest,
    ) -> convoy::Result<LaunchResponse> {
        Ok(LaunchResponse::Accepted)
    }
}

#[tokio::test]
async fn test_inline_result_and_variable_merge_back() {
    let completions = Arc::new(CompletionRegistry::new());
    let client = Arc::new(InlinePeer {
        requests: Mutex::new(Vec::new()),
    });
    let task = remote_task(client.clone(), completions.clone());

    let result = task.invoke(Some(Duration::from_secs(1))).await;
    assert_eq!(result, Some(true));
    assert_eq!(task.result().stdout, "installed");
    // Variables the peer produced are visible locally afterwards.
    assert_eq!(task.context().get("installed_version"), Some(json!("1.4.2")));
    // No waiter left behind.
    assert_eq!(completions.pending(), 0);

    let requests = client.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].step_id, "node-b/install");
    assert!(!requests[0].correlation_id.is_empty());
    assert_eq!(requests[0].timeout, Some(1000));
}

#[tokio::test]
async fn test_deferred_callback_completes_the_task() {
    let completions = Arc::new(CompletionRegistry::new());
    let client = Arc::new(DeferredPeer {
        completions: completions.clone(),
        delay: Duration::from_millis(30),
    });
    let task = remote_task(client, completions.clone());

    let result = task.invoke(Some(Duration::from_secs(2))).await;
    assert_eq!(result, Some(true));
    assert_eq!(task.context().get("installed_version"), Some(json!("1.4.2")));
    assert_eq!(completions.pending(), 0);
}

#[tokio::test]
async fn test_unresponsive_peer_times_out_near_budget() {
    let completions = Arc::new(CompletionRegistry::new());
    let task = remote_task(Arc::new(SilentPeer), completions.clone());

    let started = Instant::now();
    let result = task.invoke(Some(Duration::from_millis(150))).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Some(false));
    assert!(elapsed >= Duration::from_millis(140));
    assert!(elapsed < Duration::from_millis(600));

    let process = task.result();
    assert!(process.stderr.contains("local wait abandoned"), "{}", process.stderr);
    // The wait was abandoned, not left registered.
    assert_eq!(completions.pending(), 0);
}

#[tokio::test]
async fn test_late_callback_after_abandon_is_rejected() {
    let completions = Arc::new(CompletionRegistry::new());
    let client = Arc::new(DeferredPeer {
        completions: completions.clone(),
        delay: Duration::from_millis(120),
    });
    let task = remote_task(client, completions.clone());

    let result = task.invoke(Some(Duration::from_millis(30))).await;
    assert_eq!(result, Some(false));

    // The peer's eventual callback finds no waiter.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(completions.pending(), 0);
    assert_eq!(task.result().success, Some(false));
}

#[tokio::test]
async fn test_remote_undo_delegates_to_peer() {
    let completions = Arc::new(CompletionRegistry::new());
    let client: Arc<dyn PeerExecClient> = Arc::new(InlinePeer {
        requests: Mutex::new(Vec::new()),
    });

    let undo = Arc::new(RemoteTask::new(
        TaskId::new("node-b", "install.undo"),
        Operation::new("remove_package", json!({"package": "billing"})),
        VariableContext::new(),
        peer(),
        client.clone(),
        completions.clone(),
    ));
    let task = remote_task(client, completions).with_undo(undo.clone());

    assert_eq!(task.invoke(None).await, Some(true));
    assert_eq!(task.undo(None).await, Some(true));
    assert_eq!(undo.result().success, Some(true));
}
