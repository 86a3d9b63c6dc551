//! Convoy - coordinating multi-step automation plans across a fleet of peers.
//!
//! The crate pairs two tightly coupled subsystems: a dependency-graph
//! execution engine (graph model, local/remote/undo/composite tasks, a
//! level-parallel scheduler with per-node and per-run failure policies) and a
//! distributed locking protocol (per-scope state machine with auto-expiring
//! reservation, priority preemption across scopes, and a two-phase
//! prevent/lock handshake across peers with compensating unlock).

// Core infrastructure modules
pub mod core {
    pub mod errors;
    pub mod fanout;
    pub mod timer;
}

pub mod context;
pub mod graph;
pub mod lock;
pub mod net;
pub mod plan;
pub mod task;

// Re-exports for convenience
pub use core::errors::{ConvoyError, Result};

pub use context::VariableContext;
pub use graph::{Graph, GraphError};
pub use lock::{
    Applicant, LockCoordinator, LockError, LockRegistry, LockState, LockTransport, Locker,
    ParticipantFailure, PriorityLocker, Scope,
};
pub use net::{
    CompletionRegistry, HttpLockTransport, HttpPeerClient, LaunchRequest, LaunchResponse,
    PeerExecClient, PeerHandle, RemoteCompletion,
};
pub use plan::{
    HostMap, OrchestrationRunner, OrchestrationTemplate, PlanAssembler, RunOptions, RunOutcome,
};
pub use task::{
    CompletedProcess, CompositeTask, ExecutionRecorder, ExpectedOutcome, HookEngine, LocalTask,
    Operation, OperationRunner, RemoteTask, RunConfig, StepReport, StepTimings, Task, TaskExecutor,
    TaskHooks, TaskId, TaskKind, TaskPolicy, UndoTask,
};
