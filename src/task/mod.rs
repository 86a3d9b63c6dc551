pub mod composite;
pub mod executor;
pub mod local;
pub mod outcome;
pub mod remote;
pub mod task;
pub mod undo;

pub use composite::{CompositeTask, CompositeTaskBuilder};
pub use executor::{RunConfig, TaskExecutor};
pub use local::LocalTask;
pub use outcome::{CompletedProcess, ExpectedOutcome, StepTimings};
pub use remote::RemoteTask;
pub use task::{
    ExecutionRecorder, HookEngine, Operation, OperationRunner, StepReport, Task, TaskHooks, TaskId,
    TaskKind, TaskPolicy,
};
pub use undo::UndoTask;
