pub mod build;
pub mod runner;
pub mod template;

pub use build::{HostMap, PlanAssembler};
pub use runner::{OrchestrationRunner, RunOptions, RunOutcome};
pub use template::{OrchestrationTemplate, StepTemplate};
