pub mod coordinator;
pub mod locker;
pub mod priority;
pub mod scope;

pub use coordinator::{
    LockCoordinator, LockPhase, LockTransport, ParticipantError, ParticipantFailure,
};
pub use locker::{LockError, LockState, Locker};
pub use priority::{LockRegistry, PriorityLocker};
pub use scope::{Applicant, Scope};
