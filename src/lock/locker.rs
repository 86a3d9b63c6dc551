//! Single-scope lock state machine.
//!
//! One `Locker` exists per scope for the process lifetime. A reservation
//! (PREVENTING) arms an auto-expiry timer so a crashed or stalled applicant
//! cannot wedge the scope; promoting to LOCKED or unlocking cancels it. All
//! mutation is serialized through the locker's private mutex, and every call
//! first validates the caller's applicant against the current owner.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::coordinator::ParticipantFailure;
use super::scope::{Applicant, Scope};
use crate::core::timer::{self, TimerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Preventing,
    Locked,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("scope {scope} is already in preventing-lock")]
    AlreadyPreventing { scope: Scope },

    #[error("scope {scope} is already locked")]
    AlreadyLocked { scope: Scope },

    #[error("scope {scope} is already unlocked")]
    AlreadyUnlocked { scope: Scope },

    #[error("illegal transition: {op} while scope {scope} is {from:?}")]
    IllegalTransition {
        scope: Scope,
        from: LockState,
        op: &'static str,
    },

    #[error("scope {scope} is held by applicant [{held_by}]")]
    ApplicantMismatch { scope: Scope, held_by: Applicant },

    #[error("higher-priority scope {active} is active; {scope} may not reserve")]
    PriorityHeld { scope: Scope, active: Scope },

    #[error("lock handshake failed for scope {scope}: {} participant(s) did not ack", failures.len())]
    Handshake {
        scope: Scope,
        applicant: Applicant,
        failures: Vec<ParticipantFailure>,
    },
}

impl LockError {
    /// Whether a caller can sensibly retry (or treat the error as benign).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyPreventing { .. }
            | Self::AlreadyLocked { .. }
            | Self::AlreadyUnlocked { .. }
            | Self::PriorityHeld { .. }
            | Self::Handshake { .. } => true,
            Self::IllegalTransition { .. } | Self::ApplicantMismatch { .. } => false,
        }
    }
}

struct LockerInner {
    state: LockState,
    applicant: Option<Applicant>,
    timer: Option<TimerHandle>,
    /// Bumped on every reservation so a stale expiry cannot release a newer
    /// hold.
    generation: u64,
}

pub struct Locker {
    scope: Scope,
    expiry: Duration,
    inner: Mutex<LockerInner>,
}

impl Locker {
    /// Create the locker for `scope` with its reservation expiry. The expiry
    /// is per-instance configuration; there is no shared default.
    pub fn new(scope: Scope, expiry: Duration) -> Self {
        Self {
            scope,
            expiry,
            inner: Mutex::new(LockerInner {
                state: LockState::Unlocked,
                applicant: None,
                timer: None,
                generation: 0,
            }),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn applicant(&self) -> Option<Applicant> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .applicant
            .clone()
    }

    fn check_applicant(
        &self,
        inner: &LockerInner,
        applicant: &Applicant,
    ) -> Result<(), LockError> {
        if let Some(held) = &inner.applicant {
            if !applicant.is_empty() && held != applicant {
                return Err(LockError::ApplicantMismatch {
                    scope: self.scope,
                    held_by: held.clone(),
                });
            }
        }
        Ok(())
    }

    /// Reserve the scope. Requires a tokio runtime: the expiry timer is a
    /// spawned task.
    pub fn preventing_lock(
        self: &Arc<Self>,
        applicant: &Applicant,
    ) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check_applicant(&inner, applicant)?;
        match inner.state {
            LockState::Preventing => Err(LockError::AlreadyPreventing { scope: self.scope }),
            LockState::Locked => Err(LockError::AlreadyLocked { scope: self.scope }),
            LockState::Unlocked => {
                inner.state = LockState::Preventing;
                inner.applicant = Some(applicant.clone());
                inner.generation += 1;
                let generation = inner.generation;
                let locker = Arc::clone(self);
                inner.timer = Some(timer::schedule(self.expiry, async move {
                    locker.expire(generation);
                }));
                debug!(scope = %self.scope, applicant = %applicant, "scope reserved");
                Ok(())
            }
        }
    }

    /// Promote the reservation to a committed hold.
    pub fn lock(&self, applicant: &Applicant) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check_applicant(&inner, applicant)?;
        match inner.state {
            LockState::Preventing => {
                if let Some(timer) = inner.timer.take() {
                    timer.cancel();
                }
                inner.state = LockState::Locked;
                debug!(scope = %self.scope, applicant = %applicant, "scope locked");
                Ok(())
            }
            LockState::Locked => Err(LockError::AlreadyLocked { scope: self.scope }),
            LockState::Unlocked => Err(LockError::IllegalTransition {
                scope: self.scope,
                from: LockState::Unlocked,
                op: "lock",
            }),
        }
    }

    /// Release either a reservation or a committed hold.
    pub fn unlock(&self, applicant: &Applicant) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.check_applicant(&inner, applicant)?;
        self.unlock_inner(&mut inner)
    }

    /// Release regardless of the current applicant (operator escape hatch,
    /// reached through the unlock RPC's `force` flag).
    pub fn force_unlock(&self) -> Result<(), LockError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.unlock_inner(&mut inner)
    }

    fn unlock_inner(&self, inner: &mut LockerInner) -> Result<(), LockError> {
        match inner.state {
            LockState::Unlocked => Err(LockError::AlreadyUnlocked { scope: self.scope }),
            LockState::Preventing | LockState::Locked => {
                if let Some(timer) = inner.timer.take() {
                    timer.cancel();
                }
                inner.state = LockState::Unlocked;
                inner.applicant = None;
                debug!(scope = %self.scope, "scope unlocked");
                Ok(())
            }
        }
    }

    fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == LockState::Preventing && inner.generation == generation {
            warn!(scope = %self.scope, "reservation expired without promotion; auto-unlocking");
            inner.state = LockState::Unlocked;
            inner.applicant = None;
            inner.timer = None;
        }
    }
}
