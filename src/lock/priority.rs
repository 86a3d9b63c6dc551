//! Priority enforcement across scopes.
//!
//! A scope may only start reserving while no strictly higher-priority scope
//! is active. Priority is enforced at the PREVENTING step only: once a
//! lower-priority scope holds its lock, a later higher-priority request does
//! not evict it, but a lower-priority scope must not even begin reserving
//! under an active higher-priority one.

use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use super::locker::{LockError, LockState, Locker};
use super::scope::{Applicant, Scope};

/// A scope's locker plus its place in the priority order.
pub struct PriorityLocker {
    inner: Arc<Locker>,
}

impl PriorityLocker {
    pub fn new(scope: Scope, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Locker::new(scope, expiry)),
        }
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope()
    }

    pub fn state(&self) -> LockState {
        self.inner.state()
    }

    pub fn applicant(&self) -> Option<Applicant> {
        self.inner.applicant()
    }

    /// Reserve this scope, unless any strictly higher-priority scope among
    /// `all` is currently reserving or locked.
    pub fn preventing_lock(
        &self,
        all: &[Arc<PriorityLocker>],
        applicant: &Applicant,
    ) -> Result<(), LockError> {
        for other in all {
            if other.scope() == self.scope() || !other.scope().outranks(self.scope()) {
                continue;
            }
            if other.state() != LockState::Unlocked {
                debug!(scope = %self.scope(), active = %other.scope(), "reservation refused; higher-priority scope active");
                return Err(LockError::PriorityHeld {
                    scope: self.scope(),
                    active: other.scope(),
                });
            }
        }
        self.inner.preventing_lock(applicant)
    }

    pub fn lock(&self, applicant: &Applicant) -> Result<(), LockError> {
        self.inner.lock(applicant)
    }

    pub fn unlock(&self, applicant: &Applicant) -> Result<(), LockError> {
        self.inner.unlock(applicant)
    }

    pub fn force_unlock(&self) -> Result<(), LockError> {
        self.inner.force_unlock()
    }
}

/// Process-wide registry holding the one locker per scope. Built once at
/// startup with every scope UNLOCKED.
pub struct LockRegistry {
    lockers: Vec<Arc<PriorityLocker>>,
}

impl LockRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            lockers: Scope::ALL
                .iter()
                .map(|&scope| Arc::new(PriorityLocker::new(scope, expiry)))
                .collect(),
        }
    }

    pub fn get(&self, scope: Scope) -> &Arc<PriorityLocker> {
        // The registry always holds every scope.
        self.lockers
            .iter()
            .find(|l| l.scope() == scope)
            .unwrap_or_else(|| unreachable!("registry is built with all scopes"))
    }

    pub fn state(&self, scope: Scope) -> LockState {
        self.get(scope).state()
    }

    pub fn preventing_lock(&self, scope: Scope, applicant: &Applicant) -> Result<(), LockError> {
        self.get(scope).preventing_lock(&self.lockers, applicant)
    }

    pub fn lock(&self, scope: Scope, applicant: &Applicant) -> Result<(), LockError> {
        self.get(scope).lock(applicant)
    }

    pub fn unlock(&self, scope: Scope, applicant: &Applicant, force: bool) -> Result<(), LockError> {
        if force {
            self.get(scope).force_unlock()
        } else {
            self.get(scope).unlock(applicant)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applicant() -> Applicant {
        Applicant::from_participants(["node-a", "node-b"])
    }

    #[tokio::test]
    async fn test_lower_priority_refused_while_higher_active() {
        let registry = LockRegistry::new(Duration::from_secs(60));
        let a = applicant();

        registry.preventing_lock(Scope::Catalog, &a).unwrap();
        registry.lock(Scope::Catalog, &a).unwrap();

        let err = registry
            .preventing_lock(Scope::Orchestration, &a)
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::PriorityHeld {
                scope: Scope::Orchestration,
                active: Scope::Catalog,
            }
        ));
    }

    #[tokio::test]
    async fn test_lower_priority_allowed_when_higher_unlocked() {
        let registry = LockRegistry::new(Duration::from_secs(60));
        let a = applicant();
        registry.preventing_lock(Scope::Orchestration, &a).unwrap();
        assert_eq!(registry.state(Scope::Orchestration), LockState::Preventing);
    }

    #[tokio::test]
    async fn test_higher_priority_ignores_lower_activity() {
        let registry = LockRegistry::new(Duration::from_secs(60));
        let a = applicant();
        registry.preventing_lock(Scope::Orchestration, &a).unwrap();
        registry.lock(Scope::Orchestration, &a).unwrap();
        // CATALOG outranks ORCHESTRATION and may still reserve.
        registry.preventing_lock(Scope::Catalog, &a).unwrap();
        assert_eq!(registry.state(Scope::Catalog), LockState::Preventing);
    }

    #[tokio::test]
    async fn test_preventing_higher_scope_also_blocks() {
        let registry = LockRegistry::new(Duration::from_secs(60));
        let a = applicant();
        registry.preventing_lock(Scope::Upgrade, &a).unwrap();
        assert!(matches!(
            registry.preventing_lock(Scope::Orchestration, &a),
            Err(LockError::PriorityHeld { .. })
        ));
    }
}
