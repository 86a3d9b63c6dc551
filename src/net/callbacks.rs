//! Deferred completion signals for remote operations.
//!
//! A remote task that receives an "accepted" acknowledgment parks on a
//! oneshot keyed by its correlation id. When the peer later posts the result
//! to `/events/{correlationId}`, the web layer hands it to
//! [`CompletionRegistry::complete`], waking the parked task.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::client::RemoteCompletion;
use crate::core::errors::{ConvoyError, Result};

#[derive(Default)]
pub struct CompletionRegistry {
    waiters: DashMap<String, oneshot::Sender<RemoteCompletion>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; the returned receiver resolves when the peer calls
    /// back. Registering twice for the same correlation id replaces the
    /// earlier waiter.
    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<RemoteCompletion> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(correlation_id.to_string(), tx).is_some() {
            warn!(correlation_id, "replaced an existing completion waiter");
        }
        rx
    }

    /// Deliver a peer callback to its waiter. Errors when no waiter is
    /// registered (unknown id, or the wait was already abandoned).
    pub fn complete(&self, correlation_id: &str, completion: RemoteCompletion) -> Result<()> {
        let (_, tx) = self.waiters.remove(correlation_id).ok_or_else(|| {
            ConvoyError::validation_field("no completion waiter registered", correlation_id)
        })?;
        if tx.send(completion).is_err() {
            // Receiver dropped between removal and send; the task gave up.
            debug!(correlation_id, "completion arrived after the waiter left");
        }
        Ok(())
    }

    /// Drop the waiter for a correlation id, abandoning the local wait. The
    /// in-flight remote operation is not told to stop.
    pub fn abandon(&self, correlation_id: &str) {
        self.waiters.remove(correlation_id);
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CompletedProcess;
    use std::collections::HashMap;

    fn completion() -> RemoteCompletion {
        RemoteCompletion {
            result: CompletedProcess {
                success: Some(true),
                ..Default::default()
            },
            variable_context_payload: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let registry = CompletionRegistry::new();
        let rx = registry.register("corr-1");
        registry.complete("corr-1", completion()).unwrap();
        let got = rx.await.unwrap();
        assert_eq!(got.result.success, Some(true));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_complete_unknown_id_errors() {
        let registry = CompletionRegistry::new();
        assert!(registry.complete("nope", completion()).is_err());
    }

    #[tokio::test]
    async fn test_abandon_drops_waiter() {
        let registry = CompletionRegistry::new();
        let _rx = registry.register("corr-2");
        registry.abandon("corr-2");
        assert_eq!(registry.pending(), 0);
        assert!(registry.complete("corr-2", completion()).is_err());
    }
}
