//! Bounded task executor and run-level configuration.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::core::errors::{ConvoyError, Result};

fn default_max_parallel() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Run-level configuration shared by a composite and its scheduler.
///
/// `stop_undo_on_error` deliberately has no default: there is no safe answer
/// for whether a failed rollback step should stop further rollback, so
/// `validate` rejects a config that leaves it unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run default for halting after a failed level.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Run default for halting a rollback walk; required.
    pub stop_undo_on_error: Option<bool>,
    /// Run default for whether failed tasks still trigger their undo.
    #[serde(default)]
    pub undo_on_error: bool,
    /// Worker-pool bound for same-level tasks.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// How often the scheduler re-checks the run-wide timeout while a level
    /// is outstanding.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Run-wide timeout budget.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            stop_undo_on_error: None,
            undo_on_error: false,
            max_parallel: default_max_parallel(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_seconds: None,
        }
    }
}

impl RunConfig {
    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.stop_undo_on_error.is_none() {
            return Err(ConvoyError::Configuration {
                message: "stop_undo_on_error must be set explicitly".to_string(),
                field: Some("stop_undo_on_error".to_string()),
                expected: Some("true or false".to_string()),
                actual: Some("unset".to_string()),
            });
        }
        if self.max_parallel == 0 {
            return Err(ConvoyError::configuration("max_parallel must be greater than 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConvoyError::configuration(
                "poll_interval_ms must be greater than 0",
            ));
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err(ConvoyError::configuration(
                    "timeout_seconds must be greater than 0",
                ));
            }
        }
        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence.
    pub fn merge(base: &Self, override_with: &Self) -> Self {
        Self {
            stop_on_error: override_with.stop_on_error,
            stop_undo_on_error: override_with.stop_undo_on_error.or(base.stop_undo_on_error),
            undo_on_error: override_with.undo_on_error,
            max_parallel: override_with.max_parallel,
            poll_interval_ms: override_with.poll_interval_ms,
            timeout_seconds: override_with.timeout_seconds.or(base.timeout_seconds),
        }
    }
}

/// Bounded worker pool injected into every composite.
///
/// Futures are spawned immediately but run gated behind a semaphore, so at
/// most `max_parallel` task bodies make progress at once.
#[derive(Clone)]
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl TaskExecutor {
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Spawn a future onto the pool.
    pub fn spawn_bounded<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            // The semaphore is never closed; an Err here only drops the bound.
            let _permit = semaphore.acquire_owned().await;
            fut.await
        })
    }
}
