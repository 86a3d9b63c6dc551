//! Task result types.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{ConvoyError, Result};

/// The result slot of a task invocation.
///
/// `success` stays unset until the task has actually been invoked and
/// evaluated; a task that never ran reports `None` here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletedProcess {
    pub success: Option<bool>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl CompletedProcess {
    /// A failed result carrying a diagnostic, used when invocation itself
    /// blew up before or after the operation body ran.
    pub fn failure<S: Into<String>>(diagnostic: S) -> Self {
        Self {
            success: Some(false),
            stderr: diagnostic.into(),
            ..Default::default()
        }
    }
}

/// Elapsed time of the three invocation phases, reported to the execution
/// recorder alongside the finished result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepTimings {
    pub pre_process_ms: u64,
    pub execution_ms: u64,
    pub post_process_ms: u64,
}

/// Expected-output matching applied when the operation collaborator leaves
/// `success` unset: regex over stdout/stderr, equality on the return code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpectedOutcome {
    #[serde(default)]
    pub stdout_pattern: Option<String>,
    #[serde(default)]
    pub stderr_pattern: Option<String>,
    #[serde(default)]
    pub return_code: Option<i32>,
}

impl ExpectedOutcome {
    /// Evaluate the expectations against a completed process. Every
    /// configured expectation must hold.
    pub fn evaluate(&self, process: &CompletedProcess) -> Result<bool> {
        if let Some(pattern) = &self.stdout_pattern {
            let re = Regex::new(pattern)
                .map_err(|e| ConvoyError::validation(format!("bad stdout pattern: {e}")))?;
            if !re.is_match(&process.stdout) {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.stderr_pattern {
            let re = Regex::new(pattern)
                .map_err(|e| ConvoyError::validation(format!("bad stderr pattern: {e}")))?;
            if !re.is_match(&process.stderr) {
                return Ok(false);
            }
        }
        if let Some(expected) = self.return_code {
            if process.return_code != Some(expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.stdout_pattern.is_none() && self.stderr_pattern.is_none() && self.return_code.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_outcome_matching() {
        let process = CompletedProcess {
            success: None,
            stdout: "deployed version 1.4.2".to_string(),
            stderr: String::new(),
            return_code: Some(0),
            start_time: None,
            end_time: None,
        };

        let expected = ExpectedOutcome {
            stdout_pattern: Some(r"deployed version \d+\.\d+\.\d+".to_string()),
            stderr_pattern: None,
            return_code: Some(0),
        };
        assert!(expected.evaluate(&process).unwrap());

        let mismatched = ExpectedOutcome {
            return_code: Some(1),
            ..Default::default()
        };
        assert!(!mismatched.evaluate(&process).unwrap());
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        let expected = ExpectedOutcome {
            stdout_pattern: Some("(".to_string()),
            ..Default::default()
        };
        assert!(expected.evaluate(&CompletedProcess::default()).is_err());
    }
}
