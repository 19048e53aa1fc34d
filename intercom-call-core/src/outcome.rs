//! Non-critical operation outcomes
//!
//! Signal broadcasts and backend notifications on teardown may fail without
//! failing the caller. They return [`BestEffort`], which can only be logged.

use std::fmt::Display;

/// Result of a side call that must not fail its caller
#[must_use = "best-effort outcomes must be logged"]
#[derive(Debug)]
pub struct BestEffort {
    operation: &'static str,
    failure: Option<String>,
}

impl BestEffort {
    /// Successful outcome
    pub fn ok(operation: &'static str) -> Self {
        Self {
            operation,
            failure: None,
        }
    }

    /// Failed outcome
    pub fn failed(operation: &'static str, error: impl Display) -> Self {
        Self {
            operation,
            failure: Some(error.to_string()),
        }
    }

    /// Wrap any result, discarding the success value
    pub fn from_result<T, E: Display>(operation: &'static str, result: Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::ok(operation),
            Err(e) => Self::failed(operation, e),
        }
    }

    /// Log the outcome and report whether it succeeded
    pub fn log(self) -> bool {
        match self.failure {
            None => {
                tracing::debug!(operation = self.operation, "Best-effort operation succeeded");
                true
            }
            Some(error) => {
                tracing::warn!(
                    operation = self.operation,
                    error = %error,
                    "Best-effort operation failed, continuing"
                );
                false
            }
        }
    }
}
