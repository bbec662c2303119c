//! Routing error taxonomy.
//!
//! Transient per-model failures are absorbed into the performance ledger and
//! only escalate to one of these errors once the retry budget is exhausted.
//! Configuration errors and total exhaustion are always surfaced; they are
//! never swallowed into an empty result.

use serde::{Deserialize, Serialize};

use crate::types::ModelRef;

/// One failed dispatch, kept for diagnostics on exhaustion errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub model: ModelRef,
    pub reason: String,
    pub latency_ms: u64,
}

/// Errors surfaced to callers of `route_request`.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The task id is not present in the registry. Not retryable.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Every candidate for the task is currently unavailable. The caller may
    /// retry the whole request later.
    #[error("No model available for task '{task}'")]
    NoModelAvailable { task: String },

    /// Every available candidate was attempted and failed.
    #[error("All candidates failed for task '{task}' after {} attempt(s)", attempts.len())]
    AllModelsFailed {
        task: String,
        attempts: Vec<FailedAttempt>,
    },

    /// Every ensemble branch failed. Partial success is not an error.
    #[error("All ensemble branches failed for task '{task}' ({} branch(es))", attempts.len())]
    EnsembleExhausted {
        task: String,
        attempts: Vec<FailedAttempt>,
    },
}

impl RouteError {
    /// Per-model failure details, when the error carries them.
    pub fn attempts(&self) -> &[FailedAttempt] {
        match self {
            Self::AllModelsFailed { attempts, .. } | Self::EnsembleExhausted { attempts, .. } => {
                attempts
            }
            _ => &[],
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownTask(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelRef, Provider};

    #[test]
    fn display_includes_attempt_count() {
        let err = RouteError::AllModelsFailed {
            task: "restaurant-recommendation".into(),
            attempts: vec![
                FailedAttempt {
                    model: ModelRef::new(Provider::LocalA, "m1"),
                    reason: "timeout".into(),
                    latency_ms: 5000,
                },
                FailedAttempt {
                    model: ModelRef::new(Provider::LocalB, "m2"),
                    reason: "connection refused".into(),
                    latency_ms: 3,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("restaurant-recommendation"));
        assert!(msg.contains("2 attempt(s)"));
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn unknown_task_is_not_retryable() {
        assert!(!RouteError::UnknownTask("nope".into()).is_retryable());
        assert!(
            RouteError::NoModelAvailable {
                task: "review-sentiment".into()
            }
            .is_retryable()
        );
    }
}
