use super::{NodeId, RunReport, TaskId};
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors raised while building or validating an operation graph. These are always raised
/// before any task is launched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("invalid graph: {0}")]
    GraphValidation(String),

    #[error(
        "projected {op} memory ({projected}) exceeds allowed_mem ({allowed}), \
         including reserved_mem ({reserved})"
    )]
    MemoryExceeded {
        op: &'static str,
        projected: u64,
        allowed: u64,
        reserved: u64,
    },
}

/// Failure of a single task attempt.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskError {
    /// Transport, storage or worker failure. The attempt may be retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The attempt exceeded the configured task timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The worker observed a peak memory usage above the projection. This indicates the memory
    /// model is wrong for this operation and is never retried.
    #[error("observed peak memory ({observed}) exceeds projected memory ({projected})")]
    RuntimeMemoryExceeded { observed: u64, projected: u64 },

    /// Any other error that retrying cannot fix (unknown kernel, malformed payload, etc).
    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::Timeout(_))
    }
}

/// A task failed with a retryable error on every allowed attempt.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("task {task} failed after {attempts} attempt(s): {last_error}")]
pub struct TaskExhaustedError {
    pub task: TaskId,
    pub attempts: u32,
    pub last_error: TaskError,
}

/// Summary of why a node did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    pub node: NodeId,
    pub reason: String,
    pub failed_tasks: Vec<(TaskId, TaskError)>,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.node, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),

    #[error("{} node(s) failed, first: {}", .failures.len(), first_failure(.failures))]
    Failed {
        report: Box<RunReport>,
        failures: Vec<NodeFailure>,
    },
}

impl RunError {
    /// The run report, if execution got far enough to produce one.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunError::Plan(_) | RunError::InvalidConfig(_) => None,
            RunError::Failed { report, .. } => Some(report),
        }
    }
}

fn first_failure(failures: &[NodeFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_memory_message() {
        let err = PlanError::MemoryExceeded {
            op: "blockwise",
            projected: 192,
            allowed: 100,
            reserved: 0,
        };

        assert_eq!(
            err.to_string(),
            "projected blockwise memory (192) exceeds allowed_mem (100), including reserved_mem (0)"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(TaskError::Transient("io".into()).is_retryable());
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TaskError::Fatal("bad".into()).is_retryable());
        assert!(!TaskError::RuntimeMemoryExceeded {
            observed: 2,
            projected: 1
        }
        .is_retryable());
    }
}
