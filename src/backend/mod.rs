//! Execution backends run task payloads on workers and report on their progress.
mod local;

pub use self::local::LocalBackend;

use crate::prelude::*;
use crate::types::{TaskError, TaskPayload, TaskResult, WorkerId};
use std::fmt;

/// Opaque handle of one submitted attempt.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt{}", self.0)
    }
}

/// Status of a submitted attempt.
#[derive(Clone, PartialEq, Debug)]
pub enum TaskStatus {
    Running,
    Succeeded(TaskResult),
    Failed(TaskError),
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Runs task payloads. Submitting never blocks on the task itself: the executor polls every
/// handle until it reports a final status.
///
/// Errors returned by the methods themselves (as opposed to a `Failed` status) indicate the
/// backend could not be reached and are treated like transient task failures.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Number of attempts the backend can usefully run at the same time.
    fn max_concurrency(&self) -> usize;

    fn submit(&self, payload: TaskPayload) -> Result<TaskHandle>;

    /// Current status of an attempt. Once a final status has been returned the backend may
    /// release the handle, so each attempt must be polled to completion at most once.
    fn poll(&self, handle: TaskHandle) -> Result<TaskStatus>;

    /// Worker a running attempt was placed on, if the backend knows it.
    fn placement(&self, _handle: TaskHandle) -> Option<WorkerId> {
        None
    }

    /// Cancel an attempt. Best effort: the attempt may still run to completion, but the backend
    /// must not report it afterwards.
    fn cancel(&self, handle: TaskHandle) -> Result;
}
