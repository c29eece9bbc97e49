use crate::graph::{GraphNode, OperationGraph};
use crate::types::{NodeReport, RunReport, TaskOutcome, TaskRecord};
use crossbeam::atomic::AtomicCell;

/// Hooks invoked by the executor as a computation progresses. All methods default to doing
/// nothing.
pub trait Callback: Send + Sync {
    fn on_compute_start(&self, _graph: &OperationGraph) {}

    fn on_node_start(&self, _node: &GraphNode) {}

    /// Called once per task when its final outcome is known.
    fn on_task_end(&self, _record: &TaskRecord) {}

    fn on_node_end(&self, _report: &NodeReport) {}

    fn on_compute_end(&self, _report: &RunReport) {}
}

/// Counts tasks by outcome.
#[derive(Debug, Default)]
pub struct TaskCounter {
    succeeded: AtomicCell<u64>,
    failed: AtomicCell<u64>,
    cancelled: AtomicCell<u64>,
    nodes: AtomicCell<u64>,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load()
    }

    pub fn failed(&self) -> u64 {
        self.failed.load()
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load()
    }

    /// Nodes that were started.
    pub fn nodes(&self) -> u64 {
        self.nodes.load()
    }
}

impl Callback for TaskCounter {
    fn on_node_start(&self, _node: &GraphNode) {
        self.nodes.fetch_add(1);
    }

    fn on_task_end(&self, record: &TaskRecord) {
        let counter = match record.outcome {
            TaskOutcome::Succeeded => &self.succeeded,
            TaskOutcome::Failed => &self.failed,
            TaskOutcome::Cancelled => &self.cancelled,
        };

        counter.fetch_add(1);
    }
}
