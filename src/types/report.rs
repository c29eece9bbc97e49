use super::{ArrayDescriptor, NodeId, TaskError, TaskId, WorkerId};
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_core::util::GroupByExt;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Execution record of one task, including all its attempts and backups.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,

    /// Attempts started in the retry chain. Straggler backups are counted separately.
    pub attempts_used: u32,
    pub backups_launched: u32,
    pub backup_won: bool,
    pub worker: Option<WorkerId>,
    pub projected_mem: u64,
    pub peak_mem_observed: u64,
    pub wall_time: Duration,
    pub last_error: Option<TaskError>,
}

impl TaskRecord {
    pub fn node_id(&self) -> NodeId {
        self.task_id.node
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Source array that existed before the run.
    Materialized,
    Succeeded,
    Failed,

    /// Never started (or stopped) because of a failure elsewhere.
    Cancelled,

    /// Not required to produce any terminal node.
    Skipped,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub op_name: String,
    pub outcome: NodeOutcome,
    pub num_tasks: u64,
    pub projected_mem: u64,
    pub peak_mem_observed: u64,
    pub wall_time: Duration,
    pub descriptor: ArrayDescriptor,
}

impl NodeReport {
    /// Ratio of the highest observed peak to the projection.
    pub fn utilization(&self) -> Option<f64> {
        if self.projected_mem == 0 || self.peak_mem_observed == 0 {
            None
        } else {
            Some(self.peak_mem_observed as f64 / self.projected_mem as f64)
        }
    }
}

/// Result of executing an operation graph. Lists the outcome of every node, whether the run
/// succeeded or not.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub nodes: IndexMap<NodeId, NodeReport>,
    pub tasks: Vec<TaskRecord>,
    pub wall_time: Duration,
}

impl RunReport {
    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.get(&id)
    }

    pub fn outcome(&self, id: NodeId) -> Option<NodeOutcome> {
        self.node(id).map(|n| n.outcome)
    }

    pub fn tasks_of(&self, id: NodeId) -> impl Iterator<Item = &TaskRecord> + '_ {
        self.tasks.iter().filter(move |t| t.node_id() == id)
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task_id == id)
    }

    pub fn is_success(&self) -> bool {
        self.nodes.values().all(|n| {
            matches!(
                n.outcome,
                NodeOutcome::Materialized | NodeOutcome::Succeeded | NodeOutcome::Skipped
            )
        })
    }

    pub fn num_tasks_with(&self, outcome: TaskOutcome) -> usize {
        self.tasks.iter().filter(|t| t.outcome == outcome).count()
    }

    /// Descriptor of a node after execution, with its storage allocated.
    pub fn descriptor(&self, id: NodeId) -> Option<&ArrayDescriptor> {
        self.node(id).map(|n| &n.descriptor)
    }

    /// Log one line per node with its outcome and memory utilization.
    pub fn log_summary(&self) {
        let mut records = self.tasks.iter().collect_vec();

        for (node, tasks) in records.sort_and_group_by_key(|t| t.node_id()) {
            let retries: u32 = tasks.iter().map(|t| t.attempts_used.saturating_sub(1)).sum();
            let backups: u32 = tasks.iter().map(|t| t.backups_launched).sum();

            if let Some(report) = self.node(node) {
                info!(
                    "{} ({}): {:?}, {} task(s), {} retries, {} backups, utilization {}",
                    node,
                    report.op_name,
                    report.outcome,
                    tasks.len(),
                    retries,
                    backups,
                    report
                        .utilization()
                        .map(|u| format!("{:.2}", u))
                        .unwrap_or_else(|| "n/a".to_string()),
                );
            }
        }
    }
}
