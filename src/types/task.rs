use super::{ArrayDescriptor, NodeId, WorkerId};
use crate::graph::Application;
use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_core::ChunkCoord;

/// Identifies a task by its node and its position in the row-major enumeration of the node's
/// output chunks.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub node: NodeId,
    pub index: u64,
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/task{}", self.node, self.index)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The chunks of one input array that a task reads.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TaskInput {
    pub node: NodeId,
    pub coords: Vec<ChunkCoord>,
}

/// The unit of work: produces exactly one output chunk of one node.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub output_chunk_index: ChunkCoord,
    pub inputs: Vec<TaskInput>,
    pub attempt: u32,
    pub projected_mem: u64,
}

impl Task {
    pub fn node_id(&self) -> NodeId {
        self.id.node
    }
}

/// What a worker must do to produce the output chunk of a task.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum PayloadKind {
    Blockwise {
        /// Descriptor of each distinct input, indexed by input slot.
        inputs: Vec<ArrayDescriptor>,
        output: ArrayDescriptor,
        root: Application,
    },
    Rechunk {
        source: ArrayDescriptor,
        target: ArrayDescriptor,
    },
}

/// Self-describing task payload. A worker needs nothing except this payload, its kernel
/// registry and access to the chunk store to execute the task.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task: Task,
    pub kind: PayloadKind,

    /// Set for straggler backups: the worker running the original attempt, if known. The
    /// backend should place the backup elsewhere.
    pub avoid_worker: Option<WorkerId>,
    pub is_backup: bool,
}

/// Outcome of a successful attempt as reported by the worker.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub worker: WorkerId,
    pub peak_mem: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}
