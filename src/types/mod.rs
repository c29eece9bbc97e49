//! Common types used throughout the tessera planner and executor.
mod config;
mod descriptor;
mod error;
mod report;
mod task;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

pub use tessera_core::*;

pub use self::config::*;
pub use self::descriptor::*;
pub use self::error::*;
pub use self::report::*;
pub use self::task::*;

/// Identifier of a node in an operation graph. Identifiers are assigned in creation order and
/// are never reused, which makes them usable as a deterministic tie-breaker.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Handle returned by the graph builder for a newly added node.
pub type NodeRef = NodeId;

/// Identifies the worker that ran a task attempt.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct WorkerId(pub u32);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker{}", self.0)
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}
