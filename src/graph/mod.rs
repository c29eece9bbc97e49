//! The lazy operation graph: array descriptors connected by blockwise and rechunk operations.
mod dot;
mod mapping;
mod op;

pub use self::mapping::*;
pub use self::op::*;

use crate::planner::memory::{check_allowed, project_application, project_rechunk};
use crate::planner::tasks;
use crate::prelude::*;
use crate::types::{ArrayDescriptor, NodeId, NodeRef, PlanConfig, PlanError, StoreRef, Task};
use serde::{Deserialize, Serialize};
use tessera_core::Shape;

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub descriptor: ArrayDescriptor,
    pub op: Operation,
    pub num_tasks: u64,
    pub projected_mem_per_task: u64,
}

/// Summary of the size of a graph.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct PlanStats {
    pub num_arrays: usize,
    pub num_tasks: u64,

    /// Bytes of every array that execution would write.
    pub total_nbytes: u64,
    pub max_projected_mem: u64,
}

/// Append-only DAG of array operations. Nodes only reference nodes that were added before them,
/// so insertion order is a topological order.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct OperationGraph {
    config: PlanConfig,
    next_id: u64,
    nodes: IndexMap<NodeId, GraphNode>,
    terminals: IndexSet<NodeId>,
}

impl OperationGraph {
    pub fn new(config: PlanConfig) -> Self {
        Self {
            config,
            next_id: 0,
            nodes: default(),
            terminals: default(),
        }
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    /// Register an array that already exists in storage.
    pub fn add_source(&mut self, descriptor: ArrayDescriptor) -> Result<NodeRef, PlanError> {
        if !descriptor.store().is_allocated() {
            return Err(PlanError::GraphValidation(
                "source array must refer to existing storage".to_string(),
            ));
        }

        Ok(self.push(descriptor, Operation::Source, 0, 0))
    }

    /// Add an operation that applies `function` to the chunks of `inputs` selected by
    /// `mappings` (one mapping per input) to produce each chunk of `output`.
    ///
    /// The same node may be passed more than once; it occupies a single input slot.
    pub fn add_blockwise(
        &mut self,
        function: Function,
        inputs: &[NodeRef],
        mappings: Vec<BlockMapping>,
        output: ArrayDescriptor,
    ) -> Result<NodeRef, PlanError> {
        if inputs.is_empty() {
            return Err(PlanError::GraphValidation(format!(
                "blockwise function {:?} has no inputs",
                function.name
            )));
        }

        if inputs.len() != mappings.len() {
            return Err(PlanError::GraphValidation(format!(
                "{} inputs but {} block mappings",
                inputs.len(),
                mappings.len()
            )));
        }

        let output_blocks = output.num_blocks();
        let mut slots: Vec<NodeId> = vec![];
        let mut args = vec![];

        for (&input, mapping) in zip(inputs, mappings) {
            let node = self.require(input)?;
            mapping
                .validate(&node.descriptor.num_blocks(), &output_blocks)
                .map_err(|e| PlanError::GraphValidation(format!("input {}: {}", input, e)))?;

            let slot = match slots.iter().position(|&s| s == input) {
                Some(slot) => slot,
                None => {
                    slots.push(input);
                    slots.len() - 1
                }
            };

            args.push(BlockArg {
                mapping,
                expr: BlockExpr::Input(slot),
            });
        }

        let op = BlockwiseOp {
            inputs: slots,
            root: Application {
                function,
                args,
                grid: output.grid(),
                dtype: output.dtype(),
            },
        };

        let projected = self.project_blockwise(&op)?;
        check_allowed(
            "blockwise",
            projected,
            self.config.allowed_mem,
            self.config.reserved_mem,
        )?;

        let num_tasks = output.num_chunks();
        Ok(self.push(output, Operation::Blockwise(op), num_tasks, projected))
    }

    /// Add an operation that changes the chunking of `input` to `target_chunks`.
    ///
    /// If a direct rechunk would exceed the memory limit, the data is first rechunked to an
    /// intermediate chunking (the element-wise minimum of both chunkings) and the returned node
    /// refers to the second stage.
    pub fn add_rechunk(&mut self, input: NodeRef, target_chunks: &[u64]) -> Result<NodeRef, PlanError> {
        let source = self.require(input)?.descriptor.clone();
        let target = ArrayDescriptor::unallocated(source.shape(), source.dtype(), target_chunks)?;
        let (allowed, reserved) = (self.config.allowed_mem, self.config.reserved_mem);

        let direct = project_rechunk(&source, target_chunks, reserved)?;
        if direct <= allowed {
            let num_tasks = target.num_chunks();
            let op = RechunkOp {
                input,
                target_chunks: target_chunks.iter().copied().collect(),
            };

            return Ok(self.push(target, Operation::Rechunk(op), num_tasks, direct));
        }

        let intermediate_chunks: Shape = zip(source.chunks(), target_chunks)
            .map(|(&a, &b)| min(a, b))
            .collect();

        if intermediate_chunks.as_slice() == source.chunks()
            || intermediate_chunks.as_slice() == target_chunks
        {
            check_allowed("rechunk", direct, allowed, reserved)?;
        }

        let intermediate = source.with_chunks(&intermediate_chunks)?.with_store(StoreRef::Unallocated);
        let first = project_rechunk(&source, &intermediate_chunks, reserved)?;
        let second = project_rechunk(&intermediate, target_chunks, reserved)?;
        check_allowed("rechunk", first, allowed, reserved)?;
        check_allowed("rechunk", second, allowed, reserved)?;

        debug!(
            "rechunk {:?} -> {:?} uses intermediate chunking {:?}",
            source.chunks(),
            target_chunks,
            intermediate_chunks
        );

        let num_tasks = intermediate.num_chunks();
        let op = RechunkOp {
            input,
            target_chunks: intermediate_chunks,
        };
        let mid = self.push(intermediate, Operation::Rechunk(op), num_tasks, first);

        let num_tasks = target.num_chunks();
        let op = RechunkOp {
            input: mid,
            target_chunks: target_chunks.iter().copied().collect(),
        };
        Ok(self.push(target, Operation::Rechunk(op), num_tasks, second))
    }

    /// Mark a node as an output of the computation. Terminal nodes are never fused away.
    pub fn mark_terminal(&mut self, node: NodeRef) -> Result<(), PlanError> {
        self.require(node)?;
        self.terminals.insert(node);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    /// All nodes in topological (insertion) order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn terminals(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.terminals.iter().copied()
    }

    pub fn is_terminal(&self, id: NodeId) -> bool {
        self.terminals.contains(&id)
    }

    /// Distinct nodes that read from `id`, in topological order.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.op.inputs().contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// The nodes that must be computed to produce every terminal, in topological order. A graph
    /// without explicit terminals treats every node without consumers as terminal.
    pub fn required_nodes(&self) -> Vec<NodeId> {
        let mut required: HashSet<NodeId> = default();
        let mut stack: Vec<NodeId> = if self.terminals.is_empty() {
            self.nodes
                .keys()
                .copied()
                .filter(|&id| self.consumers(id).is_empty())
                .collect()
        } else {
            self.terminals.iter().copied().collect()
        };

        while let Some(id) = stack.pop() {
            if required.insert(id) {
                if let Some(node) = self.nodes.get(&id) {
                    stack.extend(node.op.inputs().iter().copied());
                }
            }
        }

        self.nodes
            .keys()
            .copied()
            .filter(|id| required.contains(id))
            .collect()
    }

    pub fn stats(&self) -> PlanStats {
        let mut stats = PlanStats {
            num_arrays: self.nodes.len(),
            ..default()
        };

        for node in self.nodes.values() {
            stats.num_tasks += node.num_tasks;
            stats.max_projected_mem = max(stats.max_projected_mem, node.projected_mem_per_task);

            if !node.op.is_source() {
                stats.total_nbytes += node.descriptor.nbytes();
            }
        }

        stats
    }

    /// Check the structural invariants of the graph: inputs precede their consumers, mappings
    /// agree with the block grids and every projection stays within the memory limit.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen: HashSet<NodeId> = default();

        for node in self.nodes.values() {
            for input in node.op.inputs() {
                if !seen.contains(input) {
                    return Err(PlanError::GraphValidation(format!(
                        "{} reads {} which does not precede it",
                        node.id, input
                    )));
                }
            }

            self.validate_node(node)?;
            seen.insert(node.id);
        }

        for &id in &self.terminals {
            self.require(id)?;
        }

        Ok(())
    }

    fn validate_node(&self, node: &GraphNode) -> Result<(), PlanError> {
        let invalid = |msg: String| PlanError::GraphValidation(format!("{}: {}", node.id, msg));
        let desc = &node.descriptor;
        ArrayDescriptor::new(desc.shape(), desc.dtype(), desc.chunks(), desc.store().clone())?;

        match &node.op {
            Operation::Source => {
                if !desc.store().is_allocated() {
                    return Err(invalid("source array has no storage".to_string()));
                }
            }
            Operation::Blockwise(op) => {
                if op.root.grid != desc.grid() || op.root.dtype != desc.dtype() {
                    return Err(invalid("expression does not produce the node's array".to_string()));
                }

                if op.root.leaf_slots().len() != op.inputs.len() {
                    return Err(invalid("unused or missing input slot".to_string()));
                }

                let input_blocks = self.input_blocks(op)?;
                validate_application(&op.root, &input_blocks).map_err(|e| invalid(e.to_string()))?;
            }
            Operation::Rechunk(op) => {
                let source = &self.require(op.input)?.descriptor;
                if source.shape() != desc.shape() || source.dtype() != desc.dtype() {
                    return Err(invalid("rechunk changes shape or type".to_string()));
                }

                if op.target_chunks.as_slice() != desc.chunks() {
                    return Err(invalid("rechunk target does not match descriptor".to_string()));
                }
            }
        }

        let projected = self.estimate_memory(node)?;
        check_allowed(
            node.op.name(),
            projected,
            self.config.allowed_mem,
            self.config.reserved_mem,
        )
    }

    /// Projected peak memory of a single task of `node`.
    pub fn estimate_memory(&self, node: &GraphNode) -> Result<u64, PlanError> {
        match &node.op {
            Operation::Source => Ok(0),
            Operation::Blockwise(op) => self.project_blockwise(op),
            Operation::Rechunk(op) => {
                let source = &self.require(op.input)?.descriptor;
                project_rechunk(source, &op.target_chunks, self.config.reserved_mem)
            }
        }
    }

    /// Expand a node into its tasks.
    pub fn generate_tasks(&self, id: NodeId) -> Result<Vec<Task>, PlanError> {
        tasks::generate_tasks(self, id)
    }

    pub(crate) fn project_blockwise(&self, op: &BlockwiseOp) -> Result<u64, PlanError> {
        let inputs = op
            .inputs
            .iter()
            .map(|&id| self.require(id).map(|n| &n.descriptor))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(project_application(&op.root, &inputs, self.config.reserved_mem))
    }

    pub(crate) fn input_blocks(&self, op: &BlockwiseOp) -> Result<Vec<Shape>, PlanError> {
        op.inputs
            .iter()
            .map(|&id| self.require(id).map(|n| n.descriptor.num_blocks()))
            .collect()
    }

    pub(crate) fn require(&self, id: NodeId) -> Result<&GraphNode, PlanError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| PlanError::GraphValidation(format!("unknown node {}", id)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&id)
    }

    /// Remove a node that no other node reads from.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<GraphNode> {
        self.terminals.shift_remove(&id);
        self.nodes.shift_remove(&id)
    }

    fn push(&mut self, descriptor: ArrayDescriptor, op: Operation, num_tasks: u64, projected: u64) -> NodeId {
        let id = NodeId((&mut self.next_id).get_and_increment());
        trace!(
            "adding {} ({}): shape={:?} chunks={:?} tasks={} projected_mem={}",
            id,
            op.label(),
            descriptor.shape(),
            descriptor.chunks(),
            num_tasks,
            projected
        );

        self.nodes.insert(
            id,
            GraphNode {
                id,
                descriptor,
                op,
                num_tasks,
                projected_mem_per_task: projected,
            },
        );

        id
    }
}

fn validate_application(app: &Application, input_blocks: &[Shape]) -> Result {
    let output_blocks = app.num_blocks();

    for arg in &app.args {
        let blocks = arg.expr.num_blocks(input_blocks);
        arg.mapping.validate(&blocks, &output_blocks)?;

        if let BlockExpr::Apply(inner) = &arg.expr {
            validate_application(inner, input_blocks)?;
        }
    }

    Ok(())
}
