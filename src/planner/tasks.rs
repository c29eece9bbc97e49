//! Expansion of graph nodes into independent tasks, one per output chunk.
use crate::graph::{Application, BlockExpr, Operation, OperationGraph};
use crate::prelude::*;
use crate::types::{
    ArrayDescriptor, NodeId, PayloadKind, PlanError, Task, TaskId, TaskInput, TaskPayload,
};
use tessera_core::{ChunkCoord, Shape};

/// Generate the tasks of a node in row-major order of their output chunk. Source nodes have no
/// tasks.
pub fn generate_tasks(graph: &OperationGraph, id: NodeId) -> Result<Vec<Task>, PlanError> {
    let node = graph.require(id)?;
    let grid = node.descriptor.grid();
    let make_task = |index: usize, coord: ChunkCoord, inputs: Vec<TaskInput>| Task {
        id: TaskId {
            node: id,
            index: index as u64,
        },
        output_chunk_index: coord,
        inputs,
        attempt: 1,
        projected_mem: node.projected_mem_per_task,
    };

    let tasks: Vec<Task> = match &node.op {
        Operation::Source => vec![],
        Operation::Blockwise(op) => {
            let input_blocks = graph.input_blocks(op)?;

            enumerate(grid.coords())
                .map(|(index, coord)| {
                    let mut reads: Vec<IndexSet<ChunkCoord>> = vec![default(); op.inputs.len()];
                    collect_reads(&op.root, &coord, &input_blocks, &mut reads);

                    let inputs = zip(&op.inputs, reads)
                        .map(|(&node, coords)| TaskInput {
                            node,
                            coords: coords.into_iter().collect(),
                        })
                        .collect();

                    make_task(index, coord, inputs)
                })
                .collect()
        }
        Operation::Rechunk(op) => {
            let source = graph.require(op.input)?.descriptor.grid();

            enumerate(grid.coords())
                .map(|(index, coord)| {
                    let region = grid.chunk_region(&coord);
                    let coords = source.blocks_overlapping(&region).points().collect();
                    let inputs = vec![TaskInput {
                        node: op.input,
                        coords,
                    }];

                    make_task(index, coord, inputs)
                })
                .collect()
        }
    };

    Ok(tasks)
}

/// Record, per input slot, every chunk read to compute block `coord` of `app`.
fn collect_reads(
    app: &Application,
    coord: &[u64],
    input_blocks: &[Shape],
    reads: &mut [IndexSet<ChunkCoord>],
) {
    for arg in &app.args {
        let blocks = arg.expr.num_blocks(input_blocks);

        for c in &arg.mapping.resolve(coord, &blocks) {
            match &arg.expr {
                BlockExpr::Input(slot) => {
                    reads[*slot].insert(c);
                }
                BlockExpr::Apply(inner) => collect_reads(inner, &c, input_blocks, reads),
            }
        }
    }
}

/// The part of a task payload shared by all tasks of a node. `materialized` holds the
/// descriptors (with allocated storage) of every node that has been computed so far.
pub fn payload_kind(
    graph: &OperationGraph,
    id: NodeId,
    materialized: &HashMap<NodeId, ArrayDescriptor>,
) -> Result<PayloadKind, PlanError> {
    let node = graph.require(id)?;
    let lookup = |key: &NodeId| {
        materialized.get(key).cloned().ok_or_else(|| {
            PlanError::GraphValidation(format!("{} has not been materialized", key))
        })
    };

    match &node.op {
        Operation::Source => Err(PlanError::GraphValidation(format!(
            "{} is a source and has no tasks",
            id
        ))),
        Operation::Blockwise(op) => Ok(PayloadKind::Blockwise {
            inputs: op.inputs.iter().map(lookup).collect::<Result<_, _>>()?,
            output: lookup(&id)?,
            root: op.root.clone(),
        }),
        Operation::Rechunk(op) => Ok(PayloadKind::Rechunk {
            source: lookup(&op.input)?,
            target: lookup(&id)?,
        }),
    }
}

impl Task {
    /// Build the self-describing payload a worker needs to execute this task.
    pub fn payload(
        &self,
        graph: &OperationGraph,
        materialized: &HashMap<NodeId, ArrayDescriptor>,
    ) -> Result<TaskPayload, PlanError> {
        Ok(TaskPayload {
            task: self.clone(),
            kind: payload_kind(graph, self.node_id(), materialized)?,
            avoid_worker: None,
            is_backup: false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{binary, output, source, unary};
    use crate::graph::{BlockMapping, Function};
    use crate::planner::optimize;
    use crate::types::{PlanConfig, StoreRef};

    fn coords(input: &TaskInput) -> Vec<Vec<u64>> {
        input.coords.iter().map(|c| c.to_vec()).collect()
    }

    #[test]
    fn test_blockwise_tasks() {
        let mut g = OperationGraph::new(PlanConfig::new(10_000, 0));
        let a = source(&mut g, "a", &[3, 3], &[2, 2]);
        let b = unary(&mut g, "neg", a);

        assert!(generate_tasks(&g, a).unwrap().is_empty());

        let tasks = generate_tasks(&g, b).unwrap();
        assert_eq!(tasks.len(), 4);

        for (index, task) in enumerate(&tasks) {
            assert_eq!(task.id, TaskId { node: b, index: index as u64 });
            assert_eq!(task.attempt, 1);
            assert_eq!(task.projected_mem, 128);
            assert_eq!(task.inputs.len(), 1);
            assert_eq!(coords(&task.inputs[0]), vec![task.output_chunk_index.to_vec()]);
        }

        let order = tasks.iter().map(|t| t.output_chunk_index.to_vec()).collect_vec();
        assert_eq!(order, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn test_contraction_and_broadcast() {
        let mut g = OperationGraph::new(PlanConfig::new(10_000, 0));
        let a = source(&mut g, "a", &[4, 6], &[2, 2]);
        let sum = g
            .add_blockwise(
                Function::new("sum"),
                &[a],
                vec![BlockMapping::from_labels("i", "ij").unwrap()],
                output(&[4], &[2]),
            )
            .unwrap();

        let tasks = generate_tasks(&g, sum).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            coords(&tasks[1].inputs[0]),
            vec![vec![1, 0], vec![1, 1], vec![1, 2]]
        );

        let x = source(&mut g, "x", &[4, 4], &[2, 2]);
        let y = source(&mut g, "y", &[4, 4], &[4, 4]);
        let z = binary(&mut g, "add", x, y);
        let tasks = generate_tasks(&g, z).unwrap();
        assert_eq!(coords(&tasks[3].inputs[0]), vec![vec![1, 1]]);
        assert_eq!(coords(&tasks[3].inputs[1]), vec![vec![0, 0]]);
    }

    #[test]
    fn test_fused_tasks_read_sources() {
        let mut g = OperationGraph::new(PlanConfig::new(10_000, 0));
        let a = source(&mut g, "a", &[4, 4], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let c = binary(&mut g, "mul", b, b);
        g.mark_terminal(c).unwrap();

        let opt = optimize(&g);
        let tasks = generate_tasks(&opt, c).unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[2].inputs.len(), 1);
        assert_eq!(tasks[2].inputs[0].node, a);
        assert_eq!(coords(&tasks[2].inputs[0]), vec![vec![1, 0]]);
    }

    #[test]
    fn test_rechunk_tasks() {
        let mut g = OperationGraph::new(PlanConfig::new(100_000, 0));
        let a = source(&mut g, "a", &[10, 10], &[10, 1]);
        let b = g.add_rechunk(a, &[1, 10]).unwrap();

        let tasks = generate_tasks(&g, b).unwrap();
        assert_eq!(tasks.len(), 10);
        assert_eq!(tasks[4].output_chunk_index.to_vec(), vec![4, 0]);
        assert_eq!(
            coords(&tasks[4].inputs[0]),
            (0..10u64).map(|j| vec![0, j]).collect_vec()
        );
    }

    #[test]
    fn test_payload() {
        let mut g = OperationGraph::new(PlanConfig::new(10_000, 0));
        let a = source(&mut g, "a", &[3, 3], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let task = generate_tasks(&g, b).unwrap().remove(0);

        let mut materialized: HashMap<NodeId, ArrayDescriptor> = default();
        materialized.insert(a, g.node(a).unwrap().descriptor.clone());
        assert!(task.payload(&g, &materialized).is_err());

        let out = g.node(b).unwrap().descriptor.with_store(StoreRef::Key("b".into()));
        materialized.insert(b, out.clone());
        let payload = task.payload(&g, &materialized).unwrap();

        match payload.kind {
            PayloadKind::Blockwise { inputs, output, root } => {
                assert_eq!(inputs, vec![g.node(a).unwrap().descriptor.clone()]);
                assert_eq!(output, out);
                assert_eq!(root.to_string(), "neg(#0)");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
