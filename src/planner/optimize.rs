//! Fusion of blockwise operations.
//!
//! A blockwise node `B` is fused into its consumer `C` by substituting the expression of `B` for
//! every leaf of `C` that reads `B`. The fused node keeps the identifier, descriptor and output
//! grid of `C`, and reads the inputs of `B` directly. Rechunk and source nodes are never fused.
use crate::graph::{BlockwiseOp, Operation, OperationGraph};
use crate::prelude::*;
use crate::types::{FusionConfig, NodeId, PlanError};

/// Fuse the graph using the fusion settings of its plan configuration.
pub fn optimize(graph: &OperationGraph) -> OperationGraph {
    let fusion = graph.config().fusion.clone();
    optimize_with(graph, &fusion)
}

/// Fuse the graph in a single pass over its nodes in topological order. Every blockwise node
/// greedily absorbs fusable predecessors (lowest node id first) until none are left, so the
/// result is a fixed point: optimizing it again changes nothing.
pub fn optimize_with(graph: &OperationGraph, fusion: &FusionConfig) -> OperationGraph {
    let mut out = graph.clone();
    if !fusion.enabled {
        return out;
    }

    let before = out.stats();
    let order = out.nodes().map(|n| n.id).collect_vec();

    for consumer in order {
        if let Some(only) = &fusion.only_fuse {
            if !only.contains(&consumer) {
                continue;
            }
        }

        if fusion.never_fuse.contains(&consumer) {
            continue;
        }

        while let Some((producer, fused, projected)) = next_fusion(&out, consumer, fusion) {
            debug!(
                "fusing {} into {}: {} (projected memory {})",
                producer, consumer, fused.root, projected
            );

            if let Some(node) = out.node_mut(consumer) {
                node.op = Operation::Blockwise(fused);
                node.projected_mem_per_task = projected;
            }

            out.remove_node(producer);
        }
    }

    let after = out.stats();
    info!(
        "optimized graph: {} -> {} arrays, {} -> {} tasks",
        before.num_arrays, after.num_arrays, before.num_tasks, after.num_tasks
    );

    out
}

/// The first predecessor of `consumer` (in node id order) that can be fused into it, together
/// with the fused operation.
fn next_fusion(
    graph: &OperationGraph,
    consumer: NodeId,
    fusion: &FusionConfig,
) -> Option<(NodeId, BlockwiseOp, u64)> {
    let op = graph.node(consumer)?.op.as_blockwise()?;
    let mut candidates = op.inputs.clone();
    candidates.sort();

    for producer in candidates {
        if !is_candidate(graph, producer, consumer, fusion) {
            continue;
        }

        let fused = match fuse_ops(graph, producer, consumer) {
            Ok(fused) => fused,
            Err(e) => {
                debug!("cannot fuse {} into {}: {}", producer, consumer, e);
                continue;
            }
        };

        if let Some(limit) = fusion.max_total_source_arrays {
            if op.inputs.len() > 1 && fused.inputs.len() > limit {
                trace!(
                    "not fusing {} into {}: {} source arrays exceeds limit of {}",
                    producer,
                    consumer,
                    fused.inputs.len(),
                    limit
                );
                continue;
            }
        }

        let projected = match graph.project_blockwise(&fused) {
            Ok(p) => p,
            Err(_) => continue,
        };

        if projected > graph.config().allowed_mem {
            trace!(
                "not fusing {} into {}: projected memory {} exceeds allowed_mem {}",
                producer,
                consumer,
                projected,
                graph.config().allowed_mem
            );
            continue;
        }

        return Some((producer, fused, projected));
    }

    None
}

fn is_candidate(graph: &OperationGraph, producer: NodeId, consumer: NodeId, fusion: &FusionConfig) -> bool {
    let node = match graph.node(producer) {
        Some(node) => node,
        None => return false,
    };

    matches!(node.op, Operation::Blockwise(_))
        && !graph.is_terminal(producer)
        && !fusion.never_fuse.contains(&producer)
        && graph.consumers(producer) == [consumer]
}

/// Build the operation that results from fusing `producer` into `consumer`. The inputs of the
/// fused operation are the remaining inputs of `consumer` followed by any new inputs of
/// `producer`.
pub(crate) fn fuse_ops(
    graph: &OperationGraph,
    producer: NodeId,
    consumer: NodeId,
) -> Result<BlockwiseOp, PlanError> {
    let not_blockwise = |id: NodeId| PlanError::GraphValidation(format!("{} is not blockwise", id));
    let inner = graph
        .require(producer)?
        .op
        .as_blockwise()
        .ok_or_else(|| not_blockwise(producer))?;
    let outer = graph
        .require(consumer)?
        .op
        .as_blockwise()
        .ok_or_else(|| not_blockwise(consumer))?;

    let fused_slot = outer.inputs.iter().position(|&i| i == producer).ok_or_else(|| {
        PlanError::GraphValidation(format!("{} does not read {}", consumer, producer))
    })?;

    let mut inputs = vec![];
    let mut outer_slots = vec![usize::MAX; outer.inputs.len()];
    for (slot, &id) in enumerate(&outer.inputs) {
        if slot != fused_slot {
            outer_slots[slot] = inputs.len();
            inputs.push(id);
        }
    }

    let mut inner_slots = vec![];
    for &id in &inner.inputs {
        let slot = match inputs.iter().position(|&i| i == id) {
            Some(slot) => slot,
            None => {
                inputs.push(id);
                inputs.len() - 1
            }
        };

        inner_slots.push(slot);
    }

    let mut replacement = inner.root.clone();
    replacement.remap_slots(&|s| inner_slots[s]);

    // Leaves reading the producer keep the placeholder slot until they are substituted.
    let mut root = outer.root.clone();
    root.remap_slots(&|s| outer_slots[s]);
    root.substitute(usize::MAX, &replacement);

    Ok(BlockwiseOp { inputs, root })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{binary, output, source, unary};
    use crate::graph::{BlockMapping, Function};
    use crate::types::PlanConfig;

    fn graph(allowed_mem: u64) -> OperationGraph {
        OperationGraph::new(PlanConfig::new(allowed_mem, 0))
    }

    fn label(graph: &OperationGraph, id: NodeId) -> String {
        graph.node(id).unwrap().op.label()
    }

    #[test]
    fn test_fuse_chain() {
        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[3, 3], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        let d = unary(&mut g, "sqrt", c);
        g.mark_terminal(d).unwrap();

        let opt = optimize(&g);
        assert_eq!(opt.len(), 2);
        assert_eq!(label(&opt, d), "sqrt(abs(neg(#0)))");
        assert_eq!(opt.node(d).unwrap().op.inputs(), &[a]);
        assert_eq!(opt.node(d).unwrap().descriptor, g.node(d).unwrap().descriptor);
        assert_eq!(opt.stats().num_tasks, 4);
        assert_eq!(g.stats().num_tasks, 12);

        // 32 byte chunks: the write, three applications and a doubled read.
        assert_eq!(opt.node(d).unwrap().projected_mem_per_task, 32 + 3 * 32 + 64);
        assert!(opt.validate().is_ok());
    }

    #[test]
    fn test_idempotent() {
        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[4, 4], &[2, 2]);
        let x = source(&mut g, "x", &[4, 4], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let c = binary(&mut g, "add", b, x);
        let d = unary(&mut g, "abs", b);
        let e = binary(&mut g, "mul", c, d);
        let f = unary(&mut g, "sqrt", e);
        g.mark_terminal(f).unwrap();

        let once = optimize(&g);
        let twice = optimize(&once);
        assert_eq!(once, twice);

        // Once `c` and `d` are absorbed by `e`, `e` is the only consumer of `b`.
        assert_eq!(once.len(), 3);
        assert_eq!(once.node(f).unwrap().op.inputs(), &[x, a]);
        assert_eq!(
            label(&once, f),
            "sqrt(mul(add(neg(#1), #0), abs(neg(#1))))"
        );
    }

    #[test]
    fn test_terminal_and_multiple_consumers() {
        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[4], &[2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        let d = unary(&mut g, "sqrt", b);
        g.mark_terminal(c).unwrap();
        g.mark_terminal(d).unwrap();

        let opt = optimize(&g);
        assert_eq!(opt, g);

        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[4], &[2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        g.mark_terminal(b).unwrap();
        g.mark_terminal(c).unwrap();
        assert_eq!(optimize(&g), g);
    }

    #[test]
    fn test_memory_limit() {
        // Unfused nodes project 128 bytes, the fused node would project 160 bytes.
        let mut g = graph(150);
        let a = source(&mut g, "a", &[3, 3], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        g.mark_terminal(c).unwrap();

        assert_eq!(optimize(&g), g);

        let mut g = graph(160);
        let a = source(&mut g, "a", &[3, 3], &[2, 2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        g.mark_terminal(c).unwrap();
        assert_eq!(optimize(&g).len(), 2);
    }

    fn fan_in(g: &mut OperationGraph, n: usize) -> (Vec<NodeId>, NodeId) {
        let sources = (0..n)
            .map(|i| source(g, &format!("s{}", i), &[4], &[2]))
            .collect_vec();
        let negs = sources.iter().map(|&s| unary(g, "neg", s)).collect_vec();
        let mappings = vec![BlockMapping::identity(1); n];
        let sum = g
            .add_blockwise(Function::new("sum"), &negs, mappings, output(&[4], &[2]))
            .unwrap();
        g.mark_terminal(sum).unwrap();
        (sources, sum)
    }

    #[test]
    fn test_fan_in_limit() {
        let mut g = graph(100_000);
        let (_, sum) = fan_in(&mut g, 3);
        let opt = optimize(&g);
        assert_eq!(opt.len(), 4);
        assert_eq!(label(&opt, sum), "sum(neg(#0), neg(#1), neg(#2))");

        // Every single fusion would leave five source arrays.
        let mut g = graph(100_000);
        let _ = fan_in(&mut g, 5);
        assert_eq!(optimize(&g), g);

        let opt = optimize_with(&g, &FusionConfig::fuse_all());
        assert_eq!(opt.len(), 6);
    }

    #[test]
    fn test_unary_consumer_ignores_fan_in() {
        let mut g = graph(100_000);
        let sources = (0..5)
            .map(|i| source(&mut g, &format!("s{}", i), &[4], &[2]))
            .collect_vec();
        let mappings = vec![BlockMapping::identity(1); 5];
        let sum = g
            .add_blockwise(Function::new("sum"), &sources, mappings, output(&[4], &[2]))
            .unwrap();
        let sq = unary(&mut g, "sq", sum);
        g.mark_terminal(sq).unwrap();

        let opt = optimize(&g);
        assert_eq!(opt.len(), 6);
        assert_eq!(opt.node(sq).unwrap().op.inputs(), sources.as_slice());
    }

    #[test]
    fn test_repeated_argument() {
        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[4], &[2]);
        let b = unary(&mut g, "neg", a);
        let c = binary(&mut g, "mul", b, b);
        g.mark_terminal(c).unwrap();

        let opt = optimize(&g);
        assert_eq!(opt.len(), 2);
        assert_eq!(label(&opt, c), "mul(neg(#0), neg(#0))");
    }

    #[test]
    fn test_selective_fusion() {
        let mut g = graph(10_000);
        let a = source(&mut g, "a", &[4], &[2]);
        let b = unary(&mut g, "neg", a);
        let c = unary(&mut g, "abs", b);
        let d = unary(&mut g, "sqrt", c);
        g.mark_terminal(d).unwrap();

        let never = FusionConfig {
            never_fuse: vec![b],
            ..FusionConfig::default()
        };
        let opt = optimize_with(&g, &never);
        assert_eq!(opt.len(), 3);
        assert_eq!(label(&opt, d), "sqrt(abs(#0))");

        let only = FusionConfig {
            only_fuse: Some(vec![c]),
            ..FusionConfig::default()
        };
        let opt = optimize_with(&g, &only);
        assert_eq!(opt.len(), 3);
        assert_eq!(label(&opt, c), "abs(neg(#0))");

        assert_eq!(optimize_with(&g, &FusionConfig::disabled()), g);
    }

    #[test]
    fn test_rechunk_not_fused() {
        let mut g = graph(100_000);
        let a = source(&mut g, "a", &[4, 4], &[4, 1]);
        let b = unary(&mut g, "neg", a);
        let c = g.add_rechunk(b, &[1, 4]).unwrap();
        let d = unary(&mut g, "abs", c);
        g.mark_terminal(d).unwrap();

        assert_eq!(optimize(&g), g);
    }
}
