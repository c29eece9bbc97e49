//! Projection of the peak memory a single task needs.
//!
//! Every chunk that crosses the storage boundary is counted twice: once for the encoded buffer
//! that is transferred and once for the decoded chunk. All projections include the reserved
//! memory of the worker, so they can be compared directly against `allowed_mem`.
use crate::graph::{Application, BlockExpr};
use crate::types::{ArrayDescriptor, PlanError};
use tessera_core::Shape;

/// Number of copies of a chunk that are resident while it is read or written.
pub const BUFFER_COPIES: u64 = 2;

fn scaled(nbytes: u64, multiplier: f64) -> u64 {
    (nbytes as f64 * multiplier.max(0.0)).ceil() as u64
}

/// Projected memory of a blockwise task reading one chunk of each input and writing one output
/// chunk.
pub fn project_blockwise_mem(
    input_chunk_sizes: &[u64],
    output_chunk_size: u64,
    op_multiplier: f64,
    reserved_mem: u64,
) -> u64 {
    let inputs: u64 = input_chunk_sizes.iter().sum();

    reserved_mem
        + BUFFER_COPIES * inputs
        + scaled(output_chunk_size, op_multiplier)
        + output_chunk_size
}

/// Projected memory of a rechunk task. `max_stripe` is the largest total size of the source
/// chunks that overlap a single target chunk.
pub fn project_rechunk_mem(
    source_chunk_size: u64,
    target_chunk_size: u64,
    max_stripe: u64,
    reserved_mem: u64,
) -> u64 {
    reserved_mem + max_stripe + source_chunk_size + BUFFER_COPIES * target_chunk_size
}

/// Largest total size of the chunks of `source` that overlap one chunk of the `target_chunks`
/// chunking.
pub fn rechunk_stripe(source: &ArrayDescriptor, target_chunks: &[u64]) -> Result<u64, PlanError> {
    let target = source.with_chunks(target_chunks)?;
    let blocks = source.grid().max_blocks_per_chunk_of(&target.grid());

    Ok(blocks * source.chunk_nbytes())
}

/// Projected memory of a rechunk from the chunking of `source` to `target_chunks`.
pub fn project_rechunk(
    source: &ArrayDescriptor,
    target_chunks: &[u64],
    reserved_mem: u64,
) -> Result<u64, PlanError> {
    let target = source.with_chunks(target_chunks)?;
    let stripe = rechunk_stripe(source, target_chunks)?;

    Ok(project_rechunk_mem(
        source.chunk_nbytes(),
        target.chunk_nbytes(),
        stripe,
        reserved_mem,
    ))
}

/// Projected memory of a (possibly fused) blockwise expression. `inputs` holds the descriptor
/// of every input slot.
///
/// Leaves contribute every chunk they read twice, each application contributes its scaled
/// output chunk and its extra memory, and the root output chunk is counted once more for the
/// encoded write. For a single application this equals [`project_blockwise_mem`] plus the
/// function's extra memory.
pub fn project_application(app: &Application, inputs: &[&ArrayDescriptor], reserved_mem: u64) -> u64 {
    let input_blocks: Vec<Shape> = inputs.iter().map(|d| d.num_blocks()).collect();
    let input_sizes: Vec<u64> = inputs.iter().map(|d| d.chunk_nbytes()).collect();

    reserved_mem + app.chunk_nbytes() + project_subtree(app, 1, &input_blocks, &input_sizes)
}

fn project_subtree(app: &Application, count: u64, input_blocks: &[Shape], input_sizes: &[u64]) -> u64 {
    let mut total = count * (scaled(app.chunk_nbytes(), app.function.multiplier) + app.function.extra_mem);

    for arg in &app.args {
        let blocks = arg
            .mapping
            .blocks_per_output(&arg.expr.num_blocks(input_blocks));

        total += match &arg.expr {
            BlockExpr::Input(slot) => count * blocks * BUFFER_COPIES * input_sizes[*slot],
            BlockExpr::Apply(inner) => project_subtree(inner, count * blocks, input_blocks, input_sizes),
        };
    }

    total
}

pub(crate) fn check_allowed(
    op: &'static str,
    projected: u64,
    allowed: u64,
    reserved: u64,
) -> Result<(), PlanError> {
    if projected > allowed {
        Err(PlanError::MemoryExceeded {
            op,
            projected,
            allowed,
            reserved,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{BlockArg, BlockMapping, Function};
    use tessera_core::{ChunkGrid, DataType};

    #[test]
    fn test_blockwise_example() {
        // Two (3,3) int64 arrays chunked (2,2): every chunk holds 32 bytes.
        assert_eq!(project_blockwise_mem(&[32, 32], 32, 1.0, 0), 192);
        assert_eq!(project_blockwise_mem(&[32, 32], 32, 1.0, 8), 200);
        assert_eq!(project_blockwise_mem(&[], 10, 0.0, 0), 10);
    }

    #[test]
    fn test_monotonic() {
        let sizes = [0u64, 1, 7, 32, 1000];

        for &a in &sizes {
            for &b in &sizes {
                for &out in &sizes {
                    let base = project_blockwise_mem(&[a, b], out, 1.5, 3);
                    assert!(project_blockwise_mem(&[a + 1, b], out, 1.5, 3) >= base);
                    assert!(project_blockwise_mem(&[a, b + 1], out, 1.5, 3) >= base);
                    assert!(project_blockwise_mem(&[a, b], out + 1, 1.5, 3) >= base);
                    assert!(project_blockwise_mem(&[a, b], out, 2.0, 3) >= base);

                    let base = project_rechunk_mem(a, b, out, 3);
                    assert!(project_rechunk_mem(a + 1, b, out, 3) >= base);
                    assert!(project_rechunk_mem(a, b + 1, out, 3) >= base);
                    assert!(project_rechunk_mem(a, b, out + 1, 3) >= base);
                }
            }
        }
    }

    #[test]
    fn test_rechunk() {
        let source = ArrayDescriptor::unallocated(&[10, 10], DataType::F64, &[10, 1]).unwrap();
        assert_eq!(rechunk_stripe(&source, &[1, 10]).unwrap(), 800);
        assert_eq!(project_rechunk(&source, &[1, 10], 0).unwrap(), 800 + 80 + 160);
        assert!(project_rechunk(&source, &[1, 11], 0).is_err());
    }

    #[test]
    fn test_application_matches_single_op() {
        let a = ArrayDescriptor::unallocated(&[3, 3], DataType::I64, &[2, 2]).unwrap();
        let leaf = |slot| BlockArg {
            mapping: BlockMapping::identity(2),
            expr: BlockExpr::Input(slot),
        };

        let mut app = Application {
            function: Function::new("add"),
            args: vec![leaf(0), leaf(1)],
            grid: ChunkGrid::new(&[3, 3], &[2, 2]),
            dtype: DataType::I64,
        };

        assert_eq!(project_application(&app, &[&a, &a], 0), 192);

        app.function = Function::new("add").with_multiplier(2.0).with_extra_mem(5);
        assert_eq!(
            project_application(&app, &[&a, &a], 4),
            project_blockwise_mem(&[32, 32], 32, 2.0, 4) + 5
        );
    }

    #[test]
    fn test_application_contraction() {
        // Summing over the second axis reads three input blocks for each output block.
        let a = ArrayDescriptor::unallocated(&[4, 6], DataType::F32, &[2, 2]).unwrap();
        let app = Application {
            function: Function::new("sum"),
            args: vec![BlockArg {
                mapping: BlockMapping::from_labels("i", "ij").unwrap(),
                expr: BlockExpr::Input(0),
            }],
            grid: ChunkGrid::new(&[4], &[2]),
            dtype: DataType::F32,
        };

        assert_eq!(project_application(&app, &[&a], 0), 3 * 2 * 16 + 8 + 8);
    }
}
