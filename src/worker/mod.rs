//! Executes task payloads: reads input chunks, evaluates kernels and writes the output chunk.
mod copy;
mod kernel;

pub use self::copy::copy_region;
pub use self::kernel::{
    map_elements, zip_elements, Chunk, InvalidInput, Kernel, KernelContext, KernelRegistry,
};

use crate::graph::{Application, BlockExpr};
use crate::prelude::*;
use crate::storage::ChunkStore;
use crate::types::{ArrayDescriptor, PayloadKind, TaskError, TaskPayload, TaskResult, WorkerId};
use std::cell::Cell;
use tessera_core::Shape;

/// Keeps track of the bytes a task holds in memory and the highest value observed.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    current: Cell<u64>,
    peak: Cell<u64>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        default()
    }

    pub fn allocate(&self, nbytes: u64) {
        let current = self.current.get() + nbytes;
        self.current.set(current);
        self.peak.set(max(self.peak.get(), current));
    }

    pub fn release(&self, nbytes: u64) {
        self.current.set(self.current.get().saturating_sub(nbytes));
    }

    pub fn current(&self) -> u64 {
        self.current.get()
    }

    pub fn peak(&self) -> u64 {
        self.peak.get()
    }
}

struct TaskRun<'a> {
    store: &'a dyn ChunkStore,
    kernels: &'a KernelRegistry,
    tracker: MemoryTracker,
    bytes_read: u64,
    bytes_written: u64,
}

/// Execute a task payload and write its output chunk to `store`.
///
/// Storage and kernel failures are reported as transient errors. Unknown kernels and outputs
/// that do not match the declared chunk are fatal: retrying will not fix them.
pub fn execute_payload(
    payload: &TaskPayload,
    store: &dyn ChunkStore,
    kernels: &KernelRegistry,
    worker: WorkerId,
) -> Result<TaskResult, TaskError> {
    let task = &payload.task;
    trace!(
        "{} executing {} (attempt {}{})",
        worker,
        task.id,
        task.attempt,
        if payload.is_backup { ", backup" } else { "" }
    );

    let mut run = TaskRun {
        store,
        kernels,
        tracker: MemoryTracker::new(),
        bytes_read: 0,
        bytes_written: 0,
    };

    match &payload.kind {
        PayloadKind::Blockwise {
            inputs,
            output,
            root,
        } => run.blockwise(inputs, output, root, &task.output_chunk_index)?,
        PayloadKind::Rechunk { source, target } => {
            run.rechunk(source, target, &task.output_chunk_index)?
        }
    }

    Ok(TaskResult {
        worker,
        peak_mem: run.tracker.peak(),
        bytes_read: run.bytes_read,
        bytes_written: run.bytes_written,
    })
}

impl TaskRun<'_> {
    fn blockwise(
        &mut self,
        inputs: &[ArrayDescriptor],
        output: &ArrayDescriptor,
        root: &Application,
        coord: &[u64],
    ) -> Result<(), TaskError> {
        if !output.grid().contains_coord(coord) {
            return Err(TaskError::Fatal(format!(
                "chunk {:?} is outside the grid of the output",
                coord
            )));
        }

        let input_blocks = inputs.iter().map(|d| d.num_blocks()).collect_vec();
        let chunk = self.evaluate(root, coord, inputs, &input_blocks)?;

        if chunk.dtype() != output.dtype() {
            return Err(TaskError::Fatal(format!(
                "{} produced {} elements, expected {}",
                root.function.name,
                chunk.dtype(),
                output.dtype()
            )));
        }

        let nbytes = chunk.nbytes();
        self.write(output, coord, chunk.data())?;
        drop(chunk);
        self.tracker.release(nbytes);
        Ok(())
    }

    /// Evaluate block `coord` of `app`. The returned chunk is accounted for in the tracker
    /// until the caller releases it.
    fn evaluate(
        &mut self,
        app: &Application,
        coord: &[u64],
        inputs: &[ArrayDescriptor],
        input_blocks: &[Shape],
    ) -> Result<Chunk, TaskError> {
        let kernels = self.kernels;
        let kernel = kernels.get(&app.function.name).ok_or_else(|| {
            TaskError::Fatal(format!("unknown kernel {:?}", app.function.name))
        })?;

        let mut args = Vec::with_capacity(app.args.len());
        for arg in &app.args {
            let blocks = arg.expr.num_blocks(input_blocks);
            let mut chunks = vec![];

            for c in &arg.mapping.resolve(coord, &blocks) {
                let chunk = match &arg.expr {
                    BlockExpr::Input(slot) => self.read(&inputs[*slot], &c)?,
                    BlockExpr::Apply(inner) => self.evaluate(inner, &c, inputs, input_blocks)?,
                };

                chunks.push(chunk);
            }

            args.push(chunks);
        }

        let shape: Shape = app.grid.chunk_region(coord).extents();
        let result = {
            let params = &app.function.params;
            let mut ctx = KernelContext::new(coord, shape.clone(), app.dtype, params, &self.tracker);
            kernel.call(&mut ctx, &args)
        };

        let held: u64 = args.iter().flatten().map(Chunk::nbytes).sum();
        drop(args);
        self.tracker.release(held);

        let chunk = result.map_err(|e| {
            let message = format!("kernel {} failed: {:#}", app.function.name, e);

            if e.downcast_ref::<InvalidInput>().is_some() {
                TaskError::Fatal(message)
            } else {
                TaskError::Transient(message)
            }
        })?;

        if chunk.shape() != shape.as_slice() {
            return Err(TaskError::Fatal(format!(
                "kernel {} produced chunk of shape {:?}, expected {:?}",
                app.function.name,
                chunk.shape(),
                shape
            )));
        }

        self.tracker.allocate(chunk.nbytes());
        Ok(chunk)
    }

    fn rechunk(
        &mut self,
        source: &ArrayDescriptor,
        target: &ArrayDescriptor,
        coord: &[u64],
    ) -> Result<(), TaskError> {
        if source.shape() != target.shape() || source.dtype() != target.dtype() {
            return Err(TaskError::Fatal(format!(
                "cannot rechunk {:?} of {} into {:?} of {}",
                source.shape(),
                source.dtype(),
                target.shape(),
                target.dtype()
            )));
        }

        let item_size = target.dtype().size_in_bytes();
        let target_grid = target.grid();
        let source_grid = source.grid();
        let region = target_grid.chunk_region(coord);

        let nbytes = region.volume() * item_size as u64;
        let mut buffer = vec![0; nbytes as usize];
        self.tracker.allocate(nbytes);

        for c in &source_grid.blocks_overlapping(&region) {
            let src_region = source_grid.chunk_region(&c);
            let chunk = self.read(source, &c)?;

            if let Some(overlap) = src_region.intersection(&region) {
                copy_region(
                    chunk.data(),
                    &src_region,
                    &mut buffer,
                    &region,
                    &overlap,
                    item_size,
                );
            }

            self.tracker.release(chunk.nbytes());
        }

        self.write(target, coord, &buffer)?;
        self.tracker.release(nbytes);
        Ok(())
    }

    /// Read a chunk of `array`. The chunk is accounted for in the tracker until released.
    fn read(&mut self, array: &ArrayDescriptor, coord: &[u64]) -> Result<Chunk, TaskError> {
        let data = self
            .store
            .read_chunk(array.store(), coord)
            .map_err(|e| TaskError::Transient(format!("{:#}", e)))?;

        let shape = array.grid().chunk_region(coord).extents();
        let chunk = Chunk::new(&shape, array.dtype(), data)
            .map_err(|e| TaskError::Fatal(format!("chunk {:?} of {}: {}", coord, array.store(), e)))?;

        self.bytes_read += chunk.nbytes();
        self.tracker.allocate(chunk.nbytes());
        Ok(chunk)
    }

    /// Write the output chunk. The store receives its own copy of the bytes, which is accounted
    /// for while the write is in progress.
    fn write(&mut self, array: &ArrayDescriptor, coord: &[u64], data: &[u8]) -> Result<(), TaskError> {
        if !array.store().is_allocated() {
            return Err(TaskError::Fatal(format!(
                "output of chunk {:?} has no storage allocated",
                coord
            )));
        }

        let nbytes = data.len() as u64;
        self.tracker.allocate(nbytes);
        let result = self.store.write_chunk(array.store(), coord, data);
        self.tracker.release(nbytes);

        result.map_err(|e| TaskError::Transient(format!("{:#}", e)))?;
        self.bytes_written += nbytes;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{BlockArg, BlockMapping, Function};
    use crate::storage::{read_array, write_array, MemoryStore};
    use crate::types::{NodeId, Task, TaskId};
    use tessera_core::{ChunkGrid, DataType};

    fn array(store: &MemoryStore, shape: &[u64], chunks: &[u64], values: &[i64]) -> ArrayDescriptor {
        let desc = ArrayDescriptor::unallocated(shape, DataType::I64, chunks).unwrap();
        write_array(store, &desc, values).unwrap()
    }

    fn empty(store: &MemoryStore, shape: &[u64], chunks: &[u64]) -> ArrayDescriptor {
        let key = store.create_array(shape, DataType::I64, chunks).unwrap();
        ArrayDescriptor::unallocated(shape, DataType::I64, chunks)
            .unwrap()
            .with_store(key)
    }

    fn apply(name: &str, grid: &ChunkGrid, args: Vec<BlockArg>) -> Application {
        Application {
            function: Function::new(name),
            args,
            grid: grid.clone(),
            dtype: DataType::I64,
        }
    }

    fn leaf(slot: usize, ndim: usize) -> BlockArg {
        BlockArg {
            mapping: BlockMapping::identity(ndim),
            expr: BlockExpr::Input(slot),
        }
    }

    fn payload(coord: &[u64], kind: PayloadKind) -> TaskPayload {
        TaskPayload {
            task: Task {
                id: TaskId {
                    node: NodeId(1),
                    index: 0,
                },
                output_chunk_index: coord.iter().copied().collect(),
                inputs: vec![],
                attempt: 1,
                projected_mem: 0,
            },
            kind,
            avoid_worker: None,
            is_backup: false,
        }
    }

    #[test]
    fn test_fused_blockwise() {
        let store = MemoryStore::new();
        let kernels = KernelRegistry::with_builtins();
        let a = array(&store, &[3, 3], &[2, 2], &(0..9).collect_vec());
        let out = empty(&store, &[3, 3], &[2, 2]);

        // abs(neg(#0)) evaluated in one task.
        let inner = apply("neg", &out.grid(), vec![leaf(0, 2)]);
        let root = apply(
            "abs",
            &out.grid(),
            vec![BlockArg {
                mapping: BlockMapping::identity(2),
                expr: BlockExpr::Apply(Box::new(inner)),
            }],
        );

        for coord in out.grid().coords() {
            let kind = PayloadKind::Blockwise {
                inputs: vec![a.clone()],
                output: out.clone(),
                root: root.clone(),
            };

            let result = execute_payload(&payload(&coord, kind), &store, &kernels, WorkerId(3)).unwrap();
            let nbytes = out.grid().chunk_region(&coord).volume() * 8;
            assert_eq!(result.worker, WorkerId(3));
            assert_eq!(result.bytes_read, nbytes);
            assert_eq!(result.bytes_written, nbytes);

            // Input, decoded copy and output of each kernel.
            assert_eq!(result.peak_mem, 3 * nbytes);
        }

        assert_eq!(read_array::<i64>(&store, &out).unwrap(), (0..9).collect_vec());
    }

    #[test]
    fn test_contraction() {
        let store = MemoryStore::new();
        let kernels = KernelRegistry::with_builtins();
        let a = array(&store, &[4, 2], &[2, 2], &(0..8).collect_vec());
        let out = empty(&store, &[2], &[2]);

        let root = apply(
            "sum_blocks",
            &out.grid(),
            vec![BlockArg {
                mapping: BlockMapping::from_labels("j", "ij").unwrap(),
                expr: BlockExpr::Input(0),
            }],
        );

        let kind = PayloadKind::Blockwise {
            inputs: vec![a],
            output: out.clone(),
            root,
        };
        let result = execute_payload(&payload(&[0], kind), &store, &kernels, WorkerId(0));
        assert!(result.is_err());

        // Sum of the two row blocks: [[0, 1], [2, 3]] + [[4, 5], [6, 7]].
        let a = array(&store, &[4, 2], &[2, 2], &(0..8).collect_vec());
        let out = empty(&store, &[2, 2], &[2, 2]);
        let root = apply(
            "sum_blocks",
            &out.grid(),
            vec![BlockArg {
                mapping: BlockMapping::new(vec![
                    crate::graph::AxisMap::Contract,
                    crate::graph::AxisMap::Output(1),
                ]),
                expr: BlockExpr::Input(0),
            }],
        );

        let kind = PayloadKind::Blockwise {
            inputs: vec![a],
            output: out.clone(),
            root,
        };
        execute_payload(&payload(&[0, 0], kind), &store, &kernels, WorkerId(0)).unwrap();
        assert_eq!(read_array::<i64>(&store, &out).unwrap(), vec![4, 6, 8, 10]);
    }

    #[test]
    fn test_errors() {
        let store = MemoryStore::new();
        let kernels = KernelRegistry::with_builtins();
        let a = array(&store, &[2], &[2], &[1, 2]);
        let out = empty(&store, &[2], &[2]);
        let grid = out.grid();

        let kind = |name: &str, output: &ArrayDescriptor| PayloadKind::Blockwise {
            inputs: vec![a.clone()],
            output: output.clone(),
            root: apply(name, &grid, vec![leaf(0, 1)]),
        };

        let err = execute_payload(&payload(&[0], kind("fft", &out)), &store, &kernels, WorkerId(0));
        assert!(matches!(err, Err(TaskError::Fatal(_))));

        // The kernel rejects integer input, which no retry can fix.
        let err = execute_payload(&payload(&[0], kind("sqrt", &out)), &store, &kernels, WorkerId(0));
        assert!(matches!(err, Err(TaskError::Fatal(_))));

        let mut flaky = kernels.clone();
        flaky.register("flaky", |_: &mut KernelContext<'_>, _: &[Vec<Chunk>]| -> Result<Chunk> {
            bail!("connection reset")
        });
        let err = execute_payload(&payload(&[0], kind("flaky", &out)), &store, &flaky, WorkerId(0));
        assert!(matches!(err, Err(TaskError::Transient(_))));

        let unallocated = out.with_store(crate::types::StoreRef::Unallocated);
        let err = execute_payload(&payload(&[0], kind("neg", &unallocated)), &store, &kernels, WorkerId(0));
        assert!(matches!(err, Err(TaskError::Fatal(_))));

        let missing = empty(&store, &[2], &[2]);
        let kind = PayloadKind::Blockwise {
            inputs: vec![missing],
            output: out.clone(),
            root: apply("neg", &grid, vec![leaf(0, 1)]),
        };
        let err = execute_payload(&payload(&[0], kind), &store, &kernels, WorkerId(0));
        assert!(matches!(err, Err(TaskError::Transient(_))));
    }

    #[test]
    fn test_rechunk() {
        let store = MemoryStore::new();
        let kernels = KernelRegistry::new();
        let values = (0..30).collect_vec();
        let source = array(&store, &[5, 6], &[5, 1], &values);
        let target = empty(&store, &[5, 6], &[2, 4]);

        for coord in target.grid().coords() {
            let kind = PayloadKind::Rechunk {
                source: source.clone(),
                target: target.clone(),
            };

            let result = execute_payload(&payload(&coord, kind), &store, &kernels, WorkerId(0)).unwrap();
            let tgt = target.grid().chunk_region(&coord).volume() * 8;
            assert!(result.peak_mem <= 2 * tgt + 40);
        }

        assert_eq!(read_array::<i64>(&store, &target).unwrap(), values);
    }
}
