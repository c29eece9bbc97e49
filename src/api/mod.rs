//! User-facing entry point of tessera.
use std::panic::{catch_unwind, AssertUnwindSafe, UnwindSafe};
use std::sync::Arc;

use crate::backend::{ExecutionBackend, LocalBackend};
use crate::driver::{Callback, Clock, Executor};
use crate::graph::OperationGraph;
use crate::planner::optimize_with;
use crate::prelude::*;
use crate::storage::{read_array, write_array, ChunkStore, MemoryStore};
use crate::types::{ArrayDescriptor, Config, NodeRef, RunError, RunReport};
use crate::worker::KernelRegistry;
use tessera_core::{DataType, Element};

/// Builds graphs with the engine's plan configuration and computes them on its backend.
pub struct Engine {
    config: Config,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn ChunkStore>,
    clock: Option<Arc<dyn Clock>>,
    callbacks: Vec<Arc<dyn Callback>>,
}

impl Engine {
    pub fn new(
        config: Config,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            clock: None,
            callbacks: vec![],
        }
    }

    /// Engine that keeps arrays in memory and runs tasks on a local thread pool.
    pub fn local(config: Config, kernels: KernelRegistry, num_threads: usize) -> Result<Self> {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new());
        let backend = LocalBackend::new(Arc::clone(&store), kernels, num_threads)?;

        Ok(Self::new(config, Arc::new(backend), store))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn ChunkStore {
        &*self.store
    }

    /// New, empty graph that uses the plan configuration of this engine.
    pub fn plan(&self) -> OperationGraph {
        OperationGraph::new(self.config.plan.clone())
    }

    /// Write `values` (row-major) to a new array in the engine's store and add it to `graph`
    /// as a source.
    pub fn source<T: Element>(
        &self,
        graph: &mut OperationGraph,
        shape: &[u64],
        chunks: &[u64],
        values: &[T],
    ) -> Result<NodeRef> {
        let desc = ArrayDescriptor::unallocated(shape, T::DATA_TYPE, chunks)?;
        let desc = write_array(&*self.store, &desc, values)?;

        Ok(graph.add_source(desc)?)
    }

    /// Descriptor of a blockwise output, for use with `add_blockwise`.
    pub fn output(&self, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<ArrayDescriptor> {
        Ok(ArrayDescriptor::unallocated(shape, dtype, chunks)?)
    }

    pub fn optimize(&self, graph: &OperationGraph) -> OperationGraph {
        optimize_with(graph, &self.config.plan.fusion)
    }

    /// Optimize and execute `graph`.
    pub fn compute(&self, graph: &OperationGraph) -> Result<RunReport, RunError> {
        let before = graph.stats();
        let optimized = self.optimize(graph);
        let after = optimized.stats();

        info!(
            "optimized graph: {} -> {} array(s), {} -> {} task(s)",
            before.num_arrays, after.num_arrays, before.num_tasks, after.num_tasks
        );

        self.execute(&optimized)
    }

    /// Execute `graph` as is, without fusing anything.
    pub fn execute(&self, graph: &OperationGraph) -> Result<RunReport, RunError> {
        let mut executor = Executor::new(
            self.config.executor.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
        );

        if let Some(clock) = &self.clock {
            executor = executor.with_clock(Arc::clone(clock));
        }

        for callback in &self.callbacks {
            executor = executor.with_callback(Arc::clone(callback));
        }

        executor.execute(graph)
    }

    /// Read the computed contents of `node`.
    pub fn read<T: Element>(&self, report: &RunReport, node: NodeRef) -> Result<Vec<T>> {
        let desc = report
            .descriptor(node)
            .ok_or_else(|| anyhow!("{} was not part of the computation", node))?;

        read_array(&*self.store, desc)
    }
}

/// Run `fun` against a local engine. A panic inside `fun` is reported as an error.
pub fn execute<F>(config: Config, kernels: KernelRegistry, fun: F) -> Result
where
    F: FnOnce(&Engine) -> Result + UnwindSafe,
{
    let engine = Engine::local(config, kernels, rayon::current_num_threads())?;

    match catch_unwind(AssertUnwindSafe(|| fun(&engine))) {
        Ok(result) => result,
        Err(_) => bail!("computation panicked"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::{ManualClock, TaskCounter};
    use crate::graph::{BlockMapping, Function};
    use crate::types::{NodeOutcome, PlanConfig};
    use std::io::{BufRead, BufReader};
    use std::time::Duration;

    fn engine() -> Engine {
        let mut config = Config::new(PlanConfig::new(100_000, 0), default());
        config.executor.poll_interval = Duration::from_millis(1);

        Engine::local(config, KernelRegistry::with_builtins(), 2).unwrap()
    }

    fn add_unary(engine: &Engine, g: &mut OperationGraph, name: &str, x: NodeRef) -> NodeRef {
        let desc = g.node(x).unwrap().descriptor.clone();
        let out = engine
            .output(desc.shape(), desc.dtype(), desc.chunks())
            .unwrap();

        g.add_blockwise(
            Function::new(name),
            &[x],
            vec![BlockMapping::identity(desc.ndim())],
            out,
        )
        .unwrap()
    }

    #[test]
    fn test_compute() {
        let engine = engine();
        let mut g = engine.plan();

        let values = (0..20).collect_vec();
        let x = engine.source::<i64>(&mut g, &[4, 5], &[2, 2], &values).unwrap();
        let y = add_unary(&engine, &mut g, "neg", x);
        let z = add_unary(&engine, &mut g, "abs", y);
        g.mark_terminal(z).unwrap();

        let report = engine.compute(&g).unwrap();
        assert!(report.is_success());

        // `neg` was fused into `abs`.
        assert!(report.node(y).is_none());
        assert_eq!(report.outcome(z), Some(NodeOutcome::Succeeded));
        assert_eq!(engine.read::<i64>(&report, z).unwrap(), values);

        let desc = report.descriptor(z).unwrap();
        assert_eq!(desc.shape(), &[4, 5]);
        assert_eq!(desc.chunks(), &[2, 2]);
    }

    #[test]
    fn test_optimized_matches_unoptimized() {
        let engine = engine();
        let mut g = engine.plan();

        let x = engine
            .source::<f64>(&mut g, &[6], &[4], &[1.0, 4.0, 9.0, 16.0, 25.0, 36.0])
            .unwrap();
        let y = add_unary(&engine, &mut g, "sqrt", x);
        let z = g.add_rechunk(y, &[3]).unwrap();
        let w = add_unary(&engine, &mut g, "neg", z);
        g.mark_terminal(w).unwrap();

        let fused = engine.compute(&g).unwrap();
        let plain = engine.execute(&g).unwrap();

        let expected = vec![-1.0, -2.0, -3.0, -4.0, -5.0, -6.0];
        assert_eq!(engine.read::<f64>(&fused, w).unwrap(), expected);
        assert_eq!(engine.read::<f64>(&plain, w).unwrap(), expected);
        assert_eq!(plain.outcome(y), Some(NodeOutcome::Succeeded));
    }

    #[test]
    fn test_callbacks_and_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let counter = Arc::new(TaskCounter::new());

        let mut engine = engine()
            .with_clock(Arc::new(ManualClock::new()))
            .with_callback(Arc::clone(&counter) as Arc<dyn Callback>);
        engine.config.executor.trace_file = Some(path.clone());

        let mut g = engine.plan();
        let x = engine.source::<i64>(&mut g, &[8], &[2], &[1; 8]).unwrap();
        let y = add_unary(&engine, &mut g, "neg", x);
        g.mark_terminal(y).unwrap();

        let report = engine.compute(&g).unwrap();
        assert_eq!(engine.read::<i64>(&report, y).unwrap(), vec![-1; 8]);
        assert_eq!(counter.succeeded(), 4);
        assert_eq!(counter.nodes(), 1);

        let lines = BufReader::new(std::fs::File::open(&path).unwrap())
            .lines()
            .count();
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_unknown_kernel() {
        let engine = engine();
        let mut g = engine.plan();

        let x = engine.source::<i64>(&mut g, &[4], &[2], &[1, 2, 3, 4]).unwrap();
        let y = add_unary(&engine, &mut g, "does_not_exist", x);
        g.mark_terminal(y).unwrap();

        let err = engine.compute(&g).unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.outcome(y), Some(NodeOutcome::Failed));
    }

    #[test]
    fn test_execute_catches_panic() {
        let config = Config::new(PlanConfig::new(100_000, 0), default());

        let result = execute(config.clone(), KernelRegistry::new(), |engine| {
            assert_eq!(engine.plan().len(), 0);
            Ok(())
        });
        assert!(result.is_ok());

        let result = execute(config, KernelRegistry::new(), |_| panic!("oops"));
        assert!(result.is_err());
    }
}
