use super::callback::Callback;
use super::clock::{Clock, SystemClock};
use super::trace::RunTrace;
use crate::backend::{ExecutionBackend, TaskHandle, TaskStatus};
use crate::graph::{GraphNode, OperationGraph};
use crate::planner::payload_kind;
use crate::prelude::*;
use crate::storage::ChunkStore;
use crate::types::{
    ArrayDescriptor, ExecutorConfig, FailurePolicy, NodeFailure, NodeId, NodeOutcome, NodeReport,
    PayloadKind, PlanError, RunError, RunReport, Task, TaskError, TaskExhaustedError, TaskOutcome,
    TaskPayload, TaskRecord, TaskResult, WorkerId,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Runs the tasks of an operation graph on an execution backend, node by node in topological
/// order.
pub struct Executor {
    config: ExecutorConfig,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn ChunkStore>,
    clock: Arc<dyn Clock>,
    callbacks: Vec<Arc<dyn Callback>>,
}

struct RunState {
    report: RunReport,
    materialized: HashMap<NodeId, ArrayDescriptor>,

    /// Nodes that failed or were cancelled. Their dependents cannot run.
    blocked: HashSet<NodeId>,
    failures: Vec<NodeFailure>,
    stopped: bool,
    rng: SmallRng,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            clock: Arc::new(SystemClock::new()),
            callbacks: vec![],
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute every node needed for the terminals of `graph`.
    ///
    /// Returns the run report if every required node succeeded. Otherwise the report is part
    /// of the error, together with the reason each failed node failed.
    pub fn execute(&self, graph: &OperationGraph) -> Result<RunReport, RunError> {
        self.config
            .validate()
            .map_err(|e| RunError::InvalidConfig(format!("{:#}", e)))?;
        graph.validate()?;

        let mut trace = match &self.config.trace_file {
            Some(path) => match RunTrace::new(path) {
                Ok(trace) => Some(trace),
                Err(e) => {
                    warn!("tracing disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };

        if let Some(trace) = &mut trace {
            trace.add_graph(graph);
        }

        for callback in &self.callbacks {
            callback.on_compute_start(graph);
        }

        let start = self.clock.now();
        let required = graph.required_nodes();
        let mut run = RunState {
            report: default(),
            materialized: default(),
            blocked: default(),
            failures: vec![],
            stopped: false,
            rng: SmallRng::from_entropy(),
        };

        for node in graph.nodes() {
            let outcome = if node.op.is_source() {
                run.materialized.insert(node.id, node.descriptor.clone());
                NodeOutcome::Materialized
            } else if required.contains(&node.id) {
                NodeOutcome::Cancelled
            } else {
                NodeOutcome::Skipped
            };

            run.report
                .nodes
                .insert(node.id, node_report(node, outcome, node.descriptor.clone()));
        }

        info!(
            "executing {} of {} node(s) on {} backend",
            required.len(),
            graph.len(),
            self.backend.name()
        );

        for &id in &required {
            let node = graph.require(id)?;
            if node.op.is_source() {
                continue;
            }

            if run.stopped || any(node.op.inputs(), |input| run.blocked.contains(input)) {
                debug!("{} is cancelled", id);
                run.blocked.insert(id);
                continue;
            }

            self.run_node(graph, node, &mut run)?;
        }

        let mut report = run.report;
        report.wall_time = self.clock.now().saturating_sub(start);
        report.log_summary();

        if let Some(trace) = &mut trace {
            trace.add_report(&report);
        }

        for callback in &self.callbacks {
            callback.on_compute_end(&report);
        }

        if run.failures.is_empty() {
            Ok(report)
        } else {
            Err(RunError::Failed {
                report: Box::new(report),
                failures: run.failures,
            })
        }
    }

    fn run_node(
        &self,
        graph: &OperationGraph,
        node: &GraphNode,
        run: &mut RunState,
    ) -> Result<(), PlanError> {
        info!(
            "computing {} = {} ({} task(s))",
            node.id,
            node.op.label(),
            node.num_tasks
        );

        for callback in &self.callbacks {
            callback.on_node_start(node);
        }

        let start = self.clock.now();
        let (outcome, records, descriptor) = match self.allocate(node) {
            Ok(descriptor) => {
                run.materialized.insert(node.id, descriptor.clone());
                let tasks = graph.generate_tasks(node.id)?;
                let kind = payload_kind(graph, node.id, &run.materialized)?;

                let mut exec = NodeExecution::new(self, tasks, kind, &mut run.rng);
                let result = exec.run();
                (result, exec.into_records(), descriptor)
            }
            Err(e) => (
                Err(format!("failed to allocate storage: {:#}", e)),
                vec![],
                node.descriptor.clone(),
            ),
        };

        for record in &records {
            for callback in &self.callbacks {
                callback.on_task_end(record);
            }
        }

        let mut report = node_report(
            node,
            if outcome.is_ok() {
                NodeOutcome::Succeeded
            } else {
                NodeOutcome::Failed
            },
            descriptor,
        );
        report.peak_mem_observed = records
            .iter()
            .map(|r| r.peak_mem_observed)
            .max()
            .unwrap_or(0);
        report.wall_time = self.clock.now().saturating_sub(start);

        if let Err(reason) = outcome {
            error!("{} failed: {}", node.id, reason);

            let failed_tasks = records
                .iter()
                .filter(|r| r.outcome == TaskOutcome::Failed)
                .filter_map(|r| r.last_error.clone().map(|e| (r.task_id, e)))
                .collect();

            run.failures.push(NodeFailure {
                node: node.id,
                reason,
                failed_tasks,
            });
            run.blocked.insert(node.id);

            if self.config.failure_policy == FailurePolicy::FailFast {
                run.stopped = true;
            }
        }

        for callback in &self.callbacks {
            callback.on_node_end(&report);
        }

        run.report.tasks.extend(records);
        run.report.nodes.insert(node.id, report);
        Ok(())
    }

    fn allocate(&self, node: &GraphNode) -> Result<ArrayDescriptor> {
        let desc = &node.descriptor;
        if desc.store().is_allocated() {
            return Ok(desc.clone());
        }

        let store = self
            .store
            .create_array(desc.shape(), desc.dtype(), desc.chunks())?;
        debug!("allocated {} for {}", store, node.id);
        Ok(desc.with_store(store))
    }
}

fn node_report(node: &GraphNode, outcome: NodeOutcome, descriptor: ArrayDescriptor) -> NodeReport {
    NodeReport {
        node_id: node.id,
        op_name: node.op.name().to_string(),
        outcome,
        num_tasks: node.num_tasks,
        projected_mem: node.projected_mem_per_task,
        peak_mem_observed: 0,
        wall_time: Duration::default(),
        descriptor,
    }
}

#[derive(Copy, Clone, Debug)]
struct Attempt {
    handle: TaskHandle,
    started: Duration,
    is_backup: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    /// Waiting to be (re)submitted.
    Pending,

    /// At least one attempt is running.
    Active,
    Succeeded,
    Failed,
}

struct TaskState {
    task: Task,
    phase: Phase,
    attempts: u32,
    backups: u32,
    running: Vec<Attempt>,
    not_before: Duration,
    first_start: Option<Duration>,
    finished: Option<Duration>,
    worker: Option<WorkerId>,
    peak_mem: u64,
    backup_won: bool,
    last_error: Option<TaskError>,
}

/// Drives the tasks of a single node to completion.
struct NodeExecution<'a> {
    executor: &'a Executor,
    kind: PayloadKind,
    tasks: Vec<TaskState>,
    num_running: usize,

    /// Durations of the winning attempts of finished tasks.
    durations: Vec<Duration>,
    rng: &'a mut SmallRng,
    fatal: Option<String>,
}

impl<'a> NodeExecution<'a> {
    fn new(
        executor: &'a Executor,
        tasks: Vec<Task>,
        kind: PayloadKind,
        rng: &'a mut SmallRng,
    ) -> Self {
        let tasks = tasks
            .into_iter()
            .map(|task| TaskState {
                task,
                phase: Phase::Pending,
                attempts: 0,
                backups: 0,
                running: vec![],
                not_before: Duration::default(),
                first_start: None,
                finished: None,
                worker: None,
                peak_mem: 0,
                backup_won: false,
                last_error: None,
            })
            .collect();

        Self {
            executor,
            kind,
            tasks,
            num_running: 0,
            durations: vec![],
            rng,
            fatal: None,
        }
    }

    fn config(&self) -> &'a ExecutorConfig {
        &self.executor.config
    }

    fn backend(&self) -> &'a dyn ExecutionBackend {
        &*self.executor.backend
    }

    fn now(&self) -> Duration {
        self.executor.clock.now()
    }

    fn capacity(&self) -> usize {
        max(self.backend().max_concurrency(), 1)
    }

    /// Run until every task succeeded (`Ok`) or the node failed (`Err` with the reason).
    fn run(&mut self) -> Result<(), String> {
        loop {
            self.launch_pending();

            if let Some(reason) = self.fatal.take() {
                self.cancel_all();
                return Err(reason);
            }

            if all(&self.tasks, |t| t.phase == Phase::Succeeded) {
                return Ok(());
            }

            self.executor.clock.sleep(self.config().poll_interval);
            self.poll_attempts();

            if let Some(reason) = self.fatal.take() {
                self.cancel_all();
                return Err(reason);
            }

            if self.config().stragglers_enabled {
                self.launch_backups();
            }
        }
    }

    fn launch_pending(&mut self) {
        let now = self.now();

        for index in 0..self.tasks.len() {
            if self.num_running >= self.capacity() || self.fatal.is_some() {
                break;
            }

            let state = &self.tasks[index];
            if state.phase == Phase::Pending && state.not_before <= now {
                self.submit(index, false);
            }
        }
    }

    /// Launch a backup for every task whose only running attempt has run much longer than the
    /// finished tasks of this node took on average.
    fn launch_backups(&mut self) {
        if self.durations.is_empty() {
            return;
        }

        let mean = self.durations.iter().sum::<Duration>() / self.durations.len() as u32;
        let threshold = mean.mul_f64(self.config().straggler_threshold_multiplier);
        let now = self.now();

        for index in 0..self.tasks.len() {
            if self.num_running >= self.capacity() {
                break;
            }

            let state = &self.tasks[index];
            if state.phase != Phase::Active || state.running.len() != 1 {
                continue;
            }

            let elapsed = now.saturating_sub(state.running[0].started);
            if elapsed > threshold {
                info!(
                    "{} has run for {:?} (threshold {:?}), launching backup",
                    state.task.id, elapsed, threshold
                );

                self.submit(index, true);
            }
        }
    }

    fn submit(&mut self, index: usize, is_backup: bool) {
        let now = self.now();
        let backend = self.backend();
        let state = &mut self.tasks[index];

        if is_backup {
            state.backups += 1;
        } else {
            state.attempts += 1;
        }

        let mut task = state.task.clone();
        task.attempt = state.attempts;

        let avoid_worker = if is_backup {
            state
                .running
                .first()
                .and_then(|attempt| backend.placement(attempt.handle))
        } else {
            None
        };

        let payload = TaskPayload {
            task,
            kind: self.kind.clone(),
            avoid_worker,
            is_backup,
        };

        state.first_start.get_or_insert(now);

        match backend.submit(payload) {
            Ok(handle) => {
                trace!("submitted {} as {:?}", state.task.id, handle);
                state.running.push(Attempt {
                    handle,
                    started: now,
                    is_backup,
                });
                state.phase = Phase::Active;
                self.num_running += 1;
            }
            Err(e) => {
                let error = TaskError::Transient(format!("submission failed: {:#}", e));
                self.attempt_failed(index, error);
            }
        }
    }

    fn poll_attempts(&mut self) {
        let now = self.now();
        let backend = self.backend();
        let timeout = self.config().task_timeout;

        for index in 0..self.tasks.len() {
            if self.fatal.is_some() {
                break;
            }

            let mut i = 0;
            while i < self.tasks[index].running.len() {
                let attempt = self.tasks[index].running[i];
                let status = backend.poll(attempt.handle).unwrap_or_else(|e| {
                    TaskStatus::Failed(TaskError::Transient(format!("lost attempt: {:#}", e)))
                });

                match status {
                    TaskStatus::Running => {
                        let elapsed = now.saturating_sub(attempt.started);

                        match timeout {
                            Some(timeout) if elapsed > timeout => {
                                self.cancel_attempt(attempt.handle);
                                self.remove_attempt(index, i);
                                self.attempt_failed(index, TaskError::Timeout(timeout));
                            }
                            _ => i += 1,
                        }
                    }
                    TaskStatus::Succeeded(result) => {
                        self.remove_attempt(index, i);
                        self.attempt_succeeded(index, attempt, result);
                    }
                    TaskStatus::Failed(error) => {
                        self.remove_attempt(index, i);
                        self.attempt_failed(index, error);
                    }
                }
            }
        }
    }

    fn remove_attempt(&mut self, index: usize, i: usize) {
        self.tasks[index].running.remove(i);
        self.num_running -= 1;
    }

    fn attempt_succeeded(&mut self, index: usize, attempt: Attempt, result: TaskResult) {
        let projected = self.tasks[index].task.projected_mem;

        if result.peak_mem > projected {
            self.tasks[index].peak_mem = result.peak_mem;
            let error = TaskError::RuntimeMemoryExceeded {
                observed: result.peak_mem,
                projected,
            };

            self.attempt_failed(index, error);
            return;
        }

        self.cancel_running(index);

        let now = self.now();
        let state = &mut self.tasks[index];
        state.phase = Phase::Succeeded;
        state.finished = Some(now);
        state.worker = Some(result.worker);
        state.peak_mem = result.peak_mem;
        state.backup_won = attempt.is_backup;

        debug!(
            "{} succeeded on {} (peak {} of {} bytes{})",
            state.task.id,
            result.worker,
            result.peak_mem,
            projected,
            if attempt.is_backup { ", backup" } else { "" }
        );

        self.durations.push(now.saturating_sub(attempt.started));
    }

    /// Handle a failed attempt that has already been removed from the running attempts.
    fn attempt_failed(&mut self, index: usize, error: TaskError) {
        let now = self.now();
        let max_attempts = self.config().max_attempts;
        let backoff = self.backoff(self.tasks[index].attempts);
        let state = &mut self.tasks[index];

        warn!(
            "attempt {} of {} failed: {}",
            state.attempts, state.task.id, error
        );
        state.last_error = Some(error.clone());

        let reason = if !error.is_retryable() {
            format!("task {} failed: {}", state.task.id, error)
        } else if !state.running.is_empty() {
            // Another attempt of this task may still succeed.
            return;
        } else if state.attempts < max_attempts {
            state.phase = Phase::Pending;
            state.not_before = now + backoff;
            return;
        } else {
            TaskExhaustedError {
                task: state.task.id,
                attempts: state.attempts,
                last_error: error,
            }
            .to_string()
        };

        state.phase = Phase::Failed;
        state.finished = Some(now);
        self.cancel_running(index);
        self.fatal.get_or_insert(reason);
    }

    /// Delay before the next attempt: linear in the number of attempts so far, plus up to 50%
    /// jitter.
    fn backoff(&mut self, attempts: u32) -> Duration {
        let base = self.config().retry_backoff * attempts;
        if base == Duration::default() {
            return base;
        }

        base.mul_f64(1.0 + self.rng.gen_range(0.0..0.5))
    }

    fn cancel_attempt(&self, handle: TaskHandle) {
        if let Err(e) = self.backend().cancel(handle) {
            warn!("failed to cancel {:?}: {:#}", handle, e);
        }
    }

    fn cancel_running(&mut self, index: usize) {
        for attempt in take(&mut self.tasks[index].running) {
            trace!("cancelling {:?} of {}", attempt.handle, self.tasks[index].task.id);
            self.cancel_attempt(attempt.handle);
            self.num_running -= 1;
        }
    }

    fn cancel_all(&mut self) {
        for index in 0..self.tasks.len() {
            self.cancel_running(index);
        }
    }

    fn into_records(self) -> Vec<TaskRecord> {
        let now = self.now();

        self.tasks
            .into_iter()
            .map(|state| {
                let outcome = match state.phase {
                    Phase::Succeeded => TaskOutcome::Succeeded,
                    Phase::Failed => TaskOutcome::Failed,
                    Phase::Pending | Phase::Active => TaskOutcome::Cancelled,
                };

                let end = state.finished.unwrap_or(now);
                let start = state.first_start.unwrap_or(end);

                TaskRecord {
                    task_id: state.task.id,
                    outcome,
                    attempts_used: state.attempts,
                    backups_launched: state.backups,
                    backup_won: state.backup_won,
                    worker: state.worker,
                    projected_mem: state.task.projected_mem,
                    peak_mem_observed: state.peak_mem,
                    wall_time: end.saturating_sub(start),
                    last_error: state.last_error,
                }
            })
            .collect()
    }
}
