use super::{ExecutionBackend, TaskHandle, TaskStatus};
use crate::prelude::*;
use crate::storage::ChunkStore;
use crate::types::{StoreRef, TaskError, TaskPayload, TaskResult, WorkerId};
use crate::worker::{execute_payload, KernelRegistry};
use bincode::Options;
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{unbounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tessera_core::DataType;

type Completion = (TaskHandle, Result<TaskResult, TaskError>);

fn serialize<S>(msg: &S) -> bincode::Result<Vec<u8>>
where
    S: Serialize,
{
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .serialize(msg)
}

fn deserialize<D>(buffer: &[u8]) -> bincode::Result<D>
where
    D: DeserializeOwned,
{
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .deserialize(buffer)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Queued,
    Running,

    /// Cancelled before it started. The job is skipped.
    Cancelled,

    /// Cancelled while running. The thread stays busy until the job returns, but the job may
    /// no longer touch storage.
    Abandoned,
    Done,
}

struct AttemptControl {
    phase: Mutex<Phase>,
    worker: AtomicCell<Option<WorkerId>>,
}

impl AttemptControl {
    fn check(&self) -> Result {
        if *self.phase.lock() == Phase::Abandoned {
            bail!("attempt was cancelled");
        }

        Ok(())
    }
}

/// Store as seen by one attempt: refuses every access once the attempt is abandoned, so a
/// cancelled attempt never writes after its replacement.
struct AttemptStore<'a> {
    inner: &'a dyn ChunkStore,
    control: &'a AttemptControl,
}

impl ChunkStore for AttemptStore<'_> {
    fn create_array(&self, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<StoreRef> {
        self.control.check()?;
        self.inner.create_array(shape, dtype, chunks)
    }

    fn read_chunk(&self, store: &StoreRef, coord: &[u64]) -> Result<Vec<u8>> {
        self.control.check()?;
        self.inner.read_chunk(store, coord)
    }

    fn write_chunk(&self, store: &StoreRef, coord: &[u64], data: &[u8]) -> Result {
        self.control.check()?;
        self.inner.write_chunk(store, coord, data)
    }
}

struct Slot {
    status: TaskStatus,
    control: Arc<AttemptControl>,
}

/// Backend that runs tasks on a local thread pool. Every thread acts as one worker. Payloads
/// are serialized on submission so a task sees exactly what a remote worker would.
///
/// A handle is released once its final status has been polled or it has been cancelled.
pub struct LocalBackend {
    pool: ThreadPool,
    num_threads: usize,
    store: Arc<dyn ChunkStore>,
    kernels: Arc<KernelRegistry>,
    next_handle: AtomicCell<u64>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    slots: Mutex<HashMap<TaskHandle, Slot>>,

    /// Abandoned attempts that still occupy a thread.
    abandoned: Arc<AtomicCell<usize>>,
}

impl LocalBackend {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        kernels: KernelRegistry,
        num_threads: usize,
    ) -> Result<Self> {
        let num_threads = max(num_threads, 1);
        let pool = ThreadPoolBuilder::new()
            .thread_name(|i| format!("tessera-worker-{}", i))
            .num_threads(num_threads)
            .build()?;
        let (sender, receiver) = unbounded();

        debug!("started local backend with {} threads", num_threads);

        Ok(Self {
            pool,
            num_threads,
            store,
            kernels: Arc::new(kernels),
            next_handle: default(),
            sender,
            receiver,
            slots: default(),
            abandoned: default(),
        })
    }

    /// Backend with one thread per available CPU core.
    pub fn with_default_threads(store: Arc<dyn ChunkStore>, kernels: KernelRegistry) -> Result<Self> {
        Self::new(store, kernels, rayon::current_num_threads())
    }

    fn drain_completions(&self, slots: &mut HashMap<TaskHandle, Slot>) {
        for (handle, result) in self.receiver.try_iter() {
            // Cancelled attempts have no slot anymore.
            if let Some(slot) = slots.get_mut(&handle) {
                slot.status = match result {
                    Ok(result) => TaskStatus::Succeeded(result),
                    Err(e) => TaskStatus::Failed(e),
                };
            }
        }
    }
}

fn run_serialized(
    buffer: &[u8],
    store: &dyn ChunkStore,
    kernels: &KernelRegistry,
    worker: WorkerId,
) -> Result<TaskResult, TaskError> {
    let payload: TaskPayload = deserialize(buffer)
        .map_err(|e| TaskError::Fatal(format!("malformed task payload: {}", e)))?;

    if payload.avoid_worker == Some(worker) {
        // Threads of the pool cannot be selected, so the hint is only reported.
        debug!("{} runs backup of {} on the same worker", worker, payload.task.id);
    }

    match catch_unwind(AssertUnwindSafe(|| {
        execute_payload(&payload, store, kernels, worker)
    })) {
        Ok(result) => result,
        Err(_) => Err(TaskError::Transient(format!(
            "{} panicked while executing {}",
            worker, payload.task.id
        ))),
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    /// Threads not held by abandoned attempts.
    fn max_concurrency(&self) -> usize {
        self.num_threads.saturating_sub(self.abandoned.load())
    }

    fn submit(&self, payload: TaskPayload) -> Result<TaskHandle> {
        let buffer = serialize(&payload)?;
        let handle = TaskHandle(self.next_handle.get_and_increment());
        let control = Arc::new(AttemptControl {
            phase: Mutex::new(Phase::Queued),
            worker: AtomicCell::new(None),
        });

        self.slots.lock().insert(
            handle,
            Slot {
                status: TaskStatus::Running,
                control: Arc::clone(&control),
            },
        );

        let store = Arc::clone(&self.store);
        let kernels = Arc::clone(&self.kernels);
        let abandoned = Arc::clone(&self.abandoned);
        let sender = self.sender.clone();

        self.pool.spawn_fifo(move || {
            {
                let mut phase = control.phase.lock();
                if *phase == Phase::Cancelled {
                    return;
                }

                *phase = Phase::Running;
            }

            let worker = WorkerId::new(rayon::current_thread_index().unwrap_or_default());
            control.worker.store(Some(worker));

            let store = AttemptStore {
                inner: &*store,
                control: &control,
            };
            let result = run_serialized(&buffer, &store, &kernels, worker);

            {
                let mut phase = control.phase.lock();
                if *phase == Phase::Abandoned {
                    abandoned.fetch_sub(1);
                }

                *phase = Phase::Done;
            }

            let _ = sender.send((handle, result));
        });

        Ok(handle)
    }

    fn poll(&self, handle: TaskHandle) -> Result<TaskStatus> {
        let mut slots = self.slots.lock();
        self.drain_completions(&mut slots);

        let status = match slots.get(&handle) {
            Some(slot) => slot.status.clone(),
            None => bail!("unknown task handle {:?}", handle),
        };

        if status.is_finished() {
            slots.remove(&handle);
        }

        Ok(status)
    }

    fn placement(&self, handle: TaskHandle) -> Option<WorkerId> {
        self.slots
            .lock()
            .get(&handle)
            .and_then(|slot| slot.control.worker.load())
    }

    fn cancel(&self, handle: TaskHandle) -> Result {
        let slot = match self.slots.lock().remove(&handle) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let mut phase = slot.control.phase.lock();
        match *phase {
            Phase::Queued => *phase = Phase::Cancelled,
            Phase::Running => {
                trace!("abandoning running {:?}", handle);
                *phase = Phase::Abandoned;
                self.abandoned.fetch_add(1);
            }
            _ => {}
        }

        Ok(())
    }
}
