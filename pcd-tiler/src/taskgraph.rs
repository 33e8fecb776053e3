use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Sender};

use pcd_core::error::TilerError;

type TaskFn = Box<dyn FnOnce(&TaskContext) -> Result<(), TilerError> + Send + 'static>;

/// Handle to a submitted task, used to declare dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(usize);

/// A DAG of work units built per batch and executed on the worker pool.
///
/// Tasks submitted here run once all their declared predecessors finished.
/// A running task may additionally spawn immediately-ready tasks through its
/// [`TaskContext`]; the executor counts those toward graph completion.
#[derive(Default)]
pub struct TaskGraph {
    tasks: Vec<TaskFn>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit<F>(&mut self, task: F) -> TaskHandle
    where
        F: FnOnce(&TaskContext) -> Result<(), TilerError> + Send + 'static,
    {
        let index = self.tasks.len();
        self.tasks.push(Box::new(task));
        self.successors.push(Vec::new());
        self.predecessors.push(0);
        TaskHandle(index)
    }

    /// Declare that `before` must finish before `after` starts.
    pub fn precedes(&mut self, before: TaskHandle, after: TaskHandle) {
        debug_assert_ne!(before, after);
        self.successors[before.0].push(after.0);
        self.predecessors[after.0] += 1;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

struct RunState {
    pool: Arc<rayon::ThreadPool>,
    tasks: Vec<Mutex<Option<TaskFn>>>,
    successors: Vec<Vec<usize>>,
    pending: Vec<AtomicUsize>,
    cancelled: AtomicBool,
    first_error: Mutex<Option<TilerError>>,
    in_flight: AtomicUsize,
    done: Sender<()>,
}

/// Handed to every running task. Long-running tasks should poll
/// [`TaskContext::is_cancelled`] at loop boundaries.
pub struct TaskContext {
    state: Arc<RunState>,
}

impl TaskContext {
    /// Spawn an immediately-ready task into the running graph.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce(&TaskContext) -> Result<(), TilerError> + Send + 'static,
    {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        self.state
            .pool
            .spawn(move || run_dynamic(state, Box::new(task)));
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Relaxed)
    }
}

/// Executes task graphs on a dedicated pool of exactly `concurrency`
/// threads. `run` blocks until the graph drains; on failure the remaining
/// tasks are skipped and the first error is returned.
pub struct GraphExecutor {
    pool: Arc<rayon::ThreadPool>,
    concurrency: usize,
}

impl GraphExecutor {
    pub fn new(concurrency: usize) -> Result<Self, TilerError> {
        debug_assert!(concurrency > 0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .build()
            .map_err(|e| TilerError::Configuration(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            pool: Arc::new(pool),
            concurrency,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn run(&self, graph: TaskGraph) -> Result<(), TilerError> {
        if graph.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = bounded(1);
        let task_count = graph.tasks.len();
        let ready: Vec<usize> = graph
            .predecessors
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == 0)
            .map(|(i, _)| i)
            .collect();

        let state = Arc::new(RunState {
            pool: Arc::clone(&self.pool),
            tasks: graph.tasks.into_iter().map(|t| Mutex::new(Some(t))).collect(),
            successors: graph.successors,
            pending: graph.predecessors.into_iter().map(AtomicUsize::new).collect(),
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
            in_flight: AtomicUsize::new(task_count),
            done: done_tx,
        });

        for index in ready {
            schedule(&state, index);
        }

        done_rx
            .recv()
            .expect("task graph workers disconnected before completion");

        let error = state.first_error.lock().unwrap().take();
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn schedule(state: &Arc<RunState>, index: usize) {
    let next = Arc::clone(state);
    state.pool.spawn(move || run_static(next, index));
}

fn run_static(state: Arc<RunState>, index: usize) {
    let task = state.tasks[index].lock().unwrap().take();
    if let Some(task) = task {
        if !state.cancelled.load(Ordering::SeqCst) {
            let ctx = TaskContext {
                state: Arc::clone(&state),
            };
            if let Err(error) = task(&ctx) {
                record_error(&state, error);
            }
        }
    }
    // Successors are released even after a failure so the graph drains;
    // the cancellation flag turns them into no-ops.
    for &successor in &state.successors[index] {
        if state.pending[successor].fetch_sub(1, Ordering::SeqCst) == 1 {
            schedule(&state, successor);
        }
    }
    finish(&state);
}

fn run_dynamic(state: Arc<RunState>, task: TaskFn) {
    if !state.cancelled.load(Ordering::SeqCst) {
        let ctx = TaskContext {
            state: Arc::clone(&state),
        };
        if let Err(error) = task(&ctx) {
            record_error(&state, error);
        }
    }
    finish(&state);
}

fn record_error(state: &RunState, error: TilerError) {
    state.cancelled.store(true, Ordering::SeqCst);
    let mut slot = state.first_error.lock().unwrap();
    if slot.is_none() {
        *slot = Some(error);
    }
}

fn finish(state: &RunState) {
    if state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        let _ = state.done.send(());
    }
}
