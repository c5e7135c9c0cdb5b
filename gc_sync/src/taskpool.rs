//! Fixed-size pool of collector worker threads.

use std::{
    cell::Cell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use crate::sync::{Condvar, Mutex, SpinLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gc-worker-{}", self.0)
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// The pool worker running on this thread, if any.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// What a task sees while it runs.
pub struct TaskContext<'a> {
    worker: WorkerId,
    terminated: &'a AtomicBool,
}

impl TaskContext<'_> {
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Set once the pool or [`TaskPool::terminate_task`] asked this task to
    /// stop. Nothing forces it to; long tasks should poll this.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

pub trait Task: Send {
    fn id(&self) -> TaskId;

    /// Returns whether the task considers itself complete. The pool only
    /// logs the result; retrying is the poster's business.
    fn run(&mut self, ctx: &TaskContext<'_>) -> bool;
}

/// Called on the worker thread before it takes its first task, and after
/// its last one.
pub type WorkerHook = Arc<dyn Fn(WorkerId) + Send + Sync>;

pub struct TaskPoolCreateInfo {
    pub threads: usize,
    pub prologue: Option<WorkerHook>,
    pub epilogue: Option<WorkerHook>,
}

impl TaskPoolCreateInfo {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            prologue: None,
            epilogue: None,
        }
    }
}

struct QueuedTask {
    task: Box<dyn Task>,
    terminated: Arc<AtomicBool>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<QueuedTask>,
    terminated: bool,
}

struct RunningTask {
    id: TaskId,
    terminated: Arc<AtomicBool>,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    has_work: Condvar,
    /// One slot per worker, set while it runs a task.
    running: Box<[SpinLock<Option<RunningTask>>]>,
}

impl PoolShared {
    /// Takes the next task and publishes it in `worker`'s running slot.
    /// Both happen under the queue lock, so a termination either finds the
    /// task still queued or sees it in the slot.
    fn pop(&self, worker: WorkerId) -> Option<QueuedTask> {
        let mut queue = self.queue.lock();
        loop {
            if queue.terminated {
                return None;
            }
            if let Some(queued) = queue.tasks.pop_front() {
                *self.running[worker.0 as usize].lock() = Some(RunningTask {
                    id: queued.task.id(),
                    terminated: Arc::clone(&queued.terminated),
                });
                return Some(queued);
            }
            self.has_work.wait(&mut queue);
        }
    }
}

/// A worker's execution loop.
struct Runner {
    id: WorkerId,
    shared: Arc<PoolShared>,
    prologue: Option<WorkerHook>,
    epilogue: Option<WorkerHook>,
}

impl Runner {
    fn run(self) {
        CURRENT_WORKER.with(|w| w.set(Some(self.id)));
        if let Some(hook) = &self.prologue {
            hook(self.id);
        }
        log::debug!("{} attached", self.id);

        while let Some(queued) = self.shared.pop(self.id) {
            self.execute(queued);
        }

        log::debug!("{} detached", self.id);
        if let Some(hook) = &self.epilogue {
            hook(self.id);
        }
        CURRENT_WORKER.with(|w| w.set(None));
    }

    fn execute(&self, queued: QueuedTask) {
        let QueuedTask {
            mut task,
            terminated,
        } = queued;
        let id = task.id();
        let slot = &self.shared.running[self.id.0 as usize];

        let ctx = TaskContext {
            worker: self.id,
            terminated: &terminated,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
            Ok(done) => log::trace!(
                "{}: task {:?} finished, complete = {done}",
                self.id,
                id
            ),
            Err(_) => log::error!("{}: task {:?} panicked", self.id, id),
        }

        *slot.lock() = None;
        drop(task);
    }
}

/// First id handed out by [`TaskPool::next_task_id`]. Lower ids are left to
/// callers that number their own tasks.
const FIRST_POOL_TASK_ID: u64 = 1 << 32;

pub struct TaskPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Box<[ThreadId]>,
    next_task_id: AtomicU64,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("threads", &self.thread_ids.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl TaskPool {
    pub fn new(threads: usize) -> Self {
        Self::with_info(TaskPoolCreateInfo::new(threads))
    }

    pub fn with_info(info: TaskPoolCreateInfo) -> Self {
        assert!(info.threads > 0, "a task pool needs at least one worker");

        let running = (0..info.threads)
            .map(|_| SpinLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState::default()),
            has_work: Condvar::new(),
            running,
        });

        let mut handles = Vec::with_capacity(info.threads);
        for i in 0..info.threads {
            let runner = Runner {
                id: WorkerId(i as u32),
                shared: Arc::clone(&shared),
                prologue: info.prologue.clone(),
                epilogue: info.epilogue.clone(),
            };
            let handle = thread::Builder::new()
                .name(runner.id.to_string())
                .spawn(move || runner.run())
                .expect("spawn gc worker");
            handles.push(handle);
        }
        let thread_ids = handles.iter().map(|h| h.thread().id()).collect();

        Self {
            shared,
            handles: Mutex::new(handles),
            thread_ids,
            next_task_id: AtomicU64::new(FIRST_POOL_TASK_ID),
        }
    }

    /// Worker count, fixed at construction.
    pub fn total_thread_num(&self) -> usize {
        self.thread_ids.len()
    }

    pub fn is_in_thread_pool(&self, thread: ThreadId) -> bool {
        self.thread_ids.contains(&thread)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.queue.lock().terminated
    }

    /// A fresh id, unique within this pool.
    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues a task for the next idle worker. A terminated pool drops it
    /// without running it.
    pub fn post_task(&self, task: Box<dyn Task>) {
        let queued = QueuedTask {
            task,
            terminated: Arc::new(AtomicBool::new(false)),
        };
        let rejected = {
            let mut queue = self.shared.queue.lock();
            if queue.terminated {
                Some(queued)
            } else {
                queue.tasks.push_back(queued);
                None
            }
        };
        match rejected {
            Some(queued) => {
                log::warn!(
                    "task {:?} posted to a terminated pool",
                    queued.task.id()
                );
            }
            None => {
                self.shared.has_work.notify_one();
            }
        }
    }

    /// Drops queued tasks with `id` and asks running ones to stop.
    pub fn terminate_task(&self, id: TaskId) {
        let removed = {
            let mut queue = self.shared.queue.lock();
            let (removed, kept): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut queue.tasks)
                    .into_iter()
                    .partition(|q| q.task.id() == id);
            queue.tasks = kept;
            removed
        };
        for slot in self.shared.running.iter() {
            if let Some(running) = &*slot.lock() {
                if running.id == id {
                    running.terminated.store(true, Ordering::Release);
                }
            }
        }
        log::debug!(
            "terminated task {:?}, {} dropped from queue",
            id,
            removed.len()
        );
    }

    /// Stops accepting work, drops what is queued, flags running tasks and
    /// joins every worker. Running tasks are not interrupted; this returns
    /// once they finish.
    pub fn terminate_thread(&self) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            queue.terminated = true;
            std::mem::take(&mut queue.tasks)
        };
        for slot in self.shared.running.iter() {
            if let Some(running) = &*slot.lock() {
                running.terminated.store(true, Ordering::Release);
            }
        }
        self.shared.has_work.notify_all();
        // task destructors may post or notify, so not under the queue lock
        drop(dropped);

        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                log::warn!("task pool terminated from its own worker");
                continue;
            }
            let _ = handle.join();
        }
        log::debug!("task pool terminated");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.terminate_thread();
    }
}
