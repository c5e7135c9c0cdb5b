//! Splits an address range into batches and drains it on a [`TaskPool`].

use std::{
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    TaskContext, TaskId, TaskPool, fatal,
    sync::{Condvar, Mutex},
    taskpool::Task,
};

/// Called once per claimed batch, from any worker and in any order.
pub type BatchConsumer = Box<dyn Fn(Range<usize>) + Send + Sync>;

struct DispatchState {
    base: usize,
    end: usize,
    batch: usize,
    next_index: AtomicUsize,
    alive: AtomicUsize,
    drained: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
    consumer: BatchConsumer,
}

impl DispatchState {
    fn claim(&self) -> Option<Range<usize>> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let start = index
            .checked_mul(self.batch)
            .and_then(|offset| self.base.checked_add(offset))?;
        if start >= self.end {
            return None;
        }
        Some(start..start.saturating_add(self.batch).min(self.end))
    }

    /// Claims and consumes batches until none are left or `stop` says so.
    fn drain(&self, stop: impl Fn() -> bool) -> usize {
        let mut count = 0;
        while !stop() {
            let Some(range) = self.claim() else {
                break;
            };
            (self.consumer)(range);
            count += 1;
        }
        self.drained.fetch_add(count, Ordering::Relaxed);
        count
    }

    fn retire_runner(&self) {
        if self.alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock();
            self.cvar.notify_all();
        }
    }
}

/// Claim-and-drain task posted once per worker.
struct BatchRunner {
    id: TaskId,
    state: Arc<DispatchState>,
}

impl Task for BatchRunner {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(&mut self, ctx: &TaskContext<'_>) -> bool {
        let n = self.state.drain(|| ctx.is_terminated());
        log::trace!("{} drained {n} batches", ctx.worker_id());
        true
    }
}

// A runner the pool drops unrun still counts as finished.
impl Drop for BatchRunner {
    fn drop(&mut self) {
        self.state.retire_runner();
    }
}

/// One parallel pass over `[base, base + total_bytes)`.
pub struct ArrayTaskDispatcher {
    state: Arc<DispatchState>,
}

impl ArrayTaskDispatcher {
    pub fn new<F>(
        base: usize,
        total_bytes: usize,
        batch_bytes: usize,
        consumer: F,
    ) -> Self
    where
        F: Fn(Range<usize>) + Send + Sync + 'static,
    {
        if batch_bytes == 0 {
            fatal!("dispatcher batch size must be non-zero");
        }
        let Some(end) = base.checked_add(total_bytes) else {
            fatal!(
                "dispatch region {base:#x} + {total_bytes:#x} overflows \
                 the address space"
            );
        };

        Self {
            state: Arc::new(DispatchState {
                base,
                end,
                batch: batch_bytes,
                next_index: AtomicUsize::new(0),
                alive: AtomicUsize::new(0),
                drained: AtomicUsize::new(0),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
                consumer: Box::new(consumer),
            }),
        }
    }

    /// Number of batches the region splits into.
    pub fn batch_count(&self) -> usize {
        (self.state.end - self.state.base).div_ceil(self.state.batch)
    }

    /// Batches consumed so far, across workers and the inline pass.
    pub fn drained(&self) -> usize {
        self.state.drained.load(Ordering::Relaxed)
    }

    pub fn alive_task_count(&self) -> usize {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Posts `n_threads` runners to `pool`. They share the returned id, so
    /// [`TaskPool::terminate_task`] stops the whole pass.
    pub fn dispatch(&self, pool: &TaskPool, n_threads: usize) -> TaskId {
        let id = pool.next_task_id();
        // counted before posting, a runner may finish before the loop does
        self.state.alive.fetch_add(n_threads, Ordering::AcqRel);
        for _ in 0..n_threads {
            pool.post_task(Box::new(BatchRunner {
                id,
                state: Arc::clone(&self.state),
            }));
        }
        log::debug!(
            "dispatched {} batches of {} bytes to {n_threads} runners as {:?}",
            self.batch_count(),
            self.state.batch,
            id
        );
        id
    }

    /// Drains inline on the calling thread, then blocks until every posted
    /// runner is gone.
    pub fn join_and_wait(&self) {
        let inline = self.state.drain(|| false);
        log::trace!("inline pass drained {inline} batches");

        if self.state.alive.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.state.lock.lock();
        while self.state.alive.load(Ordering::Acquire) > 0 {
            self.state.cvar.wait(&mut guard);
        }
    }
}

impl Drop for ArrayTaskDispatcher {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state.alive.load(Ordering::Acquire),
            0,
            "dispatcher dropped without join_and_wait"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;
    use std::thread;
    use std::time::Duration;

    const BASE: usize = 0x10_0000;

    struct Coverage {
        visited: Vec<AtomicU8>,
        batches: Mutex<Vec<usize>>,
    }

    impl Coverage {
        fn new(total: usize) -> Arc<Self> {
            Arc::new(Self {
                visited: (0..total).map(|_| AtomicU8::new(0)).collect(),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn consumer(
            self: &Arc<Self>,
        ) -> impl Fn(Range<usize>) + Send + Sync + 'static {
            let cov = Arc::clone(self);
            move |range: Range<usize>| {
                cov.batches.lock().push(range.len());
                for addr in range {
                    cov.visited[addr - BASE].fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        fn assert_exact(&self) {
            for (offset, v) in self.visited.iter().enumerate() {
                assert_eq!(
                    v.load(Ordering::Relaxed),
                    1,
                    "byte {offset} visited wrong number of times"
                );
            }
        }
    }

    #[test]
    fn covers_region_exactly_once_for_any_thread_count() {
        let pool = TaskPool::new(8);
        for n in [1, 2, 4, 8] {
            for (total, batch) in [(4096, 64), (1000, 7), (100, 30), (1, 16)] {
                let cov = Coverage::new(total);
                let dispatcher = ArrayTaskDispatcher::new(
                    BASE,
                    total,
                    batch,
                    cov.consumer(),
                );
                dispatcher.dispatch(&pool, n);
                dispatcher.join_and_wait();

                assert_eq!(dispatcher.alive_task_count(), 0);
                assert_eq!(dispatcher.drained(), dispatcher.batch_count());
                cov.assert_exact();
            }
        }
    }

    #[test]
    fn last_batch_is_clamped() {
        let pool = TaskPool::new(2);
        let cov = Coverage::new(100);
        let dispatcher =
            ArrayTaskDispatcher::new(BASE, 100, 30, cov.consumer());
        dispatcher.dispatch(&pool, 2);
        dispatcher.join_and_wait();

        let mut sizes = cov.batches.lock().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![10, 30, 30, 30]);
    }

    #[test]
    fn exact_multiple_has_no_empty_batch() {
        let pool = TaskPool::new(4);
        let cov = Coverage::new(120);
        let dispatcher =
            ArrayTaskDispatcher::new(BASE, 120, 30, cov.consumer());
        dispatcher.dispatch(&pool, 4);
        dispatcher.join_and_wait();

        assert_eq!(dispatcher.batch_count(), 4);
        assert!(cov.batches.lock().iter().all(|&len| len == 30));
        cov.assert_exact();
    }

    #[test]
    fn empty_region_joins_immediately() {
        let pool = TaskPool::new(2);
        let dispatcher = ArrayTaskDispatcher::new(BASE, 0, 64, |_| {
            panic!("no batches expected")
        });
        dispatcher.dispatch(&pool, 2);
        dispatcher.join_and_wait();
        assert_eq!(dispatcher.drained(), 0);
    }

    #[test]
    fn inline_pass_finishes_work_of_a_dead_pool() {
        let pool = TaskPool::new(2);
        pool.terminate_thread();

        let cov = Coverage::new(256);
        let dispatcher =
            ArrayTaskDispatcher::new(BASE, 256, 16, cov.consumer());
        dispatcher.dispatch(&pool, 2);
        dispatcher.join_and_wait();
        cov.assert_exact();
    }

    #[test]
    fn join_waits_for_slow_runners() {
        let pool = TaskPool::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        let dispatcher = {
            let done = done.clone();
            ArrayTaskDispatcher::new(BASE, 8, 1, move |_| {
                thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            })
        };
        dispatcher.dispatch(&pool, 4);
        dispatcher.join_and_wait();
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(dispatcher.alive_task_count(), 0);
    }

    #[test]
    fn each_dispatch_gets_its_own_task_id() {
        let pool = TaskPool::new(2);
        let cov = Coverage::new(64);
        let dispatcher = ArrayTaskDispatcher::new(BASE, 64, 16, cov.consumer());
        let first = dispatcher.dispatch(&pool, 1);
        let second = dispatcher.dispatch(&pool, 1);
        dispatcher.join_and_wait();

        assert_ne!(first, second);
        assert_ne!(first, pool.next_task_id());
        cov.assert_exact();
    }

    #[test]
    fn terminating_the_dispatch_id_stops_its_runners() {
        let pool = TaskPool::new(2);
        let consumed = Arc::new(AtomicUsize::new(0));
        let dispatcher = {
            let consumed = consumed.clone();
            ArrayTaskDispatcher::new(BASE, 1 << 20, 1, move |_| {
                consumed.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            })
        };
        let id = dispatcher.dispatch(&pool, 2);
        while consumed.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        pool.terminate_task(id);

        // runners see the flag between batches and retire early
        let mut guard = dispatcher.state.lock.lock();
        while dispatcher.alive_task_count() > 0 {
            dispatcher
                .state
                .cvar
                .wait_for(&mut guard, Duration::from_millis(10));
        }
        drop(guard);
        assert!(dispatcher.drained() < dispatcher.batch_count());
    }
}
