//! The collector driver: a dedicated thread that turns requests into
//! stop-the-world cycles.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use crate::{
    CollectorDriver, GcReason, Mutator, MutatorRegistry, TaskPool,
    sync::{Condvar, Mutex},
};

/// What a phase gets to work with while the world is stopped.
pub struct CollectionContext<'a> {
    pub reason: GcReason,
    pub cycle: u64,
    pub pool: &'a TaskPool,
    pub mutators: &'a [Arc<Mutator>],
}

/// The work done inside each pause.
pub type GcPhase = Box<dyn FnMut(&CollectionContext<'_>) + Send>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: u64,
    pub by_reason: [u64; GcReason::ALL.len()],
    pub total_pause: Duration,
    pub max_pause: Duration,
}

impl GcStats {
    pub fn count(&self, reason: GcReason) -> u64 {
        self.by_reason[reason.index()]
    }

    fn record(&mut self, reason: GcReason, pause: Duration) {
        self.cycles += 1;
        self.by_reason[reason.index()] += 1;
        self.total_pause += pause;
        self.max_pause = self.max_pause.max(pause);
    }
}

impl fmt::Display for GcStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} cycles, total pause {:?}, max pause {:?}",
            self.cycles, self.total_pause, self.max_pause
        )?;
        for reason in GcReason::ALL {
            let n = self.count(reason);
            if n > 0 {
                writeln!(f, "  {reason:<10} {n}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    reason: GcReason,
    synchronous: bool,
}

#[derive(Default)]
struct DriverState {
    pending: Option<Pending>,
    started: u64,
    finished: u64,
    shutdown: bool,
    stats: GcStats,
}

struct CollectorShared {
    state: Mutex<DriverState>,
    /// Driver sleeps here until there is a request.
    wake: Condvar,
    /// Synchronous requesters sleep here until their cycle is done.
    done: Condvar,
    pool: Arc<TaskPool>,
    driver_thread: Mutex<Option<ThreadId>>,
}

struct Driver {
    shared: Arc<CollectorShared>,
    registry: Arc<MutatorRegistry>,
    phase: GcPhase,
}

impl Driver {
    fn run(mut self) {
        log::debug!("gc driver started");
        while let Some((pending, cycle)) = self.next_request() {
            let pause = self.collect(pending, cycle);
            {
                let mut state = self.shared.state.lock();
                state.finished = cycle;
                state.stats.record(pending.reason, pause);
            }
            self.shared.done.notify_all();
        }
        log::debug!("gc driver stopped");
    }

    fn next_request(&self) -> Option<(Pending, u64)> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(pending) = state.pending.take() {
                state.started += 1;
                return Some((pending, state.started));
            }
            self.shared.wake.wait(&mut state);
        }
    }

    fn collect(&mut self, pending: Pending, cycle: u64) -> Duration {
        let reason = pending.reason;
        let scope = self.registry.suspend_all(None);
        let ctx = CollectionContext {
            reason,
            cycle,
            pool: &self.shared.pool,
            mutators: scope.participants(),
        };
        let phase = &mut self.phase;
        if panic::catch_unwind(AssertUnwindSafe(|| phase(&ctx))).is_err() {
            log::error!(
                "gc #{cycle} ({reason}): phase panicked, resuming mutators"
            );
        }
        let pause = scope.elapsed();
        let stopped = scope.participants().len();
        drop(scope);

        let mode = if pending.synchronous { "sync" } else { "async" };
        log::info!(
            "gc #{cycle} ({reason}, {mode}): stopped {stopped} mutators \
             for {pause:?}"
        );
        pause
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("cycles", &self.cycles_completed())
            .finish_non_exhaustive()
    }
}

/// Runs collection cycles on its own thread.
///
/// A synchronous request blocks until a cycle that began after the request
/// has finished. If the requesting thread is a registered mutator it must
/// not be RUNNING while it waits, or the world can never stop; wrap the call
/// in [`Mutator::enter_native`].
pub struct Collector {
    shared: Arc<CollectorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(
        registry: Arc<MutatorRegistry>,
        pool: Arc<TaskPool>,
        phase: GcPhase,
    ) -> Self {
        let shared = Arc::new(CollectorShared {
            state: Mutex::new(DriverState::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
            pool,
            driver_thread: Mutex::new(None),
        });
        let driver = Driver {
            shared: Arc::clone(&shared),
            registry,
            phase,
        };
        let handle = thread::Builder::new()
            .name("gc-driver".to_string())
            .spawn(move || driver.run())
            .expect("spawn gc driver");
        *shared.driver_thread.lock() = Some(handle.thread().id());

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stats(&self) -> GcStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.shared.state.lock().finished
    }

    /// Threads that would deadlock waiting on their own cycle.
    fn is_collector_thread(&self) -> bool {
        let me = thread::current().id();
        *self.shared.driver_thread.lock() == Some(me)
            || self.shared.pool.is_in_thread_pool(me)
    }

    /// Stops the driver after the cycle in progress. Pending requests are
    /// dropped and their waiters released.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending = None;
        }
        self.shared.wake.notify_all();
        self.shared.done.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("gc driver panicked");
            }
        }
    }
}

impl CollectorDriver for Collector {
    fn request_gc(&self, reason: GcReason, synchronous: bool) {
        let synchronous = if synchronous && self.is_collector_thread() {
            log::warn!(
                "synchronous {reason} gc requested from a collector thread, \
                 not waiting"
            );
            false
        } else {
            synchronous
        };

        let mut state = self.shared.state.lock();
        if state.shutdown {
            log::warn!("{reason} gc requested after shutdown");
            return;
        }
        match &mut state.pending {
            Some(pending) => {
                pending.synchronous |= synchronous;
                log::trace!(
                    "{reason} gc merged into pending {} request",
                    pending.reason
                );
            }
            None => {
                state.pending = Some(Pending {
                    reason,
                    synchronous,
                });
            }
        }
        // whichever cycle picks up the pending request
        let target = state.started + 1;
        self.shared.wake.notify_one();

        if synchronous {
            while state.finished < target && !state.shutdown {
                self.shared.done.wait(&mut state);
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
