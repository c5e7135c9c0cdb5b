use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    CollectionContext, Collector, GcPhase, GcReason, GcStats, HeapManager,
    Mutator, MutatorRegistry, NativeScope, RuntimeSettings, SettingsError,
    TaskPool, TaskPoolCreateInfo, TriggerCause, TriggerGcType, WorkerId,
};

#[derive(Debug)]
pub struct RuntimeShared {
    pub settings: RuntimeSettings,
    pub pool: Arc<TaskPool>,
    pub registry: Arc<MutatorRegistry>,
    pub heap: HeapManager,
    collector: Arc<Collector>,
    attached_workers: Arc<AtomicUsize>,
}

/// Owns the collector, its worker pool and the mutator registry.
/// Dropping it stops the collector, then the pool.
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

/// A mutator thread's handle on the runtime. Deregisters on drop.
#[derive(Debug)]
pub struct RuntimeProxy {
    pub shared: Arc<RuntimeShared>,
    mutator: Arc<Mutator>,
}

pub struct RuntimeCreateInfo {
    pub settings: RuntimeSettings,
    /// Work done in every pause. Defaults to doing nothing.
    pub phase: Option<GcPhase>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Result<Self, SettingsError> {
        info.settings.validate()?;

        let attached_workers = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(TaskPool::with_info(TaskPoolCreateInfo {
            threads: info.settings.worker_threads,
            prologue: Some({
                let attached = Arc::clone(&attached_workers);
                Arc::new(move |_: WorkerId| {
                    attached.fetch_add(1, Ordering::AcqRel);
                })
            }),
            epilogue: Some({
                let attached = Arc::clone(&attached_workers);
                Arc::new(move |_: WorkerId| {
                    attached.fetch_sub(1, Ordering::AcqRel);
                })
            }),
        }));

        let registry = Arc::new(MutatorRegistry::new());
        let phase = info.phase.unwrap_or_else(|| {
            Box::new(|ctx: &CollectionContext<'_>| {
                log::trace!("gc #{} has no phase", ctx.cycle)
            })
        });
        let collector = Arc::new(Collector::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            phase,
        ));
        let heap =
            HeapManager::new(collector.clone(), info.settings.gc_enabled);

        log::info!(
            "runtime up: {} gc workers, {} byte batches, gc {}",
            info.settings.worker_threads,
            info.settings.batch_bytes,
            if info.settings.gc_enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            inner: Arc::new(RuntimeShared {
                settings: info.settings,
                pool,
                registry,
                heap,
                collector,
                attached_workers,
            }),
        })
    }

    /// Registers a new mutator. The owning thread calls
    /// [`RuntimeProxy::start`] before touching the heap.
    pub fn new_proxy(&self) -> RuntimeProxy {
        RuntimeProxy {
            shared: Arc::clone(&self.inner),
            mutator: self.inner.registry.register(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn heap(&self) -> &HeapManager {
        &self.inner.heap
    }

    pub fn pool(&self) -> &TaskPool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &MutatorRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> GcStats {
        self.inner.collector.stats()
    }

    /// Pool workers currently between their prologue and epilogue.
    pub fn attached_workers(&self) -> usize {
        self.inner.attached_workers.load(Ordering::Acquire)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.collector.shutdown();
        self.inner.pool.terminate_thread();
        log::info!(
            "runtime down after {} gc cycles",
            self.inner.collector.cycles_completed()
        );
    }
}

impl RuntimeProxy {
    pub fn mutator(&self) -> &Arc<Mutator> {
        &self.mutator
    }

    pub fn start(&self) {
        self.mutator.start();
    }

    #[inline]
    pub fn safepoint(&self) {
        self.mutator.safepoint();
    }

    pub fn enter_native(&self) -> NativeScope<'_> {
        self.mutator.enter_native()
    }

    /// Requests a collection from this mutator. A synchronous request is
    /// made from NATIVE so the world can stop around it.
    pub fn request_gc(&self, reason: GcReason, synchronous: bool) {
        if synchronous {
            let _native = self.mutator.enter_native();
            self.shared.heap.request_gc(reason, true);
        } else {
            self.shared.heap.request_gc(reason, false);
        }
    }

    pub fn collect_garbage(&self, gc_type: TriggerGcType, cause: TriggerCause) {
        let _native = self.mutator.enter_native();
        self.shared.heap.collect_garbage(gc_type, cause);
    }
}

impl Drop for RuntimeProxy {
    fn drop(&mut self) {
        self.shared.registry.deregister(&self.mutator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadState;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    fn settings(workers: usize) -> RuntimeSettings {
        RuntimeSettings {
            worker_threads: workers,
            ..RuntimeSettings::default()
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let err = Runtime::new(RuntimeCreateInfo {
            settings: settings(0),
            phase: None,
        })
        .err();
        assert_eq!(err, Some(SettingsError::NoWorkers));
    }

    #[test]
    fn workers_attach_and_detach() {
        let runtime = Runtime::new(RuntimeCreateInfo {
            settings: settings(3),
            phase: None,
        })
        .expect("valid settings");
        wait_until(|| runtime.attached_workers() == 3);

        let inner = Arc::clone(&runtime.inner);
        drop(runtime);
        assert_eq!(inner.attached_workers.load(Ordering::Acquire), 0);
        assert!(inner.pool.is_terminated());
    }

    #[test]
    fn phase_can_use_the_pool() {
        let batches = Arc::new(AtomicUsize::new(0));
        let runtime = Runtime::new(RuntimeCreateInfo {
            settings: settings(2),
            phase: Some({
                let batches = batches.clone();
                Box::new(move |ctx: &CollectionContext<'_>| {
                    let batches = batches.clone();
                    let consumer = move |_: std::ops::Range<usize>| {
                        batches.fetch_add(1, Ordering::SeqCst);
                    };
                    let dispatcher = crate::ArrayTaskDispatcher::new(
                        0x1000, 64, 8, consumer,
                    );
                    dispatcher.dispatch(ctx.pool, ctx.pool.total_thread_num());
                    dispatcher.join_and_wait();
                })
            }),
        })
        .expect("valid settings");

        runtime.heap().request_gc(GcReason::Force, true);
        assert_eq!(runtime.stats().cycles, 1);
        assert_eq!(batches.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn proxies_collect_from_running_threads() {
        let runtime = Runtime::new(RuntimeCreateInfo {
            settings: settings(1),
            phase: None,
        })
        .expect("valid settings");
        let stop = Arc::new(AtomicBool::new(false));

        let pollers: Vec<_> = (0..3)
            .map(|_| {
                let proxy = runtime.new_proxy();
                let stop = stop.clone();
                thread::spawn(move || {
                    proxy.start();
                    while !stop.load(Ordering::Relaxed) {
                        proxy.safepoint();
                        std::hint::spin_loop();
                    }
                })
            })
            .collect();

        let requester = runtime.new_proxy();
        requester.start();
        requester.request_gc(GcReason::User, true);
        requester.collect_garbage(TriggerGcType::Full, TriggerCause::Other);
        assert_eq!(requester.mutator().state(), ThreadState::Running);

        stop.store(true, Ordering::Relaxed);
        for t in pollers {
            t.join().expect("poller panicked");
        }
        drop(requester);

        let stats = runtime.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.count(GcReason::User), 1);
        assert_eq!(stats.count(GcReason::Backup), 1);
        assert!(runtime.registry().is_empty());
    }

    #[test]
    fn disabled_gc_runs_no_cycles() {
        let runtime = Runtime::new(RuntimeCreateInfo {
            settings: RuntimeSettings {
                gc_enabled: false,
                ..settings(1)
            },
            phase: None,
        })
        .expect("valid settings");
        runtime.heap().request_gc(GcReason::Force, true);
        runtime.heap().collect_garbage(
            TriggerGcType::Full,
            TriggerCause::AllocationFailed,
        );
        assert_eq!(runtime.stats(), GcStats::default());
    }
}
