use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    Mutator, MutatorId, SuspendBarrier,
    sync::{Mutex, MutexGuard},
};

#[derive(Debug, Default)]
struct RegistryState {
    mutators: Vec<Arc<Mutator>>,
    /// Set while a [`SuspendScope`] is alive.
    stopped: bool,
}

/// The thread runtime's list of registered mutators.
///
/// The list lock is only held for short bookkeeping, never across a
/// barrier wait, so a RUNNING mutator may register or look up threads
/// while the world is being stopped.
#[derive(Debug, Default)]
pub struct MutatorRegistry {
    state: Mutex<RegistryState>,
    /// Serializes stop-the-world requests.
    world: Mutex<()>,
    id_gen: AtomicU64,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new mutator in CREATED. While the world is stopped it
    /// starts out suspended, so its first `start()` parks until resume.
    pub fn register(&self) -> Arc<Mutator> {
        let id = MutatorId(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let mutator = Arc::new(Mutator::new(id));
        let mut state = self.state.lock();
        if state.stopped {
            mutator.transition_gc_phase(true, None);
        }
        state.mutators.push(Arc::clone(&mutator));
        drop(state);
        log::debug!("registered {id}");
        mutator
    }

    /// Terminates and removes a mutator.
    pub fn deregister(&self, mutator: &Arc<Mutator>) {
        mutator.terminate();
        self.state
            .lock()
            .mutators
            .retain(|m| !Arc::ptr_eq(m, mutator));
        log::debug!("deregistered {}", mutator.id());
    }

    pub fn len(&self) -> usize {
        self.state.lock().mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: MutatorId) -> Option<Arc<Mutator>> {
        let state = self.state.lock();
        state.mutators.iter().find(|m| m.id() == id).cloned()
    }

    /// Stops every registered mutator except `except` at a safe point.
    ///
    /// Returns once all of them have passed the suspend barrier. The world
    /// stays stopped until the returned scope is dropped.
    pub fn suspend_all(&self, except: Option<MutatorId>) -> SuspendScope<'_> {
        let start = Instant::now();
        let world = self.world.lock();
        let participants: Vec<Arc<Mutator>> = {
            let mut state = self.state.lock();
            state.stopped = true;
            state
                .mutators
                .iter()
                .filter(|m| Some(m.id()) != except)
                .cloned()
                .collect()
        };

        let barrier = Arc::new(SuspendBarrier::new(participants.len() as i32));
        for m in &participants {
            if !m.transition_gc_phase(true, Some(&barrier)) {
                // already requested elsewhere, nothing will pass for it
                barrier.pass_strongly();
                continue;
            }
            if !m.is_running() {
                m.pass_suspend_barrier();
            }
        }
        barrier.wait();

        let pause_start = Instant::now();
        log::debug!(
            "stopped {} mutators in {:?}",
            participants.len(),
            pause_start - start
        );
        SuspendScope {
            registry: self,
            _world: world,
            participants,
            pause_start,
        }
    }
}

/// A stopped world. Dropping it resumes every suspended mutator.
#[must_use = "the world resumes as soon as the scope is dropped"]
pub struct SuspendScope<'a> {
    registry: &'a MutatorRegistry,
    _world: MutexGuard<'a, ()>,
    participants: Vec<Arc<Mutator>>,
    pause_start: Instant,
}

impl SuspendScope<'_> {
    pub fn participants(&self) -> &[Arc<Mutator>] {
        &self.participants
    }

    pub fn elapsed(&self) -> Duration {
        self.pause_start.elapsed()
    }
}

impl Drop for SuspendScope<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        state.stopped = false;
        // includes threads registered during the pause
        for m in self.participants.iter().chain(state.mutators.iter()) {
            m.transition_gc_phase(false, None);
        }
        drop(state);
        log::debug!(
            "resumed {} mutators after {:?}",
            self.participants.len(),
            self.pause_start.elapsed()
        );
    }
}
