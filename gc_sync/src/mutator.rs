//! Per-thread state machine for cooperative suspension.
//!
//! A mutator is never paused from the outside. The collector driver only
//! raises `SUSPEND_REQUEST` (and `ACTIVE_BARRIER` when it wants to be told
//! about it); the thread notices at its next safe point or state change,
//! passes the barrier and parks itself. A thread that never polls keeps
//! the driver waiting forever, so compiled code must poll at loop
//! back-edges and call boundaries.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bitflags::bitflags;

use crate::{
    SuspendBarrier, fatal,
    sync::{Condvar, Mutex},
};

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created = 0,
    Running = 1,
    Native = 2,
    Wait = 3,
    Suspended = 4,
    Terminated = 5,
}

impl ThreadState {
    fn decode(val: u16) -> Option<Self> {
        match val {
            0 => Some(ThreadState::Created),
            1 => Some(ThreadState::Running),
            2 => Some(ThreadState::Native),
            3 => Some(ThreadState::Wait),
            4 => Some(ThreadState::Suspended),
            5 => Some(ThreadState::Terminated),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MutatorFlags: u16 {
        const SUSPEND_REQUEST = 1 << 0;
        const ACTIVE_BARRIER = 1 << 1;
    }
}

/// `(state, flags)` packed in one atomic word so flag updates from the
/// driver never race with the thread's own state transitions.
#[derive(Debug)]
pub struct MutatorState(AtomicU32);

impl MutatorState {
    const FLAGS_MASK: u32 = 0xffff;
    const STATE_SHIFT: u32 = 16;

    #[inline(always)]
    fn pack(state: ThreadState, flags: MutatorFlags) -> u32 {
        ((state as u32) << Self::STATE_SHIFT) | flags.bits() as u32
    }

    #[inline(always)]
    fn unpack(word: u32) -> (ThreadState, MutatorFlags) {
        let raw = (word >> Self::STATE_SHIFT) as u16;
        let state = match ThreadState::decode(raw) {
            Some(state) => state,
            None => fatal!("mutator state word {word:#x} is corrupted"),
        };
        let flags =
            MutatorFlags::from_bits_truncate((word & Self::FLAGS_MASK) as u16);
        (state, flags)
    }

    pub fn new() -> Self {
        Self(AtomicU32::new(Self::pack(
            ThreadState::Created,
            MutatorFlags::empty(),
        )))
    }

    #[inline(always)]
    pub fn load(&self, ord: Ordering) -> (ThreadState, MutatorFlags, u32) {
        let w = self.0.load(ord);
        let (s, f) = Self::unpack(w);
        (s, f, w)
    }

    /// Replaces the state, keeping whatever flags are current.
    /// Returns the previous state.
    fn swap_state(&self, next: ThreadState) -> ThreadState {
        use std::sync::atomic::Ordering::*;
        loop {
            let (state, flags, cur) = self.load(Acquire);
            let word = Self::pack(next, flags);
            if self.0.compare_exchange(cur, word, AcqRel, Acquire).is_ok() {
                return state;
            }
        }
    }

    fn set_flags(&self, flags: MutatorFlags) -> MutatorFlags {
        let prev = self.0.fetch_or(flags.bits() as u32, Ordering::AcqRel);
        Self::unpack(prev).1
    }

    fn clear_flags(&self, flags: MutatorFlags) -> MutatorFlags {
        let prev = self.0.fetch_and(!(flags.bits() as u32), Ordering::AcqRel);
        Self::unpack(prev).1
    }
}

impl Default for MutatorState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(pub u64);

impl fmt::Display for MutatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutator-{}", self.0)
    }
}

pub struct Mutator {
    id: MutatorId,
    state: MutatorState,
    /// Barrier registered by the last suspend request, if not yet passed.
    suspend_lock: Mutex<Option<Arc<SuspendBarrier>>>,
    resumed: Condvar,
}

impl fmt::Debug for Mutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, flags, _) = self.state.load(Ordering::Relaxed);
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("state", &state)
            .field("flags", &flags)
            .finish()
    }
}

impl Mutator {
    pub fn new(id: MutatorId) -> Self {
        Self {
            id,
            state: MutatorState::new(),
            suspend_lock: Mutex::new(None),
            resumed: Condvar::new(),
        }
    }

    pub fn id(&self) -> MutatorId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire).0
    }

    pub fn flags(&self) -> MutatorFlags {
        self.state.load(Ordering::Acquire).1
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.flags().contains(MutatorFlags::SUSPEND_REQUEST)
    }

    /// CREATED -> RUNNING. Blocks first if a suspension is in progress.
    pub fn start(&self) {
        let state = self.state();
        if state != ThreadState::Created {
            fatal!("{} started twice (state {state:?})", self.id);
        }
        self.enter_running();
    }

    /// Thread-initiated move between RUNNING, NATIVE and WAIT.
    pub fn transfer_to(&self, next: ThreadState) {
        let current = self.state();
        if current == ThreadState::Terminated {
            fatal!("{} changes state after termination", self.id);
        }
        match next {
            ThreadState::Running => self.enter_running(),
            ThreadState::Native | ThreadState::Wait => {
                self.state.swap_state(next);
                // no longer touching the heap, count as stopped
                self.pass_suspend_barrier();
            }
            _ => fatal!("{} cannot transfer to {next:?}", self.id),
        }
    }

    /// RUNNING -> NATIVE for the lifetime of the returned guard.
    pub fn enter_native(&self) -> NativeScope<'_> {
        self.transfer_to(ThreadState::Native);
        NativeScope { mutator: self }
    }

    /// Any state -> TERMINATED. The thread must not touch the heap after.
    pub fn terminate(&self) {
        self.state.swap_state(ThreadState::Terminated);
        self.pass_suspend_barrier();
    }

    /// Safe-point poll.
    #[inline]
    pub fn safepoint(&self) {
        let (_, flags, _) = self.state.load(Ordering::Acquire);
        if flags.is_empty() {
            return;
        }
        self.safepoint_slow(flags);
    }

    #[cold]
    fn safepoint_slow(&self, flags: MutatorFlags) {
        if flags.contains(MutatorFlags::SUSPEND_REQUEST) {
            // parks as SUSPENDED before passing the barrier
            self.wait_while_suspended();
        } else if flags.contains(MutatorFlags::ACTIVE_BARRIER) {
            self.pass_suspend_barrier();
        }
    }

    /// Driver side: raise (`suspend = true`) or clear the suspend request.
    ///
    /// With a barrier the thread is also registered to pass it once. Raising
    /// an already raised request, or clearing a clear one, changes nothing and
    /// returns false.
    pub fn transition_gc_phase(
        &self,
        suspend: bool,
        barrier: Option<&Arc<SuspendBarrier>>,
    ) -> bool {
        let mut slot = self.suspend_lock.lock();
        let flags = self.flags();
        if suspend {
            if flags.contains(MutatorFlags::SUSPEND_REQUEST) {
                return false;
            }
            let mut raise = MutatorFlags::SUSPEND_REQUEST;
            if let Some(barrier) = barrier {
                *slot = Some(barrier.clone());
                raise |= MutatorFlags::ACTIVE_BARRIER;
            }
            self.state.set_flags(raise);
            log::trace!("{}: suspend requested", self.id);
        } else {
            if !flags.contains(MutatorFlags::SUSPEND_REQUEST) {
                return false;
            }
            // a barrier nobody passed is abandoned with the request
            *slot = None;
            self.state.clear_flags(
                MutatorFlags::SUSPEND_REQUEST | MutatorFlags::ACTIVE_BARRIER,
            );
            self.resumed.notify_all();
            log::trace!("{}: resumed", self.id);
        }
        true
    }

    /// Passes the registered barrier if there is one. At most once per
    /// registration, no matter how many threads race to call it.
    pub fn pass_suspend_barrier(&self) {
        let mut slot = self.suspend_lock.lock();
        self.pass_barrier_locked(&mut slot);
    }

    fn pass_barrier_locked(&self, slot: &mut Option<Arc<SuspendBarrier>>) {
        let prev = self.state.clear_flags(MutatorFlags::ACTIVE_BARRIER);
        if !prev.contains(MutatorFlags::ACTIVE_BARRIER) {
            return;
        }
        if let Some(barrier) = slot.take() {
            barrier.pass_strongly();
        }
    }

    fn enter_running(&self) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (state, flags, cur) = self.state.load(Acquire);
            if state == ThreadState::Running {
                return;
            }
            if flags.contains(MutatorFlags::ACTIVE_BARRIER) {
                self.pass_suspend_barrier();
                continue;
            }
            if flags.contains(MutatorFlags::SUSPEND_REQUEST) {
                self.wait_while_suspended();
                continue;
            }
            let next = MutatorState::pack(ThreadState::Running, flags);
            // fails if the driver raised a flag since the load
            let swapped =
                self.state.0.compare_exchange(cur, next, AcqRel, Acquire);
            if swapped.is_ok() {
                return;
            }
        }
    }

    fn wait_while_suspended(&self) {
        let mut guard = self.suspend_lock.lock();
        if !self.is_suspend_requested() {
            return;
        }
        let previous = self.state.swap_state(ThreadState::Suspended);
        // the driver may only see us stopped once SUSPENDED is published
        self.pass_barrier_locked(&mut guard);
        while self.is_suspend_requested() {
            self.resumed.wait(&mut guard);
        }
        self.state.swap_state(previous);
    }
}

/// Keeps a mutator in NATIVE while it blocks outside the heap.
#[must_use = "the mutator returns to RUNNING when the scope is dropped"]
pub struct NativeScope<'a> {
    mutator: &'a Mutator,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.mutator.transfer_to(ThreadState::Running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn running_mutator() -> Arc<Mutator> {
        let m = Arc::new(Mutator::new(MutatorId(1)));
        m.start();
        m
    }

    #[test]
    fn new_mutator_starts_created_then_running() {
        let m = Mutator::new(MutatorId(7));
        assert_eq!(m.state(), ThreadState::Created);
        assert!(m.flags().is_empty());
        m.start();
        assert!(m.is_running());
    }

    #[test]
    fn state_transitions_keep_flags() {
        let m = running_mutator();
        m.transition_gc_phase(true, None);

        m.state.swap_state(ThreadState::Native);
        assert_eq!(m.state(), ThreadState::Native);
        assert!(m.is_suspend_requested());

        m.transition_gc_phase(false, None);
        m.transfer_to(ThreadState::Wait);
        assert_eq!(m.state(), ThreadState::Wait);
        m.transfer_to(ThreadState::Running);
        assert!(m.is_running());
    }

    #[test]
    fn repeated_suspend_request_registers_once() {
        let m = running_mutator();
        let barrier = Arc::new(SuspendBarrier::new(1));

        assert!(m.transition_gc_phase(true, Some(&barrier)));
        assert!(!m.transition_gc_phase(true, Some(&barrier)));
        assert_eq!(
            m.flags(),
            MutatorFlags::SUSPEND_REQUEST | MutatorFlags::ACTIVE_BARRIER
        );

        m.pass_suspend_barrier();
        m.pass_suspend_barrier();
        assert_eq!(barrier.pass_count(), 0, "barrier passed more than once");
        assert_eq!(m.flags(), MutatorFlags::SUSPEND_REQUEST);

        assert!(m.transition_gc_phase(false, None));
        assert!(!m.transition_gc_phase(false, None));
        assert!(m.flags().is_empty());
    }

    #[test]
    fn safepoint_without_request_is_a_no_op() {
        let m = running_mutator();
        m.safepoint();
        assert!(m.is_running());
    }

    #[test]
    fn running_thread_suspends_at_safepoint_until_resumed() {
        let m = running_mutator();
        let barrier = Arc::new(SuspendBarrier::new(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let m = m.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    m.safepoint();
                    std::hint::spin_loop();
                }
            })
        };

        m.transition_gc_phase(true, Some(&barrier));
        barrier.wait();

        // the barrier only opens once the thread is parked
        assert_eq!(
            m.state(),
            ThreadState::Suspended,
            "mutator passed the barrier before parking"
        );

        stop.store(true, Ordering::Relaxed);
        m.transition_gc_phase(false, None);
        worker.join().expect("mutator thread panicked");
        assert!(m.is_running());
    }

    #[test]
    fn leaving_running_passes_the_barrier() {
        let m = running_mutator();
        let barrier = Arc::new(SuspendBarrier::new(1));
        m.transition_gc_phase(true, Some(&barrier));

        m.transfer_to(ThreadState::Native);
        assert_eq!(barrier.pass_count(), 0);
        assert!(!m.flags().contains(MutatorFlags::ACTIVE_BARRIER));
        m.transition_gc_phase(false, None);
    }

    #[test]
    fn entering_running_blocks_while_suspend_requested() {
        let m = running_mutator();
        m.transfer_to(ThreadState::Native);
        m.transition_gc_phase(true, None);

        let entered = Arc::new(AtomicBool::new(false));
        let t = {
            let m = m.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                m.transfer_to(ThreadState::Running);
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !entered.load(Ordering::SeqCst),
            "entered RUNNING while suspended"
        );
        assert_ne!(m.state(), ThreadState::Running);

        m.transition_gc_phase(false, None);
        t.join().expect("thread panicked");
        assert!(entered.load(Ordering::SeqCst));
        assert!(m.is_running());
    }

    #[test]
    fn native_scope_restores_running() {
        let m = running_mutator();
        {
            let _scope = m.enter_native();
            assert_eq!(m.state(), ThreadState::Native);
        }
        assert!(m.is_running());
    }

    #[test]
    fn terminate_passes_outstanding_barrier() {
        let m = running_mutator();
        let barrier = Arc::new(SuspendBarrier::new(1));
        m.transition_gc_phase(true, Some(&barrier));
        m.terminate();
        assert_eq!(m.state(), ThreadState::Terminated);
        assert_eq!(barrier.pass_count(), 0);
    }
}
