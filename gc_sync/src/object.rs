//! Per-object state word: relocation status plus an exclusive lock bit.
//!
//! Layout of the 64-bit word:
//!
//! ```text
//!  63                                   3   2   1   0
//! +---------------------------------------+---+-------+
//! |         header payload (untouched)    | L | fwd   |
//! +---------------------------------------+---+-------+
//! ```
//!
//! `fwd` holds a [`ForwardState`]; the fourth encoding is never produced
//! here and only shows up if the header is corrupted. `L` is the lock bit.
//! Every update goes through compare-and-swap on the whole word, so the
//! payload bits survive any transition.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::fatal;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Normal = 0,
    Forwarding = 1,
    Forwarded = 2,
}

impl ForwardState {
    #[inline(always)]
    fn decode(bits: u64) -> Option<Self> {
        match bits & StateWord::FORWARD_MASK {
            0 => Some(ForwardState::Normal),
            1 => Some(ForwardState::Forwarding),
            2 => Some(ForwardState::Forwarded),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct StateWord(AtomicU64);

impl StateWord {
    pub const FORWARD_MASK: u64 = 0b011;
    pub const LOCK_BIT: u64 = 0b100;
    pub const PAYLOAD_SHIFT: u32 = 3;

    /// A fresh header word: NORMAL, unlocked.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Rebuilds a word from raw header bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(AtomicU64::new(bits))
    }

    #[inline(always)]
    pub fn bits(&self, ord: Ordering) -> u64 {
        self.0.load(ord)
    }

    /// Current forward state, or `None` if the encoding is invalid.
    #[inline(always)]
    pub fn forward_state(&self) -> Option<ForwardState> {
        ForwardState::decode(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) & Self::LOCK_BIT != 0
    }

    pub fn payload(&self) -> u64 {
        self.0.load(Ordering::Relaxed) >> Self::PAYLOAD_SHIFT
    }

    #[inline(always)]
    fn with_forward(word: u64, state: ForwardState) -> u64 {
        (word & !Self::FORWARD_MASK) | state as u64
    }

    /// Spins until the lock bit is flipped on, leaving the forward state
    /// as found. Aborts if the forward state is not one we can handle.
    fn lock(&self) {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if ForwardState::decode(cur).is_none() {
                fatal!(
                    "object state word {cur:#x} has unknown forward state {}",
                    cur & Self::FORWARD_MASK
                );
            }
            if cur & Self::LOCK_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .0
                .compare_exchange_weak(
                    cur,
                    cur | Self::LOCK_BIT,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Clears the lock bit and resets the forward state to NORMAL.
    fn unlock_normal(&self) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur & Self::LOCK_BIT == 0 {
                fatal!(
                    "unlocking object state word {cur:#x} that is not locked"
                );
            }
            let next =
                Self::with_forward(cur & !Self::LOCK_BIT, ForwardState::Normal);
            match self.0.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn transition(
        &self,
        from: ForwardState,
        to: ForwardState,
        allow_locked: bool,
    ) -> Result<(), u64> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if ForwardState::decode(cur) != Some(from)
                || (!allow_locked && cur & Self::LOCK_BIT != 0)
            {
                return Err(cur);
            }
            match self.0.compare_exchange_weak(
                cur,
                Self::with_forward(cur, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for StateWord {
    fn default() -> Self {
        Self::new()
    }
}

/// What a mutator sees after resolving a possibly relocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Original,
    Forwarded(usize),
}

/// The collector-visible part of a heap object header.
///
/// The forwarding address lives next to the state word. It is published
/// before the word turns FORWARDED and only read after observing
/// FORWARDED, so the release/acquire pair on the word orders it.
#[derive(Debug, Default)]
pub struct ObjectHeader {
    state: StateWord,
    forward: AtomicUsize,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            state: StateWord::new(),
            forward: AtomicUsize::new(0),
        }
    }

    pub const fn from_state(state: StateWord) -> Self {
        Self {
            state,
            forward: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn state(&self) -> &StateWord {
        &self.state
    }

    #[inline(always)]
    pub fn forward_state(&self) -> Option<ForwardState> {
        self.state.forward_state()
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Claims the object for relocation (NORMAL -> FORWARDING).
    ///
    /// Returns false if another thread got there first, the object was
    /// already forwarded, or it is locked.
    pub fn try_claim_forwarding(&self) -> bool {
        self.state
            .transition(ForwardState::Normal, ForwardState::Forwarding, false)
            .is_ok()
    }

    /// Publishes the new location and moves FORWARDING -> FORWARDED.
    /// Only the thread that claimed the object may call this.
    pub fn complete_forwarding(&self, new_address: usize) {
        self.forward.store(new_address, Ordering::Release);
        if let Err(word) = self.state.transition(
            ForwardState::Forwarding,
            ForwardState::Forwarded,
            true,
        ) {
            fatal!("completing forwarding of object with state word {word:#x}");
        }
    }

    pub fn forwarding_address(&self) -> Option<usize> {
        match self.state.forward_state() {
            Some(ForwardState::Forwarded) => {
                Some(self.forward.load(Ordering::Acquire))
            }
            _ => None,
        }
    }

    /// Read barrier slow path: waits out an in-flight copy and tells the
    /// caller where the object lives now.
    pub fn read_barrier(&self) -> Resolved {
        loop {
            match self.state.forward_state() {
                Some(ForwardState::Normal) => return Resolved::Original,
                Some(ForwardState::Forwarded) => {
                    return Resolved::Forwarded(
                        self.forward.load(Ordering::Acquire),
                    );
                }
                Some(ForwardState::Forwarding) => std::hint::spin_loop(),
                None => fatal!(
                    "read barrier hit state word {:#x}",
                    self.state.bits(Ordering::Relaxed)
                ),
            }
        }
    }

    pub fn lock(&self) -> ScopedObjectLock<'_> {
        ScopedObjectLock::acquire(self)
    }
}

/// Exclusive access to one object for the duration of a scope.
///
/// Acquisition spins on the state word; release clears the lock bit and
/// leaves the object NORMAL, on every exit path including unwinding.
#[must_use = "the object is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedObjectLock<'a> {
    locked: Option<&'a ObjectHeader>,
}

impl<'a> ScopedObjectLock<'a> {
    pub fn acquire(object: &'a ObjectHeader) -> Self {
        object.state.lock();
        Self {
            locked: Some(object),
        }
    }

    /// Forward state observed while holding the lock.
    pub fn forward_state(&self) -> ForwardState {
        match self.object().forward_state() {
            Some(state) => state,
            None => fatal!("locked object lost its forward state"),
        }
    }

    pub fn forwarding_address(&self) -> Option<usize> {
        self.object().forwarding_address()
    }

    fn object(&self) -> &'a ObjectHeader {
        match self.locked {
            Some(object) => object,
            None => fatal!("scoped object lock holds no object"),
        }
    }
}

impl Drop for ScopedObjectLock<'_> {
    fn drop(&mut self) {
        match self.locked.take() {
            Some(object) => object.state.unlock_normal(),
            None => {
                fatal!("releasing a scoped object lock that was never held")
            }
        }
    }
}
