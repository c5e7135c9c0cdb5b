//! Parallel relocation over a contiguous run of object headers.
//!
//! A pass has two halves. `forward` claims every object and publishes its
//! new address (NORMAL -> FORWARDING -> FORWARDED) while readers resolve
//! through the read barrier. Once references are fixed up, `retire` takes
//! each object's lock and lets the release return it to NORMAL.

use std::{
    mem,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{ArrayTaskDispatcher, ObjectHeader, TaskPool};

/// Fixed set of object headers laid out back to back.
#[derive(Debug)]
pub struct ObjectSpace {
    headers: Box<[ObjectHeader]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvacuationStats {
    pub forwarded: usize,
    pub skipped: usize,
    pub batches: usize,
}

impl ObjectSpace {
    pub const HEADER_SIZE: usize = mem::size_of::<ObjectHeader>();

    pub fn new(objects: usize) -> Arc<Self> {
        Arc::new(Self {
            headers: (0..objects).map(|_| ObjectHeader::new()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ObjectHeader> {
        self.headers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectHeader> {
        self.headers.iter()
    }

    pub fn base(&self) -> usize {
        self.headers.as_ptr() as usize
    }

    pub fn bytes(&self) -> usize {
        self.headers.len() * Self::HEADER_SIZE
    }

    /// Headers starting inside `range`, which is an address range within
    /// `[base, base + bytes)`.
    fn headers_in(&self, range: Range<usize>) -> &[ObjectHeader] {
        let first = (range.start - self.base()).div_ceil(Self::HEADER_SIZE);
        let last = (range.end - self.base()).div_ceil(Self::HEADER_SIZE);
        &self.headers[first.min(self.len())..last.min(self.len())]
    }

    fn index_of(&self, header: &ObjectHeader) -> usize {
        let addr = header as *const ObjectHeader as usize;
        (addr - self.base()) / Self::HEADER_SIZE
    }

    /// Forwards every NORMAL object to `to_base + index * HEADER_SIZE`.
    pub fn forward(
        self: &Arc<Self>,
        pool: &TaskPool,
        n_threads: usize,
        batch_bytes: usize,
        to_base: usize,
    ) -> EvacuationStats {
        let forwarded = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let space = Arc::clone(self);
            let forwarded = Arc::clone(&forwarded);
            let skipped = Arc::clone(&skipped);
            move |range: Range<usize>| {
                for header in space.headers_in(range) {
                    if header.try_claim_forwarding() {
                        let index = space.index_of(header);
                        header.complete_forwarding(
                            to_base + index * Self::HEADER_SIZE,
                        );
                        forwarded.fetch_add(1, Ordering::Relaxed);
                    } else {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        };
        let batches = self.run(pool, n_threads, batch_bytes, consumer);
        EvacuationStats {
            forwarded: forwarded.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            batches,
        }
    }

    /// Returns every object to NORMAL under its lock.
    pub fn retire(
        self: &Arc<Self>,
        pool: &TaskPool,
        n_threads: usize,
        batch_bytes: usize,
    ) -> usize {
        let space = Arc::clone(self);
        self.run(pool, n_threads, batch_bytes, move |range: Range<usize>| {
            for header in space.headers_in(range) {
                let _lock = header.lock();
            }
        })
    }

    fn run<F>(
        &self,
        pool: &TaskPool,
        n_threads: usize,
        batch_bytes: usize,
        consumer: F,
    ) -> usize
    where
        F: Fn(Range<usize>) + Send + Sync + 'static,
    {
        let dispatcher = ArrayTaskDispatcher::new(
            self.base(),
            self.bytes(),
            batch_bytes,
            consumer,
        );
        dispatcher.dispatch(pool, n_threads);
        dispatcher.join_and_wait();
        dispatcher.drained()
    }
}
