use std::sync::atomic::{AtomicI32, Ordering};

use crate::sync::{Condvar, Mutex};

/// Single-use countdown latch between mutators and the collector driver.
///
/// Every participant calls [`pass_strongly`](Self::pass_strongly) exactly
/// once; the controller sleeps in [`wait`](Self::wait) until all of them
/// have. Passing more often than the initial count drives the counter
/// negative, which is a caller bug and is not detected.
#[derive(Debug, Default)]
pub struct SuspendBarrier {
    pass_count: AtomicI32,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            pass_count: AtomicI32::new(count),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Rearms the barrier. Only valid while nobody is waiting on it.
    pub fn initialize(&self, count: i32) {
        self.pass_count.store(count, Ordering::Release);
    }

    pub fn pass_count(&self) -> i32 {
        self.pass_count.load(Ordering::Acquire)
    }

    pub fn pass_strongly(&self) {
        let prev = self.pass_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // LAST
            let _guard = self.lock.lock();
            self.cvar.notify_all();
        }
    }

    /// Blocks until every participant has passed.
    pub fn wait(&self) {
        if self.pass_count.load(Ordering::Acquire) <= 0 {
            return;
        }
        let mut guard = self.lock.lock();
        while self.pass_count.load(Ordering::Acquire) > 0 {
            self.cvar.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_count_does_not_block() {
        let barrier = SuspendBarrier::new(0);
        barrier.wait();
        assert_eq!(barrier.pass_count(), 0);
    }

    #[test]
    fn wait_returns_only_after_every_pass() {
        let barrier = Arc::new(SuspendBarrier::new(4));
        let returned = Arc::new(AtomicBool::new(false));

        let waiter = {
            let barrier = barrier.clone();
            let returned = returned.clone();
            thread::spawn(move || {
                barrier.wait();
                returned.store(true, Ordering::SeqCst);
            })
        };

        for _ in 0..3 {
            barrier.pass_strongly();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(
            !returned.load(Ordering::SeqCst),
            "wait() returned before the 4th pass"
        );

        barrier.pass_strongly();
        waiter.join().expect("waiter panicked");
        assert!(returned.load(Ordering::SeqCst));
        assert_eq!(barrier.pass_count(), 0);
    }

    #[test]
    fn concurrent_passers_release_the_waiter() {
        let n = 4;
        let barrier = Arc::new(SuspendBarrier::new(n));
        let returned = Arc::new(AtomicBool::new(false));

        let waiter = {
            let barrier = barrier.clone();
            let returned = returned.clone();
            thread::spawn(move || {
                barrier.wait();
                returned.store(true, Ordering::SeqCst);
            })
        };

        let passers: Vec<_> = (0..n)
            .map(|i| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * i as u64));
                    barrier.pass_strongly();
                })
            })
            .collect();
        for p in passers {
            p.join().expect("passer panicked");
        }

        waiter.join().expect("waiter panicked");
        assert!(returned.load(Ordering::SeqCst));
    }

    #[test]
    fn initialize_rearms_a_used_barrier() {
        let barrier = SuspendBarrier::new(1);
        barrier.pass_strongly();
        barrier.wait();

        barrier.initialize(2);
        assert_eq!(barrier.pass_count(), 2);
        barrier.pass_strongly();
        barrier.pass_strongly();
        barrier.wait();
        assert_eq!(barrier.pass_count(), 0);
    }
}
