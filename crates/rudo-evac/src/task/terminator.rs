//! All-workers-idle termination protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 64;
const SLEEP: Duration = Duration::from_millis(1);

/// Counts idle workers; a phase ends when all of them are idle at once.
///
/// A worker offers termination only after its own queue is empty. While it
/// waits it polls a caller-supplied check for stealable work; if work shows up
/// it withdraws its offer, but never once every worker has offered, so the
/// decision is final and shared by all.
#[derive(Debug)]
pub struct Terminator {
    n_threads: usize,
    offered: CachePadded<AtomicUsize>,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Terminator {
    /// A terminator for `n_threads` workers.
    #[must_use]
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads: n_threads.max(1),
            offered: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Number of participating workers.
    #[must_use]
    pub const fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Workers currently idle.
    #[must_use]
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::Acquire)
    }

    /// Announce idleness and wait.
    ///
    /// Returns true when every worker is idle (the phase is over) and false
    /// when `has_work` reported something to steal; the caller must then go
    /// back to stealing.
    pub fn offer_termination(&self, has_work: impl Fn() -> bool) -> bool {
        if self.n_threads == 1 {
            self.offered.store(1, Ordering::Release);
            return true;
        }

        let offered = self.offered.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(offered <= self.n_threads, "more offers than workers");
        if offered == self.n_threads {
            let _guard = self.lock.lock();
            self.wakeup.notify_all();
            return true;
        }

        let mut rounds = 0u32;
        loop {
            if self.offered() == self.n_threads {
                return true;
            }
            if has_work() && self.withdraw() {
                return false;
            }

            if rounds < SPIN_ROUNDS {
                for _ in 0..(1 << rounds.min(6)) {
                    std::hint::spin_loop();
                }
            } else if rounds < SPIN_ROUNDS + YIELD_ROUNDS {
                thread::yield_now();
            } else {
                let mut guard = self.lock.lock();
                if self.offered() != self.n_threads {
                    self.wakeup.wait_for(&mut guard, SLEEP);
                }
            }
            rounds = rounds.saturating_add(1);
        }
    }

    /// Take back an offer unless termination has already been reached.
    fn withdraw(&self) -> bool {
        let mut current = self.offered();
        loop {
            if current == self.n_threads {
                return false;
            }
            debug_assert!(current > 0);
            match self.offered.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Prepare for the next phase. No worker may be inside `offer_termination`.
    pub fn reset(&self) {
        self.offered.store(0, Ordering::Release);
    }
}
