use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::yield_now;

use parking_lot::{Condvar, Mutex};

pub(crate) const DEFAULT_TRY_SPINS: usize = 50;
pub(crate) const DEFAULT_YIELD_SPINS: usize = 20;

/// Sleep/notify primitive for the dispatcher thread.
///
/// Wakes are level-sensitive in effect: the sleeper samples the epoch with
/// [`prepare`](DispatchWait::prepare), re-checks its wake condition, and
/// only then calls [`wait`](DispatchWait::wait), which parks solely while
/// the epoch is unchanged. A notify that races the re-check bumps the epoch
/// first and is therefore never lost. Waiting spins, then yields, then
/// parks on a condvar.
#[derive(Debug)]
pub(crate) struct DispatchWait {
    epoch: AtomicUsize,
    lock: Mutex<()>,
    condvar: Condvar,
    spins_first: usize,
    spins_yield: usize,
}

impl DispatchWait {
    pub(crate) fn new() -> DispatchWait {
        DispatchWait::with_spins(DEFAULT_TRY_SPINS, DEFAULT_YIELD_SPINS)
    }

    pub(crate) fn with_spins(spins_first: usize, spins_yield: usize) -> DispatchWait {
        DispatchWait {
            epoch: AtomicUsize::new(0),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            spins_first,
            spins_yield,
        }
    }

    /// Epoch to hand to `wait` once the caller has seen nothing to do.
    pub(crate) fn prepare(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Park until `notify` runs after `prepare` returned `seen`.
    pub(crate) fn wait(&self, seen: usize) {
        for _ in 0..self.spins_first {
            if self.epoch.load(Ordering::Acquire) != seen {
                return;
            }
        }
        for _ in 0..self.spins_yield {
            yield_now();
            if self.epoch.load(Ordering::Acquire) != seen {
                return;
            }
        }
        let mut guard = self.lock.lock();
        while self.epoch.load(Ordering::Acquire) == seen {
            self.condvar.wait(&mut guard);
        }
    }

    pub(crate) fn notify(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        // taking the lock orders this bump against a sleeper between its
        // epoch re-check and the park
        drop(self.lock.lock());
        self.condvar.notify_one();
    }
}
