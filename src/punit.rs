use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

/// A busy token that may be acquired on one thread and released on another,
/// which rules out a scoped mutex guard. Release-before-acquire pairs are
/// ordered by the Acquire/Release edge on the flag.
#[derive(Debug)]
pub(crate) struct BusyFlag(AtomicBool);

impl BusyFlag {
    pub(crate) fn new() -> BusyFlag {
        BusyFlag(AtomicBool::new(false))
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.0.swap(true, Ordering::Acquire)
    }

    /// Spin-yield until the token is free.
    pub(crate) fn acquire(&self) {
        let backoff = Backoff::new();
        while !self.try_acquire() {
            backoff.snooze();
        }
    }

    pub(crate) fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One busy token per parallel unit. Held from the moment the dispatcher
/// pops a request for that unit until the request's completion runs, so a
/// unit never sees two requests in flight.
#[derive(Debug)]
pub(crate) struct UnitLocks {
    units: Box<[CachePadded<BusyFlag>]>,
}

impl UnitLocks {
    pub(crate) fn new(punits: usize) -> UnitLocks {
        UnitLocks {
            units: (0..punits).map(|_| CachePadded::new(BusyFlag::new())).collect(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn try_acquire(&self, unit: usize) -> bool {
        self.units[unit].try_acquire()
    }

    /// Blocking acquire; only the teardown quiescence proof uses this.
    pub(crate) fn acquire(&self, unit: usize) {
        self.units[unit].acquire();
    }

    pub(crate) fn release(&self, unit: usize) {
        self.units[unit].release();
    }
}
