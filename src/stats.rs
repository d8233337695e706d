use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running totals kept by the dispatcher. All counters are monotone and
/// updated with relaxed atomics; read them for monitoring, not for
/// synchronization.
#[derive(Debug, Default)]
pub struct DispatchStats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    rmw_turnarounds: AtomicU64,
    device_rejects: AtomicU64,
    queue_wait_ns: AtomicU64,
    total_ns: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_dispatch(&self, queued: Duration) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.queue_wait_ns
            .fetch_add(queued.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_rmw_turnaround(&self) {
        self.rmw_turnarounds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_complete(&self, total: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_ns
            .fetch_add(total.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_device_reject(&self) {
        self.device_rejects.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests accepted by `submit`. An RMW request counts once.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Phases handed to the device model. An RMW request counts twice.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Requests handed back to the upper layer. An RMW request counts once.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Read phases that advanced to their write phase.
    pub fn rmw_turnarounds(&self) -> u64 {
        self.rmw_turnarounds.load(Ordering::Relaxed)
    }

    /// Phases the device model refused.
    pub fn device_rejects(&self) -> u64 {
        self.device_rejects.load(Ordering::Relaxed)
    }

    /// Accumulated submit-to-dispatch time across all phases.
    pub fn queue_wait(&self) -> Duration {
        Duration::from_nanos(self.queue_wait_ns.load(Ordering::Relaxed))
    }

    /// Accumulated submit-to-completion time across all requests.
    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }
}
