use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::utils::Backoff;
use tracing::{debug, error, trace, warn};

use crate::addr::{NandGeometry, PhysAddr};
use crate::error::{CreateError, DeviceError, SubmitError};
use crate::punit::{BusyFlag, UnitLocks};
use crate::queue::PriorQueue;
use crate::req::{NandReq, ReqKind};
use crate::stats::DispatchStats;
use crate::wait::DispatchWait;

/// Default admission-control threshold: total queued plus in-flight
/// requests above which `submit` stalls its caller.
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 256;

/// Dispatcher construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub geometry: NandGeometry,
    /// Admission-control threshold, see [`DEFAULT_QUEUE_HIGH_WATER`].
    pub queue_high_water: usize,
    /// Serialize every request end-to-end: `submit` blocks until the
    /// previous request has fully completed. Debugging aid only.
    pub serialize_for_debug: bool,
}

impl Config {
    pub fn new(geometry: NandGeometry) -> Config {
        Config {
            geometry,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            serialize_for_debug: false,
        }
    }
}

/// Backend that owns the actual NAND, simulated or real.
pub trait DeviceModel: Send + Sync {
    /// Accept a phase for asynchronous execution. The implementation must
    /// eventually call `completer.complete(req)` exactly once per accepted
    /// phase, from any thread, including from inside this call. On `Err`
    /// the dispatcher unwinds as if the phase had completed with the error
    /// recorded on the request.
    fn submit(&self, req: Arc<NandReq>, completer: Completer) -> Result<(), DeviceError>;
}

/// Upper FTL layer that receives finished requests.
pub trait UpperLayer: Send + Sync {
    /// Called exactly once per submitted request, after its final phase.
    fn end_req(&self, req: Arc<NandReq>);
}

struct Shared {
    geometry: NandGeometry,
    high_water: usize,
    queue: PriorQueue<Arc<NandReq>>,
    locks: UnitLocks,
    wait: DispatchWait,
    stop: AtomicBool,
    stats: DispatchStats,
    /// End-to-end serializer token, present under `serialize_for_debug`.
    seq_dbg: Option<BusyFlag>,
    device: Arc<dyn DeviceModel>,
    upper: Arc<dyn UpperLayer>,
    /// Source of the weak handles baked into completers.
    this: Weak<Shared>,
}

/// Handle a device model uses to hand a finished phase back. Holds the
/// dispatcher weakly, so a device model keeping completers around does not
/// keep a torn-down dispatcher alive.
#[derive(Clone)]
pub struct Completer {
    shared: Weak<Shared>,
}

impl Completer {
    /// Re-enter the dispatcher with a finished phase. Safe to call from
    /// any thread, including the dispatcher's own during a synchronous
    /// device submit.
    pub fn complete(&self, req: Arc<NandReq>) {
        match self.shared.upgrade() {
            Some(shared) => shared.complete(req),
            None => warn!(lpa = req.lpa(), "completion arrived after dispatcher teardown"),
        }
    }
}

/// Multi-queue request dispatcher for a NAND array.
///
/// Requests are steered to per-unit priority buckets keyed by LPA; a single
/// background thread scans the units round-robin and keeps at most one
/// request in flight per unit, so independent units proceed in parallel
/// while each unit stays strictly serial. Read-modify-write requests pass
/// through the dispatcher twice, read phase first.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use nandmq::{
///     Completer, Config, DeviceModel, DeviceError, Dispatcher, NandGeometry, NandReq,
///     PhysAddr, ReqKind, UpperLayer,
/// };
///
/// struct Echo;
/// impl DeviceModel for Echo {
///     fn submit(&self, req: Arc<NandReq>, done: Completer) -> Result<(), DeviceError> {
///         done.complete(req);
///         Ok(())
///     }
/// }
///
/// struct Sink;
/// impl UpperLayer for Sink {
///     fn end_req(&self, _req: Arc<NandReq>) {}
/// }
///
/// let cfg = Config::new(NandGeometry { channels: 2, chips_per_channel: 2 });
/// let llm = Dispatcher::new(cfg, Arc::new(Echo), Arc::new(Sink)).unwrap();
///
/// let addr = PhysAddr { channel: 0, chip: 1, block: 3, page: 7 };
/// let req = Arc::new(NandReq::new(ReqKind::Read, addr, 42));
/// llm.submit(Arc::clone(&req)).unwrap();
/// llm.flush();
/// assert!(req.status().is_ok());
/// llm.shutdown();
/// ```
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Bring up the dispatcher: build the per-unit queue and lock array and
    /// spawn the worker thread.
    pub fn new(
        cfg: Config,
        device: Arc<dyn DeviceModel>,
        upper: Arc<dyn UpperLayer>,
    ) -> Result<Dispatcher, CreateError> {
        let punits = cfg.geometry.punits();
        if punits == 0 {
            return Err(CreateError::NoUnits {
                channels: cfg.geometry.channels,
                chips_per_channel: cfg.geometry.chips_per_channel,
            });
        }
        let shared = Arc::new_cyclic(|this| Shared {
            geometry: cfg.geometry,
            high_water: cfg.queue_high_water,
            queue: PriorQueue::new(punits),
            locks: UnitLocks::new(punits),
            wait: DispatchWait::new(),
            stop: AtomicBool::new(false),
            stats: DispatchStats::default(),
            seq_dbg: cfg.serialize_for_debug.then(BusyFlag::new),
            device,
            upper,
            this: this.clone(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nandmq-dispatch".into())
                .spawn(move || shared.run())?
        };
        debug!(punits, high_water = cfg.queue_high_water, "dispatcher up");
        Ok(Dispatcher {
            shared,
            worker: Some(worker),
        })
    }

    /// Admit a request. Blocks (spin-yield) while the queue sits at the
    /// high-water mark; this is the only backpressure against the caller.
    /// On error the request was not enqueued and stays with the caller.
    pub fn submit(&self, req: Arc<NandReq>) -> Result<(), SubmitError> {
        self.shared.submit(req)
    }

    /// Wait until nothing is queued or in flight. Does not block
    /// concurrent submitters, so with active producers this is a moving
    /// target; with quiet producers it is a drain barrier.
    pub fn flush(&self) {
        self.shared.drain();
    }

    /// Running counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.shared.stats
    }

    /// Drain, stop the worker thread, and prove quiescence by acquiring
    /// every unit token. Callers must have stopped submitting first.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.drain();
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wait.notify();
        if worker.join().is_err() {
            error!("dispatcher thread panicked");
        }
        // no request can be in flight once every token is held
        for unit in 0..self.shared.locks.count() {
            self.shared.locks.acquire(unit);
        }
        debug!("dispatcher down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Shared {
    fn unit_checked(&self, addr: PhysAddr) -> Result<usize, SubmitError> {
        if !self.geometry.contains(addr) {
            return Err(SubmitError::UnitOutOfRange {
                channel: addr.channel,
                chip: addr.chip,
            });
        }
        Ok(self.geometry.punit_of(addr))
    }

    fn submit(&self, req: Arc<NandReq>) -> Result<(), SubmitError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        let (unit, unit_w) = {
            let phase = req.phase();
            let unit = self.unit_checked(phase.addr)?;
            let unit_w = match phase.kind {
                ReqKind::RmwRead => Some(self.unit_checked(phase.addr_w)?),
                _ => None,
            };
            (unit, unit_w)
        };

        if let Some(token) = &self.seq_dbg {
            token.acquire();
        }
        req.phase().submitted_at = Some(Instant::now());
        self.stats.on_submit();

        let backoff = Backoff::new();
        while self.queue.nr_items() >= self.high_water {
            backoff.snooze();
        }

        match unit_w {
            Some(unit_w) => {
                // Reserve the write phase up front so the pair rides one
                // admission pass, but keep it undispatchable until the read
                // completes; the reservation must exist before the read
                // slot does, or an immediate read completion would find
                // nothing to activate.
                let slot_w = self.queue.enqueue_deferred(unit_w, req.lpa(), Arc::clone(&req));
                req.phase().slot_w = Some(slot_w);
                self.queue.enqueue(unit, req.lpa(), Arc::clone(&req));
            }
            None => {
                self.queue.enqueue(unit, req.lpa(), Arc::clone(&req));
            }
        }
        self.wait.notify();
        Ok(())
    }

    fn run(&self) {
        trace!("dispatcher thread running");
        loop {
            if self.queue.is_all_empty() {
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
                let seen = self.wait.prepare();
                if self.queue.is_all_empty() && !self.stop.load(Ordering::Acquire) {
                    self.wait.wait(seen);
                }
                continue;
            }
            let mut dispatched = false;
            for unit in 0..self.locks.count() {
                if !self.locks.try_acquire(unit) {
                    continue;
                }
                match self.queue.dequeue(unit) {
                    Some((req, slot)) => {
                        req.phase().slot = Some(slot);
                        dispatched = true;
                        self.dispatch_one(unit, req);
                    }
                    None => self.locks.release(unit),
                }
            }
            if !dispatched {
                // everything eligible is behind a busy unit
                thread::yield_now();
            }
        }
        trace!("dispatcher thread stopped");
    }

    fn dispatch_one(&self, unit: usize, req: Arc<NandReq>) {
        let queued = req
            .phase()
            .submitted_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.stats.on_dispatch(queued);
        trace!(unit, lpa = req.lpa(), kind = ?req.kind(), "dispatching");

        let completer = Completer {
            shared: self.this.clone(),
        };
        if let Err(err) = self.device.submit(Arc::clone(&req), completer) {
            warn!(unit, lpa = req.lpa(), %err, "device model rejected request");
            self.stats.on_device_reject();
            req.phase().status = Err(err);
            // unwind the unit token and queue slot through the one
            // completion path
            self.complete(req);
        }
    }

    fn complete(&self, req: Arc<NandReq>) {
        match req.kind() {
            ReqKind::RmwRead => self.complete_rmw_read(req),
            _ => self.complete_terminal(req),
        }
    }

    /// Read phase of an RMW finished: free its unit, rewrite the request
    /// into its write phase, and let the pre-reserved write slot loose.
    fn complete_rmw_read(&self, req: Arc<NandReq>) {
        let mut phase = req.phase();
        let Some(slot) = phase.slot.take() else {
            error!(lpa = req.lpa(), "rmw read completion without a queue slot");
            return;
        };
        let read_unit = self.geometry.punit_of(phase.addr);
        self.locks.release(read_unit);

        phase.addr = phase.addr_w;
        phase.kind = ReqKind::RmwWrite;
        self.queue.remove(slot);
        match phase.slot_w.take() {
            Some(slot_w) => {
                self.queue.activate(slot_w);
            }
            None => error!(lpa = req.lpa(), "rmw read completed without a reserved write slot"),
        }
        drop(phase);
        self.stats.on_rmw_turnaround();
        self.wait.notify();
    }

    fn complete_terminal(&self, req: Arc<NandReq>) {
        let (unit, total) = {
            let mut phase = req.phase();
            let Some(slot) = phase.slot.take() else {
                error!(
                    lpa = req.lpa(),
                    kind = ?phase.kind,
                    "completion for a request that is not in flight"
                );
                return;
            };
            self.queue.remove(slot);
            let unit = self.geometry.punit_of(phase.addr);
            let total = phase.submitted_at.map(|t| t.elapsed()).unwrap_or_default();
            (unit, total)
        };
        self.locks.release(unit);
        self.stats.on_complete(total);
        self.upper.end_req(req);
        if let Some(token) = &self.seq_dbg {
            token.release();
        }
    }

    fn drain(&self) {
        let backoff = Backoff::new();
        while !self.queue.is_all_empty() {
            backoff.snooze();
        }
    }
}
