//! Thread-level scenarios: ordering, cross-unit independence, RMW phase
//! discipline, backpressure and conservation under producer load.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::yield_now;
use std::time::{Duration, Instant};

use crossbeam::scope;
use parking_lot::Mutex;

use nandmq::{
    Completer, Config, DeviceError, DeviceModel, Dispatcher, NandGeometry, NandReq, PhysAddr,
    ReqKind, UpperLayer,
};

fn geo(channels: usize, chips_per_channel: usize) -> NandGeometry {
    NandGeometry {
        channels,
        chips_per_channel,
    }
}

fn at(channel: usize, chip: usize) -> PhysAddr {
    PhysAddr {
        channel,
        chip,
        block: 0,
        page: 0,
    }
}

fn read(addr: PhysAddr, lpa: u64) -> Arc<NandReq> {
    Arc::new(NandReq::new(ReqKind::Read, addr, lpa))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spin_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        yield_now();
    }
}

#[derive(Default)]
struct Recorder {
    done: AtomicUsize,
    lpas: Mutex<Vec<u64>>,
}

impl UpperLayer for Recorder {
    fn end_req(&self, req: Arc<NandReq>) {
        self.lpas.lock().push(req.lpa());
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

impl Recorder {
    fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

/// Parks accepted phases until the test completes them by hand, recording
/// the order they arrived in.
#[derive(Default)]
struct HoldDevice {
    held: Mutex<VecDeque<(Arc<NandReq>, Completer)>>,
    received: Mutex<Vec<(ReqKind, u64)>>,
}

impl DeviceModel for HoldDevice {
    fn submit(&self, req: Arc<NandReq>, done: Completer) -> Result<(), DeviceError> {
        self.received.lock().push((req.kind(), req.lpa()));
        self.held.lock().push_back((req, done));
        Ok(())
    }
}

impl HoldDevice {
    fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    fn release_one(&self) -> bool {
        let popped = self.held.lock().pop_front();
        match popped {
            Some((req, done)) => {
                done.complete(req);
                true
            }
            None => false,
        }
    }
}

#[test]
fn same_unit_dispatches_in_lpa_order() {
    init_tracing();
    let dev = Arc::new(HoldDevice::default());
    let upper = Arc::new(Recorder::default());
    let llm = Dispatcher::new(Config::new(geo(1, 1)), dev.clone(), upper.clone()).unwrap();

    // first request occupies the only unit while it sits in the device
    llm.submit(read(at(0, 0), 20)).unwrap();
    spin_until("first dispatch", || dev.received_count() == 1);

    // these two queue up behind it, out of LPA order
    llm.submit(read(at(0, 0), 9)).unwrap();
    llm.submit(read(at(0, 0), 3)).unwrap();

    while upper.done() < 3 {
        dev.release_one();
        yield_now();
    }
    assert_eq!(
        *dev.received.lock(),
        vec![(ReqKind::Read, 20), (ReqKind::Read, 3), (ReqKind::Read, 9)]
    );
    llm.shutdown();
}

#[test]
fn stalled_unit_does_not_block_the_rest() {
    init_tracing();
    let dev = Arc::new(HoldDevice::default());
    let upper = Arc::new(Recorder::default());
    let llm = Dispatcher::new(Config::new(geo(2, 1)), dev.clone(), upper.clone()).unwrap();

    llm.submit(read(at(0, 0), 1)).unwrap();
    spin_until("unit 0 dispatch", || dev.received_count() == 1);

    // unit 0 is wedged; unit 1 must still get serviced
    llm.submit(read(at(1, 0), 2)).unwrap();
    spin_until("unit 1 dispatch", || dev.received_count() == 2);

    // a second request for the wedged unit stays queued
    llm.submit(read(at(0, 0), 3)).unwrap();
    for _ in 0..1000 {
        yield_now();
    }
    assert_eq!(dev.received_count(), 2);

    while upper.done() < 3 {
        dev.release_one();
        yield_now();
    }
    llm.shutdown();
}

#[test]
fn rmw_write_phase_waits_for_the_read() {
    init_tracing();
    let dev = Arc::new(HoldDevice::default());
    let upper = Arc::new(Recorder::default());
    let llm = Dispatcher::new(Config::new(geo(2, 1)), dev.clone(), upper.clone()).unwrap();

    let addr_w = PhysAddr {
        channel: 1,
        chip: 0,
        block: 5,
        page: 0,
    };
    let req = Arc::new(NandReq::rmw(at(0, 0), addr_w, 42));
    llm.submit(Arc::clone(&req)).unwrap();

    spin_until("read phase dispatch", || dev.received_count() == 1);
    assert_eq!(dev.received.lock()[0], (ReqKind::RmwRead, 42));

    // the write unit is idle, but the write phase must not show up while
    // the read is still in flight
    for _ in 0..1000 {
        yield_now();
    }
    assert_eq!(dev.received_count(), 1);

    assert!(dev.release_one());
    spin_until("write phase dispatch", || dev.received_count() == 2);
    assert_eq!(dev.received.lock()[1], (ReqKind::RmwWrite, 42));
    assert_eq!(req.addr(), addr_w);

    assert!(dev.release_one());
    spin_until("end_req", || upper.done() == 1);

    assert_eq!(llm.stats().dispatched(), 2);
    assert_eq!(llm.stats().completed(), 1);
    assert_eq!(llm.stats().rmw_turnarounds(), 1);
    llm.shutdown();
}

#[test]
fn submit_stalls_at_the_high_water_mark() {
    init_tracing();
    const HIGH_WATER: usize = 8;

    let dev = Arc::new(HoldDevice::default());
    let upper = Arc::new(Recorder::default());
    let mut cfg = Config::new(geo(1, 1));
    cfg.queue_high_water = HIGH_WATER;
    let llm = Dispatcher::new(cfg, dev.clone(), upper.clone()).unwrap();

    // one in flight at the device plus seven queued: exactly at the mark
    for lpa in 0..HIGH_WATER as u64 {
        llm.submit(read(at(0, 0), lpa)).unwrap();
    }
    spin_until("first dispatch", || dev.received_count() == 1);

    let over = AtomicBool::new(false);
    scope(|s| {
        s.spawn(|_| {
            llm.submit(read(at(0, 0), 99)).unwrap();
            over.store(true, Ordering::SeqCst);
        });

        // the submitter must be stuck in admission control
        for _ in 0..10_000 {
            yield_now();
        }
        assert!(!over.load(Ordering::SeqCst));

        // one completion frees a slot and lets it through
        assert!(dev.release_one());
        spin_until("overflow submit", || over.load(Ordering::SeqCst));

        while upper.done() < HIGH_WATER + 1 {
            dev.release_one();
            yield_now();
        }
    })
    .unwrap();
    llm.shutdown();
}

/// Device that checks the one-request-per-unit contract while completing
/// from its own thread.
struct ExclusionDevice {
    geometry: NandGeometry,
    in_flight: Vec<AtomicUsize>,
    violations: AtomicUsize,
    held: Mutex<VecDeque<(Arc<NandReq>, Completer)>>,
}

impl ExclusionDevice {
    fn new(geometry: NandGeometry) -> ExclusionDevice {
        ExclusionDevice {
            geometry,
            in_flight: (0..geometry.punits()).map(|_| AtomicUsize::new(0)).collect(),
            violations: AtomicUsize::new(0),
            held: Mutex::default(),
        }
    }

    fn complete_one(&self) -> bool {
        let popped = self.held.lock().pop_front();
        match popped {
            Some((req, done)) => {
                let unit = self.geometry.punit_of(req.addr());
                self.in_flight[unit].fetch_sub(1, Ordering::SeqCst);
                done.complete(req);
                true
            }
            None => false,
        }
    }
}

impl DeviceModel for ExclusionDevice {
    fn submit(&self, req: Arc<NandReq>, done: Completer) -> Result<(), DeviceError> {
        let unit = self.geometry.punit_of(req.addr());
        if self.in_flight[unit].fetch_add(1, Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.held.lock().push_back((req, done));
        Ok(())
    }
}

#[test]
fn conservation_and_exclusion_under_producer_load() {
    init_tracing();
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 200;

    let geometry = geo(4, 2);
    let dev = Arc::new(ExclusionDevice::new(geometry));
    let upper = Arc::new(Recorder::default());
    let llm = Dispatcher::new(Config::new(geometry), dev.clone(), upper.clone()).unwrap();

    let mut rmw_count = 0;
    for i in 0..PER_PRODUCER {
        if i % 5 == 0 {
            rmw_count += PRODUCERS;
        }
    }

    scope(|s| {
        // the device's completion context
        let drainer = {
            let dev = dev.clone();
            let upper = upper.clone();
            s.spawn(move |_| {
                while upper.done() < PRODUCERS * PER_PRODUCER {
                    if !dev.complete_one() {
                        yield_now();
                    }
                }
            })
        };

        for p in 0..PRODUCERS {
            let llm = &llm;
            s.spawn(move |_| {
                for i in 0..PER_PRODUCER {
                    let lpa = (p * PER_PRODUCER + i) as u64;
                    let channel = i % 4;
                    let chip = (i / 4) % 2;
                    let req = if i % 5 == 0 {
                        let w = at((channel + 1) % 4, chip);
                        Arc::new(NandReq::rmw(at(channel, chip), w, lpa))
                    } else {
                        read(at(channel, chip), lpa)
                    };
                    llm.submit(req).unwrap();
                }
            });
        }

        drainer.join().unwrap();
    })
    .unwrap();

    llm.flush();
    assert_eq!(upper.done(), PRODUCERS * PER_PRODUCER);
    assert_eq!(dev.violations.load(Ordering::SeqCst), 0);

    // every submitted request came back exactly once
    let mut lpas = upper.lpas.lock().clone();
    lpas.sort_unstable();
    let expected: Vec<u64> = (0..(PRODUCERS * PER_PRODUCER) as u64).collect();
    assert_eq!(lpas, expected);

    let stats = llm.stats();
    assert_eq!(stats.submitted(), (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.completed(), (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.dispatched(), (PRODUCERS * PER_PRODUCER + rmw_count) as u64);
    assert_eq!(stats.rmw_turnarounds(), rmw_count as u64);
    llm.shutdown();
}

#[test]
fn flush_is_a_drain_barrier_for_quiet_producers() {
    init_tracing();
    let dev = Arc::new(HoldDevice::default());
    let upper = Arc::new(Recorder::default());
    let llm = Dispatcher::new(Config::new(geo(2, 2)), dev.clone(), upper.clone()).unwrap();

    for lpa in 0..8u64 {
        llm.submit(read(at((lpa % 2) as usize, (lpa % 4 / 2) as usize), lpa)).unwrap();
    }

    scope(|s| {
        s.spawn(|_| {
            while upper.done() < 8 {
                if !dev.release_one() {
                    yield_now();
                }
            }
        });
        llm.flush();
    })
    .unwrap();

    assert_eq!(upper.done(), 8);
    llm.shutdown();
}
