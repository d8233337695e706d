use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::addr::PhysAddr;
use crate::error::DeviceError;
use crate::queue::Slot;

/// What a request asks of the NAND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqKind {
    Read,
    /// Read issued for timing only; the data is discarded.
    ReadDummy,
    Write,
    Trim,
    GcRead,
    GcWrite,
    GcErase,
    /// Read phase of a read-modify-write. Turns into `RmwWrite` when the
    /// read completes.
    RmwRead,
    /// Write phase of a read-modify-write.
    RmwWrite,
}

impl ReqKind {
    /// True for kinds whose completion hands the request back to the upper
    /// layer. Only `RmwRead` has a follow-up phase.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReqKind::RmwRead)
    }
}

/// Mutable per-phase state of a request. The unit busy token is the
/// exclusive-access token while a phase is in flight; this mutex covers the
/// handoffs around it.
#[derive(Debug)]
pub(crate) struct ReqPhase {
    pub(crate) kind: ReqKind,
    /// Location the current phase operates on.
    pub(crate) addr: PhysAddr,
    /// Target of the write phase of a read-modify-write.
    pub(crate) addr_w: PhysAddr,
    /// Queue slot of the in-flight phase, set at dequeue.
    pub(crate) slot: Option<Slot>,
    /// Pre-reserved write-phase slot of a read-modify-write.
    pub(crate) slot_w: Option<Slot>,
    pub(crate) status: Result<(), DeviceError>,
    pub(crate) submitted_at: Option<Instant>,
}

/// A NAND-level I/O request.
///
/// The upper layer builds one, wraps it in an `Arc`, and hands clones to
/// `Dispatcher::submit`; the same `Arc` comes back through
/// `UpperLayer::end_req` once the request (both phases, for RMW) has
/// finished. The logical page address is the priority key: within one
/// parallel unit, lower LPAs dispatch first.
#[derive(Debug)]
pub struct NandReq {
    lpa: u64,
    phase: Mutex<ReqPhase>,
}

impl NandReq {
    /// A single-phase request against `addr`.
    pub fn new(kind: ReqKind, addr: PhysAddr, lpa: u64) -> NandReq {
        NandReq {
            lpa,
            phase: Mutex::new(ReqPhase {
                kind,
                addr,
                addr_w: addr,
                slot: None,
                slot_w: None,
                status: Ok(()),
                submitted_at: None,
            }),
        }
    }

    /// A two-phase read-modify-write: read `addr`, write the merged page to
    /// `addr_w`. The two locations may live on different parallel units.
    pub fn rmw(addr: PhysAddr, addr_w: PhysAddr, lpa: u64) -> NandReq {
        NandReq {
            lpa,
            phase: Mutex::new(ReqPhase {
                kind: ReqKind::RmwRead,
                addr,
                addr_w,
                slot: None,
                slot_w: None,
                status: Ok(()),
                submitted_at: None,
            }),
        }
    }

    /// Logical page address, the intra-unit priority key.
    pub fn lpa(&self) -> u64 {
        self.lpa
    }

    /// Kind of the current phase.
    pub fn kind(&self) -> ReqKind {
        self.phase.lock().kind
    }

    /// Address the current phase targets. For a finished RMW this is the
    /// write location.
    pub fn addr(&self) -> PhysAddr {
        self.phase.lock().addr
    }

    /// Write-phase target of an RMW request.
    pub fn write_addr(&self) -> PhysAddr {
        self.phase.lock().addr_w
    }

    /// `Err` when the device model rejected this request.
    pub fn status(&self) -> Result<(), DeviceError> {
        self.phase.lock().status
    }

    pub(crate) fn phase(&self) -> MutexGuard<'_, ReqPhase> {
        self.phase.lock()
    }
}
