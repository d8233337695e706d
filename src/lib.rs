//! Multi-queue request dispatcher for NAND flash translation layers.
//!
//! An FTL that wants to exploit NAND parallelism has to keep every
//! (channel, chip) pair, a parallel unit, busy without ever letting two
//! requests race on the same unit. This crate provides the dispatch layer
//! that sits between the FTL's mapping logic and the device model: requests
//! go into per-unit priority buckets keyed by logical page address, a
//! single background thread feeds at most one request per unit into the
//! device model, and completions re-enter the dispatcher to free the unit
//! or, for read-modify-write requests, to launch the write phase.
//!
//! The pieces are usable on their own: [`PriorQueue`] is a generic
//! priority-FIFO bucket set with stable slot handles, and
//! [`DispatchStats`] exposes the dispatcher's counters.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use nandmq::{
//!     Completer, Config, DeviceModel, DeviceError, Dispatcher, NandGeometry, NandReq,
//!     PhysAddr, ReqKind, UpperLayer,
//! };
//!
//! // a device model that finishes everything instantly
//! struct Echo;
//! impl DeviceModel for Echo {
//!     fn submit(&self, req: Arc<NandReq>, done: Completer) -> Result<(), DeviceError> {
//!         done.complete(req);
//!         Ok(())
//!     }
//! }
//!
//! struct Sink;
//! impl UpperLayer for Sink {
//!     fn end_req(&self, _req: Arc<NandReq>) {}
//! }
//!
//! let cfg = Config::new(NandGeometry { channels: 4, chips_per_channel: 2 });
//! let llm = Dispatcher::new(cfg, Arc::new(Echo), Arc::new(Sink)).unwrap();
//!
//! let addr = PhysAddr { channel: 1, chip: 0, block: 12, page: 3 };
//! llm.submit(Arc::new(NandReq::new(ReqKind::Read, addr, 88))).unwrap();
//! llm.flush();
//! llm.shutdown();
//! ```

mod addr;
mod dispatch;
mod error;
mod punit;
mod queue;
mod req;
mod stats;
mod wait;

pub use crate::addr::{NandGeometry, PhysAddr};
pub use crate::dispatch::{
    Completer, Config, DEFAULT_QUEUE_HIGH_WATER, DeviceModel, Dispatcher, UpperLayer,
};
pub use crate::error::{CreateError, DeviceError, SubmitError};
pub use crate::queue::{PriorQueue, Slot};
pub use crate::req::{NandReq, ReqKind};
pub use crate::stats::DispatchStats;
