//! NVMe command-queue engine.
//!
//! Turns block requests into NVMe submission queue entries, tracks them through asynchronous
//! completion and reports each outcome back to its requester exactly once. The controller is
//! brought up and driven through a small set of admin and I/O queue pairs; everything outside
//! that (PCI, MSI-X, physical memory, threads) is reached through the traits in [`platform`].
//!
//! ```text
//!   make_request(bio, nsid)
//!          |
//!   NvmeController ── picks queue = current_cpu % queues
//!          |
//!   IoQueuePair ── PRP mapping, cid from the pending table, SQE into the ring, doorbell
//!          |
//!   device ── CQE + MSI-X vector
//!          |
//!   worker thread ── CQE -> pending slot -> bio callback
//! ```

pub mod admin;
pub mod bio;
pub mod cmd;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod io_queue;
pub mod namespace;
pub mod pending;
pub mod platform;
pub mod prp;
pub mod queue;
pub mod regs;
pub mod ring;

#[cfg(test)]
mod test_util;

pub use bio::{Bio, BioCallback, BioOp};
pub use cmd::{BlockRange, Command, CommandBody, Completion, Status};
pub use config::{InterruptCoalescing, NvmeConfig};
pub use controller::{next_instance_id, ControllerInfo, NvmeController};
pub use error::{NvmeError, Result};
pub use io_queue::IoQueuePair;
pub use namespace::{BlockDeviceInfo, Namespace};
pub use platform::{
    CpuTopology, DmaAllocator, DmaBuffer, InterruptController, InterruptHandler, MemoryBus,
    Platform, RegisterBus,
};
