use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NvmeError>;

/// Errors surfaced by the NVMe queue engine.
///
/// Bring-up failures unwind to the attaching caller. Per-request failures are
/// delivered through the request's completion callback and never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvmeError {
    /// The controller did not reach the expected CSTS.RDY value within the
    /// CAP.TO derived timeout.
    #[error("controller did not reach ready={expected_ready} within {waited:?}")]
    Timeout { expected_ready: bool, waited: Duration },

    #[error("out of DMA memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    /// An admin command completed with a non-zero status.
    #[error("admin command {opcode:#04x} failed: sct={sct:#x} sc={sc:#x}")]
    CommandFailed { opcode: u8, sct: u8, sc: u8 },

    /// An I/O command completed with a non-zero status.
    #[error("I/O error: sct={sct:#x} sc={sc:#x}")]
    Io { sct: u8, sc: u8 },

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("no such namespace: {0}")]
    NoSuchNamespace(u32),

    /// The controller cannot run with the host's fixed 4 KiB page size.
    #[error("unsupported controller: {0}")]
    Unsupported(&'static str),

    #[error("interrupt setup failed: {0}")]
    InterruptSetup(&'static str),

    #[error("failed to spawn worker thread {0}")]
    WorkerSpawn(String),

    /// The request was still outstanding when its queue pair was torn down.
    #[error("queue pair shut down")]
    Shutdown,
}

impl NvmeError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, NvmeError::OutOfMemory { .. })
    }
}
