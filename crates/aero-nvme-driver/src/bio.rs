//! Generic block request handed down by the block layer.

use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    Read,
    Write,
    Flush,
}

pub type BioCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One block request: operation, byte range, data buffer and completion callback.
///
/// `data` is the physical address of a physically contiguous buffer of `len` bytes. It need not
/// be page aligned. The callback runs exactly once, on the completing thread.
pub struct Bio {
    pub op: BioOp,
    pub offset: u64,
    pub len: usize,
    pub data: u64,
    done: BioCallback,
}

impl Bio {
    pub fn new(op: BioOp, offset: u64, len: usize, data: u64, done: BioCallback) -> Self {
        Self {
            op,
            offset,
            len,
            data,
            done,
        }
    }

    pub fn read(offset: u64, len: usize, data: u64, done: BioCallback) -> Self {
        Self::new(BioOp::Read, offset, len, data, done)
    }

    pub fn write(offset: u64, len: usize, data: u64, done: BioCallback) -> Self {
        Self::new(BioOp::Write, offset, len, data, done)
    }

    pub fn flush(done: BioCallback) -> Self {
        Self::new(BioOp::Flush, 0, 0, 0, done)
    }

    /// Consumes the request and runs its callback.
    pub fn complete(self, result: Result<()>) {
        (self.done)(result);
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("data", &format_args!("{:#x}", self.data))
            .finish_non_exhaustive()
    }
}
