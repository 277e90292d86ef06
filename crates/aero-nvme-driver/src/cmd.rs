//! Submission and completion queue entry formats.
//!
//! Commands are built as a [`Command`] (common header plus one payload variant) and only encoded
//! to the fixed 64-byte [`SubmissionEntry`] layout when they are written into a ring slot.
//! Completions are read as a raw 16-byte [`CompletionEntry`] and decoded into [`Completion`].

use bytemuck::{Pod, Zeroable};

use crate::error::{NvmeError, Result};

#[cfg(target_endian = "big")]
compile_error!("NVMe queue entries are little-endian; big-endian hosts are not supported");

pub const SQE_SIZE: usize = 64;
pub const CQE_SIZE: usize = 16;

/// Admin command opcodes.
pub mod admin_opcode {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const ABORT: u8 = 0x08;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0a;
}

/// NVM command set opcodes.
pub mod io_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

/// Feature identifiers used with Get/Set Features.
pub mod feature {
    pub const VOLATILE_WRITE_CACHE: u8 = 0x06;
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const INTERRUPT_COALESCING: u8 = 0x08;
}

/// Identify CNS values.
pub mod cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const ACTIVE_NAMESPACES: u8 = 0x02;
}

/// Raw 64-byte submission queue entry, exactly as the device reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmissionEntry {
    pub opcode: u8,
    /// FUSE (bits 0:1) and PSDT (bits 6:7). Always zero: PRPs, never fused.
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(core::mem::size_of::<SubmissionEntry>() == SQE_SIZE);

/// Raw 16-byte completion queue entry, exactly as the device writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CompletionEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
}

const _: () = assert!(core::mem::size_of::<CompletionEntry>() == CQE_SIZE);

/// Byte offset of the status halfword inside a CQE. The phase tag is bit 0 of it.
pub const CQE_STATUS_OFFSET: u64 = 14;

/// Fields shared by every command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    pub cid: u16,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
}

/// Starting LBA and block count of a read or write. `blocks` is the real count; it is encoded
/// zero-based on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub slba: u64,
    pub blocks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Read(BlockRange),
    Write(BlockRange),
    Flush,
    Identify {
        cns: u8,
    },
    GetFeatures {
        fid: u8,
    },
    SetFeatures {
        fid: u8,
        value: u32,
    },
    CreateIoCq {
        qid: u16,
        entries: u16,
        vector: u16,
        interrupts: bool,
    },
    CreateIoSq {
        qid: u16,
        entries: u16,
        cqid: u16,
        priority: u8,
    },
    DeleteIoSq {
        qid: u16,
    },
    DeleteIoCq {
        qid: u16,
    },
    Abort {
        sqid: u16,
        cid: u16,
    },
}

impl CommandBody {
    pub fn opcode(&self) -> u8 {
        match self {
            CommandBody::Read(_) => io_opcode::READ,
            CommandBody::Write(_) => io_opcode::WRITE,
            CommandBody::Flush => io_opcode::FLUSH,
            CommandBody::Identify { .. } => admin_opcode::IDENTIFY,
            CommandBody::GetFeatures { .. } => admin_opcode::GET_FEATURES,
            CommandBody::SetFeatures { .. } => admin_opcode::SET_FEATURES,
            CommandBody::CreateIoCq { .. } => admin_opcode::CREATE_IO_CQ,
            CommandBody::CreateIoSq { .. } => admin_opcode::CREATE_IO_SQ,
            CommandBody::DeleteIoSq { .. } => admin_opcode::DELETE_IO_SQ,
            CommandBody::DeleteIoCq { .. } => admin_opcode::DELETE_IO_CQ,
            CommandBody::Abort { .. } => admin_opcode::ABORT,
        }
    }
}

/// A command ready for submission: the common header plus one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            header: CommandHeader::default(),
            body,
        }
    }

    pub fn with_nsid(mut self, nsid: u32) -> Self {
        self.header.nsid = nsid;
        self
    }

    pub fn with_prps(mut self, prp1: u64, prp2: u64) -> Self {
        self.header.prp1 = prp1;
        self.header.prp2 = prp2;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.body.opcode()
    }

    /// Encodes to the on-the-wire 64-byte layout.
    pub fn encode(&self) -> SubmissionEntry {
        let mut sqe = SubmissionEntry::zeroed();
        sqe.opcode = self.opcode();
        sqe.cid = self.header.cid;
        sqe.nsid = self.header.nsid;
        sqe.prp1 = self.header.prp1;
        sqe.prp2 = self.header.prp2;

        match self.body {
            CommandBody::Read(range) | CommandBody::Write(range) => {
                debug_assert!(range.blocks >= 1 && range.blocks <= 1 << 16);
                sqe.cdw10 = range.slba as u32;
                sqe.cdw11 = (range.slba >> 32) as u32;
                sqe.cdw12 = range.blocks.wrapping_sub(1) & 0xffff;
            }
            CommandBody::Flush => {}
            CommandBody::Identify { cns } => {
                sqe.cdw10 = u32::from(cns);
            }
            CommandBody::GetFeatures { fid } => {
                sqe.cdw10 = u32::from(fid);
            }
            CommandBody::SetFeatures { fid, value } => {
                sqe.cdw10 = u32::from(fid);
                sqe.cdw11 = value;
            }
            CommandBody::CreateIoCq {
                qid,
                entries,
                vector,
                interrupts,
            } => {
                sqe.cdw10 = (u32::from(entries - 1) << 16) | u32::from(qid);
                // PC (physically contiguous) is always set.
                let flags = 0x1 | if interrupts { 0x2 } else { 0 };
                sqe.cdw11 = (u32::from(vector) << 16) | flags;
            }
            CommandBody::CreateIoSq {
                qid,
                entries,
                cqid,
                priority,
            } => {
                sqe.cdw10 = (u32::from(entries - 1) << 16) | u32::from(qid);
                sqe.cdw11 = (u32::from(cqid) << 16) | (u32::from(priority & 0x3) << 1) | 0x1;
            }
            CommandBody::DeleteIoSq { qid } | CommandBody::DeleteIoCq { qid } => {
                sqe.cdw10 = u32::from(qid);
            }
            CommandBody::Abort { sqid, cid } => {
                sqe.cdw10 = (u32::from(cid) << 16) | u32::from(sqid);
            }
        }
        sqe
    }
}

/// The status halfword of a completion, phase tag included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub fn phase(self) -> bool {
        self.0 & 0x1 != 0
    }

    /// Status Code.
    pub fn sc(self) -> u8 {
        (self.0 >> 1) as u8
    }

    /// Status Code Type.
    pub fn sct(self) -> u8 {
        ((self.0 >> 9) & 0x7) as u8
    }

    pub fn more(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn do_not_retry(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    pub fn is_success(self) -> bool {
        self.sc() == 0 && self.sct() == 0
    }
}

/// A decoded completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Command specific result (DW0).
    pub result: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: Status,
}

impl Completion {
    pub fn decode(raw: &CompletionEntry) -> Self {
        Self {
            result: raw.dw0,
            sqhd: raw.sqhd,
            sqid: raw.sqid,
            cid: raw.cid,
            status: Status(raw.status),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Maps a failed admin completion to [`NvmeError::CommandFailed`].
    pub fn check_admin(self, opcode: u8) -> Result<Completion> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(NvmeError::CommandFailed {
                opcode,
                sct: self.status.sct(),
                sc: self.status.sc(),
            })
        }
    }

    /// Maps a failed I/O completion to [`NvmeError::Io`].
    pub fn check_io(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(NvmeError::Io {
                sct: self.status.sct(),
                sc: self.status.sc(),
            })
        }
    }
}
