//! Identify data and namespace geometry.

use crate::cmd::BlockRange;
use crate::error::{NvmeError, Result};

/// Size of every Identify data structure.
pub const IDENTIFY_LEN: usize = 4096;

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

/// ASCII, space padded.
fn ascii_field(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_end_matches([' ', '\0']).to_string()
}

/// The parts of Identify Controller (CNS 1) the driver uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyController {
    pub vendor_id: u16,
    pub subsystem_vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size as a power of two of the minimum page size. 0 means no limit.
    pub mdts: u8,
    pub version: u32,
    pub namespace_count: u32,
    /// A volatile write cache is present.
    pub volatile_write_cache: bool,
}

impl IdentifyController {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_LEN);
        Self {
            vendor_id: le_u16(data, 0),
            subsystem_vendor_id: le_u16(data, 2),
            serial: ascii_field(&data[4..24]),
            model: ascii_field(&data[24..64]),
            firmware: ascii_field(&data[64..72]),
            mdts: data[77],
            version: le_u32(data, 80),
            namespace_count: le_u32(data, 516),
            volatile_write_cache: data[525] & 0x1 != 0,
        }
    }

    /// Largest transfer the driver will issue: `4096 << min(MDTS, cap)`, or `4096 << cap` when
    /// the controller reports no limit.
    pub fn max_io_size(&self, shift_cap: u8) -> usize {
        let shift = match self.mdts {
            0 => shift_cap,
            mdts => mdts.min(shift_cap),
        };
        4096usize << shift
    }
}

/// The parts of Identify Namespace (CNS 0) the driver uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyNamespace {
    pub size: u64,
    pub capacity: u64,
    pub utilization: u64,
    /// Data size of the formatted LBA format, as a power of two.
    pub lba_shift: u32,
}

impl IdentifyNamespace {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_LEN);
        let flbas = usize::from(data[26] & 0xf);
        let lbaf = le_u32(data, 128 + flbas * 4);
        Self {
            size: le_u64(data, 0),
            capacity: le_u64(data, 8),
            utilization: le_u64(data, 16),
            lba_shift: (lbaf >> 16) & 0xff,
        }
    }
}

/// Parses an active namespace id list (CNS 2). The list ends at the first zero entry.
pub fn parse_namespace_list(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .take_while(|&nsid| nsid != 0)
        .collect()
}

/// Geometry of one attached namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    pub id: u32,
    pub block_shift: u32,
    pub block_count: u64,
}

impl Namespace {
    pub fn from_identify(id: u32, identify: &IdentifyNamespace) -> Result<Self> {
        // LBADS below 9 is reserved.
        if !(9..=16).contains(&identify.lba_shift) {
            return Err(NvmeError::InvalidRequest("unsupported LBA data size"));
        }
        Ok(Self {
            id,
            block_shift: identify.lba_shift,
            block_count: identify.capacity,
        })
    }

    pub fn block_size(&self) -> u64 {
        1 << self.block_shift
    }

    pub fn size_bytes(&self) -> u64 {
        self.block_count << self.block_shift
    }

    /// Converts a byte range to whole blocks, rejecting unaligned or out-of-range requests.
    pub fn block_range(&self, offset: u64, len: usize) -> Result<BlockRange> {
        let len = len as u64;
        let mask = self.block_size() - 1;
        if len == 0 {
            return Err(NvmeError::InvalidRequest("zero-length transfer"));
        }
        if offset & mask != 0 || len & mask != 0 {
            return Err(NvmeError::InvalidRequest("transfer not block aligned"));
        }
        let end = offset
            .checked_add(len)
            .ok_or(NvmeError::InvalidRequest("transfer beyond end of namespace"))?;
        if end > self.size_bytes() {
            return Err(NvmeError::InvalidRequest("transfer beyond end of namespace"));
        }
        let blocks = len >> self.block_shift;
        if blocks > 1 << 16 {
            return Err(NvmeError::InvalidRequest("transfer exceeds 65536 blocks"));
        }
        Ok(BlockRange {
            slba: offset >> self.block_shift,
            blocks: blocks as u32,
        })
    }
}

/// What the block layer needs to register one namespace as a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// `nvme{instance}n{nsid}`.
    pub name: String,
    pub nsid: u32,
    pub size_bytes: u64,
    pub block_size: u64,
    pub max_io_size: usize,
}
