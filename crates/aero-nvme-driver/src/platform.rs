//! Contracts the engine consumes from the surrounding OS and driver framework.
//!
//! PCI discovery, physical memory management, MSI-X programming and the scheduler live outside
//! this crate. The controller only ever talks to them through these traits.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Memory-mapped register access at the controller's BAR0.
pub trait RegisterBus: Send + Sync {
    fn read_u32(&self, offset: u64) -> u32;
    fn write_u32(&self, offset: u64, value: u32);
    fn read_u64(&self, offset: u64) -> u64;
    fn write_u64(&self, offset: u64, value: u64);
}

/// Access to physical memory shared with the device (rings, PRP lists, identify buffers).
///
/// Implementations must make device writes visible to `read_physical` without caching; the
/// completion ring is polled through it while the device is writing.
pub trait MemoryBus: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&self, paddr: u64, buf: &[u8]);

    fn read_u16(&self, paddr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&self, paddr: u64, val: u64) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn fill(&self, paddr: u64, len: usize, byte: u8) {
        self.write_physical(paddr, &vec![byte; len]);
    }
}

/// Physically contiguous, page-aligned DMA memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `len` bytes (rounded up to whole pages by the implementation) and returns the
    /// physical address. Fails with [`crate::NvmeError::OutOfMemory`].
    fn alloc(&self, len: usize) -> Result<u64>;
    fn free(&self, paddr: u64, len: usize);
}

pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// MSI-X vectors of the controller's PCI function.
pub trait InterruptController: Send + Sync {
    /// Number of vectors available to the driver.
    fn vector_count(&self) -> u16;
    /// Routes `vector` to `handler`. The vector stays masked until [`Self::unmask`].
    fn bind(&self, vector: u16, handler: InterruptHandler) -> Result<()>;
    fn unbind(&self, vector: u16);
    fn set_affinity(&self, vector: u16, cpu: usize);
    fn mask(&self, vector: u16);
    fn unmask(&self, vector: u16);
}

pub trait CpuTopology: Send + Sync {
    fn cpu_count(&self) -> usize;
    /// CPU the calling thread is running on.
    fn current_cpu(&self) -> usize;
    /// Pins the calling thread to `cpu`.
    fn pin_current_thread(&self, cpu: usize);
}

/// Everything a controller instance needs from its environment.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterBus>,
    pub memory: Arc<dyn MemoryBus>,
    pub dma: Arc<dyn DmaAllocator>,
    pub interrupts: Arc<dyn InterruptController>,
    pub cpus: Arc<dyn CpuTopology>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("vectors", &self.interrupts.vector_count())
            .field("cpus", &self.cpus.cpu_count())
            .finish_non_exhaustive()
    }
}

/// Owner of one DMA allocation; returns it to the allocator on drop.
pub struct DmaBuffer {
    paddr: u64,
    len: usize,
    dma: Arc<dyn DmaAllocator>,
}

impl DmaBuffer {
    /// Allocates and zeroes `len` bytes.
    pub fn new_zeroed(dma: &Arc<dyn DmaAllocator>, memory: &dyn MemoryBus, len: usize) -> Result<Self> {
        let paddr = dma.alloc(len)?;
        memory.fill(paddr, len, 0);
        Ok(Self {
            paddr,
            len,
            dma: Arc::clone(dma),
        })
    }

    /// Takes ownership of an allocation made directly through `dma`. Contents are left as-is.
    pub fn from_raw(paddr: u64, len: usize, dma: Arc<dyn DmaAllocator>) -> Self {
        Self { paddr, len, dma }
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.dma.free(self.paddr, self.len);
    }
}
