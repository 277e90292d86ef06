//! In-crate fakes for the platform contracts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::cmd::{CompletionEntry, CQE_SIZE};
use crate::error::{NvmeError, Result};
use crate::platform::{
    CpuTopology, DmaAllocator, InterruptController, InterruptHandler, MemoryBus, Platform,
    RegisterBus,
};
use crate::regs::PAGE_SIZE;

/// Flat physical memory starting at address 0.
pub struct TestMemory {
    bytes: Mutex<Vec<u8>>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        let start = paddr as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let start = paddr as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
    }
}

#[derive(Default)]
struct DmaState {
    next: u64,
    free_pages: Vec<u64>,
    live: BTreeMap<u64, usize>,
    allocations: usize,
    fail_after: Option<usize>,
}

/// Page-granular bump allocator that recycles single pages.
pub struct TestDma {
    limit: u64,
    state: Mutex<DmaState>,
}

impl TestDma {
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(DmaState {
                next: base,
                ..DmaState::default()
            }),
        }
    }

    /// Fails every allocation after the next `n` succeed.
    pub fn fail_after(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_after = Some(state.allocations + n);
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn allocations(&self) -> usize {
        self.state.lock().unwrap().allocations
    }
}

impl DmaAllocator for TestDma {
    fn alloc(&self, len: usize) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_after.is_some_and(|n| state.allocations >= n) {
            return Err(NvmeError::OutOfMemory { len });
        }
        let pages = len.max(1).div_ceil(PAGE_SIZE);
        let paddr = match state.free_pages.pop() {
            Some(paddr) if pages == 1 => paddr,
            other => {
                if let Some(paddr) = other {
                    state.free_pages.push(paddr);
                }
                let paddr = state.next;
                let end = paddr + (pages * PAGE_SIZE) as u64;
                if end > self.limit {
                    return Err(NvmeError::OutOfMemory { len });
                }
                state.next = end;
                paddr
            }
        };
        state.allocations += 1;
        state.live.insert(paddr, len);
        Ok(paddr)
    }

    fn free(&self, paddr: u64, len: usize) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.live.remove(&paddr), Some(len), "bad free of {paddr:#x}");
        if len <= PAGE_SIZE {
            state.free_pages.push(paddr);
        }
    }
}

/// Records every register write; reads return what was last written.
#[derive(Default)]
pub struct TestRegs {
    writes: Mutex<Vec<(u64, u64)>>,
}

impl TestRegs {
    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.writes.lock().unwrap().clone()
    }

    fn last(&self, offset: u64) -> u64 {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(off, _)| *off == offset)
            .map_or(0, |(_, v)| *v)
    }
}

impl RegisterBus for TestRegs {
    fn read_u32(&self, offset: u64) -> u32 {
        self.last(offset) as u32
    }

    fn write_u32(&self, offset: u64, value: u32) {
        self.writes.lock().unwrap().push((offset, u64::from(value)));
    }

    fn read_u64(&self, offset: u64) -> u64 {
        self.last(offset)
    }

    fn write_u64(&self, offset: u64, value: u64) {
        self.writes.lock().unwrap().push((offset, value));
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Logs mask/unmask calls and optionally runs a hook on unmask.
#[derive(Default)]
pub struct TestInterrupts {
    calls: Mutex<Vec<String>>,
    handlers: Mutex<BTreeMap<u16, InterruptHandler>>,
    unmask_hook: Mutex<Option<Hook>>,
}

impl TestInterrupts {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn on_unmask(&self, hook: Hook) {
        *self.unmask_hook.lock().unwrap() = Some(hook);
    }

    pub fn fire(&self, vector: u16) {
        let handler = self.handlers.lock().unwrap().get(&vector).cloned();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl InterruptController for TestInterrupts {
    fn vector_count(&self) -> u16 {
        8
    }

    fn bind(&self, vector: u16, handler: InterruptHandler) -> Result<()> {
        self.handlers.lock().unwrap().insert(vector, handler);
        Ok(())
    }

    fn unbind(&self, vector: u16) {
        self.handlers.lock().unwrap().remove(&vector);
    }

    fn set_affinity(&self, vector: u16, cpu: usize) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("affinity {vector} {cpu}"));
    }

    fn mask(&self, vector: u16) {
        self.calls.lock().unwrap().push(format!("mask {vector}"));
    }

    fn unmask(&self, vector: u16) {
        self.calls.lock().unwrap().push(format!("unmask {vector}"));
        if let Some(hook) = self.unmask_hook.lock().unwrap().as_ref() {
            hook();
        }
    }
}

/// Writes a successful completion for `cid` into CQ slot `slot`, as a device would.
pub fn post_cqe(memory: &dyn MemoryBus, cq_base: u64, slot: u16, cid: u16, sqhd: u16, phase: bool) {
    post_cqe_status(memory, cq_base, slot, cid, sqhd, phase, 0);
}

/// Like [`post_cqe`] with a status code (sc, sct=0).
pub fn post_cqe_status(
    memory: &dyn MemoryBus,
    cq_base: u64,
    slot: u16,
    cid: u16,
    sqhd: u16,
    phase: bool,
    sc: u8,
) {
    let entry = CompletionEntry {
        dw0: 0,
        dw1: 0,
        sqhd,
        sqid: 1,
        cid,
        status: (u16::from(sc) << 1) | u16::from(phase),
    };
    memory.write_physical(
        cq_base + u64::from(slot) * CQE_SIZE as u64,
        bytemuck::bytes_of(&entry),
    );
}

/// A fixed number of CPUs; the caller is always on CPU 0.
pub struct TestCpus(pub usize);

impl CpuTopology for TestCpus {
    fn cpu_count(&self) -> usize {
        self.0
    }

    fn current_cpu(&self) -> usize {
        0
    }

    fn pin_current_thread(&self, _cpu: usize) {}
}

pub struct TestPlatform {
    pub platform: Platform,
    pub memory: Arc<TestMemory>,
    pub dma: Arc<TestDma>,
    pub regs: Arc<TestRegs>,
    pub interrupts: Arc<TestInterrupts>,
}

/// 1 MiB of memory with DMA handed out from 64 KiB upwards.
pub fn test_platform() -> TestPlatform {
    let memory = Arc::new(TestMemory::new(1 << 20));
    let dma = Arc::new(TestDma::new(0x10000, 1 << 20));
    let regs = Arc::new(TestRegs::default());
    let interrupts = Arc::new(TestInterrupts::default());
    let platform = Platform {
        regs: regs.clone(),
        memory: memory.clone(),
        dma: dma.clone(),
        interrupts: interrupts.clone(),
        cpus: Arc::new(TestCpus(1)),
    };
    TestPlatform {
        platform,
        memory,
        dma,
        regs,
        interrupts,
    }
}
