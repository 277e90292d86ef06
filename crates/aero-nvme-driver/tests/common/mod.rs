//! Simulated platform wiring the driver to the `aero-devices-nvme` controller model.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use aero_devices_nvme as device;
use aero_nvme_driver::{
    next_instance_id, Bio, BioCallback, CpuTopology, DmaAllocator, InterruptController,
    InterruptHandler, MemoryBus, NvmeConfig, NvmeController, NvmeError, Platform, RegisterBus,
    Result,
};

pub const PAGE: u64 = 4096;
pub const MEMORY_SIZE: usize = 16 << 20;
pub const DMA_BASE: u64 = 0x1_0000;
pub const DMA_LIMIT: u64 = 0x80_0000;
/// Bio data buffers live above the DMA allocator's range.
pub const DATA_BASE: u64 = 0x80_0000;

const BIO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub struct SimMemory {
    bytes: Mutex<Vec<u8>>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }
}

impl MemoryBus for SimMemory {
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

/// The controller model's view of [`SimMemory`].
pub struct DeviceMemory<'a>(pub &'a SimMemory);

impl device::MemoryBus for DeviceMemory<'_> {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> std::result::Result<(), device::MemoryError> {
        let bytes = self.0.bytes.lock().unwrap();
        let start = paddr as usize;
        let src = bytes
            .get(start..start + buf.len())
            .ok_or(device::MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> std::result::Result<(), device::MemoryError> {
        let mut bytes = self.0.bytes.lock().unwrap();
        let start = paddr as usize;
        let dst = bytes
            .get_mut(start..start + buf.len())
            .ok_or(device::MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
struct DmaState {
    next: u64,
    /// Freed runs, keyed by page count.
    free: HashMap<usize, Vec<u64>>,
    live: BTreeMap<u64, usize>,
    max_alloc: Option<usize>,
}

/// Page-granular allocator over `[DMA_BASE, DMA_LIMIT)`.
pub struct SimDma {
    state: Mutex<DmaState>,
}

impl SimDma {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DmaState {
                next: DMA_BASE,
                ..DmaState::default()
            }),
        }
    }

    /// Allocations larger than `len` bytes fail with out-of-memory.
    pub fn limit_allocation_size(&self, len: Option<usize>) {
        self.state.lock().unwrap().max_alloc = len;
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }
}

impl DmaAllocator for SimDma {
    fn alloc(&self, len: usize) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.max_alloc.is_some_and(|max| len > max) {
            return Err(NvmeError::OutOfMemory { len });
        }
        let pages = len.max(1).div_ceil(PAGE as usize);
        let paddr = match state.free.get_mut(&pages).and_then(Vec::pop) {
            Some(paddr) => paddr,
            None => {
                let paddr = state.next;
                let end = paddr + pages as u64 * PAGE;
                if end > DMA_LIMIT {
                    return Err(NvmeError::OutOfMemory { len });
                }
                state.next = end;
                paddr
            }
        };
        state.live.insert(paddr, len);
        Ok(paddr)
    }

    fn free(&self, paddr: u64, len: usize) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.live.remove(&paddr), Some(len), "bad free of {paddr:#x}");
        let pages = len.max(1).div_ceil(PAGE as usize);
        state.free.entry(pages).or_default().push(paddr);
    }
}

#[derive(Default)]
struct IrqState {
    handlers: HashMap<u16, InterruptHandler>,
    masked: HashSet<u16>,
    pending: HashSet<u16>,
    affinity: BTreeMap<u16, usize>,
}

/// MSI-X table: a vector raised while masked stays pending and fires on unmask.
pub struct SimInterrupts {
    vectors: u16,
    state: Mutex<IrqState>,
}

impl SimInterrupts {
    pub fn new(vectors: u16) -> Self {
        Self {
            vectors,
            state: Mutex::new(IrqState::default()),
        }
    }

    pub fn fire(&self, vector: u16) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            if state.masked.contains(&vector) {
                state.pending.insert(vector);
                return;
            }
            state.handlers.get(&vector).cloned()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn affinity(&self) -> BTreeMap<u16, usize> {
        self.state.lock().unwrap().affinity.clone()
    }

    pub fn bound(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }
}

impl InterruptController for SimInterrupts {
    fn vector_count(&self) -> u16 {
        self.vectors
    }

    fn bind(&self, vector: u16, handler: InterruptHandler) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if vector >= self.vectors || state.handlers.contains_key(&vector) {
            return Err(NvmeError::InterruptSetup("vector unavailable"));
        }
        state.handlers.insert(vector, handler);
        state.masked.insert(vector);
        Ok(())
    }

    fn unbind(&self, vector: u16) {
        let mut state = self.state.lock().unwrap();
        state.handlers.remove(&vector);
        state.pending.remove(&vector);
        state.masked.remove(&vector);
    }

    fn set_affinity(&self, vector: u16, cpu: usize) {
        self.state.lock().unwrap().affinity.insert(vector, cpu);
    }

    fn mask(&self, vector: u16) {
        self.state.lock().unwrap().masked.insert(vector);
    }

    fn unmask(&self, vector: u16) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state.masked.remove(&vector);
            if !state.pending.remove(&vector) {
                return;
            }
            state.handlers.get(&vector).cloned()
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

pub struct SimCpus {
    count: usize,
    current: AtomicUsize,
    pinned: Mutex<Vec<usize>>,
}

impl SimCpus {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            current: AtomicUsize::new(0),
            pinned: Mutex::new(Vec::new()),
        }
    }

    /// CPU reported to every caller of `current_cpu` from now on.
    pub fn set_current(&self, cpu: usize) {
        self.current.store(cpu, Ordering::SeqCst);
    }

    pub fn pinned(&self) -> Vec<usize> {
        let mut pinned = self.pinned.lock().unwrap().clone();
        pinned.sort_unstable();
        pinned
    }
}

impl CpuTopology for SimCpus {
    fn cpu_count(&self) -> usize {
        self.count
    }

    fn current_cpu(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn pin_current_thread(&self, cpu: usize) {
        self.pinned.lock().unwrap().push(cpu);
    }
}

/// BAR0 of the simulated function. Vectors the controller raises are delivered once its lock has
/// been dropped.
pub struct SimBar {
    device: Mutex<device::NvmeController>,
    memory: Arc<SimMemory>,
    interrupts: Arc<SimInterrupts>,
}

impl SimBar {
    fn write(&self, offset: u64, size: usize, value: u64) {
        let vectors = {
            let mut dev = self.device.lock().unwrap();
            dev.mmio_write(offset, size, value, &mut DeviceMemory(&self.memory))
                .expect("controller DMA outside simulated memory");
            dev.take_interrupts()
        };
        for vector in vectors {
            self.interrupts.fire(vector);
        }
    }
}

impl RegisterBus for SimBar {
    fn read_u32(&self, offset: u64) -> u32 {
        self.device.lock().unwrap().mmio_read(offset, 4) as u32
    }

    fn write_u32(&self, offset: u64, value: u32) {
        self.write(offset, 4, u64::from(value));
    }

    fn read_u64(&self, offset: u64) -> u64 {
        self.device.lock().unwrap().mmio_read(offset, 8)
    }

    fn write_u64(&self, offset: u64, value: u64) {
        self.write(offset, 8, value);
    }
}

pub struct Harness {
    pub memory: Arc<SimMemory>,
    pub dma: Arc<SimDma>,
    pub interrupts: Arc<SimInterrupts>,
    pub cpus: Arc<SimCpus>,
    pub bar: Arc<SimBar>,
    pub platform: Platform,
}

impl Harness {
    pub fn new(device: device::NvmeController) -> Self {
        Self::with_topology(device, 1, 8)
    }

    pub fn with_topology(device: device::NvmeController, cpus: usize, vectors: u16) -> Self {
        init_tracing();
        let memory = Arc::new(SimMemory::new(MEMORY_SIZE));
        let dma = Arc::new(SimDma::new());
        let interrupts = Arc::new(SimInterrupts::new(vectors));
        let cpus = Arc::new(SimCpus::new(cpus));
        let bar = Arc::new(SimBar {
            device: Mutex::new(device),
            memory: Arc::clone(&memory),
            interrupts: Arc::clone(&interrupts),
        });
        let platform = Platform {
            regs: bar.clone(),
            memory: memory.clone(),
            dma: dma.clone(),
            interrupts: interrupts.clone(),
            cpus: cpus.clone(),
        };
        Self {
            memory,
            dma,
            interrupts,
            cpus,
            bar,
            platform,
        }
    }

    /// Direct access to the controller model. Do not hold the guard across driver calls.
    pub fn device(&self) -> MutexGuard<'_, device::NvmeController> {
        self.bar.device.lock().unwrap()
    }

    /// Runs `f` against the controller model and then delivers whatever vectors it raised.
    pub fn with_device<T>(
        &self,
        f: impl FnOnce(&mut device::NvmeController, &mut dyn device::MemoryBus) -> T,
    ) -> T {
        let (value, vectors) = {
            let mut dev = self.device();
            let value = f(&mut dev, &mut DeviceMemory(&self.memory));
            (value, dev.take_interrupts())
        };
        for vector in vectors {
            self.interrupts.fire(vector);
        }
        value
    }

    pub fn release(&self, sqid: u16, cid: u16) {
        let released = self.with_device(|dev, mem| dev.release_completion(sqid, cid, mem));
        assert_eq!(released, Ok(true), "no held completion for sqid {sqid} cid {cid}");
    }

    pub fn release_all(&self) -> usize {
        self.with_device(|dev, mem| dev.release_all(mem))
            .expect("controller DMA outside simulated memory")
    }

    pub fn attach(&self, config: NvmeConfig) -> Result<NvmeController> {
        NvmeController::attach(self.platform.clone(), config, next_instance_id())
    }

    pub fn fill(&self, addr: u64, data: &[u8]) {
        self.memory.write_physical(addr, data);
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.memory.read_physical(addr, &mut buf);
        buf
    }
}

/// Controller model with one RAM-backed namespace. The returned disk shares its storage.
pub fn device_with_disk(
    config: device::NvmeControllerConfig,
    sector_size: u32,
    sectors: u64,
) -> (device::NvmeController, device::RamDisk) {
    let disk = device::RamDisk::new(sector_size, sectors);
    let mut dev = device::NvmeController::new(config);
    dev.add_namespace(1, Box::new(disk.clone()));
    (dev, disk)
}

/// One 512 MiB namespace of 512-byte blocks.
pub fn default_device() -> (device::NvmeController, device::RamDisk) {
    device_with_disk(device::NvmeControllerConfig::default(), 512, 1 << 20)
}

pub fn callback() -> (BioCallback, Receiver<Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let done: BioCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

pub fn wait(rx: &Receiver<Result<()>>) -> Result<()> {
    rx.recv_timeout(BIO_TIMEOUT).expect("bio callback never ran")
}

pub fn read(ctrl: &NvmeController, nsid: u32, offset: u64, len: usize, data: u64) -> Result<()> {
    let (done, rx) = callback();
    ctrl.make_request(Bio::read(offset, len, data, done), nsid);
    wait(&rx)
}

pub fn write(ctrl: &NvmeController, nsid: u32, offset: u64, len: usize, data: u64) -> Result<()> {
    let (done, rx) = callback();
    ctrl.make_request(Bio::write(offset, len, data, done), nsid);
    wait(&rx)
}

pub fn flush(ctrl: &NvmeController, nsid: u32) -> Result<()> {
    let (done, rx) = callback();
    ctrl.make_request(Bio::flush(done), nsid);
    wait(&rx)
}

/// Polls `cond` until it holds, failing the test after a generous timeout.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + BIO_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
