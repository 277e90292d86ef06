//! NVMe (NVM Express) controller model.
//!
//! Implements the device side of the queue protocol so a host driver can be exercised end to end
//! without hardware. The only external inputs are one disk backend per namespace and a memory bus
//! for DMA.
//!
//! Supported:
//! - BAR0 register set (CAP/VS/INTMS/INTMC/CC/CSTS/AQA/ASQ/ACQ + doorbells, any stride)
//! - Admin commands: DELETE/CREATE IO SQ, DELETE/CREATE IO CQ, IDENTIFY (CNS 0/1/2), ABORT,
//!   SET/GET FEATURES (number of queues, volatile write cache, interrupt coalescing)
//! - NVM commands: READ, WRITE, FLUSH
//! - PRP1/PRP2 and chained PRP lists. SGL is not supported.
//! - One MSI-X vector per completion queue; raised vectors are collected until
//!   [`NvmeController::take_interrupts`].
//!
//! Commands run synchronously inside the doorbell write that publishes them. A completion that
//! does not fit its queue waits in a backlog until the host moves the CQ head.
//!
//! For tests, I/O completions can be held back and released in any order, LBAs and admin opcodes
//! can be made to fail, the controller can be told never to become ready, and every I/O command
//! is logged together with the pages its PRPs resolved to.

mod ram_disk;

pub use ram_disk::RamDisk;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use thiserror::Error;
use tracing::{debug, trace, warn};

const PAGE_SIZE: usize = 4096;
const SQE_SIZE: u64 = 64;
const CQE_SIZE: u64 = 16;
const IDENTIFY_LEN: usize = 4096;
const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;

/// BAR0 register offsets.
pub mod reg {
    pub const CAP: u64 = 0x0000;
    pub const VS: u64 = 0x0008;
    pub const INTMS: u64 = 0x000c;
    pub const INTMC: u64 = 0x0010;
    pub const CC: u64 = 0x0014;
    pub const CSTS: u64 = 0x001c;
    pub const AQA: u64 = 0x0024;
    pub const ASQ: u64 = 0x0028;
    pub const ACQ: u64 = 0x0030;
    pub const DOORBELL_BASE: u64 = 0x1000;
}

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

pub mod io_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

pub mod feature {
    pub const VOLATILE_WRITE_CACHE: u8 = 0x06;
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const INTERRUPT_COALESCING: u8 = 0x08;
}

const CSTS_RDY: u32 = 1 << 0;
const CSTS_CFS: u32 = 1 << 1;

/// Returned when the controller cannot reach host memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("physical access out of bounds: {len} bytes at {addr:#x}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Host physical memory as seen by the controller's DMA engine.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiskError {
    #[error("disk I/O error")]
    Io,
    #[error("access beyond the end of the disk")]
    OutOfRange,
}

pub type DiskResult<T> = Result<T, DiskError>;

/// Block storage behind one namespace. Sectors are the namespace's logical blocks.
pub trait DiskBackend: Send {
    /// Power of two, at least 512.
    fn sector_size(&self) -> u32;
    fn total_sectors(&self) -> u64;
    fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> DiskResult<()>;
    fn write_sectors(&mut self, lba: u64, buffer: &[u8]) -> DiskResult<()>;
    fn flush(&mut self) -> DiskResult<()>;
}

/// Completion status without the phase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

impl NvmeStatus {
    const fn generic(sc: u8) -> Self {
        Self { sct: 0, sc, dnr: true }
    }

    const fn command_specific(sc: u8) -> Self {
        Self { sct: 1, sc, dnr: true }
    }

    const fn media(sc: u8) -> Self {
        Self { sct: 2, sc, dnr: false }
    }

    pub const SUCCESS: Self = Self { sct: 0, sc: 0, dnr: false };
    pub const INVALID_OPCODE: Self = Self::generic(0x01);
    pub const INVALID_FIELD: Self = Self::generic(0x02);
    pub const DATA_TRANSFER_ERROR: Self = Self::generic(0x04);
    pub const INTERNAL_ERROR: Self = Self::generic(0x06);
    pub const ABORTED_BY_REQUEST: Self = Self::generic(0x07);
    pub const ABORTED_SQ_DELETION: Self = Self::generic(0x08);
    pub const INVALID_NAMESPACE: Self = Self::generic(0x0b);
    pub const PRP_OFFSET_INVALID: Self = Self::generic(0x13);
    pub const LBA_OUT_OF_RANGE: Self = Self::generic(0x80);
    pub const INVALID_CQ: Self = Self::command_specific(0x00);
    pub const INVALID_QID: Self = Self::command_specific(0x01);
    pub const INVALID_QUEUE_SIZE: Self = Self::command_specific(0x02);
    pub const INVALID_VECTOR: Self = Self::command_specific(0x08);
    pub const INVALID_QUEUE_DELETION: Self = Self::command_specific(0x0c);
    pub const WRITE_FAULT: Self = Self::media(0x80);
    pub const UNRECOVERED_READ_ERROR: Self = Self::media(0x81);

    /// Status field bits 15:1; bit 0 (phase) is left clear.
    pub fn encode_without_phase(self) -> u16 {
        (u16::from(self.sc) << 1) | (u16::from(self.sct & 0x7) << 9) | (u16::from(self.dnr) << 15)
    }

    pub fn is_success(self) -> bool {
        self.sct == 0 && self.sc == 0
    }
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn le_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from(le_u32(bytes, offset)) | (u64::from(le_u32(bytes, offset + 4)) << 32)
}

#[derive(Debug, Clone, Copy)]
struct NvmeCommand {
    opc: u8,
    cid: u16,
    nsid: u32,
    prp1: u64,
    prp2: u64,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
}

impl NvmeCommand {
    fn parse(bytes: &[u8; SQE_SIZE as usize]) -> Self {
        Self {
            opc: bytes[0],
            cid: u16::from_le_bytes([bytes[2], bytes[3]]),
            nsid: le_u32(bytes, 4),
            prp1: le_u64(bytes, 24),
            prp2: le_u64(bytes, 32),
            cdw10: le_u32(bytes, 40),
            cdw11: le_u32(bytes, 44),
            cdw12: le_u32(bytes, 48),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CqEntry {
    dw0: u32,
    sqhd: u16,
    sqid: u16,
    cid: u16,
    status: u16,
}

impl CqEntry {
    fn to_bytes(self, phase: bool) -> [u8; CQE_SIZE as usize] {
        let mut bytes = [0u8; CQE_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.sqhd.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.sqid.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.cid.to_le_bytes());
        bytes[14..16].copy_from_slice(&(self.status | u16::from(phase)).to_le_bytes());
        bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct SubmissionQueue {
    id: u16,
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    cqid: u16,
}

#[derive(Debug)]
struct CompletionQueue {
    size: u16,
    base: u64,
    head: u16,
    tail: u16,
    phase: bool,
    interrupts: bool,
    vector: u16,
    /// Completions that did not fit, oldest first.
    backlog: VecDeque<CqEntry>,
}

impl CompletionQueue {
    fn new(size: u16, base: u64, interrupts: bool, vector: u16) -> Self {
        Self {
            size,
            base,
            head: 0,
            tail: 0,
            phase: true,
            interrupts,
            vector,
            backlog: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.size == self.head
    }

    fn push(&mut self, entry: CqEntry, memory: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        let addr = self.base + u64::from(self.tail) * CQE_SIZE;
        memory.write_physical(addr, &entry.to_bytes(self.phase))?;
        self.tail = (self.tail + 1) % self.size;
        if self.tail == 0 {
            self.phase = !self.phase;
        }
        Ok(())
    }
}

/// An I/O completion the controller has produced but not yet posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldCompletion {
    pub sqid: u16,
    pub cid: u16,
    pub opcode: u8,
    pub status: NvmeStatus,
    pub result: u32,
}

/// One I/O command as the controller decoded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoLogEntry {
    pub sqid: u16,
    pub cid: u16,
    pub opcode: u8,
    pub nsid: u32,
    pub slba: u64,
    /// One-based block count (0 for flush).
    pub blocks: u32,
    pub prp1: u64,
    pub prp2: u64,
    /// Host memory the PRPs resolved to, in transfer order.
    pub segments: Vec<(u64, usize)>,
}

/// Identity and limits the controller reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeControllerConfig {
    /// CAP.MQES + 1.
    pub max_queue_entries: u16,
    /// CAP.TO, in 500 ms units.
    pub ready_timeout: u8,
    /// CAP.DSTRD; doorbells are `4 << shift` bytes apart.
    pub doorbell_stride_shift: u8,
    /// CAP.MPSMIN; the smallest page size is `4096 << shift`. Only CC.MPS 0 is accepted.
    pub min_page_shift: u8,
    pub version: u32,
    pub vendor_id: u16,
    pub subsystem_vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum transfer size as a power of two of pages; 0 means unlimited.
    pub mdts: u8,
    pub volatile_write_cache: bool,
    /// Upper bound on I/O SQs and CQs granted through Number of Queues.
    pub max_io_queues: u16,
    pub msix_vectors: u16,
}

impl Default for NvmeControllerConfig {
    fn default() -> Self {
        Self {
            max_queue_entries: 1024,
            ready_timeout: 1,
            doorbell_stride_shift: 0,
            min_page_shift: 0,
            version: 0x0001_0400,
            vendor_id: 0x1d1d,
            subsystem_vendor_id: 0x1d1d,
            serial: "AERO0000000000000001".to_string(),
            model: "Aero NVMe Controller".to_string(),
            firmware: "0.1".to_string(),
            mdts: 5,
            volatile_write_cache: true,
            max_io_queues: 64,
            msix_vectors: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Features {
    /// Zero-based (NCQA << 16) | NSQA once negotiated.
    number_of_queues: Option<u32>,
    write_cache: bool,
    interrupt_coalescing: u32,
}

/// The controller. Host software talks to it through [`mmio_read`](Self::mmio_read) and
/// [`mmio_write`](Self::mmio_write).
pub struct NvmeController {
    config: NvmeControllerConfig,
    namespaces: BTreeMap<u32, Box<dyn DiskBackend>>,

    cap: u64,
    intms: u32,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,

    sqs: BTreeMap<u16, SubmissionQueue>,
    cqs: BTreeMap<u16, CompletionQueue>,
    features: Features,
    pending_vectors: BTreeSet<u16>,

    never_ready: bool,
    hold_io_completions: bool,
    held: Vec<HeldCompletion>,
    media_errors: BTreeMap<(u32, u64), NvmeStatus>,
    admin_failures: HashMap<u8, NvmeStatus>,
    io_log: Vec<IoLogEntry>,
}

impl NvmeController {
    pub fn new(config: NvmeControllerConfig) -> Self {
        assert!(config.max_queue_entries >= 2);
        let cap = u64::from(config.max_queue_entries - 1)
            | (1 << 16) // CQR
            | (u64::from(config.ready_timeout) << 24)
            | (u64::from(config.doorbell_stride_shift & 0xf) << 32)
            | (1 << 37) // CSS: NVM command set
            | (u64::from(config.min_page_shift & 0xf) << 48);
        Self {
            config,
            namespaces: BTreeMap::new(),
            cap,
            intms: 0,
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            sqs: BTreeMap::new(),
            cqs: BTreeMap::new(),
            features: Features::default(),
            pending_vectors: BTreeSet::new(),
            never_ready: false,
            hold_io_completions: false,
            held: Vec::new(),
            media_errors: BTreeMap::new(),
            admin_failures: HashMap::new(),
            io_log: Vec::new(),
        }
    }

    /// Attaches `disk` as namespace `nsid`, replacing any previous one.
    pub fn add_namespace(&mut self, nsid: u32, disk: Box<dyn DiskBackend>) {
        assert!(nsid != 0 && nsid != u32::MAX, "invalid namespace id {nsid}");
        self.namespaces.insert(nsid, disk);
    }

    pub fn config(&self) -> &NvmeControllerConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.csts & CSTS_RDY != 0
    }

    pub fn io_queue_count(&self) -> usize {
        self.sqs.keys().filter(|&&qid| qid != 0).count()
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.features.write_cache
    }

    pub fn interrupt_coalescing(&self) -> u32 {
        self.features.interrupt_coalescing
    }

    /// Vectors raised since the last call, lowest first.
    pub fn take_interrupts(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.pending_vectors).into_iter().collect()
    }

    /// Keep CSTS.RDY clear no matter what is written to CC.
    pub fn set_never_ready(&mut self, never_ready: bool) {
        self.never_ready = never_ready;
    }

    /// While set, I/O completions are kept back until released.
    pub fn set_hold_io_completions(&mut self, hold: bool) {
        self.hold_io_completions = hold;
    }

    pub fn held_completions(&self) -> &[HeldCompletion] {
        &self.held
    }

    /// Posts the held completion for `cid` on `sqid`. Returns false if there is none.
    pub fn release_completion(
        &mut self,
        sqid: u16,
        cid: u16,
        memory: &mut dyn MemoryBus,
    ) -> Result<bool, MemoryError> {
        let Some(index) = self
            .held
            .iter()
            .position(|h| h.sqid == sqid && h.cid == cid)
        else {
            return Ok(false);
        };
        let held = self.held.remove(index);
        self.post_held(held, held.status, held.result, memory)?;
        Ok(true)
    }

    /// Posts every held completion in the order they were produced.
    pub fn release_all(&mut self, memory: &mut dyn MemoryBus) -> Result<usize, MemoryError> {
        let held = std::mem::take(&mut self.held);
        for h in &held {
            self.post_held(*h, h.status, h.result, memory)?;
        }
        Ok(held.len())
    }

    /// Reads or writes touching `lba` of namespace `nsid` complete with `status`.
    pub fn inject_media_error(&mut self, nsid: u32, lba: u64, status: NvmeStatus) {
        self.media_errors.insert((nsid, lba), status);
    }

    pub fn clear_media_errors(&mut self) {
        self.media_errors.clear();
    }

    /// Every admin command with `opcode` completes with `status` and has no effect.
    pub fn fail_admin_opcode(&mut self, opcode: u8, status: NvmeStatus) {
        self.admin_failures.insert(opcode, status);
    }

    pub fn clear_admin_failures(&mut self) {
        self.admin_failures.clear();
    }

    pub fn io_log(&self) -> &[IoLogEntry] {
        &self.io_log
    }

    pub fn take_io_log(&mut self) -> Vec<IoLogEntry> {
        std::mem::take(&mut self.io_log)
    }

    fn read_dword(&self, offset: u64) -> u32 {
        match offset {
            reg::CAP => self.cap as u32,
            o if o == reg::CAP + 4 => (self.cap >> 32) as u32,
            reg::VS => self.config.version,
            reg::INTMS | reg::INTMC => self.intms,
            reg::CC => self.cc,
            reg::CSTS => self.csts,
            reg::AQA => self.aqa,
            reg::ASQ => self.asq as u32,
            o if o == reg::ASQ + 4 => (self.asq >> 32) as u32,
            reg::ACQ => self.acq as u32,
            o if o == reg::ACQ + 4 => (self.acq >> 32) as u32,
            _ => 0,
        }
    }

    pub fn mmio_read(&self, offset: u64, size: usize) -> u64 {
        match size {
            8 => u64::from(self.read_dword(offset)) | (u64::from(self.read_dword(offset + 4)) << 32),
            4 => u64::from(self.read_dword(offset)),
            _ => {
                let dword = self.read_dword(offset & !3);
                let shift = (offset & 3) * 8;
                let mask = (1u64 << (size.min(4) * 8)) - 1;
                (u64::from(dword) >> shift) & mask
            }
        }
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        size: usize,
        value: u64,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        match (offset, size) {
            (reg::ASQ, 8) if self.cc & 1 == 0 => self.asq = value,
            (reg::ACQ, 8) if self.cc & 1 == 0 => self.acq = value,
            (_, 8) => {
                self.write_dword(offset, value as u32, memory)?;
                self.write_dword(offset + 4, (value >> 32) as u32, memory)?;
            }
            (_, 4) => self.write_dword(offset, value as u32, memory)?,
            _ => warn!(offset, size, "unsupported register write width"),
        }
        Ok(())
    }

    fn write_dword(
        &mut self,
        offset: u64,
        value: u32,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        // The admin queue registers only take effect while the controller is disabled.
        let disabled = self.cc & 1 == 0;
        match offset {
            reg::INTMS => self.intms |= value,
            reg::INTMC => self.intms &= !value,
            reg::CC => self.write_cc(value),
            reg::AQA if disabled => self.aqa = value,
            reg::ASQ if disabled => self.asq = (self.asq & !0xffff_ffff) | u64::from(value),
            o if o == reg::ASQ + 4 && disabled => {
                self.asq = (self.asq & 0xffff_ffff) | (u64::from(value) << 32)
            }
            reg::ACQ if disabled => self.acq = (self.acq & !0xffff_ffff) | u64::from(value),
            o if o == reg::ACQ + 4 && disabled => {
                self.acq = (self.acq & 0xffff_ffff) | (u64::from(value) << 32)
            }
            o if o >= reg::DOORBELL_BASE => self.write_doorbell(o, value, memory)?,
            _ => trace!(offset, value, "ignored register write"),
        }
        Ok(())
    }

    fn write_cc(&mut self, value: u32) {
        let was_enabled = self.cc & 1 != 0;
        self.cc = value;
        match (was_enabled, value & 1 != 0) {
            (false, true) => self.enable(),
            (true, false) => self.disable(),
            _ => {}
        }
    }

    fn enable(&mut self) {
        if self.never_ready {
            debug!("enable ignored, controller never becomes ready");
            return;
        }
        match self.admin_queues() {
            Ok((sq, cq)) => {
                self.sqs.insert(0, sq);
                self.cqs.insert(0, cq);
                self.csts = CSTS_RDY;
                debug!(sq_entries = sq.size, "controller enabled");
            }
            Err(reason) => {
                warn!(reason, cc = self.cc, aqa = self.aqa, "controller fatal status");
                self.csts = CSTS_CFS;
            }
        }
    }

    fn admin_queues(&self) -> Result<(SubmissionQueue, CompletionQueue), &'static str> {
        let mps = (self.cc >> 7) & 0xf;
        let iosqes = (self.cc >> 16) & 0xf;
        let iocqes = (self.cc >> 20) & 0xf;
        if mps != 0 {
            return Err("unsupported memory page size");
        }
        if iosqes != 6 || iocqes != 4 {
            return Err("unsupported queue entry size");
        }
        let asqs = (self.aqa & 0x0fff) as u16 + 1;
        let acqs = ((self.aqa >> 16) & 0x0fff) as u16 + 1;
        if asqs < 2 || acqs < 2 || asqs > self.config.max_queue_entries || acqs > self.config.max_queue_entries {
            return Err("admin queue size out of range");
        }
        if !page_aligned(self.asq) || !page_aligned(self.acq) {
            return Err("admin queue base not page aligned");
        }
        let sq = SubmissionQueue {
            id: 0,
            size: asqs,
            base: self.asq,
            head: 0,
            tail: 0,
            cqid: 0,
        };
        Ok((sq, CompletionQueue::new(acqs, self.acq, true, 0)))
    }

    /// Controller reset: every queue, feature and pending completion is dropped. Test knobs stay.
    fn disable(&mut self) {
        self.sqs.clear();
        self.cqs.clear();
        self.held.clear();
        self.pending_vectors.clear();
        self.features = Features::default();
        self.csts = 0;
        debug!("controller disabled");
    }

    fn doorbell_stride(&self) -> u64 {
        4 << ((self.cap >> 32) & 0xf)
    }

    fn write_doorbell(
        &mut self,
        offset: u64,
        value: u32,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        if !self.is_ready() {
            return Ok(());
        }
        let stride = self.doorbell_stride();
        let rel = offset - reg::DOORBELL_BASE;
        if rel % stride != 0 {
            return Ok(());
        }
        let index = rel / stride;
        let Ok(qid) = u16::try_from(index / 2) else {
            return Ok(());
        };
        let value = value as u16;

        if index % 2 == 1 {
            let Some(cq) = self.cqs.get_mut(&qid) else {
                warn!(qid, "CQ head doorbell for missing queue");
                return Ok(());
            };
            if value >= cq.size {
                warn!(qid, value, "CQ head beyond queue size");
                return Ok(());
            }
            cq.head = value;
            return self.drain_backlog(qid, memory);
        }

        let Some(sq) = self.sqs.get_mut(&qid) else {
            warn!(qid, "SQ tail doorbell for missing queue");
            return Ok(());
        };
        if value >= sq.size {
            warn!(qid, value, "SQ tail beyond queue size");
            return Ok(());
        }
        sq.tail = value;
        self.process_sq(qid, memory)
    }

    fn process_sq(&mut self, qid: u16, memory: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        loop {
            let Some(sq) = self.sqs.get_mut(&qid) else {
                return Ok(());
            };
            if sq.head == sq.tail {
                return Ok(());
            }
            let addr = sq.base + u64::from(sq.head) * SQE_SIZE;
            sq.head = (sq.head + 1) % sq.size;
            let (sqid, cqid) = (sq.id, sq.cqid);

            let mut bytes = [0u8; SQE_SIZE as usize];
            memory.read_physical(addr, &mut bytes)?;
            let cmd = NvmeCommand::parse(&bytes);
            trace!(sqid, cid = cmd.cid, opcode = cmd.opc, "command");

            if sqid == 0 {
                let (status, result) = self.execute_admin(cmd, memory)?;
                self.post(0, 0, cmd.cid, status, result, memory)?;
                continue;
            }

            let (status, result) = self.execute_io(sqid, cmd, memory);
            if self.hold_io_completions {
                self.held.push(HeldCompletion {
                    sqid,
                    cid: cmd.cid,
                    opcode: cmd.opc,
                    status,
                    result,
                });
            } else {
                self.post(cqid, sqid, cmd.cid, status, result, memory)?;
            }
        }
    }

    fn post_held(
        &mut self,
        held: HeldCompletion,
        status: NvmeStatus,
        result: u32,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        let Some(cqid) = self.sqs.get(&held.sqid).map(|sq| sq.cqid) else {
            warn!(sqid = held.sqid, cid = held.cid, "held completion for deleted SQ dropped");
            return Ok(());
        };
        self.post(cqid, held.sqid, held.cid, status, result, memory)
    }

    /// Writes a completion to `cqid`, or queues it behind earlier ones when the CQ is full.
    fn post(
        &mut self,
        cqid: u16,
        sqid: u16,
        cid: u16,
        status: NvmeStatus,
        result: u32,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), MemoryError> {
        let sqhd = self.sqs.get(&sqid).map_or(0, |sq| sq.head);
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            warn!(cqid, sqid, cid, "completion for missing CQ dropped");
            return Ok(());
        };
        let entry = CqEntry {
            dw0: result,
            sqhd,
            sqid,
            cid,
            status: status.encode_without_phase(),
        };
        if cq.is_full() || !cq.backlog.is_empty() {
            debug!(cqid, cid, backlog = cq.backlog.len() + 1, "CQ full, completion deferred");
            cq.backlog.push_back(entry);
            return Ok(());
        }
        cq.push(entry, memory)?;
        if cq.interrupts {
            self.pending_vectors.insert(cq.vector);
        }
        Ok(())
    }

    fn drain_backlog(&mut self, cqid: u16, memory: &mut dyn MemoryBus) -> Result<(), MemoryError> {
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            return Ok(());
        };
        let mut posted = false;
        while !cq.is_full() {
            let Some(entry) = cq.backlog.pop_front() else {
                break;
            };
            cq.push(entry, memory)?;
            posted = true;
        }
        if posted && cq.interrupts {
            self.pending_vectors.insert(cq.vector);
        }
        Ok(())
    }

    fn execute_admin(
        &mut self,
        cmd: NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Result<(NvmeStatus, u32), MemoryError> {
        if let Some(&status) = self.admin_failures.get(&cmd.opc) {
            debug!(opcode = cmd.opc, sc = status.sc, "injected admin failure");
            return Ok((status, 0));
        }
        let outcome = match cmd.opc {
            admin_opcode::DELETE_IO_SQ => (self.delete_io_sq(cmd, memory)?, 0),
            admin_opcode::CREATE_IO_SQ => (self.create_io_sq(cmd), 0),
            admin_opcode::DELETE_IO_CQ => (self.delete_io_cq(cmd), 0),
            admin_opcode::CREATE_IO_CQ => (self.create_io_cq(cmd), 0),
            admin_opcode::IDENTIFY => (self.identify(cmd, memory), 0),
            admin_opcode::ABORT => self.abort(cmd, memory)?,
            admin_opcode::SET_FEATURES => self.set_features(cmd),
            admin_opcode::GET_FEATURES => self.get_features(cmd),
            opcode => {
                debug!(opcode, "unsupported admin opcode");
                (NvmeStatus::INVALID_OPCODE, 0)
            }
        };
        Ok(outcome)
    }

    fn io_queue_limit(&self) -> u16 {
        match self.features.number_of_queues {
            Some(granted) => (granted & 0xffff) as u16 + 1,
            None => self.config.max_io_queues,
        }
    }

    fn queue_size(&self, cdw10: u32) -> Option<u16> {
        let size = (cdw10 >> 16) + 1;
        (2..=u32::from(self.config.max_queue_entries))
            .contains(&size)
            .then_some(size as u16)
    }

    fn create_io_cq(&mut self, cmd: NvmeCommand) -> NvmeStatus {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || qid > self.io_queue_limit() || self.cqs.contains_key(&qid) {
            return NvmeStatus::INVALID_QID;
        }
        let Some(size) = self.queue_size(cmd.cdw10) else {
            return NvmeStatus::INVALID_QUEUE_SIZE;
        };
        if cmd.cdw11 & 1 == 0 || !page_aligned(cmd.prp1) {
            return NvmeStatus::INVALID_FIELD;
        }
        let vector = (cmd.cdw11 >> 16) as u16;
        if vector >= self.config.msix_vectors {
            return NvmeStatus::INVALID_VECTOR;
        }
        let interrupts = cmd.cdw11 & 2 != 0;
        self.cqs
            .insert(qid, CompletionQueue::new(size, cmd.prp1, interrupts, vector));
        debug!(qid, size, vector, interrupts, "I/O CQ created");
        NvmeStatus::SUCCESS
    }

    fn create_io_sq(&mut self, cmd: NvmeCommand) -> NvmeStatus {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || qid > self.io_queue_limit() || self.sqs.contains_key(&qid) {
            return NvmeStatus::INVALID_QID;
        }
        let Some(size) = self.queue_size(cmd.cdw10) else {
            return NvmeStatus::INVALID_QUEUE_SIZE;
        };
        if cmd.cdw11 & 1 == 0 || !page_aligned(cmd.prp1) {
            return NvmeStatus::INVALID_FIELD;
        }
        let cqid = (cmd.cdw11 >> 16) as u16;
        if cqid == 0 || !self.cqs.contains_key(&cqid) {
            return NvmeStatus::INVALID_CQ;
        }
        self.sqs.insert(
            qid,
            SubmissionQueue {
                id: qid,
                size,
                base: cmd.prp1,
                head: 0,
                tail: 0,
                cqid,
            },
        );
        debug!(qid, size, cqid, "I/O SQ created");
        NvmeStatus::SUCCESS
    }

    /// Held commands of the deleted queue complete as aborted before it goes away.
    fn delete_io_sq(
        &mut self,
        cmd: NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Result<NvmeStatus, MemoryError> {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || !self.sqs.contains_key(&qid) {
            return Ok(NvmeStatus::INVALID_QID);
        }
        let (aborted, kept) = std::mem::take(&mut self.held)
            .into_iter()
            .partition::<Vec<_>, _>(|h| h.sqid == qid);
        self.held = kept;
        for held in aborted {
            self.post_held(held, NvmeStatus::ABORTED_SQ_DELETION, 0, memory)?;
        }
        self.sqs.remove(&qid);
        debug!(qid, "I/O SQ deleted");
        Ok(NvmeStatus::SUCCESS)
    }

    fn delete_io_cq(&mut self, cmd: NvmeCommand) -> NvmeStatus {
        let qid = (cmd.cdw10 & 0xffff) as u16;
        if qid == 0 || !self.cqs.contains_key(&qid) {
            return NvmeStatus::INVALID_QID;
        }
        if self.sqs.values().any(|sq| sq.cqid == qid) {
            return NvmeStatus::INVALID_QUEUE_DELETION;
        }
        self.cqs.remove(&qid);
        debug!(qid, "I/O CQ deleted");
        NvmeStatus::SUCCESS
    }

    fn identify(&mut self, cmd: NvmeCommand, memory: &mut dyn MemoryBus) -> NvmeStatus {
        let data = match cmd.cdw10 & 0xff {
            0x00 => match cmd.nsid {
                0 | u32::MAX => return NvmeStatus::INVALID_NAMESPACE,
                nsid => self.identify_namespace(nsid),
            },
            0x01 => self.identify_controller(),
            0x02 => self.active_namespace_list(cmd.nsid),
            cns => {
                debug!(cns, "unsupported identify CNS");
                return NvmeStatus::INVALID_FIELD;
            }
        };
        match dma_write(memory, cmd.prp1, cmd.prp2, &data) {
            Ok(_) => NvmeStatus::SUCCESS,
            Err(status) => status,
        }
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_LEN];
        data[0..2].copy_from_slice(&self.config.vendor_id.to_le_bytes());
        data[2..4].copy_from_slice(&self.config.subsystem_vendor_id.to_le_bytes());
        write_ascii_padded(&mut data[4..24], &self.config.serial);
        write_ascii_padded(&mut data[24..64], &self.config.model);
        write_ascii_padded(&mut data[64..72], &self.config.firmware);
        data[77] = self.config.mdts;
        data[80..84].copy_from_slice(&self.config.version.to_le_bytes());
        // SQES / CQES: required and maximum entry sizes.
        data[512] = 0x66;
        data[513] = 0x44;
        let nn = self.namespaces.keys().next_back().copied().unwrap_or(0);
        data[516..520].copy_from_slice(&nn.to_le_bytes());
        data[525] = u8::from(self.config.volatile_write_cache);
        data
    }

    /// Inactive namespaces identify as all zeroes.
    fn identify_namespace(&self, nsid: u32) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_LEN];
        let Some(disk) = self.namespaces.get(&nsid) else {
            return data;
        };
        let blocks = disk.total_sectors();
        data[0..8].copy_from_slice(&blocks.to_le_bytes());
        data[8..16].copy_from_slice(&blocks.to_le_bytes());
        data[16..24].copy_from_slice(&blocks.to_le_bytes());
        // NLBAF = 0 (one format), FLBAS = 0.
        let lbads = disk.sector_size().trailing_zeros();
        data[128..132].copy_from_slice(&(lbads << 16).to_le_bytes());
        data
    }

    fn active_namespace_list(&self, above: u32) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_LEN];
        let ids = self
            .namespaces
            .keys()
            .filter(|&&nsid| nsid > above)
            .take(IDENTIFY_LEN / 4);
        for (slot, nsid) in data.chunks_exact_mut(4).zip(ids) {
            slot.copy_from_slice(&nsid.to_le_bytes());
        }
        data
    }

    /// Only commands whose completion is being held can still be aborted. DW0 bit 0 clear means
    /// the command was aborted.
    fn abort(
        &mut self,
        cmd: NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Result<(NvmeStatus, u32), MemoryError> {
        let sqid = (cmd.cdw10 & 0xffff) as u16;
        let cid = (cmd.cdw10 >> 16) as u16;
        let Some(index) = self
            .held
            .iter()
            .position(|h| h.sqid == sqid && h.cid == cid)
        else {
            debug!(sqid, cid, "abort: command not found");
            return Ok((NvmeStatus::SUCCESS, 1));
        };
        let held = self.held.remove(index);
        self.post_held(held, NvmeStatus::ABORTED_BY_REQUEST, 0, memory)?;
        debug!(sqid, cid, "command aborted");
        Ok((NvmeStatus::SUCCESS, 0))
    }

    fn set_features(&mut self, cmd: NvmeCommand) -> (NvmeStatus, u32) {
        let fid = (cmd.cdw10 & 0xff) as u8;
        match fid {
            feature::NUMBER_OF_QUEUES => {
                let nsqr = cmd.cdw11 & 0xffff;
                let ncqr = cmd.cdw11 >> 16;
                if nsqr == 0xffff || ncqr == 0xffff {
                    return (NvmeStatus::INVALID_FIELD, 0);
                }
                let max = u32::from(self.config.max_io_queues.max(1) - 1);
                let granted = (ncqr.min(max) << 16) | nsqr.min(max);
                self.features.number_of_queues = Some(granted);
                debug!(nsqr, ncqr, granted, "number of queues");
                (NvmeStatus::SUCCESS, granted)
            }
            feature::VOLATILE_WRITE_CACHE => {
                if !self.config.volatile_write_cache {
                    return (NvmeStatus::INVALID_FIELD, 0);
                }
                self.features.write_cache = cmd.cdw11 & 1 != 0;
                (NvmeStatus::SUCCESS, 0)
            }
            feature::INTERRUPT_COALESCING => {
                self.features.interrupt_coalescing = cmd.cdw11 & 0xffff;
                (NvmeStatus::SUCCESS, 0)
            }
            _ => (NvmeStatus::INVALID_FIELD, 0),
        }
    }

    fn get_features(&self, cmd: NvmeCommand) -> (NvmeStatus, u32) {
        match (cmd.cdw10 & 0xff) as u8 {
            feature::NUMBER_OF_QUEUES => {
                let max = u32::from(self.config.max_io_queues.max(1) - 1);
                let value = self
                    .features
                    .number_of_queues
                    .unwrap_or((max << 16) | max);
                (NvmeStatus::SUCCESS, value)
            }
            feature::VOLATILE_WRITE_CACHE => {
                (NvmeStatus::SUCCESS, u32::from(self.features.write_cache))
            }
            feature::INTERRUPT_COALESCING => {
                (NvmeStatus::SUCCESS, self.features.interrupt_coalescing)
            }
            _ => (NvmeStatus::INVALID_FIELD, 0),
        }
    }

    fn execute_io(
        &mut self,
        sqid: u16,
        cmd: NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> (NvmeStatus, u32) {
        match cmd.opc {
            io_opcode::FLUSH => (self.flush(sqid, cmd), 0),
            io_opcode::READ | io_opcode::WRITE => (self.read_write(sqid, cmd, memory), 0),
            opcode => {
                debug!(sqid, opcode, "unsupported I/O opcode");
                (NvmeStatus::INVALID_OPCODE, 0)
            }
        }
    }

    fn flush(&mut self, sqid: u16, cmd: NvmeCommand) -> NvmeStatus {
        self.io_log.push(IoLogEntry {
            sqid,
            cid: cmd.cid,
            opcode: cmd.opc,
            nsid: cmd.nsid,
            slba: 0,
            blocks: 0,
            prp1: cmd.prp1,
            prp2: cmd.prp2,
            segments: Vec::new(),
        });
        let result = if cmd.nsid == u32::MAX {
            self.namespaces
                .values_mut()
                .try_for_each(|disk| disk.flush())
        } else {
            match self.namespaces.get_mut(&cmd.nsid) {
                Some(disk) => disk.flush(),
                None => return NvmeStatus::INVALID_NAMESPACE,
            }
        };
        match result {
            Ok(()) => NvmeStatus::SUCCESS,
            Err(_) => NvmeStatus::INTERNAL_ERROR,
        }
    }

    fn read_write(&mut self, sqid: u16, cmd: NvmeCommand, memory: &mut dyn MemoryBus) -> NvmeStatus {
        let slba = u64::from(cmd.cdw10) | (u64::from(cmd.cdw11) << 32);
        let blocks = (cmd.cdw12 & 0xffff) + 1;
        let mut entry = IoLogEntry {
            sqid,
            cid: cmd.cid,
            opcode: cmd.opc,
            nsid: cmd.nsid,
            slba,
            blocks,
            prp1: cmd.prp1,
            prp2: cmd.prp2,
            segments: Vec::new(),
        };

        let status = self.transfer(cmd, slba, blocks, memory, &mut entry.segments);

        self.io_log.push(entry);
        status
    }

    fn transfer(
        &mut self,
        cmd: NvmeCommand,
        slba: u64,
        blocks: u32,
        memory: &mut dyn MemoryBus,
        resolved: &mut Vec<(u64, usize)>,
    ) -> NvmeStatus {
        let write = cmd.opc == io_opcode::WRITE;
        let Some(disk) = self.namespaces.get_mut(&cmd.nsid) else {
            return NvmeStatus::INVALID_NAMESPACE;
        };
        match slba.checked_add(u64::from(blocks)) {
            Some(end) if end <= disk.total_sectors() => {}
            _ => return NvmeStatus::LBA_OUT_OF_RANGE,
        }
        let len = blocks as usize * disk.sector_size() as usize;
        let segments = match prp_segments(&*memory, cmd.prp1, cmd.prp2, len) {
            Ok(segments) => segments,
            Err(status) => return status,
        };
        *resolved = segments.clone();

        let range = (cmd.nsid, slba)..(cmd.nsid, slba + u64::from(blocks));
        if let Some((&(_, lba), &status)) = self.media_errors.range(range).next() {
            debug!(nsid = cmd.nsid, lba, sc = status.sc, "injected media error");
            return status;
        }

        let mut buf = vec![0u8; len];
        if write {
            if gather(&*memory, &segments, &mut buf).is_err() {
                return NvmeStatus::DATA_TRANSFER_ERROR;
            }
            match disk.write_sectors(slba, &buf) {
                Ok(()) => NvmeStatus::SUCCESS,
                Err(DiskError::OutOfRange) => NvmeStatus::LBA_OUT_OF_RANGE,
                Err(DiskError::Io) => NvmeStatus::WRITE_FAULT,
            }
        } else {
            match disk.read_sectors(slba, &mut buf) {
                Ok(()) => {}
                Err(DiskError::OutOfRange) => return NvmeStatus::LBA_OUT_OF_RANGE,
                Err(DiskError::Io) => return NvmeStatus::UNRECOVERED_READ_ERROR,
            }
            match scatter(memory, &segments, &buf) {
                Ok(()) => NvmeStatus::SUCCESS,
                Err(_) => NvmeStatus::DATA_TRANSFER_ERROR,
            }
        }
    }
}

impl std::fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeController")
            .field("cc", &self.cc)
            .field("csts", &self.csts)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("sqs", &self.sqs.keys().collect::<Vec<_>>())
            .field("cqs", &self.cqs.keys().collect::<Vec<_>>())
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

fn page_aligned(addr: u64) -> bool {
    addr != 0 && addr & (PAGE_SIZE as u64 - 1) == 0
}

fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let len = s.len().min(dst.len());
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
}

/// Resolves PRP1/PRP2 into `(address, length)` runs covering `len` bytes. A list page's last
/// entry chains to the next list page when more than one page of entries is needed.
fn prp_segments(
    memory: &dyn MemoryBus,
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<Vec<(u64, usize)>, NvmeStatus> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if prp1 == 0 || prp1 & 0x3 != 0 {
        return Err(NvmeStatus::PRP_OFFSET_INVALID);
    }
    let first = (PAGE_SIZE - (prp1 as usize & (PAGE_SIZE - 1))).min(len);
    let mut segments = vec![(prp1, first)];
    let mut remaining = len - first;
    if remaining == 0 {
        return Ok(segments);
    }
    if !page_aligned(prp2) {
        return Err(NvmeStatus::PRP_OFFSET_INVALID);
    }
    if remaining <= PAGE_SIZE {
        segments.push((prp2, remaining));
        return Ok(segments);
    }

    let mut list = prp2;
    let mut index = 0;
    while remaining > 0 {
        let entry = memory
            .read_u64(list + index as u64 * 8)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
        if !page_aligned(entry) {
            return Err(NvmeStatus::PRP_OFFSET_INVALID);
        }
        if index == PRP_ENTRIES_PER_PAGE - 1 && remaining > PAGE_SIZE {
            list = entry;
            index = 0;
            continue;
        }
        let chunk = remaining.min(PAGE_SIZE);
        segments.push((entry, chunk));
        remaining -= chunk;
        index += 1;
    }
    Ok(segments)
}

fn gather(memory: &dyn MemoryBus, segments: &[(u64, usize)], buf: &mut [u8]) -> Result<(), MemoryError> {
    let mut offset = 0;
    for &(addr, len) in segments {
        memory.read_physical(addr, &mut buf[offset..offset + len])?;
        offset += len;
    }
    Ok(())
}

fn scatter(memory: &mut dyn MemoryBus, segments: &[(u64, usize)], buf: &[u8]) -> Result<(), MemoryError> {
    let mut offset = 0;
    for &(addr, len) in segments {
        memory.write_physical(addr, &buf[offset..offset + len])?;
        offset += len;
    }
    Ok(())
}

fn dma_write(memory: &mut dyn MemoryBus, prp1: u64, prp2: u64, data: &[u8]) -> Result<(), NvmeStatus> {
    let segments = prp_segments(&*memory, prp1, prp2, data.len())?;
    scatter(memory, &segments, data).map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)
}
