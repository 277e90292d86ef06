//! Submission/completion ring mechanics shared by every queue pair.
//!
//! The submission side is advanced only by whoever holds the owning queue's lock, which is
//! expressed by requiring `&mut SqCursor`. The completion side (head, phase tag, recorded SQ head)
//! is advanced only by the queue's completion worker and read by everyone else through atomics.

use std::sync::atomic::{fence, AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use bytemuck::Zeroable;
use tracing::trace;

use crate::cmd::{Command, Completion, CompletionEntry, CQE_SIZE, CQE_STATUS_OFFSET, SQE_SIZE};
use crate::event::Event;
use crate::platform::{DmaBuffer, InterruptController, InterruptHandler, MemoryBus, RegisterBus};

/// Producer index of a submission ring. Lives inside the owning queue's lock.
#[derive(Debug)]
pub struct SqCursor {
    tail: u16,
}

impl SqCursor {
    pub fn tail(&self) -> u16 {
        self.tail
    }
}

/// Where a ring lives: memory, depths, doorbells and interrupt vector.
#[derive(Debug)]
pub struct RingLayout {
    pub qid: u16,
    pub sq: DmaBuffer,
    pub sq_entries: u16,
    pub cq: DmaBuffer,
    pub cq_entries: u16,
    pub sq_doorbell: u64,
    pub cq_doorbell: u64,
    pub vector: u16,
}

pub struct Ring {
    layout: RingLayout,
    regs: Arc<dyn RegisterBus>,
    memory: Arc<dyn MemoryBus>,
    interrupts: Arc<dyn InterruptController>,

    /// Device consumer index, as last reported through a CQE's sqhd.
    sq_head: AtomicU16,
    sq_full: AtomicBool,
    cq_head: AtomicU16,
    cq_phase: AtomicBool,

    wake: Event,
    closed: AtomicBool,
}

impl Ring {
    pub fn new(
        layout: RingLayout,
        regs: Arc<dyn RegisterBus>,
        memory: Arc<dyn MemoryBus>,
        interrupts: Arc<dyn InterruptController>,
    ) -> (Self, SqCursor) {
        assert!(layout.sq_entries >= 2 && layout.cq_entries >= 2);
        assert!(layout.sq.len() >= usize::from(layout.sq_entries) * SQE_SIZE);
        assert!(layout.cq.len() >= usize::from(layout.cq_entries) * CQE_SIZE);

        let ring = Self {
            layout,
            regs,
            memory,
            interrupts,
            sq_head: AtomicU16::new(0),
            sq_full: AtomicBool::new(false),
            cq_head: AtomicU16::new(0),
            // The device posts its first lap with phase 1 into zeroed memory.
            cq_phase: AtomicBool::new(true),
            wake: Event::new(),
            closed: AtomicBool::new(false),
        };
        debug_assert!(!ring.completion_not_empty());
        (ring, SqCursor { tail: 0 })
    }

    pub fn qid(&self) -> u16 {
        self.layout.qid
    }

    pub fn vector(&self) -> u16 {
        self.layout.vector
    }

    pub fn sq_entries(&self) -> u16 {
        self.layout.sq_entries
    }

    pub fn cq_entries(&self) -> u16 {
        self.layout.cq_entries
    }

    pub fn sq_paddr(&self) -> u64 {
        self.layout.sq.paddr()
    }

    pub fn cq_paddr(&self) -> u64 {
        self.layout.cq.paddr()
    }

    pub fn sq_head(&self) -> u16 {
        self.sq_head.load(Ordering::SeqCst)
    }

    /// Full exactly when advancing the tail would make it equal to the head.
    pub fn is_full(&self, cursor: &SqCursor) -> bool {
        (cursor.tail + 1) % self.layout.sq_entries == self.sq_head()
    }

    /// Whether the last submission left the ring marked full. The mark is a hint; waiters must
    /// decide with [`Self::is_full`].
    pub fn is_marked_full(&self) -> bool {
        self.sq_full.load(Ordering::SeqCst)
    }

    /// Writes `cmd` into the tail slot, advances the tail and rings the SQ doorbell. Returns the
    /// slot that was written.
    pub fn submit(&self, cursor: &mut SqCursor, cmd: &Command) -> u16 {
        assert!(
            !self.is_full(cursor),
            "qid {} submission ring overrun (tail={}, head={})",
            self.layout.qid,
            cursor.tail,
            self.sq_head()
        );

        let slot = cursor.tail;
        let sqe = cmd.encode();
        let addr = self.layout.sq.paddr() + u64::from(slot) * SQE_SIZE as u64;
        self.memory.write_physical(addr, bytemuck::bytes_of(&sqe));

        cursor.tail = (slot + 1) % self.layout.sq_entries;
        let full = self.is_full(cursor);
        self.sq_full.store(full, Ordering::SeqCst);
        if full {
            trace!(
                qid = self.layout.qid,
                tail = cursor.tail,
                head = self.sq_head(),
                "submission ring full"
            );
        }

        // The entry must be visible before the device sees the new tail.
        fence(Ordering::SeqCst);
        self.regs
            .write_u32(self.layout.sq_doorbell, u32::from(cursor.tail));
        slot
    }

    /// Records the device's SQ head from a completion. Returns true when the head moved, in which
    /// case submitters waiting for space must be woken whatever the full mark says: a submitter
    /// may have refilled the ring between the head store and the mark being cleared.
    pub fn update_sq_head(&self, sqhd: u16) -> bool {
        let old = self.sq_head.swap(sqhd, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if old == sqhd {
            return false;
        }
        if self.sq_full.swap(false, Ordering::SeqCst) {
            trace!(qid = self.layout.qid, head = sqhd, "submission ring has room");
        }
        true
    }

    /// Drops the full mark as a completion worker racing a refill would.
    #[cfg(test)]
    pub(crate) fn clear_full_mark(&self) {
        self.sq_full.store(false, Ordering::SeqCst);
    }

    fn cq_slot_addr(&self, head: u16) -> u64 {
        self.layout.cq.paddr() + u64::from(head) * CQE_SIZE as u64
    }

    /// Whether the entry at the CQ head carries the expected phase tag.
    pub fn completion_not_empty(&self) -> bool {
        let head = self.cq_head.load(Ordering::SeqCst);
        let status = self
            .memory
            .read_u16(self.cq_slot_addr(head) + CQE_STATUS_OFFSET);
        let not_empty = (status & 1 != 0) == self.cq_phase.load(Ordering::SeqCst);
        trace!(qid = self.layout.qid, not_empty, "completion queue check");
        not_empty
    }

    /// Copies out the entry at the CQ head without consuming it.
    pub fn pop_completion(&self) -> Option<Completion> {
        if !self.completion_not_empty() {
            return None;
        }
        // Read the body only after the phase tag has been observed.
        fence(Ordering::SeqCst);
        let head = self.cq_head.load(Ordering::SeqCst);
        let mut raw = CompletionEntry::zeroed();
        self.memory
            .read_physical(self.cq_slot_addr(head), bytemuck::bytes_of_mut(&mut raw));
        let cqe = Completion::decode(&raw);
        assert_eq!(
            cqe.status.phase(),
            self.cq_phase.load(Ordering::SeqCst),
            "qid {} phase tag changed under us",
            self.layout.qid
        );
        Some(cqe)
    }

    /// Consumes the entry at the CQ head, flipping the phase tag on wrap, and rings the CQ
    /// doorbell.
    pub fn advance_completion_head(&self) {
        let mut head = self.cq_head.load(Ordering::SeqCst) + 1;
        if head == self.layout.cq_entries {
            head = 0;
            self.cq_phase.fetch_xor(true, Ordering::SeqCst);
        }
        self.cq_head.store(head, Ordering::SeqCst);
        self.regs.write_u32(self.layout.cq_doorbell, u32::from(head));
    }

    pub fn cq_head(&self) -> u16 {
        self.cq_head.load(Ordering::SeqCst)
    }

    pub fn cq_phase(&self) -> bool {
        self.cq_phase.load(Ordering::SeqCst)
    }

    pub fn enable_interrupts(&self) {
        self.interrupts.unmask(self.layout.vector);
        trace!(qid = self.layout.qid, vector = self.layout.vector, "enable interrupts");
    }

    pub fn disable_interrupts(&self) {
        self.interrupts.mask(self.layout.vector);
        trace!(qid = self.layout.qid, vector = self.layout.vector, "disable interrupts");
    }

    /// Blocks until the completion ring is non-empty. Returns false once the ring is closed.
    ///
    /// Interrupts are only unmasked while sleeping. After unmasking, the ring is checked again:
    /// a completion posted between the first check and the unmask would otherwise raise no
    /// interrupt that we are still waiting for.
    pub fn wait_for_completions(&self) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            if self.completion_not_empty() {
                return true;
            }
            self.enable_interrupts();
            if self.completion_not_empty() {
                self.disable_interrupts();
                return true;
            }
            self.wake.wait();
        }
    }

    /// Wakes the completion worker.
    pub fn notify(&self) {
        self.wake.notify();
    }

    /// Makes [`Self::wait_for_completions`] return false from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Interrupt top half: mask the vector and hand off to the worker.
    pub fn interrupt_handler(self: &Arc<Self>) -> InterruptHandler {
        let ring: Weak<Ring> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(ring) = ring.upgrade() {
                ring.disable_interrupts();
                ring.notify();
            }
        })
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("qid", &self.layout.qid)
            .field("sq_entries", &self.layout.sq_entries)
            .field("cq_entries", &self.layout.cq_entries)
            .field("sq_head", &self.sq_head())
            .field("cq_head", &self.cq_head())
            .field("cq_phase", &self.cq_phase())
            .finish_non_exhaustive()
    }
}
