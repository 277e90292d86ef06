//! State shared by admin and I/O queue pairs: the ring, the PRP mapper and the worker thread.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::cmd::{CQE_SIZE, SQE_SIZE};
use crate::error::{NvmeError, Result};
use crate::platform::{DmaBuffer, InterruptController, Platform};
use crate::prp::{PrpListPool, PrpMapper};
use crate::regs::{cq_head_doorbell, sq_tail_doorbell};
use crate::ring::{Ring, RingLayout, SqCursor};

/// Ring memory for one queue pair, allocated before the device is told about the queue.
#[derive(Debug)]
pub struct QueueMemory {
    pub sq: DmaBuffer,
    pub sq_entries: u16,
    pub cq: DmaBuffer,
    pub cq_entries: u16,
}

impl QueueMemory {
    pub fn allocate(platform: &Platform, sq_entries: u16, cq_entries: u16) -> Result<Self> {
        let sq = DmaBuffer::new_zeroed(
            &platform.dma,
            &*platform.memory,
            usize::from(sq_entries) * SQE_SIZE,
        )?;
        let cq = DmaBuffer::new_zeroed(
            &platform.dma,
            &*platform.memory,
            usize::from(cq_entries) * CQE_SIZE,
        )?;
        Ok(Self {
            sq,
            sq_entries,
            cq,
            cq_entries,
        })
    }
}

pub struct QueuePair {
    ring: Arc<Ring>,
    prp: PrpMapper,
    interrupts: Arc<dyn InterruptController>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuePair {
    /// Wraps already allocated ring memory. `vector` is the MSI-X vector the device will be told
    /// to signal for this queue's completions.
    pub fn new(
        platform: &Platform,
        qid: u16,
        memory: QueueMemory,
        doorbell_stride: u64,
        vector: u16,
        prp_pool_capacity: usize,
    ) -> (Self, SqCursor) {
        let layout = RingLayout {
            qid,
            sq: memory.sq,
            sq_entries: memory.sq_entries,
            cq: memory.cq,
            cq_entries: memory.cq_entries,
            sq_doorbell: sq_tail_doorbell(qid, doorbell_stride),
            cq_doorbell: cq_head_doorbell(qid, doorbell_stride),
            vector,
        };
        let (ring, cursor) = Ring::new(
            layout,
            Arc::clone(&platform.regs),
            Arc::clone(&platform.memory),
            Arc::clone(&platform.interrupts),
        );
        let pool = PrpListPool::new(Arc::clone(&platform.dma), prp_pool_capacity);
        let qp = Self {
            ring: Arc::new(ring),
            prp: PrpMapper::new(pool, Arc::clone(&platform.memory)),
            interrupts: Arc::clone(&platform.interrupts),
            worker: Mutex::new(None),
        };
        (qp, cursor)
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn prp(&self) -> &PrpMapper {
        &self.prp
    }

    pub fn qid(&self) -> u16 {
        self.ring.qid()
    }

    pub fn vector(&self) -> u16 {
        self.ring.vector()
    }

    /// Routes the queue's vector to a handler that masks it and wakes the worker.
    pub fn bind_interrupt(&self) -> Result<()> {
        let vector = self.vector();
        self.interrupts.bind(vector, self.ring.interrupt_handler())?;
        debug!(qid = self.qid(), vector, "interrupt bound");
        Ok(())
    }

    pub fn unbind_interrupt(&self) {
        self.interrupts.mask(self.vector());
        self.interrupts.unbind(self.vector());
    }

    /// Starts the completion worker as a named thread running `body`.
    pub fn start_worker<F>(&self, name: String, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|_| NvmeError::WorkerSpawn(name.clone()))?;
        debug!(qid = self.qid(), worker = %name, "worker started");
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(worker.is_none(), "qid {} already has a worker", self.qid());
        *worker = Some(handle);
        Ok(())
    }

    /// Closes the ring and waits for the worker to exit.
    pub fn stop_worker(&self) {
        self.ring.close();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!(qid = self.qid(), "queue stopped from its own worker; not joining");
                return;
            }
            if handle.join().is_err() {
                warn!(qid = self.qid(), "completion worker panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("ring", &self.ring)
            .field("prp", &self.prp)
            .finish_non_exhaustive()
    }
}
