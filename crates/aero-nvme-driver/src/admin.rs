//! The admin queue pair: one command in flight, caller blocked until it completes.

use std::sync::{Condvar, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::cmd::{Command, Completion};
use crate::error::{NvmeError, Result};
use crate::queue::QueuePair;
use crate::ring::SqCursor;

pub struct AdminQueuePair {
    qp: QueuePair,
    /// Held from submission until the completion has been handed back.
    cursor: Mutex<SqCursor>,
    result: Mutex<Option<Completion>>,
    completed: Condvar,
}

impl AdminQueuePair {
    pub fn new(qp: QueuePair, cursor: SqCursor) -> Self {
        Self {
            qp,
            cursor: Mutex::new(cursor),
            result: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    pub fn queue(&self) -> &QueuePair {
        &self.qp
    }

    /// Submits `cmd` and blocks until the device completes it. `data` is an optional
    /// `(physical address, length)` buffer described through PRPs.
    ///
    /// Returns the raw completion; the caller inspects its status.
    pub fn submit_and_wait(&self, mut cmd: Command, data: Option<(u64, usize)>) -> Result<Completion> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if self.qp.is_closed() {
            return Err(NvmeError::Shutdown);
        }

        let mapping = data.map(|(addr, len)| self.qp.prp().map(addr, len)).transpose()?;
        if let Some(mapping) = &mapping {
            cmd.header.prp1 = mapping.prp1;
            cmd.header.prp2 = mapping.prp2;
        }
        cmd.header.cid = cursor.tail();

        let mut result = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        *result = None;
        debug!(opcode = cmd.opcode(), cid = cmd.header.cid, "admin submit");
        self.qp.ring().submit(&mut cursor, &cmd);

        let mut result = self
            .completed
            .wait_while(result, |r| r.is_none() && !self.qp.is_closed())
            .unwrap_or_else(PoisonError::into_inner);
        let completion = result.take();
        drop(result);

        if let Some(mapping) = mapping {
            self.qp.prp().release(mapping);
        }
        let completion = completion.ok_or(NvmeError::Shutdown)?;
        debug!(
            opcode = cmd.opcode(),
            cid = completion.cid,
            status = completion.status.0,
            "admin complete"
        );
        Ok(completion)
    }

    /// [`Self::submit_and_wait`], mapping a failed status to [`NvmeError::CommandFailed`].
    pub fn execute(&self, cmd: Command, data: Option<(u64, usize)>) -> Result<Completion> {
        let opcode = cmd.opcode();
        let completion = self.submit_and_wait(cmd, data)?;
        completion.check_admin(opcode).inspect_err(|err| {
            warn!(opcode, %err, "admin command failed");
        })
    }

    /// Drains every posted completion into the result slot. Returns how many were consumed.
    pub fn process_completions(&self) -> usize {
        let ring = self.qp.ring();
        let mut consumed = 0;
        while let Some(cqe) = ring.pop_completion() {
            ring.update_sq_head(cqe.sqhd);
            ring.advance_completion_head();
            consumed += 1;

            let mut result = self.result.lock().unwrap_or_else(PoisonError::into_inner);
            if result.is_some() {
                warn!(cid = cqe.cid, "admin completion with a result still unclaimed");
            }
            *result = Some(cqe);
            self.completed.notify_all();
        }
        consumed
    }

    /// Completion worker body. Returns once the queue is closed.
    pub fn run(&self) {
        while self.qp.ring().wait_for_completions() {
            self.process_completions();
        }
        debug!(qid = self.qp.qid(), "admin worker exiting");
    }

    /// Stops the worker and fails a blocked caller with [`NvmeError::Shutdown`].
    pub fn stop(&self) {
        self.qp.stop_worker();
        let _result = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        self.completed.notify_all();
    }
}

impl std::fmt::Debug for AdminQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminQueuePair")
            .field("qp", &self.qp)
            .finish_non_exhaustive()
    }
}
