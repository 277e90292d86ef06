//! Pipelined I/O queue pair.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::bio::{Bio, BioOp};
use crate::cmd::{BlockRange, Command, CommandBody};
use crate::error::NvmeError;
use crate::pending::PendingTable;
use crate::prp::PrpMapping;
use crate::queue::QueuePair;
use crate::ring::SqCursor;

/// A submitted request waiting for its completion.
struct Inflight {
    bio: Bio,
    prp: Option<PrpMapping>,
}

struct Submission {
    cursor: SqCursor,
    pending: PendingTable<Inflight>,
}

pub struct IoQueuePair {
    qp: QueuePair,
    state: Mutex<Submission>,
    /// Signalled when the ring stops being full, and on close.
    not_full: Condvar,
    /// Serializes completion processing between the worker and direct pollers.
    reaping: Mutex<()>,
}

impl IoQueuePair {
    pub fn new(qp: QueuePair, cursor: SqCursor) -> Self {
        let pending = PendingTable::new(qp.ring().sq_entries());
        Self {
            qp,
            state: Mutex::new(Submission { cursor, pending }),
            not_full: Condvar::new(),
            reaping: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &QueuePair {
        &self.qp
    }

    fn lock_state(&self) -> MutexGuard<'_, Submission> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests currently outstanding on the device.
    pub fn outstanding(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Rows of the pending table allocated so far.
    pub fn pending_rows(&self) -> usize {
        self.lock_state().pending.rows()
    }

    /// PRP list pages currently cached.
    pub fn prp_pool_len(&self) -> usize {
        self.qp.prp().pool().len()
    }

    /// Submits `bio` against namespace `nsid`, translating its byte range with `range`.
    ///
    /// Blocks only while the submission ring is full. Every outcome, including failures found
    /// here, is reported through the bio's callback.
    pub fn make_request(&self, bio: Bio, nsid: u32, range: Option<BlockRange>) {
        if let Err((bio, err)) = self.submit(bio, nsid, range) {
            bio.complete(Err(err));
        }
    }

    fn submit(
        &self,
        bio: Bio,
        nsid: u32,
        range: Option<BlockRange>,
    ) -> std::result::Result<(), (Bio, NvmeError)> {
        let body = match (bio.op, range) {
            (BioOp::Read, Some(range)) => CommandBody::Read(range),
            (BioOp::Write, Some(range)) => CommandBody::Write(range),
            (BioOp::Flush, _) => CommandBody::Flush,
            (_, None) => return Err((bio, NvmeError::InvalidRequest("missing block range"))),
        };
        let prp = match body {
            CommandBody::Flush => None,
            _ => match self.qp.prp().map(bio.data, bio.len) {
                Ok(mapping) => Some(mapping),
                Err(err) => return Err((bio, err)),
            },
        };

        let mut state = self.lock_state();
        while !self.qp.is_closed() && self.qp.ring().is_full(&state.cursor) {
            debug!(qid = self.qp.qid(), "submission ring full, waiting");
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if self.qp.is_closed() {
            drop(state);
            if let Some(mapping) = prp {
                self.qp.prp().release(mapping);
            }
            return Err((bio, NvmeError::Shutdown));
        }

        let mut cmd = Command::new(body).with_nsid(nsid);
        if let Some(mapping) = &prp {
            cmd = cmd.with_prps(mapping.prp1, mapping.prp2);
        }
        let slot = state.cursor.tail();
        let cid = state.pending.insert(slot, Inflight { bio, prp });
        cmd.header.cid = cid;

        match body {
            CommandBody::Read(range) | CommandBody::Write(range) => debug!(
                qid = self.qp.qid(),
                cid,
                opcode = cmd.opcode(),
                slba = range.slba,
                nlb = range.blocks - 1,
                "submit"
            ),
            _ => debug!(qid = self.qp.qid(), cid, opcode = cmd.opcode(), "submit"),
        }
        self.qp.ring().submit(&mut state.cursor, &cmd);
        Ok(())
    }

    /// Consumes every completion currently posted and resolves its request. Never blocks on the
    /// device. Returns the number of completions consumed.
    pub fn process_completions(&self) -> usize {
        let _reaping = self.reaping.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = self.qp.ring();
        let mut consumed = 0;

        while let Some(cqe) = ring.pop_completion() {
            // Free the slot for the device before doing anything else with the entry.
            ring.advance_completion_head();
            consumed += 1;

            // Waiters test `is_full` under the state lock, so notifying under it after the head
            // store cannot slip between their check and their wait.
            let moved = ring.update_sq_head(cqe.sqhd);
            let inflight = {
                let mut state = self.lock_state();
                if moved {
                    self.not_full.notify_all();
                }
                state.pending.take(cqe.cid)
            };
            let Some(inflight) = inflight else {
                warn!(qid = self.qp.qid(), cid = cqe.cid, "completion for unknown command id");
                continue;
            };
            if let Some(mapping) = inflight.prp {
                self.qp.prp().release(mapping);
            }

            let result = cqe.check_io();
            match &result {
                Ok(()) => debug!(qid = self.qp.qid(), cid = cqe.cid, "complete"),
                Err(err) => warn!(qid = self.qp.qid(), cid = cqe.cid, %err, "I/O command failed"),
            }
            inflight.bio.complete(result);
        }
        consumed
    }

    /// Completion worker body. Returns once the queue is closed.
    pub fn run(&self) {
        while self.qp.ring().wait_for_completions() {
            debug!(qid = self.qp.qid(), "worker woke");
            self.process_completions();
        }
        debug!(qid = self.qp.qid(), "I/O worker exiting");
    }

    /// Stops the worker and wakes submitters blocked on a full ring; they fail with
    /// [`NvmeError::Shutdown`]. Outstanding requests stay pending until
    /// [`Self::fail_outstanding`].
    pub fn stop(&self) {
        self.qp.stop_worker();
        let _state = self.lock_state();
        self.not_full.notify_all();
    }

    /// Fails every request still outstanding with [`NvmeError::Shutdown`]. Returns how many.
    pub fn fail_outstanding(&self) -> usize {
        let drained = self.lock_state().pending.drain();
        let count = drained.len();
        for inflight in drained {
            if let Some(mapping) = inflight.prp {
                self.qp.prp().release(mapping);
            }
            inflight.bio.complete(Err(NvmeError::Shutdown));
        }
        if count > 0 {
            warn!(qid = self.qp.qid(), count, "failed outstanding requests");
        }
        count
    }
}

impl std::fmt::Debug for IoQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoQueuePair")
            .field("qp", &self.qp)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}
