//! Controller bring-up, queue negotiation, request dispatch and teardown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::admin::AdminQueuePair;
use crate::bio::{Bio, BioOp};
use crate::cmd::{cns, feature, Command, CommandBody, Completion};
use crate::config::NvmeConfig;
use crate::error::{NvmeError, Result};
use crate::io_queue::IoQueuePair;
use crate::namespace::{
    parse_namespace_list, BlockDeviceInfo, IdentifyController, IdentifyNamespace, Namespace,
    IDENTIFY_LEN,
};
use crate::pending::MAX_ROWS;
use crate::platform::{DmaBuffer, Platform};
use crate::queue::{QueueMemory, QueuePair};
use crate::regs::{
    admin_queue_attributes, configure_cc, Capabilities, ControllerConfig, ControllerStatus,
    PAGE_SHIFT, QEMU_VENDOR_ID, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_VS,
};

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);

/// Hands out controller instance ids, starting at 0 for the first call in this process.
pub fn next_instance_id() -> u32 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Largest queue depth whose command ids still fit the pending table.
const MAX_IO_QUEUE_ENTRIES: u16 = (65536 / MAX_ROWS) as u16;

/// Queue sizes to retry with after an allocation failure, or `None` once either would drop below
/// `floor`. Equal sizes are both halved; otherwise only the smaller one is.
pub fn backoff_step(sq: u16, cq: u16, floor: u16) -> Option<(u16, u16)> {
    let (sq, cq) = match sq.cmp(&cq) {
        std::cmp::Ordering::Equal => (sq / 2, cq / 2),
        std::cmp::Ordering::Less => (sq / 2, cq),
        std::cmp::Ordering::Greater => (sq, cq / 2),
    };
    (sq >= floor && cq >= floor).then_some((sq, cq))
}

/// Runs `attempt` with shrinking queue sizes while it fails with out-of-memory. Any other error
/// is returned at once. When the floor is reached the first out-of-memory error is returned.
pub fn with_backoff<T>(
    sq: u16,
    cq: u16,
    floor: u16,
    mut attempt: impl FnMut(u16, u16) -> Result<T>,
) -> Result<T> {
    let (mut sq, mut cq) = (sq, cq);
    let mut first_oom: Option<NvmeError> = None;
    loop {
        match attempt(sq, cq) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_out_of_memory() => {
                let original = first_oom.take().unwrap_or(err);
                match backoff_step(sq, cq, floor) {
                    Some(next) => {
                        warn!(
                            sq,
                            cq,
                            next_sq = next.0,
                            next_cq = next.1,
                            "queue allocation failed, shrinking"
                        );
                        (sq, cq) = next;
                        first_oom = Some(original);
                    }
                    None => {
                        error!(sq, cq, floor, "queue allocation failed at minimum size");
                        return Err(original);
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decodes the Number of Queues completion (zero-based counts) against what was requested and the
/// vectors left after the admin queue's.
pub fn granted_io_queues(requested: u16, result: u32, vectors: u16) -> u16 {
    let sq_granted = (result & 0xffff) + 1;
    let cq_granted = (result >> 16) + 1;
    let granted = u32::from(requested).min(sq_granted).min(cq_granted);
    granted.min(u32::from(vectors.saturating_sub(1))) as u16
}

/// Snapshot of a controller's identity and negotiated geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub instance: u32,
    pub vendor_id: u16,
    pub subsystem_vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub version: u32,
    pub admin_queue_entries: u16,
    pub io_queues: usize,
    pub io_queue_entries: u16,
    pub max_io_size: usize,
    pub write_cache: bool,
    pub namespaces: Vec<u32>,
}

/// Everything that exists while the controller is enabled.
struct Active {
    cap: Capabilities,
    admin: Arc<AdminQueuePair>,
    io_queues: Vec<Arc<IoQueuePair>>,
    io_queue_entries: u16,
    identify: IdentifyController,
    namespaces: BTreeMap<u32, Namespace>,
    write_cache: bool,
    max_io_size: usize,
}

/// One NVMe controller driven through its admin and I/O queue pairs.
pub struct NvmeController {
    instance: u32,
    platform: Platform,
    config: NvmeConfig,
    state: RwLock<Option<Active>>,
}

impl NvmeController {
    /// Brings the controller up: reset, admin queue, identify, feature negotiation, I/O queues.
    pub fn attach(platform: Platform, config: NvmeConfig, instance: u32) -> Result<Self> {
        let controller = Self {
            instance,
            platform,
            config,
            state: RwLock::new(None),
        };
        let active = controller.bring_up()?;
        *controller
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(active);
        Ok(controller)
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn config(&self) -> &NvmeConfig {
        &self.config
    }

    fn with_active<T>(&self, f: impl FnOnce(&Active) -> T) -> Result<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.as_ref().map(f).ok_or(NvmeError::Shutdown)
    }

    fn wait_ready(&self, cap: Capabilities, ready: bool) -> Result<()> {
        let timeout = cap.ready_timeout();
        let start = Instant::now();
        loop {
            let csts = ControllerStatus::from_bits_truncate(self.platform.regs.read_u32(REG_CSTS));
            if csts.contains(ControllerStatus::READY) == ready {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                error!(
                    instance = self.instance,
                    expected_ready = ready,
                    fatal = csts.contains(ControllerStatus::FATAL),
                    ?timeout,
                    "controller ready timeout"
                );
                return Err(NvmeError::Timeout {
                    expected_ready: ready,
                    waited: timeout,
                });
            }
            thread::sleep(self.config.ready_poll_interval);
        }
    }

    /// Clears CC.EN if set and waits for CSTS.RDY to drop.
    fn disable(&self, cap: Capabilities) -> Result<()> {
        let regs = &self.platform.regs;
        let cc = ControllerConfig::from_bits_retain(regs.read_u32(REG_CC));
        if cc.contains(ControllerConfig::ENABLE) {
            regs.write_u32(REG_CC, (cc - ControllerConfig::ENABLE).bits());
        }
        self.wait_ready(cap, false)
    }

    fn enable(&self, cap: Capabilities) -> Result<()> {
        let regs = &self.platform.regs;
        let cc = ControllerConfig::from_bits_retain(regs.read_u32(REG_CC));
        regs.write_u32(REG_CC, (cc | ControllerConfig::ENABLE).bits());
        self.wait_ready(cap, true)
    }

    fn bring_up(&self) -> Result<Active> {
        let regs = &self.platform.regs;
        let cap = Capabilities(regs.read_u64(REG_CAP));
        debug!(
            instance = self.instance,
            cap = cap.0,
            version = regs.read_u32(REG_VS),
            "bring-up"
        );
        if cap.min_page_shift() > PAGE_SHIFT {
            error!(
                instance = self.instance,
                min_page_size = 1u64 << cap.min_page_shift(),
                "controller cannot use 4 KiB pages"
            );
            return Err(NvmeError::Unsupported("minimum memory page size above 4 KiB"));
        }
        if self.platform.interrupts.vector_count() < 2 {
            return Err(NvmeError::InterruptSetup(
                "need one vector for the admin queue and at least one for I/O",
            ));
        }

        self.disable(cap)?;
        regs.write_u32(REG_CC, configure_cc(regs.read_u32(REG_CC)));

        let admin = self.create_admin_queue(cap)?;
        match self.bring_up_with_admin(cap, &admin) {
            Ok(active) => Ok(active),
            Err(err) => {
                if let Err(disable_err) = self.disable(cap) {
                    warn!(instance = self.instance, %disable_err, "disable after failed bring-up");
                }
                admin.stop();
                admin.queue().unbind_interrupt();
                Err(err)
            }
        }
    }

    fn create_admin_queue(&self, cap: Capabilities) -> Result<Arc<AdminQueuePair>> {
        let regs = &self.platform.regs;
        let max = cap.max_queue_entries().clamp(2, 4096) as u16;
        let entries = self.config.admin_queue_entries.clamp(2, max);
        let memory = QueueMemory::allocate(&self.platform, entries, entries)?;
        let (qp, cursor) = QueuePair::new(&self.platform, 0, memory, cap.doorbell_stride(), 0, 1);

        regs.write_u32(REG_AQA, admin_queue_attributes(entries, entries));
        regs.write_u64(REG_ASQ, qp.ring().sq_paddr());
        regs.write_u64(REG_ACQ, qp.ring().cq_paddr());

        let admin = Arc::new(AdminQueuePair::new(qp, cursor));
        admin.queue().bind_interrupt()?;
        let worker = Arc::clone(&admin);
        if let Err(err) = admin
            .queue()
            .start_worker(format!("nvme{}_aq", self.instance), move || worker.run())
        {
            admin.queue().unbind_interrupt();
            return Err(err);
        }
        Ok(admin)
    }

    fn identify(&self, admin: &AdminQueuePair, cns: u8, nsid: u32) -> Result<Vec<u8>> {
        let buf = DmaBuffer::new_zeroed(&self.platform.dma, &*self.platform.memory, IDENTIFY_LEN)?;
        let cmd = Command::new(CommandBody::Identify { cns }).with_nsid(nsid);
        admin.execute(cmd, Some((buf.paddr(), IDENTIFY_LEN)))?;
        let mut data = vec![0u8; IDENTIFY_LEN];
        self.platform.memory.read_physical(buf.paddr(), &mut data);
        Ok(data)
    }

    fn set_feature(&self, admin: &AdminQueuePair, fid: u8, value: u32) -> Result<u32> {
        let cmd = Command::new(CommandBody::SetFeatures { fid, value });
        Ok(admin.execute(cmd, None)?.result)
    }

    fn bring_up_with_admin(&self, cap: Capabilities, admin: &Arc<AdminQueuePair>) -> Result<Active> {
        self.enable(cap)?;

        let identify = IdentifyController::parse(&self.identify(admin, cns::CONTROLLER, 0)?);
        let max_io_size = identify.max_io_size(self.config.max_transfer_shift_cap);
        info!(
            instance = self.instance,
            vendor_id = identify.vendor_id,
            model = %identify.model,
            serial = %identify.serial,
            max_io_size,
            "identified controller"
        );

        let nsids = if self.config.scan_all_namespaces {
            parse_namespace_list(&self.identify(admin, cns::ACTIVE_NAMESPACES, 0)?)
        } else {
            vec![1]
        };
        let mut namespaces = BTreeMap::new();
        for nsid in nsids {
            let data = self.identify(admin, cns::NAMESPACE, nsid)?;
            let ns = Namespace::from_identify(nsid, &IdentifyNamespace::parse(&data))?;
            info!(
                instance = self.instance,
                nsid,
                block_size = ns.block_size(),
                blocks = ns.block_count,
                bytes = ns.size_bytes(),
                "namespace"
            );
            namespaces.insert(nsid, ns);
        }

        let write_cache = identify.volatile_write_cache && self.config.enable_write_cache;
        if write_cache {
            self.set_feature(admin, feature::VOLATILE_WRITE_CACHE, 1)?;
            debug!(instance = self.instance, "volatile write cache enabled");
        }

        let requested = if self.config.queue_per_cpu {
            self.platform.cpus.cpu_count().clamp(1, usize::from(u16::MAX)) as u16
        } else {
            1
        };
        let value = (u32::from(requested - 1) << 16) | u32::from(requested - 1);
        let result = self.set_feature(admin, feature::NUMBER_OF_QUEUES, value)?;
        let count = granted_io_queues(requested, result, self.platform.interrupts.vector_count());
        info!(instance = self.instance, requested, granted = count, "I/O queues negotiated");
        if count == 0 {
            return Err(NvmeError::InterruptSetup("no I/O queue could be granted"));
        }

        let (io_queues, io_queue_entries) = self.create_io_queues(cap, admin, count)?;

        if let Some(coalescing) = self.config.interrupt_coalescing {
            if identify.vendor_id != QEMU_VENDOR_ID {
                let applied = self.set_feature(
                    admin,
                    feature::INTERRUPT_COALESCING,
                    coalescing.feature_value(),
                );
                if let Err(err) = applied {
                    self.destroy_io_queues(admin, &io_queues);
                    return Err(err);
                }
                debug!(instance = self.instance, ?coalescing, "interrupt coalescing set");
            }
        }

        Ok(Active {
            cap,
            admin: Arc::clone(admin),
            io_queues,
            io_queue_entries,
            identify,
            namespaces,
            write_cache,
            max_io_size,
        })
    }

    fn create_io_queues(
        &self,
        cap: Capabilities,
        admin: &AdminQueuePair,
        count: u16,
    ) -> Result<(Vec<Arc<IoQueuePair>>, u16)> {
        let max = cap
            .max_queue_entries()
            .clamp(2, u32::from(MAX_IO_QUEUE_ENTRIES)) as u16;
        let start = self.config.io_queue_entries.clamp(2, max);
        let floor = self.config.min_io_queue_entries.max(2);

        // All ring memory first, so a shrink never leaves queues behind on the device.
        let (memories, entries) = with_backoff(start, start, floor, |sq, cq| {
            let memories = (0..count)
                .map(|_| QueueMemory::allocate(&self.platform, sq, cq))
                .collect::<Result<Vec<_>>>()?;
            Ok((memories, sq))
        })?;

        let mut queues = Vec::with_capacity(usize::from(count));
        for (index, memory) in memories.into_iter().enumerate() {
            match self.start_io_queue(cap, admin, index, memory) {
                Ok(queue) => queues.push(queue),
                Err(err) => {
                    self.destroy_io_queues(admin, &queues);
                    return Err(err);
                }
            }
        }
        info!(
            instance = self.instance,
            queues = queues.len(),
            entries,
            "I/O queues created"
        );
        Ok((queues, entries))
    }

    fn start_io_queue(
        &self,
        cap: Capabilities,
        admin: &AdminQueuePair,
        index: usize,
        memory: QueueMemory,
    ) -> Result<Arc<IoQueuePair>> {
        let qid = index as u16 + 1;
        let vector = qid;
        let (qp, cursor) = QueuePair::new(
            &self.platform,
            qid,
            memory,
            cap.doorbell_stride(),
            vector,
            self.config.prp_pool_capacity,
        );
        let create_cq = Command::new(CommandBody::CreateIoCq {
            qid,
            entries: qp.ring().cq_entries(),
            vector,
            interrupts: true,
        })
        .with_prps(qp.ring().cq_paddr(), 0);
        let create_sq = Command::new(CommandBody::CreateIoSq {
            qid,
            entries: qp.ring().sq_entries(),
            cqid: qid,
            priority: 0,
        })
        .with_prps(qp.ring().sq_paddr(), 0);

        let queue = Arc::new(IoQueuePair::new(qp, cursor));
        queue.queue().bind_interrupt()?;
        if let Err(err) = admin.execute(create_cq, None) {
            queue.queue().unbind_interrupt();
            return Err(err);
        }
        if let Err(err) = admin.execute(create_sq, None) {
            self.delete_io_queue(admin, qid, false);
            queue.queue().unbind_interrupt();
            return Err(err);
        }

        let cpu = index % self.platform.cpus.cpu_count().max(1);
        self.platform.interrupts.set_affinity(vector, cpu);
        let worker = Arc::clone(&queue);
        let cpus = Arc::clone(&self.platform.cpus);
        let name = format!("nvme{}_ioq{}_iv{}", self.instance, index, vector);
        let started = queue.queue().start_worker(name, move || {
            cpus.pin_current_thread(cpu);
            worker.run();
        });
        if let Err(err) = started {
            self.delete_io_queue(admin, qid, true);
            queue.queue().unbind_interrupt();
            return Err(err);
        }
        debug!(instance = self.instance, qid, vector, cpu, "I/O queue started");
        Ok(queue)
    }

    fn delete_io_queue(&self, admin: &AdminQueuePair, qid: u16, sq_created: bool) {
        if sq_created {
            if let Err(err) = admin.execute(Command::new(CommandBody::DeleteIoSq { qid }), None) {
                warn!(instance = self.instance, qid, %err, "delete I/O SQ failed");
            }
        }
        if let Err(err) = admin.execute(Command::new(CommandBody::DeleteIoCq { qid }), None) {
            warn!(instance = self.instance, qid, %err, "delete I/O CQ failed");
        }
    }

    /// Stops workers, deletes SQs then CQs on the device, then fails whatever is still
    /// outstanding.
    fn destroy_io_queues(&self, admin: &AdminQueuePair, queues: &[Arc<IoQueuePair>]) {
        for queue in queues {
            queue.stop();
        }
        for queue in queues {
            let qid = queue.queue().qid();
            if let Err(err) = admin.execute(Command::new(CommandBody::DeleteIoSq { qid }), None) {
                warn!(instance = self.instance, qid, %err, "delete I/O SQ failed");
            }
        }
        for queue in queues {
            let qid = queue.queue().qid();
            if let Err(err) = admin.execute(Command::new(CommandBody::DeleteIoCq { qid }), None) {
                warn!(instance = self.instance, qid, %err, "delete I/O CQ failed");
            }
        }
        for queue in queues {
            queue.process_completions();
            queue.fail_outstanding();
            queue.queue().unbind_interrupt();
        }
    }

    fn teardown(&self, active: Active) {
        self.destroy_io_queues(&active.admin, &active.io_queues);
        if let Err(err) = self.disable(active.cap) {
            warn!(instance = self.instance, %err, "controller did not disable cleanly");
        }
        active.admin.stop();
        active.admin.queue().unbind_interrupt();
        info!(instance = self.instance, "controller shut down");
    }

    /// Tears everything down. Outstanding and later requests fail with
    /// [`NvmeError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        let active = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            self.teardown(active);
        }
    }

    /// Full teardown followed by a fresh bring-up, which recreates every I/O queue pair.
    /// Requests issued while the reset is in progress fail with [`NvmeError::Shutdown`].
    pub fn reset(&self) -> Result<()> {
        info!(instance = self.instance, "resetting controller");
        self.shutdown();
        let active = self.bring_up()?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(active);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.with_active(|_| ()).is_ok()
    }

    /// Queues `bio` against namespace `nsid`. Returns immediately; the outcome arrives through
    /// the bio's callback, exactly once.
    pub fn make_request(&self, bio: Bio, nsid: u32) {
        let dispatch = self.with_active(|active| -> Result<_> {
            let ns = *active
                .namespaces
                .get(&nsid)
                .ok_or(NvmeError::NoSuchNamespace(nsid))?;
            let queue = &active.io_queues[self.platform.cpus.current_cpu() % active.io_queues.len()];
            Ok((Arc::clone(queue), ns, active.write_cache, active.max_io_size))
        });
        let (queue, ns, write_cache, max_io_size) = match dispatch.and_then(|d| d) {
            Ok(dispatch) => dispatch,
            Err(err) => return bio.complete(Err(err)),
        };

        let range = match bio.op {
            BioOp::Flush if !write_cache => {
                debug!(instance = self.instance, nsid, "flush without volatile cache");
                return bio.complete(Ok(()));
            }
            BioOp::Flush => None,
            BioOp::Read | BioOp::Write => {
                if bio.len > max_io_size {
                    return bio.complete(Err(NvmeError::InvalidRequest(
                        "transfer larger than the maximum I/O size",
                    )));
                }
                match ns.block_range(bio.offset, bio.len) {
                    Ok(range) => Some(range),
                    Err(err) => return bio.complete(Err(err)),
                }
            }
        };
        queue.make_request(bio, nsid, range);
    }

    pub fn namespace(&self, nsid: u32) -> Option<Namespace> {
        self.with_active(|active| active.namespaces.get(&nsid).copied())
            .ok()
            .flatten()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.with_active(|active| active.namespaces.values().copied().collect())
            .unwrap_or_default()
    }

    /// One entry per namespace, named `nvme{instance}n{nsid}`.
    pub fn block_devices(&self) -> Vec<BlockDeviceInfo> {
        self.with_active(|active| {
            active
                .namespaces
                .values()
                .map(|ns| BlockDeviceInfo {
                    name: format!("nvme{}n{}", self.instance, ns.id),
                    nsid: ns.id,
                    size_bytes: ns.size_bytes(),
                    block_size: ns.block_size(),
                    max_io_size: active.max_io_size,
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Returns and logs the controller's identity and negotiated configuration.
    pub fn dump_config(&self) -> Result<ControllerInfo> {
        let info = self.with_active(|active| ControllerInfo {
            instance: self.instance,
            vendor_id: active.identify.vendor_id,
            subsystem_vendor_id: active.identify.subsystem_vendor_id,
            serial: active.identify.serial.clone(),
            model: active.identify.model.clone(),
            firmware: active.identify.firmware.clone(),
            version: active.identify.version,
            admin_queue_entries: active.admin.queue().ring().sq_entries(),
            io_queues: active.io_queues.len(),
            io_queue_entries: active.io_queue_entries,
            max_io_size: active.max_io_size,
            write_cache: active.write_cache,
            namespaces: active.namespaces.keys().copied().collect(),
        })?;
        info!(
            instance = info.instance,
            vendor_id = info.vendor_id,
            subsystem_vendor_id = info.subsystem_vendor_id,
            serial = %info.serial,
            model = %info.model,
            firmware = %info.firmware,
            version = info.version,
            io_queues = info.io_queues,
            io_queue_entries = info.io_queue_entries,
            max_io_size = info.max_io_size,
            write_cache = info.write_cache,
            "controller configuration"
        );
        Ok(info)
    }

    fn admin(&self) -> Result<Arc<AdminQueuePair>> {
        self.with_active(|active| Arc::clone(&active.admin))
    }

    /// Issues a raw admin command. The completion is returned whatever its status.
    pub fn admin_command(&self, cmd: Command, data: Option<(u64, usize)>) -> Result<Completion> {
        self.admin()?.submit_and_wait(cmd, data)
    }

    /// Current value of feature `fid` (DW0 of the completion).
    pub fn get_feature(&self, fid: u8) -> Result<u32> {
        let cmd = Command::new(CommandBody::GetFeatures { fid });
        Ok(self.admin()?.execute(cmd, None)?.result)
    }

    /// Asks the controller to abort command `cid` on `sqid`. Returns whether it was aborted.
    pub fn abort(&self, sqid: u16, cid: u16) -> Result<bool> {
        let cmd = Command::new(CommandBody::Abort { sqid, cid });
        let completion = self.admin()?.execute(cmd, None)?;
        // DW0 bit 0 set means the command was not aborted.
        Ok(completion.result & 1 == 0)
    }

    /// The I/O queue pairs, for polling and inspection.
    pub fn io_queues(&self) -> Vec<Arc<IoQueuePair>> {
        self.with_active(|active| active.io_queues.clone())
            .unwrap_or_default()
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.with_active(|active| active.write_cache)
            .unwrap_or(false)
    }

    pub fn max_io_size(&self) -> Option<usize> {
        self.with_active(|active| active.max_io_size).ok()
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeController")
            .field("instance", &self.instance)
            .field("platform", &self.platform)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
