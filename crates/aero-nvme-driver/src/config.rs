use std::time::Duration;

/// Interrupt coalescing (feature 0x08): aggregation threshold in completions and aggregation
/// time in 100 µs units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptCoalescing {
    pub threshold: u8,
    pub time_100us: u8,
}

impl InterruptCoalescing {
    pub fn feature_value(self) -> u32 {
        u32::from(self.threshold) | (u32::from(self.time_100us) << 8)
    }
}

impl Default for InterruptCoalescing {
    fn default() -> Self {
        Self {
            threshold: 20,
            time_100us: 2,
        }
    }
}

/// Controller bring-up and queue geometry knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeConfig {
    pub admin_queue_entries: u16,
    /// Starting depth of each I/O SQ/CQ before any backoff. Clamped to CAP.MQES.
    pub io_queue_entries: u16,
    /// Backoff gives up once a queue would be smaller than this.
    pub min_io_queue_entries: u16,
    /// Request one I/O queue per CPU rather than a single one.
    pub queue_per_cpu: bool,
    /// Turn on a volatile write cache when the controller has one.
    pub enable_write_cache: bool,
    /// Not applied to QEMU's controller.
    pub interrupt_coalescing: Option<InterruptCoalescing>,
    /// Register every active namespace instead of only namespace 1.
    pub scan_all_namespaces: bool,
    /// PRP list pages cached per queue pair.
    pub prp_pool_capacity: usize,
    pub ready_poll_interval: Duration,
    /// Upper bound for MDTS when sizing the largest transfer.
    pub max_transfer_shift_cap: u8,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            admin_queue_entries: 8,
            io_queue_entries: 64,
            min_io_queue_entries: 16,
            queue_per_cpu: true,
            enable_write_cache: true,
            interrupt_coalescing: Some(InterruptCoalescing::default()),
            scan_all_namespaces: false,
            prp_pool_capacity: 16,
            ready_poll_interval: Duration::from_micros(50),
            max_transfer_shift_cap: 9,
        }
    }
}
