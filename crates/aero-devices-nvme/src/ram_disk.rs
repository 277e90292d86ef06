use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{DiskBackend, DiskError, DiskResult};

#[derive(Debug)]
struct State {
    sector_size: u32,
    total_sectors: u64,
    /// Only sectors that were ever written; everything else reads as zero.
    sectors: HashMap<u64, Box<[u8]>>,
    flushes: u64,
}

/// Sparse in-memory disk.
///
/// Clones share the same storage, so a test can keep a handle to inspect what the controller
/// wrote.
#[derive(Debug, Clone)]
pub struct RamDisk {
    state: Arc<Mutex<State>>,
}

impl RamDisk {
    pub fn new(sector_size: u32, total_sectors: u64) -> Self {
        assert!(sector_size.is_power_of_two() && sector_size >= 512);
        Self {
            state: Arc::new(Mutex::new(State {
                sector_size,
                total_sectors,
                sectors: HashMap::new(),
                flushes: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flush_count(&self) -> u64 {
        self.lock().flushes
    }

    /// Sectors that hold data.
    pub fn populated_sectors(&self) -> usize {
        self.lock().sectors.len()
    }

    fn check(state: &State, lba: u64, len: usize) -> DiskResult<u64> {
        let ss = state.sector_size as usize;
        if len % ss != 0 {
            return Err(DiskError::Io);
        }
        let count = (len / ss) as u64;
        match lba.checked_add(count) {
            Some(end) if end <= state.total_sectors => Ok(count),
            _ => Err(DiskError::OutOfRange),
        }
    }
}

impl DiskBackend for RamDisk {
    fn sector_size(&self) -> u32 {
        self.lock().sector_size
    }

    fn total_sectors(&self) -> u64 {
        self.lock().total_sectors
    }

    fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> DiskResult<()> {
        let state = self.lock();
        Self::check(&state, lba, buffer.len())?;
        let ss = state.sector_size as usize;
        for (i, chunk) in buffer.chunks_exact_mut(ss).enumerate() {
            match state.sectors.get(&(lba + i as u64)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buffer: &[u8]) -> DiskResult<()> {
        let mut state = self.lock();
        Self::check(&state, lba, buffer.len())?;
        let ss = state.sector_size as usize;
        for (i, chunk) in buffer.chunks_exact(ss).enumerate() {
            state.sectors.insert(lba + i as u64, chunk.into());
        }
        Ok(())
    }

    fn flush(&mut self) -> DiskResult<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}
