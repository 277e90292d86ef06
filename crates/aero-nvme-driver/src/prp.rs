//! PRP (physical region page) descriptors for data transfers.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{NvmeError, Result};
use crate::platform::{DmaAllocator, DmaBuffer, MemoryBus};
use crate::regs::PAGE_SIZE;

const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Entries in one PRP list page.
pub const PRP_LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// PRP1/PRP2 for one request, plus the list page when one was needed.
///
/// The list page must stay alive until the command has completed, after which it goes back to
/// [`PrpMapper::release`].
#[derive(Debug)]
pub struct PrpMapping {
    pub prp1: u64,
    pub prp2: u64,
    pub list: Option<DmaBuffer>,
}

/// Bounded cache of PRP list pages.
///
/// Pages are taken by submitters under their queue lock and given back by the completion worker.
pub struct PrpListPool {
    pages: Mutex<Vec<DmaBuffer>>,
    capacity: usize,
    dma: Arc<dyn DmaAllocator>,
}

impl PrpListPool {
    pub fn new(dma: Arc<dyn DmaAllocator>, capacity: usize) -> Self {
        Self {
            pages: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            dma,
        }
    }

    /// Takes a cached page, or allocates a fresh one when the pool is empty.
    pub fn take(&self) -> Result<DmaBuffer> {
        let cached = self
            .pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match cached {
            Some(page) => Ok(page),
            None => {
                let paddr = self.dma.alloc(PAGE_SIZE)?;
                Ok(DmaBuffer::from_raw(paddr, PAGE_SIZE, Arc::clone(&self.dma)))
            }
        }
    }

    /// Returns a page to the pool, or frees it when the pool is full.
    pub fn give(&self, page: DmaBuffer) {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        if pages.len() < self.capacity {
            pages.push(page);
        }
        // Otherwise `page` drops here and goes back to the allocator.
    }

    pub fn len(&self) -> usize {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for PrpListPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrpListPool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Builds PRP descriptors for physically contiguous buffers.
pub struct PrpMapper {
    pool: PrpListPool,
    memory: Arc<dyn MemoryBus>,
}

impl PrpMapper {
    pub fn new(pool: PrpListPool, memory: Arc<dyn MemoryBus>) -> Self {
        Self { pool, memory }
    }

    pub fn pool(&self) -> &PrpListPool {
        &self.pool
    }

    pub fn map(&self, addr: u64, len: usize) -> Result<PrpMapping> {
        if len == 0 {
            return Err(NvmeError::InvalidRequest("empty data transfer"));
        }
        let first_page = addr & PAGE_MASK;
        let end = addr
            .checked_add(len as u64)
            .ok_or(NvmeError::InvalidRequest("buffer wraps the address space"))?;
        let last_page_end = (end + PAGE_SIZE as u64 - 1) & PAGE_MASK;
        let pages = ((last_page_end - first_page) / PAGE_SIZE as u64) as usize;

        match pages {
            1 => Ok(PrpMapping {
                prp1: addr,
                prp2: 0,
                list: None,
            }),
            2 => Ok(PrpMapping {
                prp1: addr,
                prp2: first_page + PAGE_SIZE as u64,
                list: None,
            }),
            n if n - 1 > PRP_LIST_ENTRIES => {
                Err(NvmeError::InvalidRequest("transfer needs more than one PRP list page"))
            }
            n => {
                let list = self.pool.take()?;
                let entries: Vec<u8> = (1..n as u64)
                    .flat_map(|i| (first_page + i * PAGE_SIZE as u64).to_le_bytes())
                    .collect();
                self.memory.write_physical(list.paddr(), &entries);
                Ok(PrpMapping {
                    prp1: addr,
                    prp2: list.paddr(),
                    list: Some(list),
                })
            }
        }
    }

    /// Gives the mapping's list page, if any, back to the pool.
    pub fn release(&self, mapping: PrpMapping) {
        if let Some(list) = mapping.list {
            self.pool.give(list);
        }
    }
}

impl std::fmt::Debug for PrpMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrpMapper")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestDma, TestMemory};
    use proptest::prelude::*;

    fn mapper(capacity: usize) -> (PrpMapper, Arc<TestDma>, Arc<TestMemory>) {
        let memory = Arc::new(TestMemory::new(1 << 20));
        let dma = Arc::new(TestDma::new(0x80000, 1 << 20));
        let pool = PrpListPool::new(dma.clone(), capacity);
        (PrpMapper::new(pool, memory.clone()), dma, memory)
    }

    fn list_entries(memory: &TestMemory, list: u64, n: usize) -> Vec<u64> {
        (0..n as u64).map(|i| memory.read_u64(list + i * 8)).collect()
    }

    #[test]
    fn single_page_has_no_prp2() {
        let (m, dma, _) = mapper(4);
        let mapping = m.map(0x1_0200, 512).unwrap();
        assert_eq!((mapping.prp1, mapping.prp2), (0x1_0200, 0));
        assert!(mapping.list.is_none());
        assert_eq!(dma.allocations(), 0);
    }

    #[test]
    fn two_pages_use_direct_prp2() {
        let (m, dma, _) = mapper(4);
        let mapping = m.map(0x1_0e00, 4096).unwrap();
        assert_eq!(mapping.prp2, 0x1_1000);
        assert!(mapping.list.is_none());
        assert_eq!(dma.allocations(), 0);
    }

    #[test]
    fn unaligned_buffer_over_four_pages_builds_list() {
        let (m, _, memory) = mapper(4);
        // 0x2100..0x5100 touches pages 0x2000, 0x3000, 0x4000 and 0x5000.
        let mapping = m.map(0x2100, 3 * 4096).unwrap();
        assert_eq!(mapping.prp1, 0x2100);
        let list = mapping.list.as_ref().unwrap().paddr();
        assert_eq!(mapping.prp2, list);
        assert_eq!(list_entries(&memory, list, 3), vec![0x3000, 0x4000, 0x5000]);
    }

    #[test]
    fn released_list_page_is_reused() {
        let (m, dma, _) = mapper(1);
        let first = m.map(0, 3 * 4096).unwrap();
        let page = first.prp2;
        m.release(first);
        assert_eq!(m.pool().len(), 1);

        let second = m.map(0x10000, 3 * 4096).unwrap();
        assert_eq!(second.prp2, page);
        assert_eq!(dma.allocations(), 1);
        m.release(second);
    }

    #[test]
    fn full_pool_frees_returned_pages() {
        let (m, dma, _) = mapper(1);
        let a = m.map(0, 3 * 4096).unwrap();
        let b = m.map(0x10000, 3 * 4096).unwrap();
        assert_eq!(dma.live(), 2);
        m.release(a);
        m.release(b);
        assert_eq!(m.pool().len(), 1);
        assert_eq!(dma.live(), 1);
    }

    #[test]
    fn list_allocation_failure_is_out_of_memory() {
        let (m, dma, _) = mapper(1);
        dma.fail_after(0);
        assert!(m.map(0, 3 * 4096).unwrap_err().is_out_of_memory());
        // No list needed, no allocation attempted.
        assert!(m.map(0, 2 * 4096).is_ok());
    }

    #[test]
    fn rejects_oversized_and_empty_transfers() {
        let (m, _, _) = mapper(1);
        assert!(m.map(0, (PRP_LIST_ENTRIES + 1) * PAGE_SIZE).is_ok());
        assert!(matches!(
            m.map(0, (PRP_LIST_ENTRIES + 1) * PAGE_SIZE + 1),
            Err(NvmeError::InvalidRequest(_))
        ));
        assert!(matches!(m.map(0x1000, 0), Err(NvmeError::InvalidRequest(_))));
    }

    proptest! {
        #[test]
        fn mapping_covers_every_touched_page(
            page in 0u64..64,
            offset in 0u64..4096,
            len in 1usize..(64 * 4096),
        ) {
            let (m, _, memory) = mapper(2);
            let addr = page * 4096 + offset;
            let mapping = m.map(addr, len).unwrap();
            prop_assert_eq!(mapping.prp1, addr);

            let first = addr & PAGE_MASK;
            let pages = ((addr + len as u64 + 4095) / 4096 - first / 4096) as usize;
            match pages {
                1 => {
                    prop_assert_eq!(mapping.prp2, 0);
                    prop_assert!(mapping.list.is_none());
                }
                2 => {
                    prop_assert_eq!(mapping.prp2, first + 4096);
                    prop_assert!(mapping.list.is_none());
                }
                n => {
                    let list = mapping.list.as_ref().unwrap().paddr();
                    prop_assert_eq!(mapping.prp2, list);
                    let expected: Vec<u64> = (1..n as u64).map(|i| first + i * 4096).collect();
                    prop_assert_eq!(list_entries(&memory, list, n - 1), expected);
                }
            }
            m.release(mapping);
        }
    }
}
