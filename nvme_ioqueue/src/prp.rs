// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Physical region page construction.
//!
//! A command's data pointer holds up to two physical addresses directly;
//! transfers spanning more than two pages get a list page whose entries are
//! the remaining page addresses. List pages are recycled through a small
//! bounded cache so steady-state submission does not allocate.

use crate::NVME_PAGE_SHIFT;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DmaClient;

/// Entries in one 4KB PRP list page. Together with the direct first entry
/// this caps a single transfer at about 2 MiB.
pub(crate) const PRP_LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// List pages kept for reuse; beyond this they go back to the allocator.
const CACHE_LIMIT: usize = 16;

#[derive(Debug, Error)]
pub enum PrpError {
    #[error("transfer spans {0} pages; at most {PRP_LIST_ENTRIES} fit one PRP list")]
    TooLarge(usize),
    #[error("failed to allocate a PRP list page")]
    ListAllocation(#[source] anyhow::Error),
}

/// The data pointer for one command, plus the list page backing it, if any.
/// The list page must stay allocated until the command completes.
pub(crate) struct PrpBinding {
    pub dptr: [u64; 2],
    pub list: Option<MemoryBlock>,
}

impl PrpBinding {
    pub fn none() -> Self {
        Self {
            dptr: [0; 2],
            list: None,
        }
    }
}

pub(crate) struct PrpPool {
    dma: Arc<dyn DmaClient>,
    cache: Mutex<Vec<MemoryBlock>>,
}

impl PrpPool {
    pub fn new(dma: Arc<dyn DmaClient>) -> Self {
        Self {
            dma,
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Builds the data pointer covering the first `len` bytes of `payload`.
    ///
    /// The first entry may point into the middle of a page; every further
    /// entry is page-aligned.
    pub fn map(&self, payload: &MemoryBlock, len: usize) -> Result<PrpBinding, PrpError> {
        debug_assert!(len <= payload.len());
        let offset = payload.offset_in_page() as usize;
        let pages = (offset + len).div_ceil(PAGE_SIZE);
        let pfns = payload.pfns();
        let prp1 = (pfns[0] << NVME_PAGE_SHIFT) + offset as u64;
        let dptr = match pages {
            0 | 1 => [prp1, 0],
            2 => [prp1, pfns[1] << NVME_PAGE_SHIFT],
            n if n <= PRP_LIST_ENTRIES => {
                let list = self.pop_list_page()?;
                for (i, &pfn) in pfns[1..n].iter().enumerate() {
                    list.write_at(i * 8, &(pfn << NVME_PAGE_SHIFT).to_le_bytes());
                }
                let list_addr = list.pfns()[0] << NVME_PAGE_SHIFT;
                return Ok(PrpBinding {
                    dptr: [prp1, list_addr],
                    list: Some(list),
                });
            }
            n => return Err(PrpError::TooLarge(n)),
        };
        Ok(PrpBinding { dptr, list: None })
    }

    fn pop_list_page(&self) -> Result<MemoryBlock, PrpError> {
        if let Some(page) = self.cache.lock().pop() {
            return Ok(page);
        }
        tracing::trace!("prp list page allocated");
        self.dma
            .allocate_dma_buffer(PAGE_SIZE)
            .map_err(PrpError::ListAllocation)
    }

    /// Returns a list page for reuse once its command has completed.
    pub fn recycle(&self, page: MemoryBlock) {
        let mut cache = self.cache.lock();
        if cache.len() < CACHE_LIMIT {
            cache.push(page);
        } else {
            tracing::trace!("prp list page returned to allocator");
        }
    }

    /// The number of list pages currently cached.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::emulated::DeviceSharedMemory;
    use user_driver::memory::PAGE_SIZE64;
    use user_driver::DmaClient as _;

    fn pool_and_memory(pages: usize) -> (PrpPool, DeviceSharedMemory) {
        let mem = DeviceSharedMemory::new(pages * PAGE_SIZE);
        (PrpPool::new(mem.dma_client()), mem)
    }

    /// Reconstructs the page sequence a command would address.
    fn pages_of(binding: &PrpBinding, mem: &DeviceSharedMemory, len: usize) -> Vec<u64> {
        let mut pages = vec![binding.dptr[0] & !(PAGE_SIZE64 - 1)];
        let offset = (binding.dptr[0] % PAGE_SIZE64) as usize;
        let total = (offset + len).div_ceil(PAGE_SIZE);
        match total {
            0 | 1 => assert_eq!(binding.dptr[1], 0),
            2 => pages.push(binding.dptr[1]),
            n => {
                let list = mem.view(binding.dptr[1], PAGE_SIZE);
                for i in 0..n - 1 {
                    let mut entry = [0; 8];
                    list.read_at(i * 8, &mut entry);
                    pages.push(u64::from_le_bytes(entry));
                }
            }
        }
        pages
    }

    #[test]
    fn single_page_uses_direct_pointer() {
        let (pool, mem) = pool_and_memory(8);
        let payload = mem.dma_client().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let binding = pool.map(&payload, 512).unwrap();
        assert_eq!(binding.dptr[0], payload.pfns()[0] * PAGE_SIZE64);
        assert_eq!(binding.dptr[1], 0);
        assert!(binding.list.is_none());
    }

    #[test]
    fn offset_within_page_preserved() {
        let (pool, mem) = pool_and_memory(8);
        let payload = mem
            .dma_client()
            .allocate_dma_buffer(2 * PAGE_SIZE)
            .unwrap();
        let view = payload.subblock(512, PAGE_SIZE);
        let binding = pool.map(&view, PAGE_SIZE).unwrap();
        // 512 + 4096 bytes span two pages.
        assert_eq!(binding.dptr[0], payload.pfns()[0] * PAGE_SIZE64 + 512);
        assert_eq!(binding.dptr[1], payload.pfns()[1] * PAGE_SIZE64);
        assert!(binding.list.is_none());
    }

    #[test]
    fn page_sequences_round_trip() {
        let (pool, mem) = pool_and_memory(64);
        let payload = mem
            .dma_client()
            .allocate_dma_buffer(16 * PAGE_SIZE)
            .unwrap();
        for (offset, len) in [
            (0, 1),
            (0, PAGE_SIZE),
            (512, PAGE_SIZE),
            (0, 3 * PAGE_SIZE),
            (2048, 3 * PAGE_SIZE),
            (0, 16 * PAGE_SIZE),
            (4000, 15 * PAGE_SIZE),
        ] {
            let view = payload.subblock(offset, len);
            let binding = pool.map(&view, len).unwrap();
            let pages = pages_of(&binding, &mem, len);
            let expected: Vec<u64> = view
                .pfns()
                .iter()
                .map(|&pfn| pfn * PAGE_SIZE64)
                .collect();
            assert_eq!(pages, expected, "offset {offset} len {len}");
            if let Some(list) = binding.list {
                pool.recycle(list);
            }
        }
    }

    #[test]
    fn oversized_transfer_rejected() {
        let (pool, mem) = pool_and_memory(PRP_LIST_ENTRIES + 2);
        let len = (PRP_LIST_ENTRIES + 1) * PAGE_SIZE;
        let payload = mem.dma_client().allocate_dma_buffer(len).unwrap();
        match pool.map(&payload, len) {
            Err(PrpError::TooLarge(n)) => assert_eq!(n, PRP_LIST_ENTRIES + 1),
            other => panic!("expected TooLarge, got {:?}", other.err()),
        }
    }

    #[test]
    fn cache_is_bounded() {
        let (pool, mem) = pool_and_memory(64);
        let pages: Vec<_> = (0..20)
            .map(|_| mem.dma_client().allocate_dma_buffer(PAGE_SIZE).unwrap())
            .collect();
        let before = mem.allocated_pages();
        for page in pages {
            pool.recycle(page);
        }
        assert_eq!(pool.cached(), 16);
        // Overflowing pages went straight back to the allocator.
        assert_eq!(mem.allocated_pages(), before - 4);
    }
}
