// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process implementation of the user-mode driver memory traits,
//! backed by an aligned heap allocation. Tests use this both for driver
//! allocations and to play the device's role: the same pool can be viewed
//! at an arbitrary "physical" address, so a test can read submission queue
//! entries and post completions the way the hardware would.

use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::memory::PAGE_SIZE64;
use crate::DmaClient;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

#[repr(C, align(4096))]
struct Page([AtomicU8; PAGE_SIZE]);

impl Default for Page {
    fn default() -> Self {
        Self([0; PAGE_SIZE].map(AtomicU8::new))
    }
}

struct PagePool {
    pages: Box<[Page]>,
    state: Mutex<Vec<u64>>,
}

/// A shared pool of pages identity-mapped at 4KB page granularity: page `n`
/// of the pool has physical address `n * 4096`.
#[derive(Clone)]
pub struct DeviceSharedMemory {
    pool: Arc<PagePool>,
}

impl DeviceSharedMemory {
    pub fn new(size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        let count = size / PAGE_SIZE;
        let pages = (0..count).map(|_| Page::default()).collect();
        Self {
            pool: Arc::new(PagePool {
                pages,
                state: Mutex::new(vec![0; count.div_ceil(64)]),
            }),
        }
    }

    /// Returns an allocator handing out pages from this pool.
    pub fn dma_client(&self) -> Arc<dyn DmaClient> {
        Arc::new(EmulatedDmaAllocator {
            pool: self.pool.clone(),
        })
    }

    /// The number of pages currently allocated from the pool.
    pub fn allocated_pages(&self) -> usize {
        self.pool
            .state
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Returns a view of the pool at physical address `addr`, without
    /// claiming the underlying pages. This is how a test reaches the memory
    /// behind an address a driver handed to the device.
    pub fn view(&self, addr: u64, len: usize) -> MemoryBlock {
        let start = (addr / PAGE_SIZE64) as usize;
        let offset = (addr % PAGE_SIZE64) as usize;
        let count = (offset + len).div_ceil(PAGE_SIZE);
        assert!(start + count <= self.pool.pages.len());
        let buffer = DmaBuffer {
            pool: self.pool.clone(),
            pfns: (start..start + count).map(|p| p as u64).collect(),
            owned: false,
        };
        MemoryBlock::new(buffer).subblock(offset, len)
    }

    fn alloc(&self, len: usize) -> Option<DmaBuffer> {
        assert!(len % PAGE_SIZE == 0);
        let count = len / PAGE_SIZE;

        // Find a contiguous free range by scanning the state bitmap.
        let start_page = {
            let mut state = self.pool.state.lock();
            let total = self.pool.pages.len();
            let mut i = 0;
            let mut contig = 0;
            while contig < count && i < total {
                if state[i / 64] & 1 << (i % 64) != 0 {
                    contig = 0;
                } else {
                    contig += 1;
                }
                i += 1;
            }
            if contig < count {
                return None;
            }
            let start = i - contig;
            for j in start..i {
                state[j / 64] |= 1 << (j % 64);
            }
            start
        };

        Some(DmaBuffer {
            pool: self.pool.clone(),
            pfns: (start_page..start_page + count).map(|p| p as u64).collect(),
            owned: true,
        })
    }
}

struct DmaBuffer {
    pool: Arc<PagePool>,
    pfns: Vec<u64>,
    owned: bool,
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let mut state = self.pool.state.lock();
        for &pfn in &self.pfns {
            state[pfn as usize / 64] &= !(1 << (pfn % 64));
        }
    }
}

// SAFETY: the pool's pages are contiguous, 4KB-sized and 4KB-aligned, and
// live as long as the Arc'd pool; `pfns` is a consecutive range, so the VA
// region starting at the first page covers `len()` bytes.
unsafe impl MappedDmaTarget for DmaBuffer {
    fn base(&self) -> *const u8 {
        self.pool.pages[self.pfns[0] as usize].0.as_ptr().cast()
    }

    fn len(&self) -> usize {
        self.pfns.len() * PAGE_SIZE
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

/// A [`DmaClient`] allocating from a [`DeviceSharedMemory`] pool.
pub struct EmulatedDmaAllocator {
    pool: Arc<PagePool>,
}

impl DmaClient for EmulatedDmaAllocator {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        let shared = DeviceSharedMemory {
            pool: self.pool.clone(),
        };
        let memory = MemoryBlock::new(shared.alloc(len).context("out of memory")?);
        memory.fill(0);
        Ok(memory)
    }
}
