// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of submission and completion queues.

use crate::registers::DoorbellRegisters;
use crate::spec;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::Ordering::Release;
use std::sync::Arc;
use user_driver::memory::MemoryBlock;
use user_driver::DeviceRegisterIo;

/// Submission state shared between the two queue roles: the SQ head most
/// recently reported by the device, and the backpressure flag derived from
/// it. The completion role writes both; the submission role reads them.
pub(crate) struct SqShared {
    head: AtomicU32,
    full: AtomicBool,
}

impl SqShared {
    fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            full: AtomicBool::new(false),
        }
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Acquire)
    }

    /// Records the SQ head reported in a completion entry. A changed head
    /// means the device has freed submission slots, so backpressure is
    /// released.
    pub fn update_head(&self, sqhd: u16) -> bool {
        let old = self.head.swap(sqhd.into(), Relaxed);
        let changed = old != u32::from(sqhd);
        if changed {
            self.full.store(false, Release);
        }
        changed
    }
}

#[derive(Debug)]
pub(crate) struct QueueFull;

pub(crate) struct SubmissionQueue {
    sqid: u16,
    tail: u32,
    committed_tail: u32,
    len: u32,
    shared: Arc<SqShared>,
    mem: MemoryBlock,
}

impl SubmissionQueue {
    pub fn new(sqid: u16, len: u16, mem: MemoryBlock) -> Self {
        Self {
            sqid,
            tail: 0,
            committed_tail: 0,
            len: len.into(),
            shared: Arc::new(SqShared::new()),
            mem,
        }
    }

    pub fn id(&self) -> u16 {
        self.sqid
    }

    pub fn mem(&self) -> &MemoryBlock {
        &self.mem
    }

    pub fn shared(&self) -> &Arc<SqShared> {
        &self.shared
    }

    pub fn is_full(&self) -> bool {
        self.shared.is_full()
    }

    /// The slot the next accepted command will occupy.
    pub fn next_slot(&self) -> u16 {
        self.tail as u16
    }

    /// Copies `command` into the tail slot and advances the tail.
    ///
    /// The ring holds up to `len` entries; `tail == head` with the full flag
    /// set distinguishes a full ring from an empty one. The flag is set when
    /// the new tail catches up with the cached head and stays set until a
    /// completion reports a different head.
    pub fn write(&mut self, command: spec::Command) -> Result<u16, QueueFull> {
        if self.shared.is_full() {
            return Err(QueueFull);
        }
        let slot = self.tail;
        self.mem
            .write_obj(slot as usize * size_of_val(&command), &command);
        self.tail = advance(self.tail, self.len);
        if self.tail == self.shared.head.load(Acquire) {
            self.shared.full.store(true, Release);
        }
        tracing::trace!(
            sqid = self.sqid,
            tail = self.tail,
            full = self.shared.is_full(),
            "sq tail advance"
        );
        Ok(slot as u16)
    }

    /// Publishes the tail to the device. The entry stores are ordered before
    /// the doorbell store.
    pub fn commit<T: DeviceRegisterIo>(&mut self, registers: &DoorbellRegisters<T>) {
        if self.tail != self.committed_tail {
            fence(Release);
            registers.doorbell(self.sqid, false, self.tail);
            self.committed_tail = self.tail;
        }
    }
}

pub(crate) struct CompletionQueue {
    cqid: u16,
    head: u32,
    committed_head: u32,
    /// Queue size in entries.
    len: u32,
    phase: bool,
    mem: MemoryBlock,
}

impl CompletionQueue {
    pub fn new(cqid: u16, len: u16, mem: MemoryBlock) -> CompletionQueue {
        Self {
            cqid,
            head: 0,
            committed_head: 0,
            len: len.into(),
            phase: true,
            mem,
        }
    }

    pub fn id(&self) -> u16 {
        self.cqid
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn mem(&self) -> &MemoryBlock {
        &self.mem
    }

    /// Checks whether the entry at the head carries the current phase tag,
    /// without consuming it.
    pub fn has_ready_entry(&self) -> bool {
        self.phase_matches().is_some()
    }

    /// Reads the entry at the head, advancing the head (and flipping the
    /// phase tag on wrap) if one is ready. The caller still owes the device
    /// a head doorbell via [`Self::commit`].
    pub fn read(&mut self) -> Option<spec::Completion> {
        let completion_mem = self.phase_matches()?;
        let high = completion_mem[1].load(Acquire);
        let low = completion_mem[0].load(Relaxed);
        let completion: spec::Completion = zerocopy::transmute!([low, high]);
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
            tracing::trace!(cqid = self.cqid, phase = self.phase, "cq phase flip");
        }
        Some(completion)
    }

    pub fn commit<T: DeviceRegisterIo>(&mut self, registers: &DoorbellRegisters<T>) {
        if self.head != self.committed_head {
            fence(Release);
            registers.doorbell(self.cqid, true, self.head);
            self.committed_head = self.head;
        }
    }

    fn phase_matches(&self) -> Option<&[std::sync::atomic::AtomicU64]> {
        let entry_size = size_of::<spec::Completion>();
        let completion_mem = &self.mem.as_atomic_u64s().unwrap()
            [self.head as usize * entry_size / 8..][..entry_size / 8];

        // Check the phase bit, using an acquire read to ensure the rest of
        // the completion is read with or after the phase bit.
        let high = completion_mem[1].load(Acquire);
        let status = spec::CompletionStatus::from((high >> 48) as u16);
        (status.phase() == self.phase).then_some(completion_mem)
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::DoorbellRegisters;
    use parking_lot::Mutex;
    use user_driver::emulated::DeviceSharedMemory;
    use user_driver::memory::PAGE_SIZE;
    use user_driver::DmaClient as _;
    use zerocopy::FromZeros;

    #[derive(Clone, Default)]
    struct RecordingRegisters {
        writes: Arc<Mutex<Vec<(usize, u32)>>>,
    }

    impl DeviceRegisterIo for RecordingRegisters {
        fn len(&self) -> usize {
            0x2000
        }

        fn read_u32(&self, _offset: usize) -> u32 {
            0
        }

        fn read_u64(&self, _offset: usize) -> u64 {
            0
        }

        fn write_u32(&self, offset: usize, data: u32) {
            self.writes.lock().push((offset, data));
        }

        fn write_u64(&self, _offset: usize, _data: u64) {
            unreachable!()
        }
    }

    fn command(cid: u16) -> spec::Command {
        spec::Command {
            cdw0: spec::Cdw0::new().with_cid(cid),
            ..FromZeros::new_zeroed()
        }
    }

    fn completion(phase: bool) -> spec::Completion {
        spec::Completion {
            status: spec::CompletionStatus::new().with_phase(phase),
            ..FromZeros::new_zeroed()
        }
    }

    #[test]
    fn sq_holds_len_entries_then_reports_full() {
        let mem = DeviceSharedMemory::new(16 * PAGE_SIZE);
        let block = mem.dma_client().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let mut sq = SubmissionQueue::new(1, 4, block);

        for cid in 0..3 {
            assert_eq!(sq.write(command(cid)).unwrap(), cid);
            assert!(!sq.is_full());
        }
        // The fourth entry lands in the slot just before the cached head.
        assert_eq!(sq.write(command(3)).unwrap(), 3);
        assert!(sq.is_full());
        assert!(sq.write(command(4)).is_err());

        // Same head: still full. Changed head: released.
        assert!(!sq.shared().update_head(0));
        assert!(sq.is_full());
        assert!(sq.shared().update_head(1));
        assert!(!sq.is_full());
        assert_eq!(sq.write(command(4)).unwrap(), 0);
    }

    #[test]
    fn sq_doorbell_written_once_per_commit() {
        let mem = DeviceSharedMemory::new(16 * PAGE_SIZE);
        let block = mem.dma_client().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let mut sq = SubmissionQueue::new(1, 8, block);
        let writes = RecordingRegisters::default();
        let regs = DoorbellRegisters::new(writes.clone(), 0);
        sq.write(command(0)).unwrap();
        sq.commit(&regs);
        sq.commit(&regs);
        sq.write(command(1)).unwrap();
        sq.write(command(2)).unwrap();
        sq.commit(&regs);
        assert_eq!(*writes.writes.lock(), vec![(0x1008, 1), (0x1008, 3)]);
    }

    #[test]
    fn cq_read_honors_phase_and_wraps() {
        let mem = DeviceSharedMemory::new(16 * PAGE_SIZE);
        let block = mem.dma_client().allocate_dma_buffer(PAGE_SIZE).unwrap();
        let mut cq = CompletionQueue::new(1, 2, block.subblock(0, PAGE_SIZE));

        // Zeroed ring: phase 0 everywhere, nothing ready.
        assert!(!cq.has_ready_entry());
        assert!(cq.read().is_none());

        block.write_obj(0, &completion(true));
        block.write_obj(16, &completion(true));
        assert!(cq.has_ready_entry());
        assert!(cq.read().is_some());
        assert!(cq.read().is_some());

        // Head wrapped; the old phase no longer matches.
        assert!(cq.read().is_none());
        block.write_obj(0, &completion(false));
        assert!(cq.read().is_some());
    }
}
