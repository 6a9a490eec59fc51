// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of an I/O queue pair.
//!
//! A queue pair is single-producer, single-consumer. The two roles are
//! separate types, [`IoSubmitter`] and [`IoCompleter`], so a split
//! deployment can poll completions from a different thread than the one
//! submitting; the [`IoQueuePair`] façade owns both for the common
//! single-threaded case. The roles synchronize only through atomics: the
//! per-command occupancy flags and the submission queue's shared head/full
//! state. Neither role ever blocks: submission reports backpressure
//! synchronously, and polling an empty completion queue returns zero.

use crate::namespace::Namespace;
use crate::pending::PendingCommands;
use crate::prp::PrpBinding;
use crate::prp::PrpError;
use crate::prp::PrpPool;
use crate::queues::CompletionQueue;
use crate::queues::SqShared;
use crate::queues::SubmissionQueue;
use crate::registers::DoorbellRegisters;
use crate::spec;
use crate::spec::nvm;
use crate::NVME_PAGE_SHIFT;
use bitfield_struct::bitfield;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use zerocopy::FromZeros;

/// Completion notification for one command. Runs exactly once, from inside
/// a later [`IoCompleter::process_completions`] call.
pub type IoCallback = Box<dyn FnOnce(Result<(), NvmeError>) + Send>;

/// Per-command submission flags.
#[bitfield(u32)]
pub struct IoFlags {
    /// Force unit access (writes only).
    pub fua: bool,
    #[bits(31)]
    _rsvd: u32,
}

/// An NVMe error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    pub fn status(&self) -> spec::Status {
        self.0
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {:#x?}", self.0)
            }
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

/// An error creating a queue pair.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum QueuePairError {
    #[error("queue size {0} is out of range")]
    InvalidQueueSize(u16),
    #[error("failed to allocate memory for queues")]
    DmaAllocation(#[source] anyhow::Error),
}

/// A synchronous submission refusal. Nothing was placed in the submission
/// queue; the caller's buffer is untouched.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The submission queue is full. Poll completions and retry.
    #[error("submission queue is full")]
    QueueFull,
    /// Every command identifier for the target slot is in flight. Poll
    /// completions and retry.
    #[error("no free command identifier")]
    NoCommandSlot,
    /// The namespace is not in the queue's namespace table.
    #[error("unknown namespace {0}")]
    UnknownNamespace(u32),
    /// The byte range is not block aligned, is empty, or runs past the end
    /// of the namespace.
    #[error("i/o range is not block aligned or exceeds the namespace")]
    InvalidRange,
    /// The payload buffer does not cover the requested transfer.
    #[error("payload buffer is smaller than the transfer")]
    BufferTooSmall,
    /// The transfer needs more PRP entries than one list page holds.
    #[error(transparent)]
    Prp(#[from] PrpError),
}

impl SubmitError {
    /// True for refusals that clear on their own once completions are
    /// processed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::QueueFull | SubmitError::NoCommandSlot)
    }
}

pub(crate) struct PendingCommand {
    cb: IoCallback,
    /// Keeps the caller's buffer mapped while the device owns it.
    _buffer: Option<MemoryBlock>,
    prp_list: Option<MemoryBlock>,
}

impl PendingCommand {
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            cb: Box::new(|_| ()),
            _buffer: None,
            prp_list: None,
        }
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("buffer", &self._buffer)
            .field("prp_list", &self.prp_list)
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SubmissionStats {
    pub issued: u64,
    pub rejected_full: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionStats {
    pub completed: u64,
    pub device_errors: u64,
}

/// The submission role of a queue pair.
pub struct IoSubmitter<T: DeviceRegisterIo> {
    sq: SubmissionQueue,
    registers: Arc<DoorbellRegisters<T>>,
    pending: Arc<PendingCommands>,
    prp: Arc<PrpPool>,
    namespaces: Arc<BTreeMap<u32, Namespace>>,
    stats: SubmissionStats,
}

impl<T: DeviceRegisterIo> IoSubmitter<T> {
    /// Submits a read of `len` bytes at byte offset `offset` of namespace
    /// `nsid` into `payload`.
    ///
    /// The payload handle is retained until the command completes, so the
    /// region stays mapped while the device writes it. `offset` and `len`
    /// must be multiples of the namespace's block size.
    pub fn submit_read(
        &mut self,
        nsid: u32,
        payload: &MemoryBlock,
        offset: u64,
        len: usize,
        flags: IoFlags,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        self.submit_rw(nvm::NvmOpcode::READ, nsid, payload, offset, len, flags, cb)
    }

    /// Submits a write of the first `len` bytes of `payload` to byte offset
    /// `offset` of namespace `nsid`. See [`Self::submit_read`].
    pub fn submit_write(
        &mut self,
        nsid: u32,
        payload: &MemoryBlock,
        offset: u64,
        len: usize,
        flags: IoFlags,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        self.submit_rw(nvm::NvmOpcode::WRITE, nsid, payload, offset, len, flags, cb)
    }

    /// Submits a flush of namespace `nsid`. Carries no data.
    pub fn submit_flush(&mut self, nsid: u32, cb: IoCallback) -> Result<(), SubmitError> {
        if self.sq.is_full() {
            self.stats.rejected_full += 1;
            return Err(SubmitError::QueueFull);
        }
        if !self.namespaces.contains_key(&nsid) {
            return Err(SubmitError::UnknownNamespace(nsid));
        }
        self.submit(nvm::NvmOpcode::FLUSH, nsid, [0; 3], PrpBinding::none(), None, cb)
    }

    /// True while the queue is exerting backpressure.
    pub fn is_full(&self) -> bool {
        self.sq.is_full()
    }

    pub fn stats(&self) -> SubmissionStats {
        self.stats
    }

    fn submit_rw(
        &mut self,
        opcode: nvm::NvmOpcode,
        nsid: u32,
        payload: &MemoryBlock,
        offset: u64,
        len: usize,
        flags: IoFlags,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        if self.sq.is_full() {
            self.stats.rejected_full += 1;
            tracing::trace!(sqid = self.sq.id(), "submission rejected, sq full");
            return Err(SubmitError::QueueFull);
        }
        let ns = self
            .namespaces
            .get(&nsid)
            .ok_or(SubmitError::UnknownNamespace(nsid))?;
        let (slba, blocks) = ns
            .block_range(offset, len)
            .ok_or(SubmitError::InvalidRange)?;
        if len > payload.len() {
            return Err(SubmitError::BufferTooSmall);
        }
        let binding = self.prp.map(payload, len)?;
        let cdws = [
            nvm::Cdw10ReadWrite::new()
                .with_slba_low(slba as u32)
                .into(),
            nvm::Cdw11ReadWrite::new()
                .with_slba_high((slba >> 32) as u32)
                .into(),
            nvm::Cdw12ReadWrite::new()
                .with_nlb_z((blocks - 1) as u16)
                .with_fua(flags.fua())
                .into(),
        ];
        self.submit(opcode, nsid, cdws, binding, Some(payload.clone()), cb)
    }

    fn submit(
        &mut self,
        opcode: nvm::NvmOpcode,
        nsid: u32,
        cdws: [u32; 3],
        binding: PrpBinding,
        buffer: Option<MemoryBlock>,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        // The identifier's column is the slot the entry will land in.
        let col = self.sq.next_slot();
        let dptr = binding.dptr;
        let command = PendingCommand {
            cb,
            _buffer: buffer,
            prp_list: binding.list,
        };
        let cid = match self.pending.claim(col, command) {
            Ok(cid) => cid,
            Err(command) => {
                self.recycle(command);
                return Err(SubmitError::NoCommandSlot);
            }
        };
        let entry = spec::Command {
            cdw0: spec::Cdw0::new().with_opcode(opcode.0).with_cid(cid),
            nsid,
            dptr,
            cdw10: cdws[0],
            cdw11: cdws[1],
            cdw12: cdws[2],
            ..FromZeros::new_zeroed()
        };
        match self.sq.write(entry) {
            Ok(slot) => debug_assert_eq!(slot, col),
            Err(_) => {
                // No partial submission: give the slot and list page back.
                let command = self.pending.release(cid);
                self.recycle(command);
                self.stats.rejected_full += 1;
                return Err(SubmitError::QueueFull);
            }
        }
        self.sq.commit(&self.registers);
        self.stats.issued += 1;
        tracing::debug!(
            sqid = self.sq.id(),
            cid,
            opcode = opcode.0,
            nsid,
            "command submitted"
        );
        Ok(())
    }

    fn recycle(&self, command: PendingCommand) {
        if let Some(list) = command.prp_list {
            self.prp.recycle(list);
        }
    }
}

/// The completion role of a queue pair.
pub struct IoCompleter<T: DeviceRegisterIo> {
    cq: CompletionQueue,
    registers: Arc<DoorbellRegisters<T>>,
    pending: Arc<PendingCommands>,
    prp: Arc<PrpPool>,
    sq_shared: Arc<SqShared>,
    stats: CompletionStats,
}

impl<T: DeviceRegisterIo> IoCompleter<T> {
    /// Processes up to `max` completions (`0` meaning up to the queue size),
    /// dispatching each command's callback. Returns the number processed;
    /// never blocks.
    ///
    /// Completions dispatch in the order the device posted them, not in
    /// identifier order. Each one is acknowledged to the device with its own
    /// head doorbell before the callback runs.
    pub fn process_completions(&mut self, max: usize) -> usize {
        let max = if max == 0 { self.cq.len() as usize } else { max };
        let mut count = 0;
        while count < max {
            let Some(cqe) = self.cq.read() else {
                break;
            };
            self.cq.commit(&self.registers);
            assert_eq!(cqe.sqid, self.cq.id(), "completion for the wrong queue");
            self.sq_shared.update_head(cqe.sqhd);
            let status = spec::Status(cqe.status.status());
            let result = if status == spec::Status::SUCCESS {
                Ok(())
            } else {
                self.stats.device_errors += 1;
                tracing::warn!(
                    cqid = self.cq.id(),
                    cid = cqe.cid,
                    status = ?status,
                    "command failed"
                );
                Err(NvmeError::from(status))
            };
            tracing::trace!(
                cqid = self.cq.id(),
                cid = cqe.cid,
                sqhd = cqe.sqhd,
                "completion"
            );
            let command = self.pending.release(cqe.cid);
            (command.cb)(result);
            if let Some(list) = command.prp_list {
                self.prp.recycle(list);
            }
            self.stats.completed += 1;
            count += 1;
        }
        count
    }

    /// Checks whether the device has posted a completion that has not been
    /// processed yet.
    pub fn has_pending_completions(&self) -> bool {
        self.cq.has_ready_entry()
    }

    pub fn stats(&self) -> CompletionStats {
        self.stats
    }
}

/// An I/O queue pair: coupled submission and completion rings shared with
/// the controller, polled explicitly.
pub struct IoQueuePair<T: DeviceRegisterIo> {
    submitter: IoSubmitter<T>,
    completer: IoCompleter<T>,
}

impl<T: DeviceRegisterIo> IoQueuePair<T> {
    /// Maximum entries per ring: one page of submission queue entries. (A
    /// page of completion entries holds four times as many.)
    pub const MAX_QSIZE: u16 = (PAGE_SIZE / 64) as u16;

    /// Creates the rings for I/O queue pair `qid` with `qsize` entries each.
    ///
    /// The rings are allocated from `dma`, zeroed, and stay allocated until
    /// both roles are dropped; [`Self::sq_addr`] and [`Self::cq_addr`] are
    /// what the controller's create-queue commands need. The queue borrows
    /// the namespace table; the caller keeps ownership of the controller.
    pub fn new(
        qid: u16,
        qsize: u16,
        registers: Arc<DoorbellRegisters<T>>,
        dma: Arc<dyn DmaClient>,
        namespaces: Arc<BTreeMap<u32, Namespace>>,
    ) -> Result<Self, QueuePairError> {
        if !(2..=Self::MAX_QSIZE).contains(&qsize) {
            return Err(QueuePairError::InvalidQueueSize(qsize));
        }
        let mem = dma
            .allocate_dma_buffer(2 * PAGE_SIZE)
            .map_err(QueuePairError::DmaAllocation)?;
        mem.fill(0);
        let sq = SubmissionQueue::new(qid, qsize, mem.subblock(0, PAGE_SIZE));
        let cq = CompletionQueue::new(qid, qsize, mem.subblock(PAGE_SIZE, PAGE_SIZE));
        assert!(!cq.has_ready_entry());

        let pending = Arc::new(PendingCommands::new(qsize));
        let prp = Arc::new(PrpPool::new(dma));
        let sq_shared = sq.shared().clone();
        Ok(Self {
            submitter: IoSubmitter {
                sq,
                registers: registers.clone(),
                pending: pending.clone(),
                prp: prp.clone(),
                namespaces,
                stats: Default::default(),
            },
            completer: IoCompleter {
                cq,
                registers,
                pending,
                prp,
                sq_shared,
                stats: Default::default(),
            },
        })
    }

    pub fn qid(&self) -> u16 {
        self.submitter.sq.id()
    }

    /// Physical address of the submission ring.
    pub fn sq_addr(&self) -> u64 {
        self.submitter.sq.mem().pfns()[0] << NVME_PAGE_SHIFT
    }

    /// Physical address of the completion ring.
    pub fn cq_addr(&self) -> u64 {
        self.completer.cq.mem().pfns()[0] << NVME_PAGE_SHIFT
    }

    /// See [`IoSubmitter::submit_read`].
    pub fn submit_read(
        &mut self,
        nsid: u32,
        payload: &MemoryBlock,
        offset: u64,
        len: usize,
        flags: IoFlags,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        self.submitter
            .submit_read(nsid, payload, offset, len, flags, cb)
    }

    /// See [`IoSubmitter::submit_write`].
    pub fn submit_write(
        &mut self,
        nsid: u32,
        payload: &MemoryBlock,
        offset: u64,
        len: usize,
        flags: IoFlags,
        cb: IoCallback,
    ) -> Result<(), SubmitError> {
        self.submitter
            .submit_write(nsid, payload, offset, len, flags, cb)
    }

    /// See [`IoSubmitter::submit_flush`].
    pub fn submit_flush(&mut self, nsid: u32, cb: IoCallback) -> Result<(), SubmitError> {
        self.submitter.submit_flush(nsid, cb)
    }

    /// See [`IoCompleter::process_completions`].
    pub fn process_completions(&mut self, max: usize) -> usize {
        self.completer.process_completions(max)
    }

    pub fn has_pending_completions(&self) -> bool {
        self.completer.has_pending_completions()
    }

    pub fn is_full(&self) -> bool {
        self.submitter.is_full()
    }

    /// The number of submitted commands whose callbacks have not run yet.
    pub fn outstanding(&self) -> usize {
        self.submitter.pending.in_flight()
    }

    pub fn cached_prp_pages(&self) -> usize {
        self.submitter.prp.cached()
    }

    pub fn submission_stats(&self) -> SubmissionStats {
        self.submitter.stats()
    }

    pub fn completion_stats(&self) -> CompletionStats {
        self.completer.stats()
    }

    /// Splits the pair into its two roles so completions can be polled from
    /// a different thread than the submitter's. Dropping both halves tears
    /// the queue down.
    pub fn into_split(self) -> (IoSubmitter<T>, IoCompleter<T>) {
        (self.submitter, self.completer)
    }
}
