// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A polled user-space NVMe I/O queue pair.
//!
//! The crate implements the host side of one NVMe submission/completion
//! ring pair: read, write, and flush submission with PRP construction,
//! phase-tag based completion polling, command-identifier reuse, and
//! submission backpressure. Controller bring-up, the admin queue, and
//! interrupt wiring are the caller's concern; the queue pair only needs a
//! doorbell window, a DMA allocator, and the namespace geometry.

#![forbid(unsafe_code)]

mod namespace;
mod pending;
mod prp;
mod queue_pair;
mod queues;
mod registers;

pub use self::namespace::Namespace;
pub use self::namespace::NamespaceError;
pub use self::prp::PrpError;
pub use self::queue_pair::CompletionStats;
pub use self::queue_pair::IoCallback;
pub use self::queue_pair::IoCompleter;
pub use self::queue_pair::IoFlags;
pub use self::queue_pair::IoQueuePair;
pub use self::queue_pair::IoSubmitter;
pub use self::queue_pair::NvmeError;
pub use self::queue_pair::QueuePairError;
pub use self::queue_pair::SubmissionStats;
pub use self::queue_pair::SubmitError;
pub use self::registers::DoorbellRegisters;

use nvme_spec as spec;

const NVME_PAGE_SHIFT: u8 = 12;
