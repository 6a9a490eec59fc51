// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command identifier table.
//!
//! A command identifier is factored as `row * qsize + col`, where `col` is
//! the submission queue slot the command was written to and `row` is an
//! overflow dimension: when the device has fetched a slot's entry but not
//! yet posted its completion, a new command may land in the same column
//! under the next row, giving it a distinct identifier. The completion path
//! inverts the factoring to find the pending state for a CQE.

use crate::queue_pair::PendingCommand;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::Ordering::Release;

/// Rows in the identifier table. Completion-order bounds keep a live queue
/// well under this; exhausting it is reported as transient backpressure.
pub(crate) const MAX_PENDING_ROWS: u16 = 4;

struct PendingSlot {
    occupied: AtomicBool,
    /// The occupancy flag, not this lock, is the producer/consumer
    /// synchronization point; the lock only carries the non-atomic payload
    /// across it and is never contended.
    payload: Mutex<Option<PendingCommand>>,
}

pub(crate) struct PendingCommands {
    qsize: u32,
    slots: Vec<PendingSlot>,
}

impl PendingCommands {
    pub fn new(qsize: u16) -> Self {
        Self {
            qsize: qsize.into(),
            slots: (0..u32::from(qsize) * u32::from(MAX_PENDING_ROWS))
                .map(|_| PendingSlot {
                    occupied: AtomicBool::new(false),
                    payload: Mutex::new(None),
                })
                .collect(),
        }
    }

    /// Claims an identifier in column `col`, storing `command` in the slot.
    ///
    /// Walks rows 0..[`MAX_PENDING_ROWS`] until a free slot accepts the
    /// claim; gives `command` back if every row of the column is in flight.
    pub fn claim(&self, col: u16, command: PendingCommand) -> Result<u16, PendingCommand> {
        debug_assert!(u32::from(col) < self.qsize);
        for row in 0..MAX_PENDING_ROWS {
            let cid = u32::from(row) * self.qsize + u32::from(col);
            let slot = &self.slots[cid as usize];
            if slot
                .occupied
                .compare_exchange(false, true, Acquire, Relaxed)
                .is_ok()
            {
                if row != 0 {
                    tracing::trace!(col, row, cid, "cid column conflict");
                }
                *slot.payload.lock() = Some(command);
                return Ok(cid as u16);
            }
        }
        Err(command)
    }

    /// Releases the slot for `cid`, returning the payload stored at claim.
    pub fn release(&self, cid: u16) -> PendingCommand {
        let slot = self
            .slots
            .get(u32::from(cid) as usize)
            .unwrap_or_else(|| panic!("completion for out-of-range cid {cid}"));
        let command = slot.payload.lock().take();
        assert!(
            slot.occupied.load(Relaxed),
            "completion for unclaimed cid {cid}"
        );
        slot.occupied.store(false, Release);
        command.unwrap_or_else(|| panic!("completion for empty cid {cid}"))
    }

    /// The number of commands currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.occupied.load(Relaxed))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight() == 0
    }
}

impl Drop for PendingCommands {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight != 0 {
            tracing::warn!(in_flight, "queue pair destroyed with commands in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> PendingCommand {
        PendingCommand::for_test()
    }

    #[test]
    fn same_column_escalates_rows() {
        // Two-entry queue: colliding claims on column 0 walk rows 0 and 1.
        let pending = PendingCommands::new(2);
        assert_eq!(pending.claim(0, command()).unwrap(), 0);
        assert_eq!(pending.claim(1, command()).unwrap(), 1);
        assert_eq!(pending.claim(0, command()).unwrap(), 2);
        assert_eq!(pending.in_flight(), 3);

        // Releases in completion order 0, 2, 1 free (row 0, col 0),
        // (row 1, col 0), (row 0, col 1).
        pending.release(0);
        assert_eq!(pending.claim(0, command()).unwrap(), 0);
        pending.release(2);
        pending.release(1);
        pending.release(0);
        assert!(pending.is_empty());
    }

    #[test]
    fn exhausted_column_reports_backpressure() {
        let pending = PendingCommands::new(2);
        for row in 0..MAX_PENDING_ROWS {
            assert_eq!(pending.claim(0, command()).unwrap(), row * 2);
        }
        assert!(pending.claim(0, command()).is_err());
        assert_eq!(pending.claim(1, command()).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "unclaimed cid")]
    fn release_of_free_slot_panics() {
        let pending = PendingCommands::new(2);
        pending.release(0);
    }
}
