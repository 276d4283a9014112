//! Blocked-sender bookkeeping.
//!
//! When an insert fails for lack of space the sender is recorded on the
//! ring, keyed by its domain, together with the space it was short of. A
//! later `notify` by the ring owner drains every entry the consumer has made
//! room for and wakes the senders behind them.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::hv::DomainId;

/// One blocked sender: who, and how much free space it asked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingEntry {
    pub source: DomainId,
    pub space_required: u32,
}

/// Per-ring set of blocked senders; at most one entry per source domain.
pub struct PendingQueue {
    entries: Vec<PendingEntry>,
}

impl PendingQueue {
    pub const fn new() -> PendingQueue {
        PendingQueue {
            entries: Vec::new(),
        }
    }

    /// Insert or upgrade: an existing entry for `source` is raised to the
    /// larger of the two requests, a new one appended.
    pub fn queue(&mut self, source: DomainId, space_required: u32) -> Result<()> {
        if let Some(ent) = self.entries.iter_mut().find(|ent| ent.source == source) {
            ent.space_required = ent.space_required.max(space_required);
            return Ok(());
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.entries.push(PendingEntry {
            source,
            space_required,
        });
        Ok(())
    }

    /// Removes the entry for `source`, if any.
    pub fn cancel(&mut self, source: DomainId) {
        self.entries.retain(|ent| ent.source != source);
    }

    /// Moves every entry satisfied by `free` bytes onto `out`.
    pub fn drain_satisfied(&mut self, free: u32, out: &mut Vec<PendingEntry>) {
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].space_required <= free {
                out.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, source: DomainId) -> bool {
        self.entries.iter().any(|ent| ent.source == source)
    }
}
