//! On-demand mapping of a ring's pinned guest frames.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::hv::{Hypervisor, Mfn};

/// Lazily filled cache of hypervisor-virtual mappings, parallel to a ring's
/// pinned frame list. Each slot fills independently on first use; every
/// hypercall exit path that established a mapping drops the whole cache, so
/// mapping residency is bounded by the duration of a single call.
pub struct MappingCache {
    slots: Vec<Option<NonNull<u8>>>,
}

// The raw mapping pointers are only created and dereferenced under the
// owning ring's spin-lock.
unsafe impl Send for MappingCache {}

impl MappingCache {
    pub fn new(npage: usize) -> MappingCache {
        MappingCache {
            slots: vec![None; npage],
        }
    }

    /// Returns a cached or freshly established mapping of frame `i`.
    pub fn page<H: Hypervisor>(&mut self, hv: &H, mfns: &[Mfn], i: usize) -> Result<NonNull<u8>> {
        let slot = self.slots.get_mut(i).ok_or(Error::MemoryFault)?;
        if let Some(ptr) = *slot {
            return Ok(ptr);
        }
        let mfn = *mfns.get(i).ok_or(Error::MemoryFault)?;
        let ptr = hv.map_frame(mfn)?;
        *slot = Some(ptr);
        Ok(ptr)
    }

    /// Drops every cached mapping.
    pub fn clear<H: Hypervisor>(&mut self, hv: &H, mfns: &[Mfn]) {
        for (mfn, slot) in mfns.iter().zip(self.slots.iter_mut()) {
            if let Some(ptr) = slot.take() {
                unsafe { hv.unmap_frame(*mfn, ptr) };
            }
        }
    }
}
