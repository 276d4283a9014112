//! Per-domain ring registry.
//!
//! Each participating domain carries a fixed array of hash buckets holding
//! its active rings, guarded by the domain's L2 rwlock. Entries are `Arc`s
//! whose only long-lived owner is the bucket; detaching one under L2-write
//! therefore leaves the detaching path as the sole holder.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::array;

use crate::error::{Error, Result};
use crate::hv::DomainId;
use crate::ring::RingInfo;
use crate::sync::{RwLock, L2};
use crate::wire::{Address, RingId};

/// Bucket count of every per-domain ring table.
pub const V4V_HTABLE_SIZE: usize = 32;

/// Mixes a ring identity down to its bucket index: XOR of the port halves,
/// the owning domain and the partner, masked to the table size.
fn bucket_of(id: &RingId) -> usize {
    let mut h = (id.addr.port >> 16) ^ (id.addr.port & 0xffff);
    h ^= u32::from(id.addr.domain.0) ^ u32::from(id.partner.0);
    (h as usize) & (V4V_HTABLE_SIZE - 1)
}

/// The hash table of one domain's active rings.
pub struct RingTable {
    buckets: [Vec<Arc<RingInfo>>; V4V_HTABLE_SIZE],
}

impl RingTable {
    pub fn new() -> RingTable {
        RingTable {
            buckets: array::from_fn(|_| Vec::new()),
        }
    }

    /// Identity lookup; compares all three fields.
    pub fn find(&self, id: &RingId) -> Option<&Arc<RingInfo>> {
        self.buckets[bucket_of(id)]
            .iter()
            .find(|ring| ring.id() == id)
    }

    /// Destination lookup for a send: first the sender as explicit partner,
    /// then the wildcard.
    pub fn find_dst(&self, addr: Address, sender: DomainId) -> Option<&Arc<RingInfo>> {
        self.find(&RingId {
            addr,
            partner: sender,
        })
        .or_else(|| {
            self.find(&RingId {
                addr,
                partner: DomainId::ANY,
            })
        })
    }

    pub fn insert(&mut self, ring: Arc<RingInfo>) -> Result<()> {
        let bucket = &mut self.buckets[bucket_of(ring.id())];
        if bucket.iter().any(|existing| existing.id() == ring.id()) {
            return Err(Error::AlreadyExists);
        }
        bucket.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        bucket.push(ring);
        Ok(())
    }

    pub fn remove(&mut self, id: &RingId) -> Option<Arc<RingInfo>> {
        let bucket = &mut self.buckets[bucket_of(id)];
        let at = bucket.iter().position(|ring| ring.id() == id)?;
        Some(bucket.swap_remove(at))
    }

    /// Detaches every ring, leaving the table empty.
    pub fn drain_all(&mut self) -> Vec<Arc<RingInfo>> {
        let mut all = Vec::new();
        for bucket in &mut self.buckets {
            all.append(bucket);
        }
        all
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RingInfo>> {
        self.buckets.iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.is_empty())
    }
}

/// State of one participating domain: its ring table and the event-channel
/// port allocated at init.
pub struct DomainState {
    domain: DomainId,
    port: u32,
    table: RwLock<L2, RingTable>,
}

impl DomainState {
    pub fn new(domain: DomainId, port: u32) -> DomainState {
        DomainState {
            domain,
            port,
            table: RwLock::new(RingTable::new()),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn table(&self) -> &RwLock<L2, RingTable> {
        &self.table
    }
}
