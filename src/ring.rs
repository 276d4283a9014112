//! Ring storage: circular-buffer arithmetic, message framing and the
//! scatter/gather insert path.
//!
//! The payload area of a ring is a byte-circular buffer of `len` bytes
//! starting right behind the 40-byte shared header in frame 0, laid over
//! `npage` pinned guest frames. The hypervisor owns `tx_ptr` (cached here,
//! mirrored into the shared header at every commit); the guest consumer owns
//! `rx_ptr`. The consumer pointer is adversarial: it is read exactly once
//! per decision and never trusted to be in range.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::cmp;
use core::sync::atomic::{fence, Ordering};

use crate::error::{Error, Result};
use crate::hv::{DomainId, GuestAddr, Hypervisor, Mfn, PAGE_SIZE};
use crate::mapper::MappingCache;
use crate::pending::PendingQueue;
use crate::sync::{Mutex, L3};
use crate::wire::{self, Address, MsgHeader, RingId, MSG_HDR_SIZE, RING_HDR_SIZE, V4V_SLOT};

/// One element of a `sendv` scatter list, already copied out of guest memory.
/// `base` addresses the chunk in the *sender's* address space.
#[derive(Clone, Copy, Debug)]
pub struct Iov {
    pub base: GuestAddr,
    pub len: u32,
}

/// Registry entry for one guest ring.
///
/// Identity, capacity and the pinned frame list are immutable for the life
/// of the entry (protected by the owning domain's bucket rwlock); everything
/// mutable lives in [`RingState`] behind the ring spin-lock.
pub struct RingInfo {
    id: RingId,
    len: u32,
    mfns: Vec<Mfn>,
    state: Mutex<L3, RingState>,
}

/// Mutable ring state, guarded by the ring spin-lock.
pub struct RingState {
    /// Authoritative producer offset; the guest copy is overwritten at every
    /// commit.
    pub tx_ptr: u32,
    pub mappings: MappingCache,
    pub pending: PendingQueue,
}

impl RingInfo {
    pub fn new(id: RingId, len: u32, mfns: Vec<Mfn>, tx_ptr: u32) -> RingInfo {
        let npage = mfns.len();
        RingInfo {
            id,
            len,
            mfns,
            state: Mutex::new(RingState {
                tx_ptr,
                mappings: MappingCache::new(npage),
                pending: PendingQueue::new(),
            }),
        }
    }

    pub fn id(&self) -> &RingId {
        &self.id
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn mfns(&self) -> &[Mfn] {
        &self.mfns
    }

    pub fn state(&self) -> &Mutex<L3, RingState> {
        &self.state
    }

    /// Largest single payload this ring can ever accept.
    pub fn max_message_size(&self) -> u32 {
        self.len - MSG_HDR_SIZE - V4V_SLOT
    }
}

/// Fill state of a ring, derived from one read of the consumer pointer.
#[derive(Clone, Copy, Debug)]
pub struct RingStatus {
    /// Payload bytes a sender may enqueue right now.
    pub free: u32,
    /// Whether the consumer has caught up with the producer.
    pub empty: bool,
}

/// Free-space computation. `rx` may hold anything the guest wrote; all
/// arithmetic is modulo `len` and the result clamps at zero.
fn payload_space(len: u32, tx: u32, rx: u32) -> RingStatus {
    if rx == tx {
        RingStatus {
            free: len - MSG_HDR_SIZE,
            empty: true,
        }
    } else {
        let gap = rx.wrapping_sub(tx) % len;
        RingStatus {
            free: gap.saturating_sub(MSG_HDR_SIZE + V4V_SLOT),
            empty: false,
        }
    }
}

/// Reads the ring's fill state. Caller holds the ring spin-lock; the frame-0
/// mapping this establishes stays cached until `st.mappings` is cleared.
pub fn status<H: Hypervisor>(hv: &H, ring: &RingInfo, st: &mut RingState) -> Result<RingStatus> {
    let hdr_page = st.mappings.page(hv, &ring.mfns, 0)?;
    let rx = unsafe { wire::rx_ptr_cell(hdr_page) }.load(Ordering::Acquire);
    Ok(payload_space(ring.len, st.tx_ptr, rx))
}

/// Writes `len` bytes at payload offset `off`, splitting at the wrap
/// boundary into at most two contiguous runs and at frame boundaries below
/// that. `fill` produces the bytes for each destination window, addressed by
/// source offset.
fn write_wrapped<H: Hypervisor>(
    hv: &H,
    ring: &RingInfo,
    st: &mut RingState,
    off: u32,
    len: usize,
    mut fill: impl FnMut(usize, &mut [u8]) -> Result<()>,
) -> Result<()> {
    let off = off % ring.len;
    let mut runs: ArrayVec<(u32, usize, usize), 2> = ArrayVec::new();
    let first = cmp::min(len, (ring.len - off) as usize);
    runs.push((off, 0, first));
    if first < len {
        runs.push((0, first, len - first));
    }

    for (ring_off, src_at, run_len) in runs {
        // Contiguous in ring space; may still span several frames. Frame 0
        // additionally holds the shared header, which `pos` always skips.
        let mut pos = RING_HDR_SIZE + ring_off as usize;
        let mut done = 0;
        while done < run_len {
            let frame = pos / PAGE_SIZE;
            let at = pos % PAGE_SIZE;
            let chunk = cmp::min(run_len - done, PAGE_SIZE - at);
            let page = st.mappings.page(hv, &ring.mfns, frame)?;
            let window =
                unsafe { core::slice::from_raw_parts_mut(page.as_ptr().add(at), chunk) };
            fill(src_at + done, window)?;
            pos += chunk;
            done += chunk;
        }
    }
    Ok(())
}

/// Enqueues one datagram into the ring.
///
/// Caller holds the ring spin-lock and has bounded the scatter total to
/// 2 GiB. The commit store of `tx_ptr` is the single linearization point:
/// nothing written before it is observable by the consumer, and any fault
/// aborts the call without reaching it. All mappings established here are
/// dropped again before returning.
pub fn insertv<H: Hypervisor>(
    hv: &H,
    ring: &RingInfo,
    st: &mut RingState,
    caller: DomainId,
    source: Address,
    message_type: u32,
    iovs: &[Iov],
) -> Result<usize> {
    let res = insert_inner(hv, ring, st, caller, source, message_type, iovs);
    st.mappings.clear(hv, &ring.mfns);
    res
}

fn insert_inner<H: Hypervisor>(
    hv: &H,
    ring: &RingInfo,
    st: &mut RingState,
    caller: DomainId,
    source: Address,
    message_type: u32,
    iovs: &[Iov],
) -> Result<usize> {
    let total: u64 = iovs.iter().map(|iov| u64::from(iov.len)).sum();
    debug_assert!(total < 1 << 31);
    let total = total as u32;
    if u64::from(wire::roundup16(total)) + u64::from(MSG_HDR_SIZE) >= u64::from(ring.len) {
        return Err(Error::MsgTooLarge);
    }

    let hdr_page = st.mappings.page(hv, &ring.mfns, 0)?;
    let mut rx = unsafe { wire::rx_ptr_cell(hdr_page) }.load(Ordering::Acquire);
    let mut tx = st.tx_ptr;

    if rx == tx && tx != 0 {
        // Consumer caught up: collapse accumulated wrap drift. The consumer
        // must observe the rx reset before any new tx advance.
        unsafe { wire::rx_ptr_cell(hdr_page) }.store(0, Ordering::Release);
        fence(Ordering::SeqCst);
        unsafe { wire::tx_ptr_cell(hdr_page) }.store(0, Ordering::Release);
        tx = 0;
        rx = 0;
        st.tx_ptr = 0;
    }

    if payload_space(ring.len, tx, rx).free < total {
        return Err(Error::WouldBlock);
    }

    let mut hdr = [0u8; MsgHeader::SIZE];
    MsgHeader {
        len: total + MSG_HDR_SIZE,
        message_type,
        source,
    }
    .write(&mut hdr);
    write_wrapped(hv, ring, st, tx, hdr.len(), |at, window| {
        window.copy_from_slice(&hdr[at..at + window.len()]);
        Ok(())
    })?;

    // The scatter list is consumed in order; chunks concatenate without
    // padding between them.
    let mut off = (tx + MSG_HDR_SIZE) % ring.len;
    for iov in iovs {
        write_wrapped(hv, ring, st, off, iov.len as usize, |at, window| {
            hv.copy_from_guest(caller, iov.base.offset(at as u64), window)
        })?;
        off = ((u64::from(off) + u64::from(iov.len)) % u64::from(ring.len)) as u32;
    }

    let new_tx = ((u64::from(tx) + u64::from(MSG_HDR_SIZE) + u64::from(wire::roundup16(total)))
        % u64::from(ring.len)) as u32;
    st.tx_ptr = new_tx;
    // Commit point.
    unsafe { wire::tx_ptr_cell(hdr_page) }.store(new_tx, Ordering::Release);
    fence(Ordering::SeqCst);

    Ok(total as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_of_empty_ring() {
        let s = payload_space(256, 0, 0);
        assert!(s.empty);
        assert_eq!(s.free, 256 - 16);
    }

    #[test]
    fn space_accounts_for_header_and_slot() {
        // One 32-byte frame enqueued at the head of a 128-byte ring.
        let s = payload_space(128, 32, 0);
        assert!(!s.empty);
        assert_eq!(s.free, 96 - 32);
    }

    #[test]
    fn space_clamps_at_zero() {
        let s = payload_space(64, 32, 0);
        assert_eq!(s.free, 0);
    }

    #[test]
    fn adversarial_rx_stays_bounded() {
        // rx values far out of range reduce modulo len and can never make
        // free exceed the ring size.
        for rx in [64u32, 65, 4096, u32::MAX, u32::MAX - 7] {
            let s = payload_space(64, 16, rx);
            assert!(s.free < 64, "rx={rx} free={}", s.free);
        }
        // rx congruent to tx modulo len but not equal: not "empty", zero gap.
        let s = payload_space(64, 16, 16 + 64);
        assert!(!s.empty);
        assert_eq!(s.free, 0);
    }
}
