//! Delivery and notification: the `sendv` and `notify` hypercalls.

use alloc::vec::Vec;
use log::warn;

use crate::error::{Error, Result};
use crate::hv::{DomainId, GuestAddr, Hypervisor};
use crate::ring::{self, Iov};
use crate::sync::CleanLockToken;
use crate::v4v::V4v;
use crate::wire::{Address, RingDataEnt, RingDataFlags, RingDataHdr, V4V_DATA_MAGIC};

/// Scatter totals beyond this are rejected outright.
const MAX_MSG_SIZE: u64 = 1 << 31;

impl<H: Hypervisor> V4v<H> {
    /// The sendv hypercall: enqueue one datagram, assembled from the scatter
    /// list at `iov_hnd`, into the destination ring named by the address
    /// pair at `addr_hnd`. Returns the payload byte count on success.
    ///
    /// A full destination ring queues a pending entry for the caller as a
    /// side effect of the `WouldBlock` failure; every other failure leaves
    /// no trace.
    pub fn sendv(
        &self,
        caller: DomainId,
        addr_hnd: GuestAddr,
        iov_hnd: GuestAddr,
        niov: u32,
        message_type: u32,
    ) -> Result<usize> {
        let mut token = unsafe { CleanLockToken::new() };

        let mut addr_buf = [0u8; 2 * Address::SIZE];
        self.hv.copy_from_guest(caller, addr_hnd, &mut addr_buf)?;
        let mut src = Address::read_at(&addr_buf, 0);
        let dst = Address::read_at(&addr_buf, Address::SIZE);
        // The source domain is whoever issued the hypercall; the field in
        // guest memory cannot spoof it.
        src.domain = caller;

        let mut iovs = Vec::new();
        iovs.try_reserve_exact(niov as usize)
            .map_err(|_| Error::OutOfMemory)?;
        for i in 0..u64::from(niov) {
            let mut iov_buf = [0u8; 16];
            self.hv
                .copy_from_guest(caller, iov_hnd.offset(i * 16), &mut iov_buf)?;
            iovs.push(Iov {
                base: GuestAddr(u64::from_le_bytes([
                    iov_buf[0], iov_buf[1], iov_buf[2], iov_buf[3], iov_buf[4], iov_buf[5],
                    iov_buf[6], iov_buf[7],
                ])),
                len: u32::from_le_bytes([iov_buf[8], iov_buf[9], iov_buf[10], iov_buf[11]]),
            });
        }
        let total: u64 = iovs.iter().map(|iov| u64::from(iov.len)).sum();
        if total >= MAX_MSG_SIZE {
            return Err(Error::MsgTooLarge);
        }

        if !self.hv.domain_exists(dst.domain) {
            return Err(Error::Refused);
        }
        if !self.rules.read(token.token()).check(src, dst) {
            warn!("sendv {src} -> {dst} rejected by rule");
            return Err(Error::Refused);
        }

        let sent;
        let dst_port;
        {
            let mut domains = self.domains.read(token.token());
            let (domains, l1_token) = domains.token_split();
            let dst_state = domains.get(&dst.domain).ok_or(Error::Refused)?;
            dst_port = dst_state.port();

            let mut table = dst_state.table().read(l1_token);
            let (table, mut l2_token) = table.token_split();
            let ring = table.find_dst(dst, caller).ok_or(Error::Refused)?;

            let mut st = ring.state().lock(l2_token.token());
            match ring::insertv(&self.hv, ring, &mut st, caller, src, message_type, &iovs) {
                Ok(n) => sent = n,
                Err(Error::WouldBlock) => {
                    st.pending.queue(caller, total as u32)?;
                    return Err(Error::WouldBlock);
                }
                Err(err) => return Err(err),
            }
        }
        // The commit has happened; now wake the consumer.
        self.hv.signal(dst.domain, dst_port);
        Ok(sent)
    }

    /// The notify hypercall.
    ///
    /// Scans every ring of the caller for pending entries the consumer has
    /// made room for and signals the senders behind them. When a ring-data
    /// block is supplied, additionally fills one status entry per referenced
    /// destination ring, queueing or cancelling pending entries for the
    /// caller as the free space dictates.
    pub fn notify(&self, caller: DomainId, ring_data_hnd: Option<GuestAddr>) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };

        let mut woken: Vec<DomainId> = Vec::new();
        let mut drained = Vec::new();

        let mut domains = self.domains.read(token.token());
        let (domains, mut l1_token) = domains.token_split();
        let state = domains.get(&caller).ok_or(Error::NoDevice)?;

        {
            let mut table = state.table().read(l1_token.token());
            let (table, mut l2_token) = table.token_split();
            for ring in table.iter() {
                let mut st = ring.state().lock(l2_token.token());
                let free = ring::status(&self.hv, ring, &mut st)
                    .map(|status| status.free)
                    .unwrap_or(0);
                st.pending.drain_satisfied(free, &mut drained);
                st.mappings.clear(&self.hv, ring.mfns());
                for ent in drained.drain(..) {
                    woken.push(ent.source);
                }
            }
        }

        if let Some(hnd) = ring_data_hnd {
            let mut hdr_buf = [0u8; RingDataHdr::SIZE];
            self.hv.copy_from_guest(caller, hnd, &mut hdr_buf)?;
            let hdr = RingDataHdr::read(&hdr_buf);
            if hdr.magic != V4V_DATA_MAGIC {
                return Err(Error::InvalidArgument);
            }

            for i in 0..u64::from(hdr.nent) {
                let ent_hnd = hnd.offset(RingDataHdr::SIZE as u64 + i * RingDataEnt::SIZE as u64);
                let mut ent_buf = [0u8; RingDataEnt::SIZE];
                self.hv.copy_from_guest(caller, ent_hnd, &mut ent_buf)?;
                let mut ent = RingDataEnt::read(&ent_buf);

                ent.flags = RingDataFlags::empty();
                ent.max_message_size = 0;
                let mut queued = Ok(());
                if let Some(dst_state) = domains.get(&ent.ring.domain) {
                    let mut table = dst_state.table().read(l1_token.token());
                    let (table, mut l2_token) = table.token_split();
                    if let Some(ring) = table.find_dst(ent.ring, caller) {
                        ent.flags |= RingDataFlags::EXISTS;
                        ent.max_message_size = ring.max_message_size();

                        let mut st = ring.state().lock(l2_token.token());
                        if let Ok(status) = ring::status(&self.hv, ring, &mut st) {
                            if status.empty {
                                ent.flags |= RingDataFlags::EMPTY;
                            }
                            if status.free >= ent.space_required {
                                ent.flags |= RingDataFlags::SUFFICIENT;
                                st.pending.cancel(caller);
                            } else {
                                ent.flags |= RingDataFlags::PENDING;
                                queued = st.pending.queue(caller, ent.space_required);
                            }
                        }
                        st.mappings.clear(&self.hv, ring.mfns());
                    }
                }
                queued?;

                ent.write(&mut ent_buf);
                self.hv.copy_to_guest(caller, ent_hnd, &ent_buf)?;
            }
        }

        // The walk is complete; wake the unblocked senders.
        for source in woken {
            if let Some(source_state) = domains.get(&source) {
                self.hv.signal(source, source_state.port());
            }
        }
        Ok(())
    }
}
