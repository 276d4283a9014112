//! Top-level facade: hypercall surface and domain lifecycle.
//!
//! [`V4v`] owns the global state (the L1-guarded map of per-domain state
//! and the rule table) and exposes one method per hypercall opcode. The
//! dispatch shim decodes guest registers, calls in here and muxes the
//! `Result` back into the return register.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use log::debug;

use crate::error::{Error, Result};
use crate::hv::{DomainId, GuestAddr, Hypervisor, Pfn, PAGE_SIZE};
use crate::registry::DomainState;
use crate::ring::RingInfo;
use crate::rules::RuleTable;
use crate::sync::{CleanLockToken, RwLock, L1};
use crate::wire::{
    InfoBlock, RingDesc, RingId, Rule, RulesListHdr, MSG_HDR_SIZE, RING_HDR_SIZE,
    RING_ID_OFFSET, RING_TX_OFFSET, V4V_DATA_MAGIC, V4V_RING_MAGIC, V4V_RULES_MAGIC,
};

/// The inter-domain messaging core, generic over the hypervisor it is
/// embedded in.
pub struct V4v<H: Hypervisor> {
    pub(crate) hv: H,
    /// L1: the set of per-domain state pointers. Read-held whenever a state
    /// is dereferenced, write-held only to publish or clear one.
    pub(crate) domains: RwLock<L1, HashMap<DomainId, Arc<DomainState>>>,
    pub(crate) rules: RwLock<L1, RuleTable>,
}

impl<H: Hypervisor> V4v<H> {
    pub fn new(hv: H) -> V4v<H> {
        V4v {
            hv,
            domains: RwLock::new(HashMap::new()),
            rules: RwLock::new(RuleTable::new()),
        }
    }

    pub fn hypervisor(&self) -> &H {
        &self.hv
    }

    /// Domain-creation hook. Idempotent; also run lazily when a domain first
    /// participates.
    pub fn domain_init(&self, domain: DomainId) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };
        self.get_or_init(domain, &mut token).map(|_| ())
    }

    pub(crate) fn get_or_init(
        &self,
        domain: DomainId,
        token: &mut CleanLockToken,
    ) -> Result<Arc<DomainState>> {
        {
            let domains = self.domains.read(token.token());
            if let Some(state) = domains.get(&domain) {
                return Ok(state.clone());
            }
        }

        let port = self.hv.alloc_event_port(domain)?;
        let state = Arc::new(DomainState::new(domain, port));
        let mut domains = self.domains.write(token.token());
        if let Some(existing) = domains.get(&domain) {
            // Lost the publish race; keep the winner's port.
            let existing = existing.clone();
            drop(domains);
            self.hv.free_event_port(domain, port);
            return Ok(existing);
        }
        if domains.try_reserve(1).is_err() {
            drop(domains);
            self.hv.free_event_port(domain, port);
            return Err(Error::OutOfMemory);
        }
        domains.insert(domain, state.clone());
        debug!("domain {domain}: state created, event port {port}");
        Ok(state)
    }

    /// Domain-destruction hook. Removes every ring the domain owns,
    /// releasing its pinned frames, then clears the per-domain pointer.
    /// Must only run once the domain's dying flag is set.
    pub fn domain_destroy(&self, domain: DomainId) {
        debug_assert!(self.hv.domain_is_dying(domain));
        let mut token = unsafe { CleanLockToken::new() };

        let mut domains = self.domains.write(token.token());
        let Some(state) = domains.remove(&domain) else {
            return;
        };
        let (_, l1_token) = domains.token_split();

        let mut table = state.table().write(l1_token);
        let (table, mut l2_token) = table.token_split();
        for ring in table.drain_all() {
            {
                // Serialize with any in-flight insert before releasing the
                // frames underneath it.
                let mut st = ring.state().lock(l2_token.token());
                st.pending.clear();
                st.mappings.clear(&self.hv, ring.mfns());
            }
            for mfn in ring.mfns() {
                self.hv.unpin(*mfn);
            }
            debug!("domain {domain}: dropped ring {}", ring.id().addr);
        }

        self.hv.free_event_port(domain, state.port());
        debug!("domain {domain}: state destroyed");
    }

    /// The register-ring hypercall: `caller` shares the ring described at
    /// `ring_hnd`, backed by the `npage` guest frames listed at `pfn_hnd`.
    pub fn register_ring(
        &self,
        caller: DomainId,
        ring_hnd: GuestAddr,
        pfn_hnd: GuestAddr,
        npage: u32,
    ) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };

        if !ring_hnd.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        let mut buf = [0u8; RingDesc::SIZE];
        self.hv.copy_from_guest(caller, ring_hnd, &mut buf)?;
        let mut desc = RingDesc::read(&buf);

        if desc.magic != V4V_RING_MAGIC {
            return Err(Error::InvalidArgument);
        }
        if desc.len < MSG_HDR_SIZE + 32 || desc.len % 16 != 0 {
            return Err(Error::InvalidArgument);
        }
        if npage == 0
            || u64::from(npage) * (PAGE_SIZE as u64) < u64::from(desc.len) + RING_HDR_SIZE as u64
        {
            return Err(Error::InvalidArgument);
        }

        // A ring always belongs to the registering domain, whatever the
        // guest put in the identity.
        desc.id.addr.domain = caller;
        if desc.tx_ptr >= desc.len || desc.tx_ptr % 16 != 0 {
            desc.tx_ptr = desc.rx_ptr;
        }
        if desc.tx_ptr >= desc.len || desc.tx_ptr % 16 != 0 {
            return Err(Error::InvalidArgument);
        }

        let mut pfns = Vec::new();
        pfns.try_reserve_exact(npage as usize)
            .map_err(|_| Error::OutOfMemory)?;
        for i in 0..u64::from(npage) {
            let mut word = [0u8; 8];
            self.hv
                .copy_from_guest(caller, pfn_hnd.offset(i * 8), &mut word)?;
            pfns.push(Pfn(u64::from_le_bytes(word)));
        }

        self.get_or_init(caller, &mut token)?;

        // Pin the backing frames, all or nothing.
        let mut mfns = Vec::new();
        mfns.try_reserve_exact(npage as usize)
            .map_err(|_| Error::OutOfMemory)?;
        for pfn in &pfns {
            match self.hv.pin_writable(caller, *pfn) {
                Ok(mfn) => mfns.push(mfn),
                Err(err) => {
                    for mfn in &mfns {
                        self.hv.unpin(*mfn);
                    }
                    return Err(err);
                }
            }
        }

        let unwind = |err: Error| {
            for mfn in &mfns {
                self.hv.unpin(*mfn);
            }
            err
        };

        // Publish the normalized identity and producer pointer back to the
        // guest's copy before the ring becomes reachable. The consumer
        // pointer stays untouched.
        let tx_buf = desc.tx_ptr.to_le_bytes();
        let mut id_buf = [0u8; RingId::SIZE];
        desc.id.write_at(&mut id_buf, 0);
        if let Err(err) = self
            .hv
            .copy_to_guest(caller, ring_hnd.offset(RING_TX_OFFSET as u64), &tx_buf)
            .and_then(|()| {
                self.hv
                    .copy_to_guest(caller, ring_hnd.offset(RING_ID_OFFSET as u64), &id_buf)
            })
        {
            return Err(unwind(err));
        }

        let ring = Arc::new(RingInfo::new(desc.id, desc.len, mfns.clone(), desc.tx_ptr));
        {
            let mut domains = self.domains.read(token.token());
            let (domains, l1_token) = domains.token_split();
            let Some(state) = domains.get(&caller) else {
                // Torn down between init and here; the domain is dying.
                return Err(unwind(Error::NoDevice));
            };
            let mut table = state.table().write(l1_token);
            if let Err(err) = table.insert(ring) {
                return Err(unwind(err));
            }
        }

        debug!(
            "domain {caller}: registered ring {} partner {} len {}",
            desc.id.addr, desc.id.partner, desc.len
        );
        Ok(())
    }

    /// The unregister-ring hypercall: tears down the ring whose identity is
    /// described at `ring_hnd`.
    pub fn unregister_ring(&self, caller: DomainId, ring_hnd: GuestAddr) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };

        let mut buf = [0u8; RingDesc::SIZE];
        self.hv.copy_from_guest(caller, ring_hnd, &mut buf)?;
        let desc = RingDesc::read(&buf);
        if desc.magic != V4V_RING_MAGIC {
            return Err(Error::InvalidArgument);
        }
        let mut id = desc.id;
        id.addr.domain = caller;

        let ring = {
            let mut domains = self.domains.read(token.token());
            let (domains, l1_token) = domains.token_split();
            let state = domains.get(&caller).ok_or(Error::NotFound)?;
            let mut table = state.table().write(l1_token);
            let (table, mut l2_token) = table.token_split();
            let ring = table.remove(&id).ok_or(Error::NotFound)?;
            {
                // Serialize with any in-flight insert before the frames go.
                let mut st = ring.state().lock(l2_token.token());
                st.pending.clear();
                st.mappings.clear(&self.hv, ring.mfns());
            }
            ring
        };
        for mfn in ring.mfns() {
            self.hv.unpin(*mfn);
        }

        debug!("domain {caller}: unregistered ring {}", id.addr);
        Ok(())
    }

    /// The info hypercall: wire magics plus the caller's event-channel port.
    pub fn info(&self, caller: DomainId, info_hnd: GuestAddr) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };
        let state = self.get_or_init(caller, &mut token)?;

        let mut buf = [0u8; InfoBlock::SIZE];
        InfoBlock {
            ring_magic: V4V_RING_MAGIC,
            data_magic: V4V_DATA_MAGIC,
            port: state.port(),
        }
        .write(&mut buf);
        self.hv.copy_to_guest(caller, info_hnd, &buf)
    }

    /// The tables-add hypercall: inserts the rule at `rule_hnd` before the
    /// 1-based `position`.
    pub fn rules_add(&self, caller: DomainId, rule_hnd: GuestAddr, position: u32) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };
        let mut buf = [0u8; Rule::SIZE];
        self.hv.copy_from_guest(caller, rule_hnd, &mut buf)?;
        let rule = Rule::read(&buf);
        self.rules.write(token.token()).add(rule, position)
    }

    /// The tables-del hypercall: by position when `position` is not −1, by
    /// exact match when a rule is supplied, otherwise a full flush.
    pub fn rules_del(
        &self,
        caller: DomainId,
        rule_hnd: Option<GuestAddr>,
        position: i64,
    ) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };
        if position != -1 {
            self.rules.write(token.token()).del_at(position as u32);
            return Ok(());
        }
        match rule_hnd {
            Some(hnd) => {
                let mut buf = [0u8; Rule::SIZE];
                self.hv.copy_from_guest(caller, hnd, &mut buf)?;
                let rule = Rule::read(&buf);
                self.rules.write(token.token()).del_match(&rule);
            }
            None => self.rules.write(token.token()).flush(),
        }
        Ok(())
    }

    /// The tables-list hypercall: copies out up to `nb_rules` rules starting
    /// at `start_rule` and writes the actual count back into the block
    /// header.
    pub fn rules_list(&self, caller: DomainId, list_hnd: GuestAddr) -> Result<()> {
        let mut token = unsafe { CleanLockToken::new() };
        let mut hdr_buf = [0u8; RulesListHdr::SIZE];
        self.hv.copy_from_guest(caller, list_hnd, &mut hdr_buf)?;
        let mut hdr = RulesListHdr::read(&hdr_buf);
        if hdr.magic != V4V_RULES_MAGIC {
            return Err(Error::InvalidArgument);
        }

        let mut copied = 0u32;
        {
            let rules = self.rules.read(token.token());
            for rule in rules.tail(hdr.start_rule as usize).iter() {
                if copied == hdr.nb_rules {
                    break;
                }
                let mut rule_buf = [0u8; Rule::SIZE];
                rule.write(&mut rule_buf);
                let at = RulesListHdr::SIZE as u64 + u64::from(copied) * Rule::SIZE as u64;
                self.hv
                    .copy_to_guest(caller, list_hnd.offset(at), &rule_buf)?;
                copied += 1;
            }
        }

        hdr.nb_rules = copied;
        hdr.write(&mut hdr_buf);
        self.hv.copy_to_guest(caller, list_hnd, &hdr_buf)
    }
}
