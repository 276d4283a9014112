//! Test double of the hypervisor seam plus guest-side helpers.
//!
//! `MockHv` models each domain as a flat array of 4 KiB frames addressed by
//! `pfn * PAGE_SIZE`, with pin/unpin accounting and a recorded stream of
//! event-channel signals. The guest-side helpers build hypercall argument
//! blocks in that memory and play the consumer role against a ring.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use v4v::wire::{Address, MsgHeader, RingDesc, RingId, roundup16, V4V_RING_MAGIC};
use v4v::{DomainId, Error, GuestAddr, Hypervisor, Mfn, Pfn, Result, V4v, PAGE_SIZE};

// Per-domain scratch layout: hypercall argument blocks on page 0, sendv
// staging on pages 6+; rings live on pages 1 through 5.
pub const PFN_LIST_AT: u64 = 0x0;
pub const RULE_AT: u64 = 0x800;
pub const INFO_AT: u64 = 0x880;
pub const RING_DATA_AT: u64 = 0x900;
pub const SEND_ADDR_AT: u64 = 0x6000;
pub const IOV_AT: u64 = 0x6040;
pub const PAYLOAD_AT: u64 = 0x7000;

pub const ANY: u16 = 0x7ff4;

struct DomainMem {
    pages: Vec<*mut u8>,
}

#[derive(Default)]
struct Inner {
    domains: HashMap<u16, DomainMem>,
    dying: Vec<u16>,
    pins: HashMap<u64, u32>,
    ports: Vec<(u16, u32)>,
    next_port: u32,
    signals: Vec<(u16, u32)>,
}

pub struct MockHv {
    inner: Mutex<Inner>,
}

unsafe impl Send for MockHv {}
unsafe impl Sync for MockHv {}

fn mfn_key(domain: u16, pfn: u64) -> u64 {
    (u64::from(domain) << 32) | pfn
}

impl MockHv {
    pub fn new() -> MockHv {
        MockHv {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add_domain(&self, domain: u16, npages: usize) {
        let pages = (0..npages)
            .map(|_| Box::into_raw(Box::new([0u8; PAGE_SIZE])) as *mut u8)
            .collect();
        self.inner
            .lock()
            .unwrap()
            .domains
            .insert(domain, DomainMem { pages });
    }

    pub fn set_dying(&self, domain: u16) {
        self.inner.lock().unwrap().dying.push(domain);
    }

    pub fn write_guest(&self, domain: u16, addr: u64, bytes: &[u8]) {
        self.copy_to_guest(DomainId(domain), GuestAddr(addr), bytes)
            .expect("guest write out of range");
    }

    pub fn read_guest(&self, domain: u16, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.copy_from_guest(DomainId(domain), GuestAddr(addr), &mut buf)
            .expect("guest read out of range");
        buf
    }

    pub fn pinned_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pins
            .values()
            .map(|&n| n as usize)
            .sum()
    }

    pub fn take_signals(&self) -> Vec<(u16, u32)> {
        std::mem::take(&mut self.inner.lock().unwrap().signals)
    }

    fn access(
        &self,
        domain: u16,
        addr: u64,
        len: usize,
        mut visit: impl FnMut(*mut u8, usize, usize),
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mem = inner.domains.get(&domain).ok_or(Error::MemoryFault)?;
        let mut addr = addr;
        let mut done = 0;
        while done < len {
            let page = (addr / PAGE_SIZE as u64) as usize;
            let at = (addr % PAGE_SIZE as u64) as usize;
            let chunk = (len - done).min(PAGE_SIZE - at);
            let base = *mem.pages.get(page).ok_or(Error::MemoryFault)?;
            visit(unsafe { base.add(at) }, done, chunk);
            addr += chunk as u64;
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for MockHv {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        for mem in inner.domains.values() {
            for &page in &mem.pages {
                drop(unsafe { Box::from_raw(page as *mut [u8; PAGE_SIZE]) });
            }
        }
    }
}

impl Hypervisor for MockHv {
    fn domain_exists(&self, domain: DomainId) -> bool {
        self.inner.lock().unwrap().domains.contains_key(&domain.0)
    }

    fn domain_is_dying(&self, domain: DomainId) -> bool {
        self.inner.lock().unwrap().dying.contains(&domain.0)
    }

    fn alloc_event_port(&self, domain: DomainId) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_port += 1;
        let port = inner.next_port;
        inner.ports.push((domain.0, port));
        Ok(port)
    }

    fn free_event_port(&self, domain: DomainId, port: u32) {
        self.inner
            .lock()
            .unwrap()
            .ports
            .retain(|&p| p != (domain.0, port));
    }

    fn signal(&self, domain: DomainId, port: u32) {
        self.inner.lock().unwrap().signals.push((domain.0, port));
    }

    fn pin_writable(&self, domain: DomainId, pfn: Pfn) -> Result<Mfn> {
        let mut inner = self.inner.lock().unwrap();
        let mem = inner.domains.get(&domain.0).ok_or(Error::MemoryFault)?;
        if pfn.0 as usize >= mem.pages.len() {
            return Err(Error::MemoryFault);
        }
        let key = mfn_key(domain.0, pfn.0);
        *inner.pins.entry(key).or_insert(0) += 1;
        Ok(Mfn(key))
    }

    fn unpin(&self, mfn: Mfn) {
        let mut inner = self.inner.lock().unwrap();
        match inner.pins.get_mut(&mfn.0) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.pins.remove(&mfn.0);
            }
            None => panic!("unpin of frame {:#x} that was never pinned", mfn.0),
        }
    }

    fn map_frame(&self, mfn: Mfn) -> Result<NonNull<u8>> {
        let inner = self.inner.lock().unwrap();
        if !inner.pins.contains_key(&mfn.0) {
            return Err(Error::MemoryFault);
        }
        let domain = (mfn.0 >> 32) as u16;
        let pfn = (mfn.0 & 0xffff_ffff) as usize;
        let mem = inner.domains.get(&domain).ok_or(Error::MemoryFault)?;
        NonNull::new(mem.pages[pfn]).ok_or(Error::MemoryFault)
    }

    unsafe fn unmap_frame(&self, _mfn: Mfn, _ptr: NonNull<u8>) {}

    fn copy_from_guest(&self, domain: DomainId, src: GuestAddr, dst: &mut [u8]) -> Result<()> {
        self.access(domain.0, src.0, dst.len(), |ptr, at, chunk| unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst[at..].as_mut_ptr(), chunk);
        })
    }

    fn copy_to_guest(&self, domain: DomainId, dst: GuestAddr, src: &[u8]) -> Result<()> {
        self.access(domain.0, dst.0, src.len(), |ptr, at, chunk| unsafe {
            std::ptr::copy_nonoverlapping(src[at..].as_ptr(), ptr, chunk);
        })
    }
}

/// Builds a fresh core with the given `(domain, page count)` guests, running
/// the domain-creation hook for each.
pub fn new_v4v(domains: &[(u16, usize)]) -> V4v<MockHv> {
    let hv = MockHv::new();
    for &(domain, npages) in domains {
        hv.add_domain(domain, npages);
    }
    let v = V4v::new(hv);
    for &(domain, _) in domains {
        v.domain_init(DomainId(domain)).unwrap();
    }
    v
}

/// Writes a ring header + pfn list into `owner`'s memory and registers it.
/// The ring occupies `npage` frames starting at `first_pfn`.
pub fn install_ring(
    v: &V4v<MockHv>,
    owner: u16,
    first_pfn: u64,
    npage: u32,
    len: u32,
    port: u32,
    partner: u16,
) -> GuestAddr {
    let ring_addr = write_ring_desc(v, owner, first_pfn, npage, len, port, partner);
    v.register_ring(
        DomainId(owner),
        ring_addr,
        GuestAddr(PFN_LIST_AT),
        npage,
    )
    .expect("ring registration failed");
    ring_addr
}

/// As [`install_ring`] but without issuing the hypercall.
pub fn write_ring_desc(
    v: &V4v<MockHv>,
    owner: u16,
    first_pfn: u64,
    npage: u32,
    len: u32,
    port: u32,
    partner: u16,
) -> GuestAddr {
    let hv = v.hypervisor();
    let ring_addr = GuestAddr(first_pfn * PAGE_SIZE as u64);
    let mut buf = [0u8; RingDesc::SIZE];
    RingDesc {
        magic: V4V_RING_MAGIC,
        len,
        rx_ptr: 0,
        tx_ptr: 0,
        id: RingId {
            addr: Address {
                port,
                domain: DomainId(owner),
            },
            partner: DomainId(partner),
        },
    }
    .write(&mut buf);
    hv.write_guest(owner, ring_addr.0, &buf);

    let mut pfn_bytes = Vec::new();
    for i in 0..u64::from(npage) {
        pfn_bytes.extend_from_slice(&(first_pfn + i).to_le_bytes());
    }
    hv.write_guest(owner, PFN_LIST_AT, &pfn_bytes);
    ring_addr
}

/// Issues a sendv of `chunks`, staged in the sender's scratch page.
pub fn send(
    v: &V4v<MockHv>,
    src: (u16, u32),
    dst: (u16, u32),
    message_type: u32,
    chunks: &[&[u8]],
) -> Result<usize> {
    let hv = v.hypervisor();
    let mut addr_buf = [0u8; 16];
    Address {
        port: src.1,
        domain: DomainId(src.0),
    }
    .write_at(&mut addr_buf, 0);
    Address {
        port: dst.1,
        domain: DomainId(dst.0),
    }
    .write_at(&mut addr_buf, 8);
    hv.write_guest(src.0, SEND_ADDR_AT, &addr_buf);

    let mut iov_bytes = Vec::new();
    let mut data_at = PAYLOAD_AT;
    for chunk in chunks {
        hv.write_guest(src.0, data_at, chunk);
        iov_bytes.extend_from_slice(&data_at.to_le_bytes());
        iov_bytes.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        iov_bytes.extend_from_slice(&[0u8; 4]);
        data_at += chunk.len() as u64;
    }
    hv.write_guest(src.0, IOV_AT, &iov_bytes);

    v.sendv(
        DomainId(src.0),
        GuestAddr(SEND_ADDR_AT),
        GuestAddr(IOV_AT),
        chunks.len() as u32,
        message_type,
    )
}

/// The guest-visible `(tx_ptr, rx_ptr)` pair of a ring.
pub fn ring_ptrs(v: &V4v<MockHv>, owner: u16, ring_addr: GuestAddr) -> (u32, u32) {
    let hdr = v.hypervisor().read_guest(owner, ring_addr.0, RingDesc::SIZE);
    let desc = RingDesc::read(&hdr.try_into().unwrap());
    (desc.tx_ptr, desc.rx_ptr)
}

pub struct Consumed {
    pub frame_len: u32,
    pub message_type: u32,
    pub source: (u16, u32),
    pub payload: Vec<u8>,
}

fn read_ring_bytes(
    v: &V4v<MockHv>,
    owner: u16,
    ring_addr: GuestAddr,
    ring_len: u32,
    off: u32,
    n: u32,
) -> Vec<u8> {
    let hv = v.hypervisor();
    (0..u64::from(n))
        .map(|i| {
            let at = (u64::from(off) + i) % u64::from(ring_len);
            hv.read_guest(owner, ring_addr.0 + RingDesc::SIZE as u64 + at, 1)[0]
        })
        .collect()
}

/// Plays the consumer: reads the message under `rx_ptr`, advances `rx_ptr`
/// past it. Returns `None` on an empty ring.
pub fn consume_one(v: &V4v<MockHv>, owner: u16, ring_addr: GuestAddr) -> Option<Consumed> {
    let hv = v.hypervisor();
    let hdr = hv.read_guest(owner, ring_addr.0, RingDesc::SIZE);
    let desc = RingDesc::read(&hdr.try_into().unwrap());
    if desc.rx_ptr == desc.tx_ptr {
        return None;
    }

    let mhdr_bytes = read_ring_bytes(v, owner, ring_addr, desc.len, desc.rx_ptr, 16);
    let mhdr = MsgHeader::read(&mhdr_bytes.try_into().unwrap());
    let payload_len = mhdr.len - 16;
    let payload = read_ring_bytes(
        v,
        owner,
        ring_addr,
        desc.len,
        (desc.rx_ptr + 16) % desc.len,
        payload_len,
    );

    let new_rx = ((u64::from(desc.rx_ptr) + u64::from(roundup16(mhdr.len))) % u64::from(desc.len))
        as u32;
    hv.write_guest(owner, ring_addr.0 + 12, &new_rx.to_le_bytes());

    Some(Consumed {
        frame_len: mhdr.len,
        message_type: mhdr.message_type,
        source: (mhdr.source.domain.0, mhdr.source.port),
        payload,
    })
}

/// Drains the ring to empty.
pub fn drain(v: &V4v<MockHv>, owner: u16, ring_addr: GuestAddr) -> Vec<Consumed> {
    let mut out = Vec::new();
    while let Some(msg) = consume_one(v, owner, ring_addr) {
        out.push(msg);
    }
    out
}
