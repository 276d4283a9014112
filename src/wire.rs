//! Guest-visible wire formats.
//!
//! Every structure shared with a guest is little-endian and tightly packed,
//! independent of the host. Layouts are fixed by explicit offsets with field
//! codecs next to them; the shared producer/consumer cells of a mapped ring
//! header are additionally exposed as atomics, since the consumer mutates
//! `rx_ptr` concurrently with the hypervisor.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

use crate::hv::DomainId;

/// Magic of the shared ring header.
pub const V4V_RING_MAGIC: u64 = 0x0002_7633_20f8_6a38;
/// Magic of the bulk ring-state query block.
pub const V4V_DATA_MAGIC: u64 = 0x4ce4_d30f_bc82_e92a;
/// Magic of the rule-list block.
pub const V4V_RULES_MAGIC: u64 = 0x2062_bf35_71a8_de0f;

/// Wildcard port, valid only in rules.
pub const V4V_PORT_ANY: u32 = 0xffff_ffff;

/// Granularity of ring offsets: message frames start and end on 16-byte
/// boundaries, and one spare slot distinguishes a full ring from an empty one.
pub const V4V_SLOT: u32 = 16;

/// Rounds up to the next multiple of 16, saturating at `u32::MAX & !15`.
pub const fn roundup16(x: u32) -> u32 {
    x.saturating_add(15) & !15
}

// Shared ring header layout (frame 0).
pub const RING_MAGIC_OFFSET: usize = 0;
pub const RING_LEN_OFFSET: usize = 8;
pub const RING_RX_OFFSET: usize = 12;
pub const RING_TX_OFFSET: usize = 16;
pub const RING_ID_OFFSET: usize = 24;
/// Total header prefix; the payload area starts right behind it.
pub const RING_HDR_SIZE: usize = 40;

/// Size of the in-ring message frame header.
pub const MSG_HDR_SIZE: u32 = 16;

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    (get_u32(buf, at) as u64) | ((get_u32(buf, at + 4) as u64) << 32)
}

fn put_u16(buf: &mut [u8], at: usize, val: u16) {
    buf[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, val: u64) {
    buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

/// A `(domain, port)` endpoint.
///
/// Packed form is 6 bytes (`port` then `domain`); standalone occurrences pad
/// to [`Address::SIZE`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Address {
    pub port: u32,
    pub domain: DomainId,
}

impl Address {
    /// Padded wire size.
    pub const SIZE: usize = 8;

    pub fn read_at(buf: &[u8], at: usize) -> Address {
        Address {
            port: get_u32(buf, at),
            domain: DomainId(get_u16(buf, at + 4)),
        }
    }

    pub fn write_at(self, buf: &mut [u8], at: usize) {
        put_u32(buf, at, self.port);
        put_u16(buf, at + 4, self.domain.0);
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

/// Identity of a ring within its owning domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingId {
    pub addr: Address,
    /// Domain this ring accepts sends from; [`DomainId::ANY`] permits all.
    pub partner: DomainId,
}

impl RingId {
    /// Wire size: packed address (6), partner (2), 8 bytes of padding.
    pub const SIZE: usize = 16;

    pub fn read_at(buf: &[u8], at: usize) -> RingId {
        RingId {
            addr: Address {
                port: get_u32(buf, at),
                domain: DomainId(get_u16(buf, at + 4)),
            },
            partner: DomainId(get_u16(buf, at + 6)),
        }
    }

    pub fn write_at(self, buf: &mut [u8], at: usize) {
        put_u32(buf, at, self.addr.port);
        put_u16(buf, at + 4, self.addr.domain.0);
        put_u16(buf, at + 6, self.partner.0);
    }
}

/// Registration-time snapshot of a guest's ring header.
#[derive(Clone, Copy, Debug)]
pub struct RingDesc {
    pub magic: u64,
    pub len: u32,
    pub rx_ptr: u32,
    pub tx_ptr: u32,
    pub id: RingId,
}

impl RingDesc {
    pub const SIZE: usize = RING_HDR_SIZE;

    pub fn read(buf: &[u8; Self::SIZE]) -> RingDesc {
        RingDesc {
            magic: get_u64(buf, RING_MAGIC_OFFSET),
            len: get_u32(buf, RING_LEN_OFFSET),
            rx_ptr: get_u32(buf, RING_RX_OFFSET),
            tx_ptr: get_u32(buf, RING_TX_OFFSET),
            id: RingId::read_at(buf, RING_ID_OFFSET),
        }
    }

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        put_u64(buf, RING_MAGIC_OFFSET, self.magic);
        put_u32(buf, RING_LEN_OFFSET, self.len);
        put_u32(buf, RING_RX_OFFSET, self.rx_ptr);
        put_u32(buf, RING_TX_OFFSET, self.tx_ptr);
        self.id.write_at(buf, RING_ID_OFFSET);
    }
}

/// Header of one message frame inside the ring payload area.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MsgHeader {
    /// Total frame length including this header.
    pub len: u32,
    pub message_type: u32,
    pub source: Address,
}

impl MsgHeader {
    pub const SIZE: usize = MSG_HDR_SIZE as usize;

    pub fn read(buf: &[u8; Self::SIZE]) -> MsgHeader {
        MsgHeader {
            len: get_u32(buf, 0),
            message_type: get_u32(buf, 4),
            source: Address {
                port: get_u32(buf, 8),
                domain: DomainId(get_u16(buf, 12)),
            },
        }
    }

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        put_u32(buf, 0, self.len);
        put_u32(buf, 4, self.message_type);
        put_u32(buf, 8, self.source.port);
        put_u16(buf, 12, self.source.domain.0);
    }
}

bitflags::bitflags! {
    /// Per-entry status word of the bulk ring-state query.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RingDataFlags: u16 {
        /// Ring is registered and accepts this source.
        const EXISTS = 1 << 0;
        /// Free bytes cover the requested space.
        const SUFFICIENT = 1 << 1;
        /// Requested space not yet available; a pending entry was queued.
        const PENDING = 1 << 2;
        /// Ring holds no messages.
        const EMPTY = 1 << 3;
    }
}

/// Header of the bulk ring-state query block.
#[derive(Clone, Copy, Debug)]
pub struct RingDataHdr {
    pub magic: u64,
    pub nent: u32,
}

impl RingDataHdr {
    pub const SIZE: usize = 16;

    pub fn read(buf: &[u8; Self::SIZE]) -> RingDataHdr {
        RingDataHdr {
            magic: get_u64(buf, 0),
            nent: get_u32(buf, 8),
        }
    }
}

/// One entry of the bulk ring-state query.
#[derive(Clone, Copy, Debug)]
pub struct RingDataEnt {
    pub ring: Address,
    pub flags: RingDataFlags,
    pub space_required: u32,
    pub max_message_size: u32,
}

impl RingDataEnt {
    pub const SIZE: usize = 20;

    pub fn read(buf: &[u8; Self::SIZE]) -> RingDataEnt {
        RingDataEnt {
            ring: Address::read_at(buf, 0),
            flags: RingDataFlags::from_bits_truncate(get_u16(buf, 8)),
            space_required: get_u32(buf, 12),
            max_message_size: get_u32(buf, 16),
        }
    }

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        self.ring.write_at(buf, 0);
        put_u16(buf, 8, self.flags.bits());
        put_u32(buf, 12, self.space_required);
        put_u32(buf, 16, self.max_message_size);
    }
}

/// One accept/reject rule; either address may wildcard its domain, its port,
/// or both.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rule {
    pub src: Address,
    pub dst: Address,
    pub accept: bool,
}

fn addr_matches(pattern: Address, addr: Address) -> bool {
    (pattern.domain == DomainId::ANY || pattern.domain == addr.domain)
        && (pattern.port == V4V_PORT_ANY || pattern.port == addr.port)
}

impl Rule {
    pub const SIZE: usize = 24;

    pub fn read(buf: &[u8; Self::SIZE]) -> Rule {
        Rule {
            src: Address::read_at(buf, 0),
            dst: Address::read_at(buf, 8),
            accept: get_u32(buf, 16) != 0,
        }
    }

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        self.src.write_at(buf, 0);
        self.dst.write_at(buf, 8);
        put_u32(buf, 16, self.accept as u32);
    }

    pub fn matches(&self, src: Address, dst: Address) -> bool {
        addr_matches(self.src, src) && addr_matches(self.dst, dst)
    }
}

/// Header of the rule-list block.
#[derive(Clone, Copy, Debug)]
pub struct RulesListHdr {
    pub magic: u64,
    pub start_rule: u32,
    pub nb_rules: u32,
}

impl RulesListHdr {
    pub const SIZE: usize = 16;

    pub fn read(buf: &[u8; Self::SIZE]) -> RulesListHdr {
        RulesListHdr {
            magic: get_u64(buf, 0),
            start_rule: get_u32(buf, 8),
            nb_rules: get_u32(buf, 12),
        }
    }

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        put_u64(buf, 0, self.magic);
        put_u32(buf, 8, self.start_rule);
        put_u32(buf, 12, self.nb_rules);
    }
}

/// Reply block of the `info` hypercall.
#[derive(Clone, Copy, Debug)]
pub struct InfoBlock {
    pub ring_magic: u64,
    pub data_magic: u64,
    pub port: u32,
}

impl InfoBlock {
    pub const SIZE: usize = 24;

    pub fn write(&self, buf: &mut [u8; Self::SIZE]) {
        put_u64(buf, 0, self.ring_magic);
        put_u64(buf, 8, self.data_magic);
        put_u32(buf, 16, self.port);
    }
}

/// Atomic view of the consumer pointer of a mapped ring header.
///
/// # Safety
///
/// `hdr` must map at least [`RING_HDR_SIZE`] bytes of a 4-aligned (in
/// practice page-aligned) ring header, live for `'a`.
pub unsafe fn rx_ptr_cell<'a>(hdr: NonNull<u8>) -> &'a AtomicU32 {
    unsafe { AtomicU32::from_ptr(hdr.as_ptr().add(RING_RX_OFFSET).cast()) }
}

/// Atomic view of the producer pointer of a mapped ring header.
///
/// # Safety
///
/// Same contract as [`rx_ptr_cell`].
pub unsafe fn tx_ptr_cell<'a>(hdr: NonNull<u8>) -> &'a AtomicU32 {
    unsafe { AtomicU32::from_ptr(hdr.as_ptr().add(RING_TX_OFFSET).cast()) }
}
