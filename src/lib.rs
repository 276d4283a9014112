//! # V4V inter-domain messaging
//!
//! Hypervisor-resident datagram transport between guest domains. A guest
//! registers a small region of its own memory as a circular byte ring; other
//! domains (or the same domain on another port) enqueue variable-length
//! datagrams into that ring by hypercall. This crate is the core of the
//! facility:
//!
//! - the per-domain ring registry (hash-indexed, hierarchical locking);
//! - the ring storage protocol (scatter/gather enqueue into guest-owned
//!   circular buffers with shared producer/consumer pointers);
//! - the blocked-sender pending-notification system;
//! - the bulk ring-state query;
//! - the accept/reject rule table gating sends;
//! - domain lifecycle (init on creation, teardown on destruction).
//!
//! The surrounding hypervisor plugs in through the [`hv::Hypervisor`] trait:
//! event-channel signalling, page pinning, frame mapping and guest-memory
//! copies all cross that seam. The hypercall dispatch shim lives on the other
//! side of it and calls the methods of [`V4v`] directly.

#![cfg_attr(not(test), no_std)]
// Strict safety enforcement
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod error;
pub mod hv;
pub mod sync;
pub mod wire;

mod delivery;
mod mapper;
mod pending;
mod registry;
mod ring;
mod rules;
mod v4v;

pub use crate::{
    error::{Error, Result},
    hv::{DomainId, GuestAddr, Hypervisor, Mfn, Pfn, PAGE_SIZE},
    pending::PendingEntry,
    registry::V4V_HTABLE_SIZE,
    ring::Iov,
    v4v::V4v,
    wire::{Address, RingDataFlags, RingId, Rule},
};
