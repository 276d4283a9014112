//! Synchronization primitives.
//!
//! All locks in this crate go through the ordered layer so the L1 → L2 → L3
//! acquisition order of the registry hierarchy is checked at compile time.

mod ordered;

pub use ordered::{
    CleanLockToken, Level, LockToken, Lower, Mutex, MutexGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard, L0, L1, L2, L3,
};
