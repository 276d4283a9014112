// Adapted from the MIT licensed https://github.com/antialize/ordered-locks,
// wrapping the spin primitives instead of std::sync.

//! Compile-time ordering of locks into levels [`L1`], [`L2`] and [`L3`].
//! A lock at level `i` can only be acquired while holding locks at level
//! `i-1` or below, which makes deadlock by inverted acquisition impossible
//! to express.
//!
//! Lock levels here map onto the registry hierarchy: `L1` is the global
//! rwlock over the per-domain state pointers, `L2` the per-domain rwlock
//! over the ring buckets, `L3` the per-ring spin-lock over mutable ring
//! state. Holding the write side of an `L2` lock already excludes every
//! reader that could reach an `L3` lock underneath it, but the `L3` lock is
//! still taken on teardown paths to serialize with in-flight inserts.

use core::marker::PhantomData;

/// Lock level of a lock.
pub trait Level {}

/// Indicates that the implementor is a lower level than `O`.
pub trait Lower<O: Level>: Level {}

/// Base level; no lock lives here.
#[derive(Debug)]
pub struct L0 {}

#[derive(Debug)]
pub struct L1 {}

#[derive(Debug)]
pub struct L2 {}

#[derive(Debug)]
pub struct L3 {}

impl Level for L0 {}
impl Level for L1 {}
impl Level for L2 {}
impl Level for L3 {}

impl Lower<L1> for L0 {}
impl Lower<L2> for L0 {}
impl Lower<L3> for L0 {}

impl Lower<L2> for L1 {}
impl Lower<L3> for L1 {}

impl Lower<L3> for L2 {}

/// While this exists, only locks with a level higher than `L` may be taken.
/// Tokens are carried down the call stack to witness the current locking
/// level; they are zero-sized and vanish at runtime.
pub struct LockToken<'a, L: Level>(PhantomData<&'a mut L>);

impl<'a, L: Level> LockToken<'a, L> {
    /// Create a borrowed copy of self.
    pub fn token(&mut self) -> LockToken<'_, L> {
        LockToken(PhantomData)
    }

    pub fn downgraded<LP: Lower<L>>(_: LockToken<'a, LP>) -> Self {
        LockToken(PhantomData)
    }
}

/// Token witnessing that no lock is held while not borrowed.
pub struct CleanLockToken(());

impl CleanLockToken {
    /// Create a borrowed copy of self.
    pub fn token(&mut self) -> LockToken<'_, L0> {
        LockToken(PhantomData)
    }

    /// Create a new instance.
    ///
    /// # Safety
    ///
    /// Safe to call only while no lock of this hierarchy is held by the
    /// current CPU, and only one `CleanLockToken` may be live at a time on
    /// it. Hypercall entry points satisfy both.
    pub unsafe fn new() -> Self {
        CleanLockToken(())
    }
}

/// A spin-lock carrying a lock level.
///
/// Data is only reachable through the RAII guard, which in turn yields a
/// token for acquiring higher-level locks.
#[derive(Debug)]
pub struct Mutex<L: Level, T: ?Sized> {
    _phantom: PhantomData<L>,
    inner: spin::Mutex<T>,
}

impl<L: Level, T> Mutex<L, T> {
    pub const fn new(val: T) -> Self {
        Self {
            _phantom: PhantomData,
            inner: spin::Mutex::new(val),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> MutexGuard<'a, L, T> {
        MutexGuard {
            inner: self.inner.lock(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> Option<MutexGuard<'a, L, T>> {
        self.inner.try_lock().map(|inner| MutexGuard {
            inner,
            lock_token: LockToken::downgraded(lock_token),
        })
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// RAII guard of a [`Mutex`]; unlocks on drop.
pub struct MutexGuard<'a, L: Level, T: ?Sized> {
    inner: spin::MutexGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<'a, L: Level, T: ?Sized> MutexGuard<'a, L, T> {
    /// Split the guard into a mutable reference to the held content and a
    /// [`LockToken`] usable for further locking.
    pub fn token_split(&mut self) -> (&mut T, LockToken<'_, L>) {
        (&mut self.inner, self.lock_token.token())
    }
}

impl<'a, L: Level, T: ?Sized> core::ops::Deref for MutexGuard<'a, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, L: Level, T: ?Sized> core::ops::DerefMut for MutexGuard<'a, L, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// A reader-writer lock carrying a lock level.
#[derive(Debug)]
pub struct RwLock<L: Level, T: ?Sized> {
    _phantom: PhantomData<L>,
    inner: spin::RwLock<T>,
}

impl<L: Level, T> RwLock<L, T> {
    pub const fn new(val: T) -> Self {
        Self {
            _phantom: PhantomData,
            inner: spin::RwLock::new(val),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Locks with exclusive write access, spinning until available.
    pub fn write<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> RwLockWriteGuard<'a, L, T> {
        RwLockWriteGuard {
            inner: self.inner.write(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    /// Locks with shared read access, spinning until available.
    pub fn read<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> RwLockReadGuard<'a, L, T> {
        RwLockReadGuard {
            inner: self.inner.read(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }
}

/// RAII guard releasing exclusive write access on drop.
pub struct RwLockWriteGuard<'a, L: Level, T: ?Sized> {
    inner: spin::RwLockWriteGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<L: Level, T: ?Sized> RwLockWriteGuard<'_, L, T> {
    /// Split the guard into a mutable reference to the held content and a
    /// [`LockToken`] usable for further locking.
    pub fn token_split(&mut self) -> (&mut T, LockToken<'_, L>) {
        (&mut self.inner, self.lock_token.token())
    }
}

impl<L: Level, T: ?Sized> core::ops::Deref for RwLockWriteGuard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<L: Level, T: ?Sized> core::ops::DerefMut for RwLockWriteGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// RAII guard releasing shared read access on drop.
pub struct RwLockReadGuard<'a, L: Level, T: ?Sized> {
    inner: spin::RwLockReadGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<L: Level, T: ?Sized> RwLockReadGuard<'_, L, T> {
    /// Split the guard into a reference to the held content and a
    /// [`LockToken`] usable for further locking.
    pub fn token_split(&mut self) -> (&T, LockToken<'_, L>) {
        (&self.inner, self.lock_token.token())
    }
}

impl<L: Level, T: ?Sized> core::ops::Deref for RwLockReadGuard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
