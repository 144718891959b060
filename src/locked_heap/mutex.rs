//! The lock that guards a [`LockedHeap`](super::LockedHeap).
//!
//! `Mutex<T, L>` is an `UnsafeCell<T>` plus a raw lock `L`. The lock only
//! has to say "held" or "not held"; the guard does the rest. Choosing `L`
//! picks the threading model: [`SingleThreadedLock`] for a heap confined to
//! one thread, [`SpinLock`] for one shared between threads.

use core::{
    cell::{Cell, UnsafeCell},
    mem,
    ops::{Deref, DerefMut},
};

/// A raw lock with no data of its own.
///
/// # Safety
///
/// `lock` must not return while another call's lock is still held. Holding
/// the lock grants `&mut` access to the whole heap, so a second holder would
/// alias it:
///
/// * A `Sync` implementation must exclude every other thread.
///
/// * Every implementation must also refuse re-entry from the thread that
///   already holds it, for example a heap operation reached again from inside
///   a heap operation. Refusal may panic, abort, or never return.
pub unsafe trait Lock {
    /// Take the lock, waiting or refusing if it is held.
    fn lock(&self);

    /// Release a lock taken by [`Lock::lock`].
    fn unlock(&self);
}

/// A [`Lock`] for a heap that never leaves its thread.
///
/// It is not `Sync`, so it costs no atomics. Re-entry panics.
#[derive(Debug)]
pub struct SingleThreadedLock {
    held: Cell<bool>,
}

impl SingleThreadedLock {
    /// A new, released lock.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            held: Cell::new(false),
        }
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.held.replace(true), "re-entrant heap access");
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.held.get());
        self.held.set(false);
    }
}

/// A [`Lock`] that busy-waits, for a heap shared between threads.
///
/// Re-entry from the holding thread never returns.
#[derive(Debug, Default)]
pub struct SpinLock {
    inner: spin::mutex::SpinMutex<()>,
}

impl SpinLock {
    /// A new, released lock.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            inner: spin::mutex::SpinMutex::new(()),
        }
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        // The `MutexGuard` below stands in for this guard.
        mem::forget(self.inner.lock());
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.inner.is_locked());
        // Safety: only a `MutexGuard` calls this, and it holds the lock taken
        // in `lock`.
        unsafe { self.inner.force_unlock() }
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: moving the mutex moves `T` and `L` with it.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: a `Sync` lock excludes other threads, per the `Lock` contract. `T`
// must be `Send` because a guard taken on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        Mutex {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    pub(super) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Exclusive access to the value, until dropped.
pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock, and `&mut self` rules out any
        // other borrow through it.
        unsafe { &mut *self.mutex.value.get() }
    }
}
