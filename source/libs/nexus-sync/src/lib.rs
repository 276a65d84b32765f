// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! CONTEXT: Helping lock (mutual exclusion with time donation to the holder)
//! OWNERS: @kernel-sync-team
//! PUBLIC API: HelpingLock, HelpingLockGuard, ContextId, register_context_hooks
//! DEPENDS_ON: core atomics; scheduler hooks registered at boot
//! INVARIANTS: Non-reentrant; a waiter donates to the current owner while it spins
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Identifier of an execution context as seen by the scheduler.
///
/// Zero is reserved for "no owner"; [`ContextId::ANONYMOUS`] is used when no
/// scheduler hook is registered and the caller cannot be told apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextId(usize);

impl ContextId {
    /// Context that cannot be identified; reentrancy checks are skipped for it.
    pub const ANONYMOUS: Self = Self(usize::MAX);

    /// Creates an id from a raw non-zero value.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANONYMOUS {
            f.write_str("ctx:anon")
        } else {
            write!(f, "ctx:{:#x}", self.0)
        }
    }
}

const FREE: usize = 0;

// ---------------------------------------------------------------------------
// Registered scheduler hooks
// ---------------------------------------------------------------------------

static CURRENT_FN: AtomicPtr<()> = AtomicPtr::new(default_current as fn() -> ContextId as *mut ());
static HELP_FN: AtomicPtr<()> = AtomicPtr::new(default_help as fn(ContextId) as *mut ());

#[cfg(any(test, feature = "std"))]
fn default_current() -> ContextId {
    std::thread_local! {
        static MARKER: u8 = const { 0 };
    }
    MARKER.with(|m| ContextId(m as *const u8 as usize))
}

#[cfg(not(any(test, feature = "std")))]
fn default_current() -> ContextId {
    ContextId::ANONYMOUS
}

#[cfg(any(test, feature = "std"))]
fn default_help(_owner: ContextId) {
    std::thread::yield_now();
}

#[cfg(not(any(test, feature = "std")))]
fn default_help(_owner: ContextId) {
    core::hint::spin_loop();
}

/// Registers the scheduler hooks used by every [`HelpingLock`].
///
/// `current` identifies the running context. `help` is called by a blocked
/// locker with the owner's id and should switch to the owner (donating the
/// caller's priority and time slice) until it releases the lock or blocks.
/// Must be called during boot, before contended locking starts.
pub fn register_context_hooks(current: fn() -> ContextId, help: fn(ContextId)) {
    CURRENT_FN.store(current as *mut (), Ordering::Release);
    HELP_FN.store(help as *mut (), Ordering::Release);
    log::debug!(target: "sync", "helping-lock hooks registered");
}

/// Returns the id of the calling context through the registered hook.
#[inline]
pub fn current_context() -> ContextId {
    let ptr = CURRENT_FN.load(Ordering::Acquire);
    // SAFETY: the pointer is either `default_current` or was stored by
    // `register_context_hooks` from a valid `fn() -> ContextId`.
    let f: fn() -> ContextId = unsafe { core::mem::transmute(ptr) };
    f()
}

#[inline]
fn help(owner: ContextId) {
    let ptr = HELP_FN.load(Ordering::Acquire);
    // SAFETY: see `current_context`.
    let f: fn(ContextId) = unsafe { core::mem::transmute(ptr) };
    f(owner);
}

// ---------------------------------------------------------------------------
// HelpingLock
// ---------------------------------------------------------------------------

/// Mutual exclusion lock whose waiters help the current owner.
///
/// Besides the scoped [`HelpingLock::lock`] API the lock offers raw
/// [`acquire`](HelpingLock::acquire)/[`release`](HelpingLock::release) for
/// callers whose critical section spans several calls.
pub struct HelpingLock<T: ?Sized> {
    owner: AtomicUsize,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for HelpingLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for HelpingLock<T> {}

impl<T> HelpingLock<T> {
    /// Creates an unlocked lock around `value`.
    pub const fn new(value: T) -> Self {
        Self { owner: AtomicUsize::new(FREE), value: UnsafeCell::new(value) }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> HelpingLock<T> {
    /// Locks, helping the owner until the lock becomes free.
    pub fn lock(&self) -> HelpingLockGuard<'_, T> {
        self.acquire();
        HelpingLockGuard { lock: self }
    }

    /// Attempts to lock without waiting.
    pub fn try_lock(&self) -> Option<HelpingLockGuard<'_, T>> {
        let me = current_context();
        self.owner
            .compare_exchange(FREE, me.as_raw(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| HelpingLockGuard { lock: self })
    }

    /// Acquires the lock without producing a guard.
    ///
    /// The caller must pair this with exactly one [`release`](Self::release).
    pub fn acquire(&self) {
        let me = current_context();
        loop {
            match self.owner.compare_exchange_weak(
                FREE,
                me.as_raw(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(FREE) => continue,
                Err(raw) => {
                    let owner = ContextId(raw);
                    if me != ContextId::ANONYMOUS && owner == me {
                        debug_assert!(false, "helping lock re-acquired by its owner {me}");
                        log::error!(target: "sync", "LOCKDEP: re-lock by owner {}", me);
                    }
                    help(owner);
                }
            }
        }
    }

    /// Releases a lock obtained through [`acquire`](Self::acquire).
    ///
    /// # Safety
    ///
    /// The calling context must hold the lock and must not touch the
    /// protected value through pointers obtained while holding it afterwards.
    pub unsafe fn release(&self) {
        debug_assert!(self.is_locked(), "releasing a helping lock that is not held");
        self.owner.store(FREE, Ordering::Release);
    }

    /// Returns the current owner, if any.
    pub fn owner(&self) -> Option<ContextId> {
        ContextId::from_raw(self.owner.load(Ordering::Relaxed))
    }

    /// Returns whether any context holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != FREE
    }

    /// Returns whether the calling context holds the lock.
    ///
    /// Anonymous contexts are indistinguishable, so for them this only
    /// reports whether the lock is held at all.
    pub fn held_by_current(&self) -> bool {
        self.owner() == Some(current_context())
    }

    /// Raw pointer to the protected value.
    ///
    /// Dereferencing it is only sound while the caller holds the lock.
    pub fn data_ptr(&self) -> *mut T {
        self.value.get()
    }

    /// Mutable access through exclusive ownership of the lock itself.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for HelpingLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for HelpingLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelpingLock").field("owner", &self.owner()).finish_non_exhaustive()
    }
}

/// Scoped ownership of a [`HelpingLock`]; releases on drop.
pub struct HelpingLockGuard<'a, T: ?Sized> {
    lock: &'a HelpingLock<T>,
}

impl<'a, T: ?Sized> Deref for HelpingLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard proves ownership.
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for HelpingLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard proves ownership; `&mut self` makes the access exclusive.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for HelpingLockGuard<'a, T> {
    fn drop(&mut self) {
        // SAFETY: the guard proves ownership.
        unsafe { self.lock.release() };
    }
}
