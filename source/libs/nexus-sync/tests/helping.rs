// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Helping-lock donation through registered scheduler hooks
//! OWNERS: @kernel-sync-team
//! STATUS: Functional
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCOPE:
//!   - register_context_hooks replaces the default context and help hooks
//!   - a blocked locker calls `help` with the owner's ContextId
//!
//! TEST_SCENARIOS:
//!   - owner_is_the_registered_context(): raw acquire records the hook's id
//!   - contended_lock_helps_its_owner(): waiter donates to the holder until release
//!
//! DEPENDENCIES:
//!   - own binary: the hooks are process-global and must not leak into unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_sync::{current_context, register_context_hooks, ContextId, HelpingLock};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
static HELP_CALLS: AtomicUsize = AtomicUsize::new(0);
static LAST_HELPED: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

fn current() -> ContextId {
    ID.with(|id| ContextId::from_raw(*id).unwrap())
}

fn help(owner: ContextId) {
    LAST_HELPED.store(owner.as_raw(), Ordering::SeqCst);
    HELP_CALLS.fetch_add(1, Ordering::SeqCst);
    std::thread::yield_now();
}

fn install() {
    register_context_hooks(current, help);
}

#[test]
fn owner_is_the_registered_context() {
    install();
    let lock = HelpingLock::new(());
    lock.acquire();
    assert_eq!(current_context(), current());
    assert_eq!(lock.owner(), Some(current()));
    assert!(lock.held_by_current());
    // SAFETY: acquired above.
    unsafe { lock.release() };
    assert_eq!(lock.owner(), None);
}

#[test]
fn contended_lock_helps_its_owner() {
    install();
    let lock = Arc::new(HelpingLock::new(0_u32));
    let guard = lock.lock();
    let me = current();
    let before = HELP_CALLS.load(Ordering::SeqCst);

    let waiter = {
        let lock = Arc::clone(&lock);
        std::thread::spawn(move || {
            *lock.lock() += 1;
            current()
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while HELP_CALLS.load(Ordering::SeqCst) == before {
        assert!(Instant::now() < deadline, "waiter never helped the owner");
        std::thread::yield_now();
    }
    assert_eq!(LAST_HELPED.load(Ordering::SeqCst), me.as_raw());
    assert_eq!(*guard, 0);
    drop(guard);

    let waiter_id = waiter.join().unwrap();
    assert_ne!(waiter_id, me);
    assert_eq!(*lock.lock(), 1);
}
