// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Size-classed slot-array pools backing mapping trees and submap accounting
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TreeAllocators, SIZE_FACTOR, SIZE_ID_MAX
//! DEPENDS_ON: spin::Mutex, config::MapdbConfig
//! INVARIANTS: Arrays of class `id` hold exactly SIZE_FACTOR << id slots; returned arrays hold only end tags
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Growing or shrinking a mapping tree means taking an array of the next
//! class from here and moving the live slots over, so every array of one
//! class has the same length and recycled arrays can be reused as-is.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::mapping::Mapping;
use crate::config::MapdbConfig;

/// Capacity of the smallest tree class.
pub const SIZE_FACTOR: usize = 4;
/// Largest size class; its trees hold `SIZE_FACTOR << SIZE_ID_MAX` slots.
pub const SIZE_ID_MAX: u8 = 9;

const CLASSES: usize = SIZE_ID_MAX as usize + 1;
/// Recycled arrays kept per class before they go back to the heap.
const CACHE_DEPTH: usize = 16;

/// Number of slots of a tree of class `size_id`.
#[inline]
pub const fn capacity_of(size_id: u8) -> usize {
    SIZE_FACTOR << size_id
}

struct Pool {
    cached: Mutex<Vec<Box<[Mapping]>>>,
}

impl Pool {
    const fn new() -> Self {
        Self { cached: Mutex::new(Vec::new()) }
    }
}

/// Allocator handle shared by every Treemap of one database.
///
/// Created once at boot and injected; the pools themselves fill lazily.
pub struct TreeAllocators {
    pools: [Pool; CLASSES],
    slots_in_use: AtomicUsize,
    slot_limit: Option<usize>,
    submaps_in_use: AtomicUsize,
    submap_limit: Option<usize>,
}

impl TreeAllocators {
    /// Creates empty pools with the quotas of `config`.
    pub fn new(config: &MapdbConfig) -> Self {
        const POOL: Pool = Pool::new();
        Self {
            pools: [POOL; CLASSES],
            slots_in_use: AtomicUsize::new(0),
            slot_limit: config.tree_slot_limit,
            submaps_in_use: AtomicUsize::new(0),
            submap_limit: config.submap_limit,
        }
    }

    /// Takes an array of class `size_id`, all slots set to end tags.
    pub(crate) fn alloc(&self, size_id: u8) -> Option<Box<[Mapping]>> {
        debug_assert!(size_id <= SIZE_ID_MAX);
        let slots = capacity_of(size_id);
        if !reserve(&self.slots_in_use, slots, self.slot_limit) {
            log::debug!(target: "mapdb", "tree class {} denied: slot quota", size_id);
            return None;
        }
        if let Some(array) = self.pools[size_id as usize].cached.lock().pop() {
            return Some(array);
        }
        Some((0..slots).map(|_| Mapping::end()).collect())
    }

    /// Returns an array to the pool of its class.
    pub(crate) fn dealloc(&self, size_id: u8, mut array: Box<[Mapping]>) {
        debug_assert_eq!(array.len(), capacity_of(size_id));
        // Drops any nested Treemap still linked from the array.
        for slot in array.iter_mut() {
            slot.set_end();
        }
        self.slots_in_use.fetch_sub(array.len(), Ordering::Relaxed);
        let mut cached = self.pools[size_id as usize].cached.lock();
        if cached.len() < CACHE_DEPTH {
            cached.push(array);
        }
    }

    /// Charges one nested Treemap against the submap quota.
    pub(crate) fn reserve_submap(&self) -> bool {
        reserve(&self.submaps_in_use, 1, self.submap_limit)
    }

    /// Returns a submap charge taken by [`reserve_submap`](Self::reserve_submap).
    pub(crate) fn release_submap(&self) {
        self.submaps_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Slots currently handed out across all classes.
    pub fn slots_in_use(&self) -> usize {
        self.slots_in_use.load(Ordering::Relaxed)
    }

    /// Nested Treemaps currently alive.
    pub fn submaps_in_use(&self) -> usize {
        self.submaps_in_use.load(Ordering::Relaxed)
    }
}

fn reserve(counter: &AtomicUsize, amount: usize, limit: Option<usize>) -> bool {
    match limit {
        None => {
            counter.fetch_add(amount, Ordering::Relaxed);
            true
        }
        Some(limit) => counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(amount).filter(|&next| next <= limit)
            })
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpaceId;

    fn allocators(limit: Option<usize>) -> TreeAllocators {
        let config = MapdbConfig::new(SpaceId::task(0), 1 << 22, &[22, 12])
            .unwrap()
            .with_tree_slot_limit(limit);
        TreeAllocators::new(&config)
    }

    #[test]
    fn classes_double_in_size() {
        assert_eq!(capacity_of(0), 4);
        assert_eq!(capacity_of(1), 8);
        assert_eq!(capacity_of(SIZE_ID_MAX), 2048);
    }

    #[test]
    fn arrays_start_as_end_tags_and_are_recycled() {
        let pools = allocators(None);
        let array = pools.alloc(2).unwrap();
        assert_eq!(array.len(), 16);
        assert!(array.iter().all(Mapping::is_end_tag));
        assert_eq!(pools.slots_in_use(), 16);
        let ptr = array.as_ptr();
        pools.dealloc(2, array);
        assert_eq!(pools.slots_in_use(), 0);
        let again = pools.alloc(2).unwrap();
        assert_eq!(again.as_ptr(), ptr);
        pools.dealloc(2, again);
    }

    #[test]
    fn slot_limit_denies_growth() {
        let pools = allocators(Some(12));
        let small = pools.alloc(1).unwrap();
        assert!(pools.alloc(0).is_some_and(|a| {
            pools.dealloc(0, a);
            true
        }));
        assert!(pools.alloc(1).is_none());
        pools.dealloc(1, small);
        assert!(pools.alloc(1).is_some());
    }
}
