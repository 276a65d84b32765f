// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pre-order encoded mapping tree of one physical frame
//! OWNERS: @kernel-mm-team
//! PUBLIC API: crate-internal (MappingTree)
//! DEPENDS_ON: db::pool::TreeAllocators, db::mapping::Mapping
//! INVARIANTS:
//!   - slot 0 is the root (depth 0); a live slot's parent is the nearest preceding slot of smaller depth
//!   - a submap slot is the first live slot after the mapping owning it
//!   - every slot after the first end tag is an end tag
//!   - after `pack` the last slot is unused, unless the largest class is full
//!   - count + empty_count <= capacity
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::boxed::Box;
use alloc::sync::Arc;

use static_assertions::const_assert;

use super::mapping::{Mapping, DEPTH_EMPTY, DEPTH_END, DEPTH_MAX, DEPTH_SUBMAP};
use super::pool::{capacity_of, TreeAllocators, SIZE_ID_MAX};
use super::treemap::Treemap;
use crate::error::MapdbError;
use crate::types::SpaceId;

const_assert!(DEPTH_MAX < DEPTH_SUBMAP);
const_assert!(DEPTH_SUBMAP < DEPTH_EMPTY);
const_assert!(DEPTH_EMPTY < DEPTH_END);
// Every class must leave room for the root plus one free slot.
const_assert!(capacity_of(0) >= 2);

/// Size-classed slot array plus its header.
pub(crate) struct MappingTree {
    count: usize,
    empty_count: usize,
    size_id: u8,
    slots: Box<[Mapping]>,
    alloc: Arc<TreeAllocators>,
}

/// Header numbers of a tree, for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TreeStats {
    /// Live slots, including the root and submap links.
    pub live: usize,
    /// Tombstoned slots not yet reclaimed.
    pub tombstones: usize,
    /// Capacity class (capacity is `4 << size_class`).
    pub size_class: u8,
    /// Total slots of the array.
    pub capacity: usize,
}

impl MappingTree {
    /// Creates a smallest-class tree holding only `root`.
    pub(crate) fn new(alloc: &Arc<TreeAllocators>, root: Mapping) -> Result<Self, MapdbError> {
        debug_assert!(root.is_root());
        let mut slots = alloc.alloc(0).ok_or(MapdbError::NoMemory)?;
        slots[0] = root;
        Ok(Self { count: 1, empty_count: 0, size_id: 0, slots, alloc: Arc::clone(alloc) })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn stats(&self) -> TreeStats {
        TreeStats {
            live: self.count,
            tombstones: self.empty_count,
            size_class: self.size_id,
            capacity: self.capacity(),
        }
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> &Mapping {
        &self.slots[idx]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Mapping {
        &mut self.slots[idx]
    }

    /// Next live slot after `idx`, in pre-order.
    pub(crate) fn next(&self, idx: usize) -> Option<usize> {
        for i in idx + 1..self.capacity() {
            let slot = &self.slots[i];
            if slot.is_end_tag() {
                return None;
            }
            if !slot.unused() {
                return Some(i);
            }
        }
        None
    }

    /// Next live slot after `cursor` inside the subtree of `parent`.
    pub(crate) fn next_child(&self, parent: usize, cursor: usize) -> Option<usize> {
        let depth = self.slots[parent].depth();
        self.next(cursor).filter(|&i| self.slots[i].depth() > depth)
    }

    /// Nearest preceding slot of smaller depth; `None` for the root.
    pub(crate) fn parent(&self, idx: usize) -> Option<usize> {
        let depth = self.slots[idx].depth();
        (0..idx).rev().find(|&i| self.slots[i].depth() < depth)
    }

    /// The submap owned by `parent`, which is always its first live child.
    pub(crate) fn find_submap(&self, parent: usize) -> Option<usize> {
        if self.slots[parent].is_submap() {
            return None;
        }
        self.next(parent).filter(|&i| self.slots[i].is_submap())
    }

    /// Inserts a regular child of `parent` and returns its position.
    ///
    /// Positions up to and including `parent` do not move.
    pub(crate) fn insert_child(&mut self, parent: usize, space: SpaceId, page: usize) -> Result<usize, MapdbError> {
        let depth = self.slots[parent].depth();
        if depth >= DEPTH_MAX {
            return Err(MapdbError::DepthExceeded);
        }
        let idx = self.make_room(parent, false)?;
        self.occupy(idx, Mapping::page(depth + 1, space, page));
        Ok(idx)
    }

    /// Links `map` as the first child of `parent`.
    pub(crate) fn insert_submap(&mut self, parent: usize, map: Box<Treemap>) -> Result<usize, MapdbError> {
        debug_assert!(self.find_submap(parent).is_none());
        let idx = self.make_room(parent, true)?;
        self.occupy(idx, Mapping::submap(map));
        Ok(idx)
    }

    fn occupy(&mut self, idx: usize, mapping: Mapping) {
        if self.slots[idx].depth() == DEPTH_EMPTY {
            self.empty_count -= 1;
        }
        self.slots[idx] = mapping;
        self.count += 1;
    }

    /// Moves an unused slot to where a new child of `parent` belongs.
    fn make_room(&mut self, parent: usize, submap: bool) -> Result<usize, MapdbError> {
        let cap = self.capacity();
        if !self.slots[cap - 1].unused() {
            log::warn!(target: "mapdb", "insert into full tree (cap {})", cap);
            return Err(MapdbError::NoMemory);
        }
        let parent_depth = self.slots[parent].depth();
        let mut free = None;
        let mut insert = parent + 1;
        while insert < cap {
            let slot = &self.slots[insert];
            if slot.is_end_tag() {
                break;
            }
            if slot.unused() {
                free = Some(insert);
            } else if submap {
                break;
            } else {
                let depth = slot.depth();
                if depth <= parent_depth || (free.is_some() && depth <= parent_depth + 1) {
                    break;
                }
            }
            insert += 1;
        }

        if let Some(free) = free {
            // Siblings between the hole and the insertion point move up.
            self.slots[free..insert].rotate_left(1);
            return Ok(insert - 1);
        }

        // Everything from the insertion point moves down into the next unused slot.
        let Some(hole) = (insert..cap).find(|&i| self.slots[i].unused()) else {
            return Err(MapdbError::NoMemory);
        };
        self.slots[insert..=hole].rotate_right(1);
        Ok(insert)
    }

    /// Tombstones a live non-root slot.
    pub(crate) fn kill(&mut self, idx: usize) {
        debug_assert!(idx != 0 && !self.slots[idx].unused());
        self.slots[idx].set_unused();
        self.count -= 1;
        self.empty_count += 1;
    }

    /// Turns tombstones past the last live slot back into end tags.
    pub(crate) fn trim_tail(&mut self) {
        let last_live = (0..self.capacity()).rev().find(|&i| !self.slots[i].unused()).unwrap_or(0);
        for slot in self.slots[last_live + 1..].iter_mut() {
            if slot.is_end_tag() {
                break;
            }
            slot.set_end();
            self.empty_count -= 1;
        }
    }

    /// Restores a free last slot, resizing by one class at most.
    ///
    /// Returns `false` if the tree is still full afterwards.
    pub(crate) fn pack(&mut self) -> bool {
        let cap = self.capacity();
        if self.size_id > 0 && self.count * 4 < cap && self.resize(self.size_id - 1) {
            self.verify();
            return true;
        }
        if self.slots[cap - 1].unused() {
            return true;
        }
        if self.count * 4 < cap * 3 || self.size_id == SIZE_ID_MAX {
            self.compact();
        } else if !self.resize(self.size_id + 1) {
            log::warn!(target: "mapdb", "tree growth to class {} failed; compacting", self.size_id + 1);
            self.compact();
        }
        let restored = self.slots[self.capacity() - 1].unused();
        if !restored {
            log::warn!(target: "mapdb", "mapping tree full at class {}", self.size_id);
        }
        self.verify();
        restored
    }

    fn resize(&mut self, size_id: u8) -> bool {
        let Some(mut dst) = self.alloc.alloc(size_id) else {
            return false;
        };
        debug_assert!(self.count <= dst.len());
        let mut w = 0;
        for slot in self.slots.iter_mut().filter(|s| !s.unused()) {
            core::mem::swap(&mut dst[w], slot);
            w += 1;
        }
        let old = core::mem::replace(&mut self.slots, dst);
        self.alloc.dealloc(self.size_id, old);
        self.size_id = size_id;
        self.empty_count = 0;
        true
    }

    /// In-place copy-compaction: live slots slide to the front in order.
    fn compact(&mut self) {
        let mut w = 0;
        for r in 0..self.capacity() {
            if self.slots[r].is_end_tag() {
                break;
            }
            if !self.slots[r].unused() {
                self.slots.swap(w, r);
                w += 1;
            }
        }
        for slot in self.slots[w..].iter_mut() {
            slot.set_end();
        }
        self.empty_count = 0;
    }

    #[cfg(any(debug_assertions, feature = "debug_tree_verify"))]
    pub(crate) fn verify(&self) {
        if let Err(what) = self.check_integrity() {
            panic!("mapping tree corrupt: {what}");
        }
    }

    #[cfg(not(any(debug_assertions, feature = "debug_tree_verify")))]
    #[inline]
    pub(crate) fn verify(&self) {}

    /// Checks the structural invariants other than the free last slot.
    pub(crate) fn check_integrity(&self) -> Result<(), &'static str> {
        if !self.slots[0].is_root() {
            return Err("slot 0 is not the root");
        }
        let (mut live, mut empty) = (0usize, 0usize);
        let mut ended = false;
        let mut prev_depth = 0u8;
        let mut prev_was_owner = false;
        for (i, slot) in self.slots.iter().enumerate() {
            if ended {
                if !slot.is_end_tag() {
                    return Err("slot after the end tag");
                }
                continue;
            }
            match slot.depth() {
                DEPTH_END => ended = true,
                DEPTH_EMPTY => empty += 1,
                DEPTH_SUBMAP => {
                    if !prev_was_owner {
                        return Err("submap is not the first child of its owner");
                    }
                    live += 1;
                    prev_was_owner = false;
                }
                depth => {
                    if i != 0 && (depth == 0 || depth > prev_depth + 1) {
                        return Err("depth jumps in pre-order");
                    }
                    live += 1;
                    prev_depth = depth;
                    prev_was_owner = true;
                }
            }
        }
        if live != self.count || empty != self.empty_count {
            return Err("header counts disagree with slots");
        }
        if live + empty > self.capacity() {
            return Err("more used slots than capacity");
        }
        Ok(())
    }
}

impl Drop for MappingTree {
    fn drop(&mut self) {
        self.verify();
        let slots = core::mem::take(&mut self.slots);
        self.alloc.dealloc(self.size_id, slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapdbConfig;

    const ROOT: SpaceId = SpaceId::task(0);

    fn pools() -> Arc<TreeAllocators> {
        let config = MapdbConfig::new(ROOT, 1 << 22, &[22, 12]).unwrap();
        Arc::new(TreeAllocators::new(&config))
    }

    fn depths(tree: &MappingTree) -> Vec<u8> {
        tree.slots.iter().map(Mapping::depth).collect()
    }

    fn tree() -> MappingTree {
        MappingTree::new(&pools(), Mapping::root(ROOT, 7)).unwrap()
    }

    #[test]
    fn children_keep_preorder() {
        let mut t = tree();
        let a = t.insert_child(0, SpaceId::task(1), 1).unwrap();
        let b = t.insert_child(a, SpaceId::task(2), 2).unwrap();
        assert!(t.pack());
        let c = t.insert_child(0, SpaceId::task(3), 3).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(t.parent(b), Some(a));
        assert_eq!(t.parent(c), Some(0));
        assert_eq!(t.parent(0), None);
        assert!(t.check_integrity().is_ok());
    }

    #[test]
    fn insert_reuses_tombstone_among_siblings() {
        let mut t = tree();
        for task in 1..=2 {
            t.insert_child(0, SpaceId::task(task), task as usize).unwrap();
            t.pack();
        }
        t.kill(1);
        let idx = t.insert_child(0, SpaceId::task(9), 9).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(t.stats().tombstones, 0);
        assert_eq!(t.count(), 3);
        assert!(t.check_integrity().is_ok());
    }

    #[test]
    fn submap_is_first_child() {
        let mut t = tree();
        let a = t.insert_child(0, SpaceId::task(1), 1).unwrap();
        t.pack();
        assert!(t.find_submap(0).is_none());
        let map = Treemap::new_nested(&pools(), 4, ROOT, 7 << 22, crate::types::PageShifts::new(&[12]).unwrap());
        let s = t.insert_submap(0, Box::new(map.unwrap())).unwrap();
        assert_eq!(s, 1);
        assert_eq!(t.find_submap(0), Some(1));
        assert_eq!(t.parent(a + 1), Some(0));
        assert!(t.get(2).matches(SpaceId::task(1), 1));
        assert!(t.check_integrity().is_ok());
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut t = tree();
        let mut parent = 0;
        for depth in 1..=DEPTH_MAX as usize {
            parent = t.insert_child(parent, SpaceId::task(1), depth).unwrap();
            assert!(t.pack());
        }
        assert_eq!(t.get(parent).depth(), DEPTH_MAX);
        assert_eq!(t.insert_child(parent, SpaceId::task(2), 0), Err(MapdbError::DepthExceeded));
    }

    #[test]
    fn pack_grows_and_shrinks() {
        let mut t = tree();
        for page in 0..40 {
            t.insert_child(0, SpaceId::task(1), page).unwrap();
            assert!(t.pack());
        }
        assert!(t.capacity() >= 41);
        let grown = t.stats().size_class;
        while let Some(i) = t.next(0) {
            t.kill(i);
        }
        t.trim_tail();
        assert!(t.pack());
        assert_eq!(t.stats().size_class, grown - 1);
        assert_eq!(t.count(), 1);
        assert!(t.check_integrity().is_ok());
    }

    #[test]
    fn trim_tail_reclaims_trailing_tombstones_only() {
        let mut t = tree();
        for page in 0..2 {
            t.insert_child(0, SpaceId::task(1), page).unwrap();
            t.pack();
        }
        t.kill(2);
        t.kill(1);
        t.trim_tail();
        assert_eq!(depths(&t), vec![0, DEPTH_END, DEPTH_END, DEPTH_END]);
        assert_eq!(t.stats().tombstones, 0);
    }

    #[test]
    fn full_tree_refuses_insert() {
        let mut t = tree();
        for page in 0..3 {
            t.insert_child(0, SpaceId::task(1), page).unwrap();
        }
        assert_eq!(t.insert_child(0, SpaceId::task(1), 9), Err(MapdbError::NoMemory));
        assert!(t.pack());
        assert!(t.insert_child(0, SpaceId::task(1), 9).is_ok());
    }
}
