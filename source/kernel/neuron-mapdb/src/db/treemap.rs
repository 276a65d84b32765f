// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-page-size frame table (Treemap) and its physframes
//! OWNERS: @kernel-mm-team
//! PUBLIC API: crate-internal (Treemap, Physframe)
//! DEPENDS_ON: nexus-sync::HelpingLock, db::tree::MappingTree
//! INVARIANTS:
//!   - a frame's tree is only touched while its lock is held
//!   - nested frame locks are taken only while holding the lock of the frame owning the submap
//!   - the root of frame `k` is (owner, (va_offset >> shift) + k)
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use nexus_sync::HelpingLock;

use super::mapping::Mapping;
use super::pool::TreeAllocators;
use super::tree::MappingTree;
use super::LockPath;
use crate::error::MapdbError;
use crate::types::{page_size, PageShifts, SpaceId, Tag};

/// One physical frame at the granularity of its Treemap.
pub(crate) struct Physframe {
    pub(crate) tree: HelpingLock<Option<MappingTree>>,
}

impl Physframe {
    fn new() -> Self {
        Self { tree: HelpingLock::new(None) }
    }
}

/// Frame table for one page size.
pub(crate) struct Treemap {
    key_end: usize,
    owner: SpaceId,
    va_offset: usize,
    shifts: PageShifts,
    frames: Box<[Physframe]>,
    alloc: Arc<TreeAllocators>,
    nested: bool,
}

impl Treemap {
    /// Creates the top-level Treemap spanning `key_end` frames.
    pub(crate) fn new_root(
        alloc: &Arc<TreeAllocators>,
        key_end: usize,
        owner: SpaceId,
        shifts: PageShifts,
    ) -> Self {
        Self::build(alloc, key_end, owner, 0, shifts, false)
    }

    /// Creates a submap, charging it against the submap quota.
    pub(crate) fn new_nested(
        alloc: &Arc<TreeAllocators>,
        key_end: usize,
        owner: SpaceId,
        va_offset: usize,
        shifts: PageShifts,
    ) -> Result<Self, MapdbError> {
        if !alloc.reserve_submap() {
            log::debug!(target: "mapdb", "submap denied: quota");
            return Err(MapdbError::NoMemory);
        }
        Ok(Self::build(alloc, key_end, owner, va_offset, shifts, true))
    }

    fn build(
        alloc: &Arc<TreeAllocators>,
        key_end: usize,
        owner: SpaceId,
        va_offset: usize,
        shifts: PageShifts,
        nested: bool,
    ) -> Self {
        let frames: Vec<Physframe> = (0..key_end).map(|_| Physframe::new()).collect();
        Self {
            key_end,
            owner,
            va_offset,
            shifts,
            frames: frames.into_boxed_slice(),
            alloc: Arc::clone(alloc),
            nested,
        }
    }

    #[inline]
    pub(crate) fn page_shift(&self) -> u8 {
        self.shifts.largest()
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        page_size(self.page_shift())
    }

    #[inline]
    pub(crate) fn key_end(&self) -> usize {
        self.key_end
    }

    pub(crate) fn frame(&self, key: usize) -> &Physframe {
        &self.frames[key]
    }

    pub(crate) fn alloc(&self) -> &Arc<TreeAllocators> {
        &self.alloc
    }

    fn root_page(&self, key: usize) -> usize {
        (self.va_offset >> self.page_shift()) + key
    }

    fn new_tree(&self, key: usize) -> Result<MappingTree, MapdbError> {
        MappingTree::new(&self.alloc, Mapping::root(self.owner, self.root_page(key)))
    }

    /// Drops the tree of frame `key` once only its implicit root is left.
    ///
    /// A root handed away by a grant keeps its tree, since it could not be
    /// recreated from the frame number alone.
    pub(crate) fn settle(&self, key: usize, slot: &mut Option<MappingTree>) {
        let implicit = slot
            .as_ref()
            .is_some_and(|tree| tree.count() == 1 && tree.get(0).matches(self.owner, self.root_page(key)));
        if implicit {
            *slot = None;
        }
    }

    /// Virtual address of the mapping at `idx` of `tree`.
    pub(crate) fn vaddr(&self, tree: &MappingTree, idx: usize) -> Option<usize> {
        tree.get(idx).page_number().map(|page| page << self.page_shift())
    }

    /// Finds (space, va) in the frame containing byte offset `offs`.
    ///
    /// On success the frame lock, and the locks of every nested frame on the
    /// way, stay held and are recorded in `path`. Otherwise nothing stays
    /// locked by this call. A missing tree is created only for the implicit
    /// root; failing that allocation is the only error.
    pub(crate) fn lookup(
        &self,
        offs: usize,
        space: SpaceId,
        va: usize,
        path: &mut LockPath,
    ) -> Result<Option<usize>, MapdbError> {
        let shift = self.page_shift();
        let key = offs >> shift;
        if key >= self.key_end {
            return Ok(None);
        }
        let frame = &self.frames[key];
        frame.tree.acquire();
        // SAFETY: the frame lock is held from here until release or hand-over to `path`.
        let slot = unsafe { &mut *frame.tree.data_ptr() };
        if slot.is_none() {
            if space != self.owner || va >> shift != self.root_page(key) {
                // SAFETY: acquired above.
                unsafe { frame.tree.release() };
                return Ok(None);
            }
            match self.new_tree(key) {
                Ok(tree) => *slot = Some(tree),
                Err(err) => {
                    log::warn!(target: "mapdb", "no tree for frame {} of shift {}: {}", key, shift, err);
                    // SAFETY: acquired above.
                    unsafe { frame.tree.release() };
                    return Err(err);
                }
            }
        }
        let Some(tree) = slot.as_mut() else {
            // SAFETY: acquired above.
            unsafe { frame.tree.release() };
            return Ok(None);
        };
        path.push(NonNull::from(self), key, NonNull::from(&mut *tree));

        let page = va >> shift;
        let mut outcome = Ok(None);
        let mut cursor = Some(0);
        while let Some(i) = cursor {
            let entry = tree.get(i);
            if let Some(sub) = entry.submap_ref() {
                match sub.lookup(offs & (self.page_size() - 1), space, va, path) {
                    Ok(Some(found)) => return Ok(Some(found)),
                    Ok(None) => {}
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            } else if entry.matches(space, page) {
                return Ok(Some(i));
            }
            cursor = tree.next(i);
        }

        path.pop();
        self.settle(key, slot);
        // SAFETY: acquired above; `tree` is not used past this point.
        unsafe { frame.tree.release() };
        outcome
    }

    /// Inserts a mapping of `size` bytes below `parent`, which must be at this level.
    ///
    /// `offs` is the byte offset of the physical address inside this frame.
    pub(crate) fn insert(
        &self,
        tree: &mut MappingTree,
        parent: usize,
        space: SpaceId,
        va: usize,
        offs: usize,
        size: usize,
    ) -> Result<Option<usize>, MapdbError> {
        if size == self.page_size() {
            return tree.insert_child(parent, space, va >> self.page_shift()).map(Some);
        }
        if size > self.page_size() {
            return Err(MapdbError::OutOfRange);
        }
        let sub_shifts = self.shifts.tail().ok_or(MapdbError::OutOfRange)?;
        if sub_shifts.shift_of(size).is_none() {
            return Err(MapdbError::OutOfRange);
        }

        let sub_idx = match tree.find_submap(parent) {
            Some(idx) => idx,
            None => {
                let owner = tree.get(parent).space().ok_or(MapdbError::OutOfRange)?;
                let base = self.vaddr(tree, parent).ok_or(MapdbError::OutOfRange)?;
                let frames = self.page_size() >> sub_shifts.largest();
                let map = Treemap::new_nested(&self.alloc, frames, owner, base, sub_shifts)?;
                log::trace!(target: "mapdb", "submap {:#x} of {} at shift {}", base, owner, sub_shifts.largest());
                tree.insert_submap(parent, Box::new(map))?
            }
        };
        let Some(sub) = tree.get(sub_idx).submap_ref() else {
            return Err(MapdbError::OutOfRange);
        };
        sub.insert_below_root(offs & (self.page_size() - 1), space, va, size)?;
        Ok(None)
    }

    /// Inserts below the root of the frame containing `offs`, creating its tree if needed.
    fn insert_below_root(&self, offs: usize, space: SpaceId, va: usize, size: usize) -> Result<(), MapdbError> {
        let key = offs >> self.page_shift();
        let mut guard = self.frames[key].tree.lock();
        if guard.is_none() {
            *guard = Some(self.new_tree(key)?);
        }
        let result = match guard.as_mut() {
            Some(tree) => {
                let result = self.insert(tree, 0, space, va, offs, size).map(|_| ());
                tree.pack();
                result
            }
            None => Err(MapdbError::NoMemory),
        };
        self.settle(key, &mut guard);
        result
    }

    /// Revokes the subtree of `parent` (and `parent` itself with `me_too`).
    ///
    /// `offs_begin..offs_end` is the byte range inside this frame; children at
    /// this page size are revoked whole, submaps only over the overlap.
    /// `restrict` spares subtrees of immediate children with a different tag.
    pub(crate) fn flush(
        &self,
        tree: &mut MappingTree,
        parent: usize,
        me_too: bool,
        restrict: Option<Tag>,
        offs_begin: usize,
        offs_end: usize,
    ) {
        let parent_depth = tree.get(parent).depth();
        let restrict = if me_too { None } else { restrict };
        let whole = me_too || (offs_begin == 0 && offs_end >= self.page_size());
        let mut owner_depth = parent_depth;
        let mut skip_below: Option<u8> = None;
        let mut cursor = parent;

        while let Some(i) = tree.next_child(parent, cursor) {
            cursor = i;
            let entry = tree.get(i);
            let depth = entry.depth();
            if let Some(skipped) = skip_below {
                if depth > skipped {
                    continue;
                }
                skip_below = None;
            }

            if entry.is_submap() {
                let owned_by_parent = owner_depth == parent_depth;
                if owned_by_parent && !(whole && restrict.is_none()) {
                    if let Some(sub) = entry.submap_ref() {
                        sub.flush_range(offs_begin, offs_end.min(self.page_size()), restrict);
                    }
                } else {
                    tree.kill(i);
                }
                continue;
            }

            owner_depth = depth;
            if depth == parent_depth + 1 && restrict.is_some_and(|tag| entry.tag() != Some(tag)) {
                skip_below = Some(depth);
                continue;
            }
            tree.kill(i);
        }

        if me_too && parent != 0 {
            tree.kill(parent);
        }
        tree.trim_tail();
    }

    /// Revokes the children of every subframe root overlapping `offs_begin..offs_end`.
    fn flush_range(&self, offs_begin: usize, offs_end: usize, restrict: Option<Tag>) {
        let shift = self.page_shift();
        let size = self.page_size();
        let first = offs_begin >> shift;
        let end = ((offs_end + size - 1) >> shift).min(self.key_end);
        for key in first..end {
            let mut guard = self.frames[key].tree.lock();
            let base = key << shift;
            if let Some(tree) = guard.as_mut() {
                let begin = offs_begin.saturating_sub(base);
                let stop = (offs_end - base).min(size);
                self.flush(tree, 0, false, restrict, begin, stop);
                tree.pack();
            }
            self.settle(key, &mut guard);
        }
    }

    /// Moves this submap, and every nested root below it, to `owner` at `va_offset`.
    pub(crate) fn regrant(&mut self, owner: SpaceId, va_offset: usize) {
        self.owner = owner;
        self.va_offset = va_offset;
        let shift = self.page_shift();
        for key in 0..self.key_end {
            let page = self.root_page(key);
            let mut guard = self.frames[key].tree.lock();
            let Some(tree) = guard.as_mut() else {
                continue;
            };
            tree.get_mut(0).set_owner(owner, page);
            if let Some(sub_idx) = tree.find_submap(0) {
                if let Some(sub) = tree.get_mut(sub_idx).submap_mut() {
                    sub.regrant(owner, page << shift);
                }
            }
        }
    }
}

impl Drop for Treemap {
    fn drop(&mut self) {
        if self.nested {
            self.alloc.release_submap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapdbConfig;

    const SIGMA0: SpaceId = SpaceId::task(0);

    fn nested(frames: usize) -> Treemap {
        let config = MapdbConfig::new(SIGMA0, 1 << 22, &[22, 12]).unwrap();
        let alloc = Arc::new(TreeAllocators::new(&config));
        Treemap::new_nested(&alloc, frames, SIGMA0, 3 << 22, PageShifts::new(&[12]).unwrap()).unwrap()
    }

    #[test]
    fn nested_maps_count_against_quota() {
        let config = MapdbConfig::new(SIGMA0, 1 << 22, &[22, 12]).unwrap().with_submap_limit(Some(1));
        let alloc = Arc::new(TreeAllocators::new(&config));
        let shifts = PageShifts::new(&[12]).unwrap();
        let first = Treemap::new_nested(&alloc, 4, SIGMA0, 0, shifts).unwrap();
        assert!(Treemap::new_nested(&alloc, 4, SIGMA0, 0, shifts).is_err());
        drop(first);
        assert_eq!(alloc.submaps_in_use(), 0);
        assert!(Treemap::new_nested(&alloc, 4, SIGMA0, 0, shifts).is_ok());
    }

    #[test]
    fn implicit_roots_follow_va_offset() {
        let map = nested(8);
        assert_eq!(map.root_page(0), (3 << 22) >> 12);
        assert_eq!(map.root_page(5), ((3 << 22) >> 12) + 5);
    }

    #[test]
    fn regrant_rewrites_existing_roots() {
        let mut map = nested(8);
        map.insert_below_root(2 << 12, SpaceId::task(4), 0x7000, 4096).unwrap();
        map.regrant(SpaceId::task(9), 5 << 22);
        let guard = map.frames[2].tree.lock();
        let tree = guard.as_ref().unwrap();
        assert!(tree.get(0).matches(SpaceId::task(9), ((5 << 22) >> 12) + 2));
        assert!(map.frames[1].tree.lock().is_none());
    }

    #[test]
    fn settle_drops_root_only_trees() {
        let map = nested(2);
        let mut slot = Some(map.new_tree(0).unwrap());
        map.settle(0, &mut slot);
        assert!(slot.is_none());

        let mut granted = Some(map.new_tree(1).unwrap());
        if let Some(tree) = granted.as_mut() {
            tree.get_mut(0).set_owner(SpaceId::task(7), 0x10);
        }
        map.settle(1, &mut granted);
        assert!(granted.is_some());
    }
}
