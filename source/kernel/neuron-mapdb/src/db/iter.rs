// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pre-order walk over the descendants of a mapping, across submaps
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbIter
//! DEPENDS_ON: db::treemap (frame locks), db::tree
//! INVARIANTS:
//!   - each nested level holds exactly the lock of the subframe it walks
//!   - dropping the iterator releases every nested lock it holds
//!   - a tag restriction applies only to immediate children of the walk's root
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::marker::PhantomData;
use core::ptr::NonNull;

use super::mapping::MappingInfo;
use super::tree::MappingTree;
use super::treemap::Treemap;
use crate::types::{Tag, MAX_PAGE_LEVELS};

#[derive(Clone, Copy)]
struct Level {
    map: NonNull<Treemap>,
    tree: NonNull<MappingTree>,
    parent: usize,
    cursor: usize,
    restrict: Option<Tag>,
    offs_begin: usize,
    offs_end: usize,
    /// Depth of the regular slot most recently passed; owns a following submap.
    owner_depth: u8,
    skip_below: Option<u8>,
    /// Nested levels hold the lock of frame `key` and walk up to `key_end`.
    nested: bool,
    key: usize,
    key_end: usize,
    span_begin: usize,
    span_end: usize,
}

impl Level {
    fn enter_frame(&mut self, key: usize, tree: NonNull<MappingTree>) {
        // SAFETY: the Treemap outlives the iterator (see MapdbIter).
        let map = unsafe { self.map.as_ref() };
        let base = key << map.page_shift();
        self.key = key;
        self.tree = tree;
        self.parent = 0;
        self.cursor = 0;
        self.owner_depth = 0;
        self.skip_below = None;
        self.offs_begin = self.span_begin.saturating_sub(base).min(map.page_size());
        self.offs_end = self.span_end.saturating_sub(base).min(map.page_size());
    }
}

/// Descendants of one mapping, yielded as [`MappingInfo`] snapshots.
///
/// Borrows the [`Frame`](super::Frame) that locks the walk's root, so the
/// root tree cannot change underneath. Submap frames are locked one at a
/// time while they are walked.
pub struct MapdbIter<'f> {
    levels: [Option<Level>; MAX_PAGE_LEVELS],
    len: usize,
    _frame: PhantomData<&'f mut ()>,
}

impl<'f> MapdbIter<'f> {
    pub(crate) fn new(
        map: NonNull<Treemap>,
        tree: NonNull<MappingTree>,
        parent: usize,
        restrict: Option<Tag>,
        offs_begin: usize,
        offs_end: usize,
    ) -> Self {
        let mut levels = [None; MAX_PAGE_LEVELS];
        let mut len = 0;
        if offs_begin < offs_end {
            // SAFETY: `tree` is locked by the borrowed Frame.
            let owner_depth = unsafe { tree.as_ref() }.get(parent).depth();
            levels[0] = Some(Level {
                map,
                tree,
                parent,
                cursor: parent,
                restrict,
                offs_begin,
                offs_end,
                owner_depth,
                skip_below: None,
                nested: false,
                key: 0,
                key_end: 0,
                span_begin: 0,
                span_end: 0,
            });
            len = 1;
        }
        Self { levels, len, _frame: PhantomData }
    }

    /// Locks the first frame in `from..end` of `map` that has a tree.
    fn enter(map: &Treemap, from: usize, end: usize) -> Option<(usize, NonNull<MappingTree>)> {
        for key in from..end {
            let frame = map.frame(key);
            frame.tree.acquire();
            // SAFETY: locked just above.
            if let Some(tree) = unsafe { &mut *frame.tree.data_ptr() }.as_mut() {
                return Some((key, NonNull::from(tree)));
            }
            // SAFETY: locked just above, nothing borrowed from it.
            unsafe { frame.tree.release() };
        }
        None
    }

    fn push_submap(&mut self, sub: &Treemap, span_begin: usize, span_end: usize, restrict: Option<Tag>) {
        let shift = sub.page_shift();
        let first = span_begin >> shift;
        let end = ((span_end + sub.page_size() - 1) >> shift).min(sub.key_end());
        let Some((key, tree)) = Self::enter(sub, first, end) else {
            return;
        };
        assert!(self.len < MAX_PAGE_LEVELS, "submap nesting deeper than the page-size list");
        let mut level = Level {
            map: NonNull::from(sub),
            tree,
            parent: 0,
            cursor: 0,
            restrict,
            offs_begin: 0,
            offs_end: 0,
            owner_depth: 0,
            skip_below: None,
            nested: true,
            key,
            key_end: end,
            span_begin,
            span_end,
        };
        level.enter_frame(key, tree);
        self.levels[self.len] = Some(level);
        self.len += 1;
    }

    fn pop(&mut self) {
        self.len -= 1;
        self.levels[self.len] = None;
    }
}

impl Iterator for MapdbIter<'_> {
    type Item = MappingInfo;

    fn next(&mut self) -> Option<MappingInfo> {
        loop {
            let top = self.len.checked_sub(1)?;
            let mut level = self.levels[top]?;
            // SAFETY: the level's frame is locked by the Frame (base level)
            // or by this iterator (nested levels); its Treemap is pinned by
            // the enclosing locks.
            let (map, tree) = unsafe { (level.map.as_ref(), level.tree.as_ref()) };

            let Some(i) = tree.next_child(level.parent, level.cursor) else {
                if !level.nested {
                    return None;
                }
                // SAFETY: this level acquired the frame lock in `enter`.
                unsafe { map.frame(level.key).tree.release() };
                match Self::enter(map, level.key + 1, level.key_end) {
                    Some((key, next_tree)) => {
                        level.enter_frame(key, next_tree);
                        self.levels[top] = Some(level);
                    }
                    None => self.pop(),
                }
                continue;
            };
            level.cursor = i;

            let slot = tree.get(i);
            let depth = slot.depth();
            if let Some(skipped) = level.skip_below {
                if depth > skipped {
                    self.levels[top] = Some(level);
                    continue;
                }
                level.skip_below = None;
            }

            let parent_depth = tree.get(level.parent).depth();
            if let Some(sub) = slot.submap_ref() {
                let (begin, end, restrict) = if level.owner_depth == parent_depth {
                    (level.offs_begin, level.offs_end, level.restrict)
                } else {
                    (0, map.page_size(), None)
                };
                self.levels[top] = Some(level);
                self.push_submap(sub, begin, end, restrict);
                continue;
            }

            level.owner_depth = depth;
            if depth == parent_depth + 1 && level.restrict.is_some_and(|tag| slot.tag() != Some(tag)) {
                level.skip_below = Some(depth);
                self.levels[top] = Some(level);
                continue;
            }
            self.levels[top] = Some(level);

            let (Some(space), Some(tag), Some(page)) = (slot.space(), slot.tag(), slot.page_number()) else {
                continue;
            };
            return Some(MappingInfo {
                space,
                tag,
                vaddr: page << map.page_shift(),
                page_shift: map.page_shift(),
                depth,
            });
        }
    }
}

impl Drop for MapdbIter<'_> {
    fn drop(&mut self) {
        while let Some(top) = self.len.checked_sub(1) {
            if let Some(level) = self.levels[top] {
                if level.nested {
                    // SAFETY: nested levels always hold the lock of `key`.
                    unsafe { level.map.as_ref().frame(level.key).tree.release() };
                }
            }
            self.pop();
        }
    }
}
