// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One slot of a mapping tree (a mapping, a submap link, a tombstone, or the end tag)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MappingRef, MappingInfo
//! DEPENDS_ON: db::treemap::Treemap (submap links)
//! INVARIANTS: depth == DEPTH_SUBMAP iff the slot owns a nested Treemap

use alloc::boxed::Box;
use core::fmt;

use super::treemap::Treemap;
use crate::types::{SpaceId, Tag};

/// Depth of the implicit root mapping of every tree.
pub(crate) const DEPTH_ROOT: u8 = 0;
/// Deepest regular mapping.
pub(crate) const DEPTH_MAX: u8 = 252;
/// Slot links to a nested Treemap instead of describing a mapping.
pub(crate) const DEPTH_SUBMAP: u8 = 253;
/// Tombstoned slot.
pub(crate) const DEPTH_EMPTY: u8 = 254;
/// End of live data; every slot after it is an end tag as well.
pub(crate) const DEPTH_END: u8 = 255;

pub(crate) enum Entry {
    Vacant,
    Page { space: SpaceId, tag: Tag, page: usize },
    Submap(Box<Treemap>),
}

/// Tree slot. The depth encodes both tree structure and the slot variant.
pub(crate) struct Mapping {
    depth: u8,
    entry: Entry,
}

impl Mapping {
    pub(crate) const fn end() -> Self {
        Self { depth: DEPTH_END, entry: Entry::Vacant }
    }

    pub(crate) fn root(space: SpaceId, page: usize) -> Self {
        Self::page(DEPTH_ROOT, space, page)
    }

    pub(crate) fn page(depth: u8, space: SpaceId, page: usize) -> Self {
        debug_assert!(depth <= DEPTH_MAX);
        Self { depth, entry: Entry::Page { space, tag: space.tag(), page } }
    }

    pub(crate) fn submap(map: Box<Treemap>) -> Self {
        Self { depth: DEPTH_SUBMAP, entry: Entry::Submap(map) }
    }

    #[inline]
    pub(crate) fn depth(&self) -> u8 {
        self.depth
    }

    /// Tombstones or end tags.
    #[inline]
    pub(crate) fn unused(&self) -> bool {
        self.depth > DEPTH_SUBMAP
    }

    #[inline]
    pub(crate) fn is_end_tag(&self) -> bool {
        self.depth == DEPTH_END
    }

    #[inline]
    pub(crate) fn is_submap(&self) -> bool {
        self.depth == DEPTH_SUBMAP
    }

    #[inline]
    pub(crate) fn is_root(&self) -> bool {
        self.depth == DEPTH_ROOT
    }

    pub(crate) fn set_unused(&mut self) {
        self.depth = DEPTH_EMPTY;
        self.entry = Entry::Vacant;
    }

    pub(crate) fn set_end(&mut self) {
        self.depth = DEPTH_END;
        self.entry = Entry::Vacant;
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        match self.entry {
            Entry::Page { space, .. } => Some(space),
            _ => None,
        }
    }

    pub(crate) fn tag(&self) -> Option<Tag> {
        match self.entry {
            Entry::Page { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub(crate) fn page_number(&self) -> Option<usize> {
        match self.entry {
            Entry::Page { page, .. } => Some(page),
            _ => None,
        }
    }

    pub(crate) fn matches(&self, space: SpaceId, page: usize) -> bool {
        matches!(self.entry, Entry::Page { space: s, page: p, .. } if s == space && p == page)
    }

    pub(crate) fn set_owner(&mut self, space: SpaceId, page: usize) {
        if let Entry::Page { space: s, tag, page: p } = &mut self.entry {
            *s = space;
            *tag = space.tag();
            *p = page;
        }
    }

    pub(crate) fn submap_ref(&self) -> Option<&Treemap> {
        match &self.entry {
            Entry::Submap(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn submap_mut(&mut self) -> Option<&mut Treemap> {
        match &mut self.entry {
            Entry::Submap(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entry, self.depth) {
            (_, DEPTH_END) => f.write_str("End"),
            (_, DEPTH_EMPTY) => f.write_str("Empty"),
            (Entry::Submap(map), _) => write!(f, "Submap(shift={})", map.page_shift()),
            (Entry::Page { space, page, .. }, depth) => {
                write!(f, "Page(d={depth}, {space}, page={page:#x})")
            }
            (Entry::Vacant, depth) => write!(f, "Vacant(d={depth})"),
        }
    }
}

/// Position of a mapping inside the tree locked by a [`Frame`](crate::Frame).
///
/// Valid until the frame is released. An insert keeps the positions of the
/// parent and its ancestors; all other positions may move.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappingRef(pub(crate) usize);

/// Snapshot of one mapping, as yielded by the revocation iterator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    /// Owning address space.
    pub space: SpaceId,
    /// Revocation tag of the owner.
    pub tag: Tag,
    /// Virtual address of the mapped page in `space`.
    pub vaddr: usize,
    /// log2 of the mapped page size.
    pub page_shift: u8,
    /// Depth in its mapping tree (0 for a root).
    pub depth: u8,
}

impl MappingInfo {
    /// Mapped page size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        1usize << self.page_shift
    }
}
