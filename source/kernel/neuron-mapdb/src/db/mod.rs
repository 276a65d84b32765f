// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping database facade: who received which physical page from whom
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mapdb, Frame, Inserted, MappingRef, MappingInfo, MapdbIter, TreeAllocators, TreeStats
//! DEPENDS_ON: db::treemap, db::tree, db::iter, nexus-sync::HelpingLock
//! INVARIANTS:
//!   - `lookup` returns with the frame locked; dropping the Frame (or `free`) is the only release
//!   - insert/flush/grant/iter require the Frame of the matching lookup
//!   - at most one successful insert per Frame
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod iter;
mod mapping;
mod pool;
mod tree;
mod treemap;

#[cfg(test)]
mod tests_prop;

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr::NonNull;

pub use self::iter::MapdbIter;
pub use self::mapping::{MappingInfo, MappingRef};
pub use self::pool::{TreeAllocators, SIZE_FACTOR, SIZE_ID_MAX};
pub use self::tree::TreeStats;

use self::tree::MappingTree;
use self::treemap::Treemap;
use crate::config::MapdbConfig;
use crate::error::MapdbError;
use crate::types::{page_size, trunc, PageShifts, SpaceId, Tag, MAX_PAGE_LEVELS};

#[derive(Clone, Copy)]
struct LockLevel {
    map: NonNull<Treemap>,
    key: usize,
    tree: NonNull<MappingTree>,
}

/// Frame locks held by one lookup, outermost first.
pub(crate) struct LockPath {
    levels: [Option<LockLevel>; MAX_PAGE_LEVELS],
    len: usize,
}

impl LockPath {
    const fn new() -> Self {
        Self { levels: [None; MAX_PAGE_LEVELS], len: 0 }
    }

    pub(crate) fn push(&mut self, map: NonNull<Treemap>, key: usize, tree: NonNull<MappingTree>) {
        assert!(self.len < MAX_PAGE_LEVELS, "submap nesting deeper than the page-size list");
        self.levels[self.len] = Some(LockLevel { map, key, tree });
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
        self.levels[self.len] = None;
    }

    fn innermost(&self) -> Option<LockLevel> {
        self.len.checked_sub(1).and_then(|i| self.levels[i])
    }
}

/// Lock token for the frame holding a looked-up mapping.
///
/// Holds the frame lock and, for mappings inside submaps, the locks of all
/// enclosing frames. Dropping it restores the free last slot of each locked
/// tree and releases the locks innermost first.
pub struct Frame<'db> {
    path: LockPath,
    inserted: bool,
    _db: PhantomData<&'db Mapdb>,
    // Lock ownership is per context.
    _not_send: PhantomData<*const ()>,
}

impl<'db> Frame<'db> {
    fn level(&self) -> LockLevel {
        match self.path.innermost() {
            Some(level) => level,
            None => unreachable!("frame token without a locked frame"),
        }
    }

    fn map(&self) -> &Treemap {
        // SAFETY: the Treemap is kept alive by the locks this token holds.
        unsafe { self.level().map.as_ref() }
    }

    fn tree(&self) -> &MappingTree {
        // SAFETY: the frame lock is held for as long as the token lives.
        unsafe { self.level().tree.as_ref() }
    }

    fn parts_mut(&mut self) -> (&Treemap, &mut MappingTree) {
        let level = self.level();
        // SAFETY: as above; `&mut self` makes the tree access exclusive.
        unsafe { (level.map.as_ref(), &mut *level.tree.as_ptr()) }
    }

    /// log2 of the page size of the locked frame's tree.
    pub fn page_shift(&self) -> u8 {
        self.map().page_shift()
    }

    /// Snapshot of the mapping `m`.
    pub fn info(&self, m: MappingRef) -> Option<MappingInfo> {
        let slot = self.tree().get(m.0);
        Some(MappingInfo {
            space: slot.space()?,
            tag: slot.tag()?,
            vaddr: slot.page_number()? << self.page_shift(),
            page_shift: self.page_shift(),
            depth: slot.depth(),
        })
    }

    /// Owner of `m`.
    pub fn space(&self, m: MappingRef) -> Option<SpaceId> {
        self.tree().get(m.0).space()
    }

    /// Virtual address of `m` in its owner.
    pub fn vaddr(&self, m: MappingRef) -> Option<usize> {
        self.map().vaddr(self.tree(), m.0)
    }

    /// The mapping `m` was derived from; `None` for a root.
    pub fn parent(&self, m: MappingRef) -> Option<MappingRef> {
        if self.tree().get(m.0).is_root() {
            return None;
        }
        self.tree().parent(m.0).map(MappingRef)
    }

    /// Whether an insert already succeeded through this token.
    pub fn inserted(&self) -> bool {
        self.inserted
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        while let Some(level) = self.path.innermost() {
            // SAFETY: the level was pushed while acquiring its lock, which is still held.
            let map = unsafe { level.map.as_ref() };
            let frame = map.frame(level.key);
            // SAFETY: same lock; no other reference into the tree is alive during drop.
            let slot = unsafe { &mut *frame.tree.data_ptr() };
            if let Some(tree) = slot.as_mut() {
                tree.pack();
            }
            map.settle(level.key, slot);
            self.path.pop();
            // SAFETY: acquired by the lookup that produced this token.
            unsafe { frame.tree.release() };
        }
    }
}

impl core::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let level = self.level();
        f.debug_struct("Frame")
            .field("levels", &self.path.len)
            .field("key", &level.key)
            .field("page_shift", &self.page_shift())
            .field("inserted", &self.inserted)
            .finish()
    }
}

/// Where a successful insert put the new mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Inserted {
    /// In the locked tree, at the returned position.
    Local(MappingRef),
    /// In a submap frame; that frame is already unlocked again.
    Nested,
}

/// The mapping database.
pub struct Mapdb {
    root: Treemap,
    config: MapdbConfig,
}

static_assertions::assert_impl_all!(Mapdb: Send, Sync);
static_assertions::assert_not_impl_any!(Frame<'static>: Send, Sync);

impl Mapdb {
    /// Creates a database with its own allocator pools.
    pub fn new(config: MapdbConfig) -> Self {
        let alloc = Arc::new(TreeAllocators::new(&config));
        Self::with_allocators(config, alloc)
    }

    /// Creates a database drawing trees from `alloc`.
    pub fn with_allocators(config: MapdbConfig, alloc: Arc<TreeAllocators>) -> Self {
        let root = Treemap::new_root(&alloc, config.frame_count(), config.sigma0, config.page_shifts);
        log::debug!(
            target: "mapdb",
            "mapdb: {} frames of shift {}, sizes {:?}",
            root.key_end(),
            root.page_shift(),
            config.page_shifts
        );
        Self { root, config }
    }

    /// Supported page sizes, largest first.
    pub fn page_shifts(&self) -> PageShifts {
        self.config.page_shifts
    }

    /// Owner of every implicit root mapping.
    pub fn sigma0(&self) -> SpaceId {
        self.config.sigma0
    }

    /// Allocator pools backing this database.
    pub fn allocators(&self) -> &Arc<TreeAllocators> {
        self.root.alloc()
    }

    /// Whether `phys` is tracked by this database.
    #[inline]
    pub fn valid_address(&self, phys: usize) -> bool {
        phys < self.config.end_frame_phys
    }

    /// Finds the mapping of `va` in `space` for the page containing `phys`.
    ///
    /// Returns with the frame locked. A frame whose tree does not exist yet
    /// gets one only if (`space`, `va`) names its implicit root; if that
    /// allocation fails the mapping reads as absent. Use
    /// [`try_lookup`](Self::try_lookup) to tell the two apart.
    pub fn lookup(&self, space: SpaceId, va: usize, phys: usize) -> Option<(MappingRef, Frame<'_>)> {
        self.try_lookup(space, va, phys).ok().flatten()
    }

    /// [`lookup`](Self::lookup) that reports a failed tree allocation as
    /// [`MapdbError::NoMemory`] instead of "not found".
    pub fn try_lookup(
        &self,
        space: SpaceId,
        va: usize,
        phys: usize,
    ) -> Result<Option<(MappingRef, Frame<'_>)>, MapdbError> {
        if !self.valid_address(phys) {
            return Ok(None);
        }
        let mut path = LockPath::new();
        let Some(idx) = self.root.lookup(phys, space, va, &mut path)? else {
            return Ok(None);
        };
        let frame = Frame { path, inserted: false, _db: PhantomData, _not_send: PhantomData };
        Ok(Some((MappingRef(idx), frame)))
    }

    /// Records that `space` received `size` bytes at `va` from `parent`.
    ///
    /// `phys` is the physical address of the new mapping. Sizes below the
    /// locked frame's page size go into a submap of `parent`.
    pub fn insert(
        &self,
        frame: &mut Frame<'_>,
        parent: MappingRef,
        space: SpaceId,
        va: usize,
        phys: usize,
        size: usize,
    ) -> Result<Inserted, MapdbError> {
        if frame.inserted {
            return Err(MapdbError::InsertPending);
        }
        let (map, tree) = frame.parts_mut();
        let offs = phys & (map.page_size() - 1);
        let result = map.insert(tree, parent.0, space, trunc(va, size.max(1)), offs, size);
        match result {
            Ok(Some(idx)) => {
                frame.inserted = true;
                Ok(Inserted::Local(MappingRef(idx)))
            }
            Ok(None) => {
                frame.inserted = true;
                Ok(Inserted::Nested)
            }
            Err(err) => {
                log::debug!(target: "mapdb", "insert {}@{:#x} failed: {}", space, va, err);
                Err(err)
            }
        }
    }

    /// Releases a frame token.
    pub fn free(&self, frame: Frame<'_>) {
        drop(frame);
    }

    /// Revokes everything derived from `m` inside `va_start..va_end` of its owner.
    ///
    /// With `me_too` the mapping itself goes as well (roots excepted) and the
    /// range covers its whole page. `restrict` limits revocation to the
    /// subtrees of immediate children tagged `restrict`.
    pub fn flush(
        &self,
        frame: &mut Frame<'_>,
        m: MappingRef,
        me_too: bool,
        restrict: Option<Tag>,
        va_start: usize,
        va_end: usize,
    ) {
        let Some(base) = frame.vaddr(m) else {
            return;
        };
        let (map, tree) = frame.parts_mut();
        let (begin, end) = if me_too {
            (0, map.page_size())
        } else {
            window(base, map.page_size(), va_start, va_end)
        };
        if begin < end {
            map.flush(tree, m.0, me_too, restrict, begin, end);
        }
    }

    /// Hands `m` over to `new_space` at `va`, submap roots included.
    pub fn grant(&self, frame: &mut Frame<'_>, m: MappingRef, new_space: SpaceId, va: usize) {
        let (map, tree) = frame.parts_mut();
        let shift = map.page_shift();
        let base = trunc(va, page_size(shift));
        tree.get_mut(m.0).set_owner(new_space, base >> shift);
        if let Some(sub_idx) = tree.find_submap(m.0) {
            if let Some(sub) = tree.get_mut(sub_idx).submap_mut() {
                sub.regrant(new_space, base);
            }
        }
        log::trace!(target: "mapdb", "granted to {} at {:#x}", new_space, base);
    }

    /// Returns the sender mapping if the receiver's mapping at `rcv_addr` was derived from it.
    ///
    /// Succeeds when the parent of `to`'s mapping belongs to `from` at
    /// `snd_addr`; the returned token then locks that parent's frame.
    pub fn check_for_upgrade(
        &self,
        phys: usize,
        from: SpaceId,
        snd_addr: usize,
        to: SpaceId,
        rcv_addr: usize,
    ) -> Option<(MappingRef, Frame<'_>)> {
        let (m, frame) = self.lookup(to, rcv_addr, phys)?;
        let parent = frame.parent(m)?;
        if frame.space(parent) == Some(from) && frame.vaddr(parent) == Some(snd_addr) {
            Some((parent, frame))
        } else {
            None
        }
    }

    /// Tree header of the top-level frame containing `phys`, if it has a tree.
    pub fn frame_stats(&self, phys: usize) -> Option<TreeStats> {
        if !self.valid_address(phys) {
            return None;
        }
        let guard = self.root.frame(phys >> self.root.page_shift()).tree.lock();
        guard.as_ref().map(MappingTree::stats)
    }

    /// Walks every descendant of `m` inside `va_start..va_end`, in pre-order.
    pub fn iter<'f>(
        &self,
        frame: &'f mut Frame<'_>,
        m: MappingRef,
        restrict: Option<Tag>,
        va_start: usize,
        va_end: usize,
    ) -> MapdbIter<'f> {
        let base = frame.vaddr(m).unwrap_or(va_start);
        let level = frame.level();
        // SAFETY: the token keeps the Treemap and tree locked for 'f.
        let map = unsafe { level.map.as_ref() };
        let (begin, end) = window(base, map.page_size(), va_start, va_end);
        MapdbIter::new(level.map, level.tree, m.0, restrict, begin, end)
    }
}

/// Byte range of `va_start..va_end` inside the page at `base`.
fn window(base: usize, size: usize, va_start: usize, va_end: usize) -> (usize, usize) {
    let begin = va_start.saturating_sub(base).min(size);
    let end = va_end.saturating_sub(base).min(size);
    (begin, end.max(begin))
}
