// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-table collaborator interface consumed by map/unmap
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Space, SpaceRegistry, Translation, InsertStatus, Attribs
//! DEPENDS_ON: bitflags
//! INVARIANTS: `delete` with READ in the mask removes the whole translation

use bitflags::bitflags;

use crate::types::SpaceId;

bitflags! {
    /// Access rights and status bits of one translation.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct Attribs: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Set by hardware on access; harvested on unmap.
        const REFERENCED = 1 << 3;
        /// Set by hardware on write; harvested on unmap.
        const DIRTY = 1 << 4;
        /// Device memory; never cached.
        const UNCACHED = 1 << 5;
    }
}

impl Attribs {
    /// Access rights proper.
    pub const RIGHTS: Self = Self::READ.union(Self::WRITE).union(Self::EXEC);
    /// Hardware-maintained status bits.
    pub const ACCESSED: Self = Self::REFERENCED.union(Self::DIRTY);
}

/// One translation read from a page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical base address of the page.
    pub phys: usize,
    /// Page size in bytes.
    pub size: usize,
    /// Rights and status bits.
    pub attribs: Attribs,
}

impl Translation {
    /// Physical address backing `addr`, which must lie in this page.
    #[inline]
    pub fn phys_at(&self, addr: usize) -> usize {
        self.phys + (addr & (self.size - 1))
    }
}

/// Outcome of [`Space::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    /// New translation written.
    Ok,
    /// An identical translation already existed.
    WarnExists,
    /// The existing translation of the same page got additional rights.
    WarnUpgrade,
    /// Page-table memory exhausted.
    ErrNoMem,
    /// An incompatible translation is in the way.
    ErrExists,
}

impl InsertStatus {
    /// Whether the receiver now holds the requested translation.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::WarnExists | Self::WarnUpgrade)
    }
}

/// Address space as seen by the map/unmap engine.
///
/// Implementations apply their own locking; the engine calls them while it
/// holds the mapping-database lock of the affected frame.
pub trait Space: Sync {
    /// Identity recorded in the mapping database.
    fn id(&self) -> SpaceId;

    /// Translation covering `addr`, if any.
    fn lookup(&self, addr: usize) -> Option<Translation>;

    /// Writes a translation of `size` bytes at `addr`.
    fn insert(&self, phys: usize, addr: usize, size: usize, attribs: Attribs) -> InsertStatus;

    /// Revokes `attribs` from the translation at `addr`.
    ///
    /// A mask including READ removes the translation. Returns the rights
    /// actually removed plus the REFERENCED/DIRTY bits collected (and
    /// cleared) from the entry.
    fn delete(&self, addr: usize, size: usize, attribs: Attribs) -> Attribs;

    /// Translation to send from `addr`; identity-mapping spaces synthesize one.
    fn fabricate(&self, addr: usize) -> Option<Translation> {
        self.lookup(addr)
    }

    /// Policy veto on receiving `size` bytes at `addr`.
    fn is_mappable(&self, _addr: usize, _size: usize) -> bool {
        true
    }

    /// Merges harvested REFERENCED/DIRTY bits into the translation at `addr`.
    fn set_accessed(&self, _addr: usize, _flags: Attribs) {}

    /// Invalidates stale TLB entries after a batch of deletions.
    fn tlb_flush(&self) {}
}

/// Resolves the owners recorded in the mapping database.
pub trait SpaceRegistry {
    /// The live space with id `id`.
    fn space(&self, id: SpaceId) -> Option<&dyn Space>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rights_and_accessed_partition_status_bits() {
        assert!(!Attribs::RIGHTS.intersects(Attribs::ACCESSED));
        assert!(!Attribs::RIGHTS.contains(Attribs::UNCACHED));
    }

    #[test]
    fn phys_at_keeps_in_page_offset() {
        let t = Translation { phys: 0x40_0000, size: 0x40_0000, attribs: Attribs::READ };
        assert_eq!(t.phys_at(0x1234_5678), 0x40_0000 + 0x34_5678);
    }

    #[test]
    fn warnings_count_as_success() {
        assert!(InsertStatus::WarnUpgrade.is_ok());
        assert!(!InsertStatus::ErrExists.is_ok());
    }
}
