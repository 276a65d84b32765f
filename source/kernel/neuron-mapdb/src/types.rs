// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the mapping database and the map/unmap engine
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SpaceId, Tag, PageShifts, MAX_PAGE_LEVELS, MIN_PAGE_SHIFT
//! DEPENDS_ON: core only
//! INVARIANTS: Page shifts strictly decrease and never go below MIN_PAGE_SHIFT
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use crate::error::MapdbError;

/// Maximum number of page-size classes (and therefore Treemap nesting levels).
pub const MAX_PAGE_LEVELS: usize = 4;
/// Smallest page size the database accepts (4 KiB).
pub const MIN_PAGE_SHIFT: u8 = 12;

/// Address-space identifier stored in every mapping.
///
/// The upper half is the task number, the lower half its incarnation. All
/// incarnations of one task share a [`Tag`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    /// Creates an id from task number and incarnation.
    #[inline]
    pub const fn new(task: u16, incarnation: u16) -> Self {
        Self(((task as u32) << 16) | incarnation as u32)
    }

    /// Shorthand for the first incarnation of `task`.
    #[inline]
    pub const fn task(task: u16) -> Self {
        Self::new(task, 0)
    }

    /// Creates an id from its raw encoding.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw encoding.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the revocation tag of this space.
    #[inline]
    pub const fn tag(self) -> Tag {
        Tag((self.0 >> 16) as u16)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space:{}.{}", self.0 >> 16, self.0 & 0xffff)
    }
}

/// Coarse grouping of spaces used to restrict revocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Tag(u16);

impl Tag {
    /// Creates a tag from its raw value.
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

/// Supported page sizes as log2 values, largest first.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageShifts {
    shifts: [u8; MAX_PAGE_LEVELS],
    len: u8,
}

impl PageShifts {
    /// Validates and stores `shifts`.
    pub fn new(shifts: &[u8]) -> Result<Self, MapdbError> {
        if shifts.is_empty() || shifts.len() > MAX_PAGE_LEVELS {
            return Err(MapdbError::InvalidPageSizes);
        }
        let bits = usize::BITS as u8;
        let mut prev = bits;
        let mut out = [0u8; MAX_PAGE_LEVELS];
        for (slot, &shift) in out.iter_mut().zip(shifts) {
            if shift < MIN_PAGE_SHIFT || shift >= prev {
                return Err(MapdbError::InvalidPageSizes);
            }
            *slot = shift;
            prev = shift;
        }
        Ok(Self { shifts: out, len: shifts.len() as u8 })
    }

    /// Number of page-size classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// All shifts, largest first.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.shifts[..self.len()]
    }

    /// Largest page shift.
    #[inline]
    pub fn largest(&self) -> u8 {
        self.shifts[0]
    }

    /// Smallest page shift.
    #[inline]
    pub fn smallest(&self) -> u8 {
        self.shifts[self.len() - 1]
    }

    /// The shifts below the largest one, or `None` at the last level.
    pub(crate) fn tail(&self) -> Option<Self> {
        if self.len <= 1 {
            return None;
        }
        let mut shifts = [0u8; MAX_PAGE_LEVELS];
        shifts[..self.len() - 1].copy_from_slice(&self.shifts[1..self.len()]);
        Some(Self { shifts, len: self.len - 1 })
    }

    /// Whether `shift` is one of the supported sizes.
    pub fn contains(&self, shift: u8) -> bool {
        self.as_slice().contains(&shift)
    }

    /// Shift of a page of `size` bytes, if supported.
    pub fn shift_of(&self, size: usize) -> Option<u8> {
        if !size.is_power_of_two() {
            return None;
        }
        let shift = size.trailing_zeros() as u8;
        self.contains(shift).then_some(shift)
    }
}

impl fmt::Debug for PageShifts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[inline]
pub(crate) const fn page_size(shift: u8) -> usize {
    1usize << shift
}

#[inline]
pub(crate) const fn trunc(addr: usize, size: usize) -> usize {
    addr & !(size - 1)
}
