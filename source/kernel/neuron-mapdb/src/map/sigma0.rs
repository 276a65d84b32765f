// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identity-mapping root space (sigma0) that fabricates its translations
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Sigma0Space
//! DEPENDS_ON: map::space::Space
//! INVARIANTS: fabricated pages are identity mapped and naturally aligned

use core::ops::Range;

use super::space::{Attribs, InsertStatus, Space, Translation};
use crate::types::{page_size, trunc, SpaceId};

/// The space owning every implicit root mapping.
///
/// It has no page table of its own: RAM below `phys_end` and the optional
/// device window are identity mapped on demand, devices uncached.
#[derive(Clone, Debug)]
pub struct Sigma0Space {
    id: SpaceId,
    phys_end: usize,
    page_shift: u8,
    device: Option<Range<usize>>,
}

impl Sigma0Space {
    /// Identity maps `[0, phys_end)` in pages of `1 << page_shift` bytes.
    pub fn new(id: SpaceId, phys_end: usize, page_shift: u8) -> Self {
        Self { id, phys_end, page_shift, device: None }
    }

    /// Also identity maps `window`, marked [`Attribs::UNCACHED`].
    #[must_use]
    pub fn with_device_window(mut self, window: Range<usize>) -> Self {
        self.device = Some(window);
        self
    }

    fn is_device(&self, addr: usize) -> bool {
        self.device.as_ref().is_some_and(|w| w.contains(&addr))
    }
}

impl Space for Sigma0Space {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn lookup(&self, addr: usize) -> Option<Translation> {
        let size = page_size(self.page_shift);
        let attribs = if addr < self.phys_end {
            Attribs::RIGHTS
        } else if self.is_device(addr) {
            Attribs::READ | Attribs::WRITE | Attribs::UNCACHED
        } else {
            return None;
        };
        Some(Translation { phys: trunc(addr, size), size, attribs })
    }

    fn insert(&self, _phys: usize, _addr: usize, _size: usize, _attribs: Attribs) -> InsertStatus {
        InsertStatus::ErrExists
    }

    fn delete(&self, _addr: usize, _size: usize, _attribs: Attribs) -> Attribs {
        Attribs::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_is_identity_mapped_and_cached() {
        let s0 = Sigma0Space::new(SpaceId::task(0), 16 << 20, 22);
        let t = s0.fabricate(0x50_1234).unwrap();
        assert_eq!(t.phys, 0x40_0000);
        assert_eq!(t.size, 4 << 20);
        assert_eq!(t.attribs, Attribs::RIGHTS);
        assert!(s0.fabricate(32 << 20).is_none());
    }

    #[test]
    fn device_window_is_uncached() {
        let s0 = Sigma0Space::new(SpaceId::task(0), 16 << 20, 12).with_device_window(0x1000_0000..0x1000_4000);
        let t = s0.fabricate(0x1000_2010).unwrap();
        assert_eq!(t.phys, 0x1000_2000);
        assert!(t.attribs.contains(Attribs::UNCACHED));
        assert!(!t.attribs.contains(Attribs::EXEC));
    }
}
