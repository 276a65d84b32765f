// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time configuration of the mapping database
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbConfig
//! DEPENDS_ON: types::PageShifts
//! INVARIANTS: end_frame_phys is non-zero; quotas of None mean unbounded

use crate::error::MapdbError;
use crate::types::{PageShifts, SpaceId};

/// Parameters fixed when the database is created at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapdbConfig {
    /// Supported page sizes, largest first.
    pub page_shifts: PageShifts,
    /// First physical address not managed by the database.
    pub end_frame_phys: usize,
    /// Owner of every implicit root mapping (the identity-mapping space).
    pub sigma0: SpaceId,
    /// Upper bound on tree slots handed out across all size classes.
    pub tree_slot_limit: Option<usize>,
    /// Upper bound on live nested Treemaps.
    pub submap_limit: Option<usize>,
}

impl MapdbConfig {
    /// Creates a configuration covering `[0, end_frame_phys)` with unbounded quotas.
    pub fn new(sigma0: SpaceId, end_frame_phys: usize, page_shifts: &[u8]) -> Result<Self, MapdbError> {
        if end_frame_phys == 0 {
            return Err(MapdbError::OutOfRange);
        }
        Ok(Self {
            page_shifts: PageShifts::new(page_shifts)?,
            end_frame_phys,
            sigma0,
            tree_slot_limit: None,
            submap_limit: None,
        })
    }

    /// Caps the number of tree slots in use.
    #[must_use]
    pub fn with_tree_slot_limit(mut self, limit: Option<usize>) -> Self {
        self.tree_slot_limit = limit;
        self
    }

    /// Caps the number of nested Treemaps.
    #[must_use]
    pub fn with_submap_limit(mut self, limit: Option<usize>) -> Self {
        self.submap_limit = limit;
        self
    }

    /// Number of top-level frames (largest page size) the database spans.
    pub fn frame_count(&self) -> usize {
        let shift = self.page_shifts.largest();
        (self.end_frame_phys >> shift) + usize::from(self.end_frame_phys & ((1 << shift) - 1) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_rounds_up() {
        let config = MapdbConfig::new(SpaceId::task(0), (8 << 22) + 4096, &[22, 12]).unwrap();
        assert_eq!(config.frame_count(), 9);
        let exact = MapdbConfig::new(SpaceId::task(0), 8 << 22, &[22, 12]).unwrap();
        assert_eq!(exact.frame_count(), 8);
    }

    #[test]
    fn rejects_empty_range_and_bad_sizes() {
        assert_eq!(MapdbConfig::new(SpaceId::task(0), 0, &[12]), Err(MapdbError::OutOfRange));
        assert_eq!(
            MapdbConfig::new(SpaceId::task(0), 4096, &[12, 22]),
            Err(MapdbError::InvalidPageSizes)
        );
    }

    #[test]
    fn quotas_default_to_unbounded() {
        let config = MapdbConfig::new(SpaceId::task(0), 1 << 30, &[21, 12])
            .unwrap()
            .with_submap_limit(Some(3));
        assert_eq!(config.tree_slot_limit, None);
        assert_eq!(config.submap_limit, Some(3));
    }
}
