// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recoverable error taxonomy of the mapping database and map/unmap
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapdbError, MapError
//! DEPENDS_ON: thiserror (no_std)
//! INVARIANTS: Invariant or lock-discipline violations are panics, never these errors

use thiserror::Error;

/// Errors reported by [`Mapdb`](crate::Mapdb) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapdbError {
    /// A mapping tree or nested Treemap could not be allocated.
    #[error("mapping database out of memory")]
    NoMemory,
    /// The parent mapping already sits at the maximum tree depth.
    #[error("mapping tree depth exhausted")]
    DepthExceeded,
    /// An insert already succeeded during this lookup/free cycle.
    #[error("only one insert per lookup/free cycle")]
    InsertPending,
    /// The physical address or size is not managed by this database.
    #[error("address outside the managed range")]
    OutOfRange,
    /// The page-size list is empty, unordered, or too long.
    #[error("invalid page-size configuration")]
    InvalidPageSizes,
}

/// Aggregate outcome of a failed multi-page [`map`](crate::MapEngine::map).
///
/// Only the first failure is reported; the other pages are still processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Page-table or mapping-database memory was exhausted for some page.
    #[error("remap failed: out of memory")]
    NoMemory,
    /// The receiver held an incompatible translation the page table refused to replace.
    #[error("receiver already has an incompatible mapping")]
    AlreadyExists,
    /// The receiver region vetoed the mapping.
    #[error("receiver region is not mappable")]
    NotMappable,
}

impl From<MapdbError> for MapError {
    fn from(_value: MapdbError) -> Self {
        Self::NoMemory
    }
}
