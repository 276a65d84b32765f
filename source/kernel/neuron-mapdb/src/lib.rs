// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

//! CONTEXT: NEURON mapping database and generic flexpage map/unmap
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mapdb, Frame, MapdbIter, MapEngine, Space, SpaceRegistry, MapdbConfig, errors
//! DEPENDS_ON: nexus-sync (helping lock), spin, bitflags, log, thiserror, static_assertions
//! INVARIANTS:
//!   - one helping lock per physical frame tree; outer frames lock before nested ones
//!   - every mapping except a frame's root was inserted below the mapping it came from
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! The database answers "who received this physical page from whom". Every
//! frame owns a tree whose root is the identity mapping of sigma0; a map
//! operation adds the receiver below the sender, and unmap walks and deletes
//! a mapping's subtree. Superpages mapped at a smaller size keep per-subpage
//! trees in nested Treemaps.

extern crate alloc;

pub mod config;
pub mod db;
pub mod error;
pub mod map;
pub mod types;

pub use config::MapdbConfig;
pub use db::{Frame, Inserted, MapdbIter, Mapdb, MappingInfo, MappingRef, TreeAllocators, TreeStats};
pub use error::{MapError, MapdbError};
pub use map::{Attribs, InsertStatus, MapEngine, Sigma0Space, Space, SpaceRegistry, Translation};
pub use types::{PageShifts, SpaceId, Tag, MAX_PAGE_LEVELS, MIN_PAGE_SHIFT};
