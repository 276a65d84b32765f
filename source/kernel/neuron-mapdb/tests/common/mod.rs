// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host page-table doubles for the map/unmap integration tests
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! DEPENDENCIES:
//!   - neuron_mapdb::Space / SpaceRegistry: collaborator traits implemented here
//!   - spin::Mutex: page-table lock of the mock
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use neuron_mapdb::{
    Attribs, InsertStatus, Mapdb, MapdbConfig, Sigma0Space, Space, SpaceId, SpaceRegistry, Translation,
};

pub const SIGMA0: SpaceId = SpaceId::task(0);
pub const SUPER: usize = 1 << 22;
pub const SMALL: usize = 1 << 12;
/// Managed physical memory: four 4 MiB frames.
pub const PHYS_END: usize = 4 * SUPER;
/// Identity-mapped device memory outside the database.
pub const DEVICE: Range<usize> = 0x2000_0000..0x2000_0000 + SUPER;

pub fn config() -> MapdbConfig {
    MapdbConfig::new(SIGMA0, PHYS_END, &[22, 12]).unwrap()
}

/// Page table of one task: page base -> translation.
pub struct MockSpace {
    id: SpaceId,
    table: spin::Mutex<BTreeMap<usize, Translation>>,
    reserved: Option<Range<usize>>,
    out_of_memory: AtomicBool,
    flushes: AtomicUsize,
}

impl MockSpace {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            table: spin::Mutex::new(BTreeMap::new()),
            reserved: None,
            out_of_memory: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn with_reserved(mut self, range: Range<usize>) -> Self {
        self.reserved = Some(range);
        self
    }

    pub fn set_out_of_memory(&self, on: bool) {
        self.out_of_memory.store(on, Ordering::Relaxed);
    }

    /// Simulates the MMU setting status bits on the page at `addr`.
    pub fn touch(&self, addr: usize, flags: Attribs) {
        let mut table = self.table.lock();
        if let Some((_, t)) = table.range_mut(..=addr).next_back().filter(|(base, t)| addr < **base + t.size) {
            t.attribs |= flags;
        }
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn pages(&self) -> usize {
        self.table.lock().len()
    }
}

impl Space for MockSpace {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn lookup(&self, addr: usize) -> Option<Translation> {
        let table = self.table.lock();
        let (base, t) = table.range(..=addr).next_back()?;
        (addr < base + t.size).then_some(*t)
    }

    fn insert(&self, phys: usize, addr: usize, size: usize, attribs: Attribs) -> InsertStatus {
        if self.out_of_memory.load(Ordering::Relaxed) {
            return InsertStatus::ErrNoMem;
        }
        let mut table = self.table.lock();
        if let Some(t) = table.get_mut(&addr) {
            if t.phys != phys || t.size != size {
                return InsertStatus::ErrExists;
            }
            if t.attribs.contains(attribs & Attribs::RIGHTS) {
                return InsertStatus::WarnExists;
            }
            t.attribs |= attribs & Attribs::RIGHTS;
            return InsertStatus::WarnUpgrade;
        }
        if table.range(addr..addr + size).next().is_some() {
            return InsertStatus::ErrExists;
        }
        table.insert(addr, Translation { phys, size, attribs });
        InsertStatus::Ok
    }

    fn delete(&self, addr: usize, _size: usize, attribs: Attribs) -> Attribs {
        let mut table = self.table.lock();
        let Some(base) = table.range(..=addr).next_back().filter(|(b, t)| addr < **b + t.size).map(|(b, _)| *b) else {
            return Attribs::empty();
        };
        let Some(t) = table.get_mut(&base) else {
            return Attribs::empty();
        };
        let removed = (t.attribs & attribs & Attribs::RIGHTS) | (t.attribs & Attribs::ACCESSED);
        if attribs.contains(Attribs::READ) {
            table.remove(&base);
        } else {
            t.attribs -= attribs | Attribs::ACCESSED;
        }
        removed
    }

    fn is_mappable(&self, addr: usize, size: usize) -> bool {
        self.reserved.as_ref().map_or(true, |r| addr + size <= r.start || addr >= r.end)
    }

    fn set_accessed(&self, addr: usize, flags: Attribs) {
        self.touch(addr, flags);
    }

    fn tlb_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sigma0 plus a fixed set of task spaces.
pub struct Spaces {
    pub sigma0: Sigma0Space,
    pub tasks: Vec<MockSpace>,
}

impl Spaces {
    /// Tasks 1..=count, plus sigma0 with the device window.
    pub fn new(count: u16) -> Self {
        Self {
            sigma0: Sigma0Space::new(SIGMA0, PHYS_END, 22).with_device_window(DEVICE),
            tasks: (1..=count).map(|task| MockSpace::new(SpaceId::task(task))).collect(),
        }
    }

    /// Task `n` (1-based).
    pub fn task(&self, n: u16) -> &MockSpace {
        &self.tasks[usize::from(n) - 1]
    }
}

impl SpaceRegistry for Spaces {
    fn space(&self, id: SpaceId) -> Option<&dyn Space> {
        if id == SIGMA0 {
            return Some(&self.sigma0);
        }
        self.tasks.iter().find(|s| s.id == id).map(|s| s as &dyn Space)
    }
}

pub fn mapdb() -> Mapdb {
    Mapdb::new(config())
}
