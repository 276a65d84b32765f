// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generic flexpage map/grant and recursive unmap over the mapping database
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MapEngine, Space, SpaceRegistry, Translation, InsertStatus, Attribs, Sigma0Space
//! DEPENDS_ON: db::Mapdb, map::space (page-table collaborator)
//! INVARIANTS:
//!   - every page is an independent step: lock, mutate, unlock
//!   - a receiver right never exceeds the sender's
//!   - a degraded superpage is never granted whole
//!   - TLB flushes are issued once per call and space, after all pages
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod sigma0;
mod space;

use alloc::vec::Vec;

pub use self::sigma0::Sigma0Space;
pub use self::space::{Attribs, InsertStatus, Space, SpaceRegistry, Translation};

use crate::db::{Frame, Mapdb, MappingRef};
use crate::error::MapError;
use crate::types::{page_size, trunc, SpaceId, Tag};

/// Outcome of one page of a map call.
struct Step {
    len: usize,
    result: Result<(), MapError>,
    sender_flush: bool,
}

impl Step {
    fn skip(len: usize) -> Self {
        Self { len, result: Ok(()), sender_flush: false }
    }
}

/// Map/unmap over one database and the spaces it refers to.
pub struct MapEngine<'a, R: SpaceRegistry + ?Sized> {
    mapdb: &'a Mapdb,
    spaces: &'a R,
}

impl<'a, R: SpaceRegistry + ?Sized> MapEngine<'a, R> {
    /// Creates an engine; `spaces` must resolve every owner recorded in `mapdb`.
    pub fn new(mapdb: &'a Mapdb, spaces: &'a R) -> Self {
        Self { mapdb, spaces }
    }

    /// The database this engine updates.
    pub fn mapdb(&self) -> &'a Mapdb {
        self.mapdb
    }

    /// Maps (or grants) `size` bytes from `from` to `to`, limited to `rights`.
    ///
    /// Pages without a sender translation are skipped. All other pages are
    /// attempted even after a failure; the first failure is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        from: &dyn Space,
        from_addr: usize,
        to: &dyn Space,
        to_addr: usize,
        size: usize,
        grant: bool,
        rights: Attribs,
    ) -> Result<(), MapError> {
        let del = Attribs::RIGHTS.difference(rights);
        self.map_with(from, from_addr, to, to_addr, size, grant, Attribs::empty(), del)
    }

    /// [`map`](Self::map) with explicit attribute edits.
    ///
    /// The receiver gets `(sender | attrib_add) - attrib_del`; rights the
    /// sender does not hold are never added.
    #[allow(clippy::too_many_arguments)]
    pub fn map_with(
        &self,
        from: &dyn Space,
        from_addr: usize,
        to: &dyn Space,
        to_addr: usize,
        size: usize,
        grant: bool,
        attrib_add: Attribs,
        attrib_del: Attribs,
    ) -> Result<(), MapError> {
        let min = page_size(self.mapdb.page_shifts().smallest());
        let mut snd = trunc(from_addr, min);
        let mut rcv = trunc(to_addr, min);
        let len = trunc(size, min);
        let snd_end = snd.saturating_add(len);
        let rcv_end = rcv.saturating_add(len);

        let mut first_err = None;
        let mut sender_flush = false;
        while snd < snd_end && rcv < rcv_end {
            let step = self.map_page(from, snd, snd_end, to, rcv, rcv_end, grant, attrib_add, attrib_del);
            if let Err(err) = step.result {
                first_err.get_or_insert(err);
            }
            sender_flush |= step.sender_flush;
            snd = snd.saturating_add(step.len);
            rcv = rcv.saturating_add(step.len);
        }

        if sender_flush {
            from.tlb_flush();
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_page(
        &self,
        from: &dyn Space,
        snd: usize,
        snd_end: usize,
        to: &dyn Space,
        rcv: usize,
        rcv_end: usize,
        grant: bool,
        attrib_add: Attribs,
        attrib_del: Attribs,
    ) -> Step {
        let shifts = self.mapdb.page_shifts();
        let min = page_size(shifts.smallest());

        let Some(s) = from.fabricate(snd) else {
            log::trace!(target: "map", "{}: nothing at {:#x}", from.id(), snd);
            return Step::skip(min);
        };
        let receiver = to.lookup(rcv);

        // Largest size both sides and both windows can take.
        let fits = |size: usize| {
            size <= s.size
                && snd % size == 0
                && rcv % size == 0
                && size <= snd_end - snd
                && size <= rcv_end - rcv
                && receiver.map_or(true, |r| size <= r.size)
                && to.is_mappable(rcv, size)
        };
        let Some(i_size) = shifts.as_slice().iter().map(|&shift| page_size(shift)).find(|&size| fits(size)) else {
            log::debug!(target: "map", "{}: {:#x} not mappable", to.id(), rcv);
            return Step { len: min, result: Err(MapError::NotMappable), sender_flush: false };
        };
        let i_phys = s.phys_at(snd);
        let grant = if grant && i_size < s.size {
            log::warn!(target: "map", "{}: superpage grant at {:#x} demoted to map", from.id(), snd);
            false
        } else {
            grant
        };

        let mut attribs = (s.attribs | attrib_add) - attrib_del;
        attribs &= (s.attribs & Attribs::RIGHTS) | !Attribs::RIGHTS;
        attribs -= Attribs::ACCESSED;
        if !attribs.intersects(Attribs::RIGHTS) {
            return Step::skip(i_size);
        }

        let mut sender: Option<(MappingRef, Frame<'_>)> = None;
        if let Some(r) = receiver.filter(|r| r.size > i_size && r.phys_at(rcv) == i_phys) {
            // Already reachable through a larger receiver page of the same
            // frame. Splitting that page would revoke everything derived from it.
            log::trace!(target: "map", "{}: {:#x} already inside a {:#x} page", to.id(), rcv, r.size);
            return Step::skip(i_size);
        }
        if let Some(r) = receiver {
            if !grant && r.size == i_size && r.phys_at(rcv) == i_phys && self.mapdb.valid_address(i_phys) {
                sender = self.mapdb.check_for_upgrade(i_phys, from.id(), snd, to.id(), rcv);
                if sender.is_some() {
                    log::trace!(target: "map", "{}: upgrade at {:#x}", to.id(), rcv);
                }
            }
            if sender.is_none() {
                log::debug!(target: "map", "{}: replacing translation at {:#x}", to.id(), rcv);
                self.unmap(to, rcv, i_size, true, Attribs::RIGHTS);
            }
        }

        if sender.is_none() && self.mapdb.valid_address(i_phys) {
            match self.mapdb.try_lookup(from.id(), snd, i_phys) {
                Ok(Some(found)) => sender = Some(found),
                Ok(None) => {
                    // Revoked concurrently between the page-table read and here.
                    log::debug!(target: "map", "{}: stale translation at {:#x}", from.id(), snd);
                    return Step::skip(i_size);
                }
                Err(err) => {
                    log::warn!(target: "map", "{}: no tree for {:#x}: {}", from.id(), i_phys, err);
                    return Step { len: i_size, result: Err(err.into()), sender_flush: false };
                }
            }
        }

        let mut step = Step::skip(i_size);
        match to.insert(i_phys, rcv, i_size, attribs) {
            InsertStatus::ErrNoMem => {
                log::warn!(target: "map", "{}: page table out of memory at {:#x}", to.id(), rcv);
                step.result = Err(MapError::NoMemory);
            }
            InsertStatus::ErrExists => {
                log::debug!(target: "map", "{}: incompatible translation at {:#x}", to.id(), rcv);
                step.result = Err(MapError::AlreadyExists);
            }
            status => {
                if grant {
                    if let Some((m, frame)) = sender.as_mut() {
                        self.mapdb.grant(frame, *m, to.id(), rcv);
                    }
                    from.delete(snd, i_size, Attribs::RIGHTS);
                    step.sender_flush = true;
                } else if status == InsertStatus::Ok {
                    if let Some((m, frame)) = sender.as_mut() {
                        if let Err(err) = self.mapdb.insert(frame, *m, to.id(), rcv, i_phys, i_size) {
                            log::warn!(target: "map", "{}: remap failed at {:#x}: {}", to.id(), rcv, err);
                            to.delete(rcv, i_size, Attribs::RIGHTS);
                            step.result = Err(err.into());
                        }
                    }
                }
            }
        }
        step
    }

    /// Revokes `rights` for `size` bytes at `addr` from everything derived from `space`.
    ///
    /// With `me_too` the caller's own translations go as well, whole pages at
    /// a time. Returns every right removed, plus the REFERENCED/DIRTY bits
    /// collected on the way.
    pub fn unmap(&self, space: &dyn Space, addr: usize, size: usize, me_too: bool, rights: Attribs) -> Attribs {
        self.unmap_restricted(space, addr, size, me_too, rights, None)
    }

    /// [`unmap`](Self::unmap) limited to the subtrees of mappings given to
    /// spaces tagged `restrict`. The restriction is ignored with `me_too`.
    pub fn unmap_restricted(
        &self,
        space: &dyn Space,
        addr: usize,
        size: usize,
        me_too: bool,
        rights: Attribs,
        restrict: Option<Tag>,
    ) -> Attribs {
        let min = page_size(self.mapdb.page_shifts().smallest());
        let full_flush = rights.contains(Attribs::READ);
        let restrict = if me_too { None } else { restrict };
        let end = addr.saturating_add(size);

        let mut removed = Attribs::empty();
        let mut touched: Vec<SpaceId> = Vec::new();
        let mut own_flush = false;
        let mut cur = trunc(addr, min);
        while cur < end {
            let Some(t) = space.fabricate(cur) else {
                cur = cur.saturating_add(min);
                continue;
            };
            let page = trunc(cur, t.size);
            let page_end = page.saturating_add(t.size);
            let (start, stop) = if me_too { (page, page_end) } else { (cur, page_end.min(end)) };
            cur = page_end;

            let found = if self.mapdb.valid_address(t.phys) {
                self.mapdb.lookup(space.id(), page, t.phys)
            } else {
                None
            };
            let Some((m, mut frame)) = found else {
                log::trace!(target: "map", "{}: {:#x} untracked", space.id(), page);
                if me_too {
                    removed |= space.delete(page, t.size, rights);
                    own_flush = true;
                }
                continue;
            };

            let mut accessed = Attribs::empty();
            if me_too {
                let own = space.delete(page, t.size, rights);
                removed |= own;
                accessed |= own & Attribs::ACCESSED;
                own_flush = true;
            }

            for info in self.mapdb.iter(&mut frame, m, restrict, start, stop) {
                let Some(target) = self.spaces.space(info.space) else {
                    log::warn!(target: "map", "mapping owned by unknown {}", info.space);
                    continue;
                };
                let gone = target.delete(info.vaddr, info.size(), rights);
                removed |= gone;
                accessed |= gone & Attribs::ACCESSED;
                if !touched.contains(&info.space) {
                    touched.push(info.space);
                }
            }

            if !accessed.is_empty() {
                self.harvest(space, &frame, m, page, me_too, accessed);
            }
            if full_flush {
                self.mapdb.flush(&mut frame, m, me_too, restrict, start, stop);
            }
        }

        if own_flush {
            space.tlb_flush();
        }
        for id in touched {
            if let Some(target) = self.spaces.space(id) {
                target.tlb_flush();
            }
        }
        removed
    }

    /// Keeps REFERENCED/DIRTY information alive after a revoke.
    fn harvest(&self, space: &dyn Space, frame: &Frame<'_>, m: MappingRef, page: usize, me_too: bool, flags: Attribs) {
        if !me_too {
            space.set_accessed(page, flags);
            return;
        }
        let Some(parent) = frame.parent(m) else {
            return;
        };
        if let (Some(owner), Some(va)) = (frame.space(parent), frame.vaddr(parent)) {
            if let Some(target) = self.spaces.space(owner) {
                target.set_accessed(va, flags);
            }
        }
    }
}
