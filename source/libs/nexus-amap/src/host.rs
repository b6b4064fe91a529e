// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory page backend for host-first tests and tools.
//!
//! Pages carry a `u64` payload instead of 4 KiB of data; duplication copies
//! the payload. Busy pages are modelled as a countdown of remaining
//! [`PageBackend::wait_unbusy`] calls so retry paths can be driven
//! deterministically from a single thread.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::backend::PageBackend;
use crate::error::PageError;
use crate::types::{AnonId, Blocking};

/// Counters describing how the amap layer drove the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Successful and failed `page_in` calls.
    pub page_ins: usize,
    /// `revoke_write` calls.
    pub revokes: usize,
    /// Successful duplications.
    pub duplicates: usize,
    /// Anons reclaimed through `free_pages`.
    pub freed: usize,
    /// `free_pages` calls (batches).
    pub free_batches: usize,
    /// `wait_for_memory` calls.
    pub memory_waits: usize,
    /// `wait_unbusy` calls.
    pub busy_waits: usize,
}

/// [`PageBackend`] keeping every anon in a hash map.
#[derive(Default)]
pub struct HostPager {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    next: u64,
    anons: HashMap<AnonId, HostAnon>,
    page_limit: Option<usize>,
    failing_page_ins: BTreeSet<AnonId>,
    stats: HostStats,
}

struct HostAnon {
    refs: usize,
    payload: u64,
    swap_slot: Option<u32>,
    busy_waits: u32,
}

impl HostState {
    fn anon_mut(&mut self, anon: AnonId) -> &mut HostAnon {
        self.anons.get_mut(&anon).unwrap_or_else(|| panic!("host pager: unknown {anon}"))
    }

    fn anon(&self, anon: AnonId) -> &HostAnon {
        self.anons.get(&anon).unwrap_or_else(|| panic!("host pager: unknown {anon}"))
    }

    fn allocate(&mut self, payload: u64) -> Result<AnonId, PageError> {
        if let Some(limit) = self.page_limit {
            if self.anons.len() >= limit {
                return Err(PageError::NoMemory);
            }
        }
        self.next += 1;
        let id = AnonId::from_raw(self.next).ok_or(PageError::NoMemory)?;
        self.anons.insert(id, HostAnon { refs: 1, payload, swap_slot: None, busy_waits: 0 });
        Ok(id)
    }
}

impl HostPager {
    /// Creates a backend without a page limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that refuses to hold more than `limit` anons until
    /// the next [`PageBackend::wait_for_memory`].
    pub fn with_page_limit(limit: usize) -> Self {
        let pager = Self::default();
        pager.state.lock().page_limit = Some(limit);
        pager
    }

    /// Allocates an anon with one reference and the given payload.
    pub fn alloc(&self, payload: u64) -> Result<AnonId, PageError> {
        self.state.lock().allocate(payload)
    }

    /// Payload of a live anon.
    pub fn payload(&self, anon: AnonId) -> Option<u64> {
        self.state.lock().anons.get(&anon).map(|a| a.payload)
    }

    /// Whether `anon` has not been freed.
    pub fn is_live(&self, anon: AnonId) -> bool {
        self.state.lock().anons.contains_key(&anon)
    }

    /// Number of live anons.
    pub fn live_pages(&self) -> usize {
        self.state.lock().anons.len()
    }

    /// Marks `anon` as swapped out to `slot`.
    pub fn swap_out(&self, anon: AnonId, slot: u32) {
        self.state.lock().anon_mut(anon).swap_slot = Some(slot);
    }

    /// Keeps `anon` busy for the next `waits` calls to `wait_unbusy`.
    pub fn set_busy(&self, anon: AnonId, waits: u32) {
        self.state.lock().anon_mut(anon).busy_waits = waits;
    }

    /// Makes every future `page_in` of `anon` fail with an I/O error.
    pub fn fail_page_in(&self, anon: AnonId) {
        self.state.lock().failing_page_ins.insert(anon);
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> HostStats {
        self.state.lock().stats
    }
}

impl PageBackend for HostPager {
    fn add_ref(&self, anon: AnonId) {
        self.state.lock().anon_mut(anon).refs += 1;
    }

    fn drop_ref(&self, anon: AnonId) -> bool {
        let mut state = self.state.lock();
        let entry = state.anon_mut(anon);
        assert!(entry.refs > 0, "host pager: {anon} over-released");
        entry.refs -= 1;
        entry.refs == 0
    }

    fn refcount(&self, anon: AnonId) -> usize {
        self.state.lock().anons.get(&anon).map_or(0, |a| a.refs)
    }

    fn free_pages(&self, anons: &[AnonId]) {
        let mut state = self.state.lock();
        for anon in anons {
            assert_eq!(state.anon(*anon).refs, 0, "host pager: freeing referenced {anon}");
            state.anons.remove(anon);
            state.failing_page_ins.remove(anon);
        }
        state.stats.freed += anons.len();
        state.stats.free_batches += 1;
    }

    fn duplicate(&self, anon: AnonId, _blocking: Blocking) -> Result<AnonId, PageError> {
        let mut state = self.state.lock();
        let payload = state.anon(anon).payload;
        let copy = state.allocate(payload)?;
        state.stats.duplicates += 1;
        Ok(copy)
    }

    fn wait_for_memory(&self) {
        let mut state = self.state.lock();
        state.stats.memory_waits += 1;
        // The host "page daemon" always reclaims enough.
        state.page_limit = None;
    }

    fn is_busy(&self, anon: AnonId) -> bool {
        self.state.lock().anon(anon).busy_waits > 0
    }

    fn wait_unbusy(&self, anon: AnonId) {
        let mut state = self.state.lock();
        state.stats.busy_waits += 1;
        let entry = state.anon_mut(anon);
        entry.busy_waits = entry.busy_waits.saturating_sub(1);
    }

    fn revoke_write(&self, _anon: AnonId) {
        self.state.lock().stats.revokes += 1;
    }

    fn swap_slot(&self, anon: AnonId) -> Option<u32> {
        self.state.lock().anons.get(&anon).and_then(|a| a.swap_slot)
    }

    fn page_in(&self, anon: AnonId) -> Result<(), PageError> {
        let mut state = self.state.lock();
        state.stats.page_ins += 1;
        if state.failing_page_ins.contains(&anon) {
            return Err(PageError::Io { anon });
        }
        state.anon_mut(anon).swap_slot = None;
        Ok(())
    }
}
