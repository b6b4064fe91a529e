// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry of live amaps and the swap-off sweep over it
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AmapSystem::swap_off
//! INVARIANTS: An amap is registered from create until it is freed; the sweep never
//!             holds the registry lock while it locks an amap
//!
//! The sweep walks the registry by id, so amaps created or freed while it
//! sleeps in a page-in are either picked up later or skipped, never visited
//! through a stale link.

use std::collections::BTreeMap;
use std::ops::Bound;

use log::{debug, warn};
use parking_lot::{Mutex, RwLockWriteGuard};

use crate::amap::{Amap, AmapFlags};
use crate::system::AmapSystem;
use crate::types::AmapId;
use crate::LOG_TARGET;

pub(crate) struct LiveRegistry {
    live: Mutex<BTreeMap<AmapId, Amap>>,
}

impl LiveRegistry {
    pub(crate) fn new() -> Self {
        Self { live: Mutex::new(BTreeMap::new()) }
    }

    pub(crate) fn insert(&self, amap: Amap) {
        let previous = self.live.lock().insert(amap.id(), amap);
        debug_assert!(previous.is_none(), "amap registered twice");
    }

    pub(crate) fn remove(&self, id: AmapId) -> bool {
        self.live.lock().remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: AmapId) -> bool {
        self.live.lock().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn first(&self) -> Option<Amap> {
        self.live.lock().values().next().cloned()
    }

    /// The live amap with the smallest id above `id`.
    pub(crate) fn next_after(&self, id: AmapId) -> Option<Amap> {
        self.live
            .lock()
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(_, amap)| amap.clone())
    }
}

impl AmapSystem {
    /// Pages in every anon whose swap slot lies in `[start, end)`, so the
    /// slots can be retired.
    ///
    /// Returns `true` if a page-in failed; the sweep stops at the first
    /// failure. Amaps freed while the sweep sleeps are skipped; an amap whose
    /// last reference goes away while it is being swept is wiped out by the
    /// sweep once it is done with it.
    pub fn swap_off(&self, start: u32, end: u32) -> bool {
        debug!(target: LOG_TARGET, "swap_off [{}, {}) over {} amaps", start, end, self.registry.len());
        let mut cursor = self.registry.first();
        while let Some(amap) = cursor {
            if self.swap_off_amap(&amap, start, end) {
                return true;
            }
            cursor = self.registry.next_after(amap.id());
        }
        false
    }

    fn swap_off_amap(&self, amap: &Amap, start: u32, end: u32) -> bool {
        let mut inner = amap.write();
        if inner.dead {
            return false;
        }
        inner.flags.insert(AmapFlags::SWAPOFF);
        let mut failed = false;
        let mut from = 0;
        loop {
            let nslots = inner.nslots;
            let found = inner.storage.occupied(from, nslots).find(|(_, anon)| {
                self.backend.swap_slot(*anon).is_some_and(|slot| slot >= start && slot < end)
            });
            let Some((slot, anon)) = found else {
                break;
            };
            let generation = inner.generation;
            self.backend.add_ref(anon);
            let paged = RwLockWriteGuard::unlocked(&mut inner, || self.backend.page_in(anon));
            if self.backend.drop_ref(anon) {
                self.backend.free_pages(&[anon]);
            }
            if let Err(err) = paged {
                warn!(target: LOG_TARGET, "swap_off {}: slot {}: {}", amap.id(), slot, err);
                failed = true;
                break;
            }
            // Resume after the slot unless the amap changed while unlocked.
            from = if inner.generation == generation { slot + 1 } else { 0 };
        }
        inner.flags.remove(AmapFlags::SWAPOFF);
        if inner.refs == 0 && !inner.dead {
            let reclaim = self.wipeout_locked(amap.id(), &mut inner);
            drop(inner);
            self.settle(reclaim);
        }
        failed
    }
}
