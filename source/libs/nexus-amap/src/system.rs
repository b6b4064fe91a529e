// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Amap system handle: lifecycle, reference counting and slot primitives
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AmapSystem::{create, free, wipeout, reference, unreference, split_ref,
//!             extend, lookup, lookups, populate, add, unadd, wipe_range, clip_entry}
//! DEPENDS_ON: PageBackend, Pools, LiveRegistry
//! INVARIANTS: Lock order amap -> registry; backend calls that may sleep are never made
//!             with an amap lock held; freed anons are handed to the backend in one batch
//!             per operation, after the amap lock is released
//!
//! Copy-on-write lives in `cow.rs` and the swap-off sweep in `registry.rs`;
//! both are further `impl AmapSystem` blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::amap::{Amap, AmapFlags, AmapInner, Ppref};
use crate::backend::PageBackend;
use crate::chunk::Storage;
use crate::config::AmapConfig;
use crate::entry::{AmapRef, MapEntry};
use crate::error::{AmapError, ConfigError, Result};
use crate::pool::{PoolUsage, Pools};
use crate::ppref::PerPageRefs;
use crate::registry::LiveRegistry;
use crate::types::{AmapId, AnonId, Blocking};
use crate::{LOG_TARGET, PAGE_SIZE};

bitflags! {
    /// Options for [`AmapSystem::reference`] and [`AmapSystem::unreference`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RefFlags: u8 {
        /// The reference comes from a shared mapping.
        const SHARED = 1 << 0;
        /// The reference covers the whole amap regardless of the range passed.
        const ALL = 1 << 1;
    }
}

/// Objects released under an amap lock, handed back once the lock is gone.
#[derive(Debug, Default)]
pub(crate) struct Reclaim {
    pub(crate) anons: Vec<AnonId>,
    pub(crate) chunks: usize,
    pub(crate) pprefs: usize,
    pub(crate) amaps: usize,
}

/// Owner of every amap: configuration, page backend, pools and the live
/// registry.
pub struct AmapSystem {
    pub(crate) config: AmapConfig,
    pub(crate) backend: Arc<dyn PageBackend>,
    pub(crate) pools: Pools,
    pub(crate) registry: LiveRegistry,
    next_id: AtomicU64,
}

/// Returns the amap behind `aref`; a missing amap is a caller bug.
pub(crate) fn amap_of<'a>(aref: &'a AmapRef, op: &str) -> &'a Amap {
    match aref.amap.as_ref() {
        Some(amap) => amap,
        None => panic!("{op}: reference has no amap"),
    }
}

fn assert_live(inner: &AmapInner, amap: &Amap, op: &str) {
    assert!(!inner.dead, "{op}: {} used after wipeout", amap.id());
}

fn assert_range(inner: &AmapInner, offset: usize, len: usize, op: &str) {
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= inner.nslots),
        "{op}: range {offset}+{len} beyond {} slots",
        inner.nslots
    );
}

fn slot_of(inner: &AmapInner, aref: &AmapRef, offset: usize, op: &str) -> usize {
    let slot = aref.pageoff + offset;
    assert!(slot < inner.nslots, "{op}: slot {slot} beyond {} slots", inner.nslots);
    slot
}

/// Wipes `[start, start + len)` and accounts for what went; returns the
/// number of slots emptied.
fn wipe(
    storage: &mut Storage,
    nused: &mut usize,
    start: usize,
    len: usize,
    backend: &dyn PageBackend,
    reclaim: &mut Reclaim,
) -> usize {
    let wiped = storage.wipe_range(start, len, backend, &mut reclaim.anons);
    *nused -= wiped.slots;
    reclaim.chunks += wiped.chunks;
    wiped.slots
}

impl AmapSystem {
    /// Creates a system with the default configuration.
    pub fn new(backend: Arc<dyn PageBackend>) -> Self {
        let config = AmapConfig::default();
        Self {
            pools: Pools::new(&config.limits),
            config,
            backend,
            registry: LiveRegistry::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a system with a validated configuration.
    pub fn with_config(
        backend: Arc<dyn PageBackend>,
        config: AmapConfig,
    ) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pools: Pools::new(&config.limits),
            config,
            backend,
            registry: LiveRegistry::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &AmapConfig {
        &self.config
    }

    /// Page backend the system drives.
    pub fn backend(&self) -> &Arc<dyn PageBackend> {
        &self.backend
    }

    /// Objects currently accounted in each pool.
    pub fn pool_usage(&self) -> PoolUsage {
        self.pools.usage()
    }

    /// Number of amaps in the live registry.
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether the amap with `id` is in the live registry.
    pub fn is_live(&self, id: AmapId) -> bool {
        self.registry.contains(id)
    }

    /// Creates an empty amap of `nslots` slots with one reference and
    /// registers it.
    ///
    /// Amaps larger than one chunk get a chunk index; with `lazy` unset every
    /// chunk is allocated up front. Any allocation failure releases whatever
    /// this call had reserved.
    pub fn create(&self, nslots: usize, blocking: Blocking, lazy: bool) -> Result<Amap> {
        assert!(nslots > 0, "amap_create: zero slots");
        self.pools.amaps.reserve(blocking)?;
        let storage = match Storage::new(nslots, lazy, &self.pools, blocking) {
            Ok(storage) => storage,
            Err(err) => {
                self.pools.amaps.release(1);
                debug!(target: LOG_TARGET, "create slots={} failed: {}", nslots, err);
                return Err(err);
            }
        };
        let id = AmapId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let amap = Amap::new(id, AmapInner::new(nslots, storage));
        self.registry.insert(amap.clone());
        debug!(target: LOG_TARGET, "create {} slots={} lazy={}", id, nslots, lazy);
        Ok(amap)
    }

    /// Releases an amap that has no references and no occupied slots.
    pub fn free(&self, amap: &Amap) {
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_free");
        assert!(
            inner.refs == 0 && inner.nused == 0,
            "amap_free: {} still has refs={} nused={}",
            amap.id(),
            inner.refs,
            inner.nused
        );
        let reclaim = self.free_locked(amap.id(), &mut inner);
        drop(inner);
        self.settle(reclaim);
    }

    /// Tears down an amap whose reference count is zero.
    ///
    /// Deferred while a swap-off sweep holds the amap; the sweep completes it.
    pub fn wipeout(&self, amap: &Amap) {
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_wipeout");
        assert_eq!(inner.refs, 0, "amap_wipeout: {} still referenced", amap.id());
        let reclaim = self.wipeout_locked(amap.id(), &mut inner);
        drop(inner);
        self.settle(reclaim);
    }

    pub(crate) fn wipeout_locked(&self, id: AmapId, inner: &mut AmapInner) -> Reclaim {
        debug_assert_eq!(inner.refs, 0);
        if inner.flags.contains(AmapFlags::SWAPOFF) {
            debug!(target: LOG_TARGET, "wipeout {} deferred to swap-off", id);
            return Reclaim::default();
        }
        debug!(target: LOG_TARGET, "wipeout {} nused={}", id, inner.nused);
        self.free_locked(id, inner)
    }

    /// Drops every remaining slot reference, deregisters and marks the amap
    /// dead.
    pub(crate) fn free_locked(&self, id: AmapId, inner: &mut AmapInner) -> Reclaim {
        self.registry.remove(id);
        let mut reclaim = Reclaim::default();
        let (anons, chunks) = inner.storage.drain();
        reclaim.anons.extend(anons.into_iter().filter(|anon| self.backend.drop_ref(*anon)));
        reclaim.chunks = chunks;
        if let Ppref::Active(_) = core::mem::replace(&mut inner.ppref, Ppref::Untracked) {
            reclaim.pprefs = 1;
        }
        reclaim.amaps = 1;
        inner.nused = 0;
        inner.dead = true;
        inner.touch();
        reclaim
    }

    /// Returns released objects to the backend and the pools.
    pub(crate) fn settle(&self, reclaim: Reclaim) {
        if !reclaim.anons.is_empty() {
            trace!(target: LOG_TARGET, "freeing {} anons", reclaim.anons.len());
            self.backend.free_pages(&reclaim.anons);
        }
        self.pools.chunks.release(reclaim.chunks);
        self.pools.pprefs.release(reclaim.pprefs);
        self.pools.amaps.release(reclaim.amaps);
    }

    fn establish_ppref(&self, inner: &mut AmapInner, initial: usize) -> Result<()> {
        self.pools.pprefs.reserve(Blocking::NoWait)?;
        match PerPageRefs::establish(inner.nslots, initial) {
            Ok(ppref) => {
                inner.ppref = Ppref::Active(ppref);
                Ok(())
            }
            Err(err) => {
                self.pools.pprefs.release(1);
                Err(err)
            }
        }
    }

    /// Drops one per-page reference over `[start, start + len)`, wiping slots
    /// whose count reaches zero. No-op unless per-page tracking is active.
    pub(crate) fn drop_range(&self, inner: &mut AmapInner, start: usize, len: usize, reclaim: &mut Reclaim) {
        let AmapInner { storage, ppref, nused, generation, .. } = inner;
        let Ppref::Active(ppref) = ppref else {
            return;
        };
        let backend = &*self.backend;
        let mut wiped = 0;
        ppref.adjust(start, len, -1, |run, run_len| {
            wiped += wipe(storage, nused, run, run_len, backend, reclaim);
        });
        if wiped > 0 {
            *generation = generation.wrapping_add(1);
        }
    }

    /// Takes a reference on `amap` for `[offset, offset + len)`.
    ///
    /// A reference covering less than the whole amap switches on per-page
    /// tracking; if that allocation fails nothing changes.
    pub fn reference(&self, amap: &Amap, offset: usize, len: usize, flags: RefFlags) -> Result<()> {
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_ref");
        assert_range(&inner, offset, len, "amap_ref");
        let nslots = inner.nslots;
        let all = flags.contains(RefFlags::ALL);
        if !all && len != nslots && matches!(inner.ppref, Ppref::Untracked) {
            let prior = inner.refs;
            self.establish_ppref(&mut inner, prior)?;
        }
        let (start, len) = if all { (0, nslots) } else { (offset, len) };
        if let Ppref::Active(ppref) = &mut inner.ppref {
            ppref.adjust(start, len, 1, |_, _| {});
        }
        inner.refs += 1;
        if flags.contains(RefFlags::SHARED) {
            inner.flags.insert(AmapFlags::SHARED);
        }
        trace!(target: LOG_TARGET, "ref {} {}+{} refs={}", amap.id(), start, len, inner.refs);
        Ok(())
    }

    /// Drops a reference on `amap` for `[offset, offset + len)`.
    ///
    /// The last reference wipes the amap out. Otherwise slots whose per-page
    /// count reaches zero are wiped while the amap survives.
    pub fn unreference(&self, amap: &Amap, offset: usize, len: usize, flags: RefFlags) {
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_unref");
        assert_range(&inner, offset, len, "amap_unref");
        assert!(inner.refs > 0, "amap_unref: {} has no references", amap.id());
        inner.refs -= 1;
        trace!(target: LOG_TARGET, "unref {} {}+{} refs={}", amap.id(), offset, len, inner.refs);
        let reclaim = if inner.refs == 0 {
            self.wipeout_locked(amap.id(), &mut inner)
        } else {
            if inner.refs == 1 {
                inner.flags.remove(AmapFlags::SHARED);
            }
            let nslots = inner.nslots;
            let all = flags.contains(RefFlags::ALL);
            if !all && len != nslots && matches!(inner.ppref, Ppref::Untracked) {
                let prior = inner.refs + 1;
                if let Err(err) = self.establish_ppref(&mut inner, prior) {
                    warn!(target: LOG_TARGET, "{}: per-page refs disabled: {}", amap.id(), err);
                    inner.ppref = Ppref::Disabled;
                }
            }
            let (start, len) = if all { (0, nslots) } else { (offset, len) };
            let mut reclaim = Reclaim::default();
            self.drop_range(&mut inner, start, len, &mut reclaim);
            reclaim
        };
        drop(inner);
        self.settle(reclaim);
    }

    /// Splits `origref` at `offset` pages, returning a reference to the tail.
    ///
    /// Both halves keep the amap alive; per-page tracking is switched on so
    /// each half can later be released on its own.
    pub fn split_ref(&self, origref: &AmapRef, offset: usize) -> Result<AmapRef> {
        let amap = amap_of(origref, "amap_split_ref");
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_split_ref");
        assert!(
            offset > 0 && origref.pageoff + offset < inner.nslots,
            "amap_split_ref: offset {} from {} outside {} slots",
            offset,
            origref.pageoff,
            inner.nslots
        );
        if matches!(inner.ppref, Ppref::Untracked) {
            let refs = inner.refs;
            self.establish_ppref(&mut inner, refs)?;
        }
        inner.refs += 1;
        trace!(target: LOG_TARGET, "split {} at {} refs={}", amap.id(), origref.pageoff + offset, inner.refs);
        Ok(AmapRef::new(amap.clone(), origref.pageoff + offset))
    }

    /// Grows the amap behind `entry` so the entry can cover `add` more pages,
    /// then extends the entry.
    pub fn extend(&self, entry: &mut MapEntry, add: usize, blocking: Blocking) -> Result<()> {
        let amap = amap_of(&entry.aref, "amap_extend").clone();
        let covered = entry.aref.pageoff + entry.npages();
        let slotneed = covered + add;
        loop {
            let mut inner = amap.write();
            assert_live(&inner, &amap, "amap_extend");
            if inner.refs != 1 {
                return Err(AmapError::Shared);
            }
            match self.grow_locked(&mut inner, slotneed) {
                Ok(()) => {
                    if let Ppref::Active(ppref) = &mut inner.ppref {
                        ppref.adjust(covered, add, 1, |_, _| {});
                    }
                    inner.touch();
                    debug!(target: LOG_TARGET, "extend {} by {} to {} slots", amap.id(), add, inner.nslots);
                    break;
                }
                Err(AmapError::OutOfMemory { kind: "amap chunk" }) if blocking == Blocking::MayWait => {
                    drop(inner);
                    self.pools.chunks.wait_for_room();
                }
                Err(err) => return Err(err),
            }
        }
        entry.end += add * PAGE_SIZE;
        Ok(())
    }

    fn grow_locked(&self, inner: &mut AmapInner, slotneed: usize) -> Result<()> {
        if slotneed <= inner.nslots {
            return Ok(());
        }
        let extra = slotneed - inner.nslots;
        if let Ppref::Active(ppref) = &mut inner.ppref {
            ppref.reserve(extra)?;
        }
        inner.storage.grow(slotneed, &self.pools, Blocking::NoWait)?;
        if let Ppref::Active(ppref) = &mut inner.ppref {
            ppref.grow(extra)?;
        }
        inner.nslots = slotneed;
        Ok(())
    }

    /// Anon at page `offset` of `aref`, if any. Never allocates.
    pub fn lookup(&self, aref: &AmapRef, offset: usize) -> Option<AnonId> {
        let amap = amap_of(aref, "amap_lookup");
        let inner = amap.read();
        assert_live(&inner, amap, "amap_lookup");
        let slot = slot_of(&inner, aref, offset, "amap_lookup");
        inner.storage.lookup(slot)
    }

    /// Fills `out` with the anons of `out.len()` pages starting at `offset`.
    /// Pages without a chunk read as `None`.
    pub fn lookups(&self, aref: &AmapRef, offset: usize, out: &mut [Option<AnonId>]) {
        let amap = amap_of(aref, "amap_lookups");
        let inner = amap.read();
        assert_live(&inner, amap, "amap_lookups");
        let start = aref.pageoff + offset;
        assert_range(&inner, start, out.len(), "amap_lookups");
        out.fill(None);
        for (slot, anon) in inner.storage.occupied(start, start + out.len()) {
            out[slot - start] = Some(anon);
        }
    }

    /// Makes sure the chunk for page `offset` exists, sleeping for memory if
    /// needed. Failure is fatal.
    pub fn populate(&self, aref: &AmapRef, offset: usize) {
        let amap = amap_of(aref, "amap_populate");
        loop {
            let mut inner = amap.write();
            assert_live(&inner, amap, "amap_populate");
            let slot = slot_of(&inner, aref, offset, "amap_populate");
            let created = inner.storage.chunk(slot).is_none();
            let outcome = inner.storage.chunk_or_create(slot, &self.pools, Blocking::NoWait).map(|_| ());
            match outcome {
                Ok(()) => {
                    if created {
                        inner.touch();
                    }
                    return;
                }
                Err(AmapError::OutOfMemory { kind: "amap chunk" }) => {
                    drop(inner);
                    self.pools.chunks.wait_for_room();
                }
                Err(err) => panic!("amap_populate: {err}"),
            }
        }
    }

    /// Stores `anon` at page `offset`, taking over the caller's reference.
    ///
    /// With `replace` the slot must be occupied; the displaced anon is
    /// returned together with the slot's reference on it. Without `replace`
    /// the slot must be empty. Fails only when the chunk cannot be created.
    pub fn add(&self, aref: &AmapRef, offset: usize, anon: AnonId, replace: bool) -> Result<Option<AnonId>> {
        let amap = amap_of(aref, "amap_add");
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_add");
        let slot = slot_of(&inner, aref, offset, "amap_add");
        let shared = inner.flags.contains(AmapFlags::SHARED);
        let chunk = inner.storage.chunk_or_create(slot, &self.pools, Blocking::NoWait)?;
        let index = slot - chunk.base();
        let displaced = if replace {
            let Some(old) = chunk.anon_at(index) else {
                panic!("amap_add: replacing empty slot {slot} of {}", amap.id());
            };
            if shared {
                self.backend.revoke_write(old);
            }
            chunk.replace(index, anon);
            Some(old)
        } else {
            assert!(
                chunk.anon_at(index).is_none(),
                "amap_add: slot {slot} of {} already occupied",
                amap.id()
            );
            chunk.insert(index, anon);
            None
        };
        if displaced.is_none() {
            inner.nused += 1;
        }
        inner.touch();
        Ok(displaced)
    }

    /// Empties the slot at page `offset` and returns its anon; the slot's
    /// reference passes to the caller. The slot must be occupied.
    pub fn unadd(&self, aref: &AmapRef, offset: usize) -> AnonId {
        let amap = amap_of(aref, "amap_unadd");
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_unadd");
        let slot = slot_of(&inner, aref, offset, "amap_unadd");
        let taken = inner.storage.chunk_mut(slot).and_then(|chunk| chunk.take(slot - chunk.base()));
        let Some(anon) = taken else {
            panic!("amap_unadd: slot {slot} of {} is empty", amap.id());
        };
        inner.nused -= 1;
        let chunk_freed = inner.storage.free_if_empty(slot);
        inner.touch();
        drop(inner);
        if chunk_freed {
            self.pools.chunks.release(1);
        }
        anon
    }

    /// Drops every occupied slot in `[offset, offset + len)` of `amap`.
    pub fn wipe_range(&self, amap: &Amap, offset: usize, len: usize) {
        let mut inner = amap.write();
        assert_live(&inner, amap, "amap_wipe_range");
        assert_range(&inner, offset, len, "amap_wipe_range");
        let mut reclaim = Reclaim::default();
        let AmapInner { storage, nused, .. } = &mut *inner;
        if wipe(storage, nused, offset, len, &*self.backend, &mut reclaim) > 0 {
            inner.touch();
        }
        drop(inner);
        self.settle(reclaim);
    }

    /// Splits `entry` at the page-aligned address `at`. `entry` keeps
    /// `[start, at)` and the returned entry covers `[at, end)`, sharing the
    /// amap through [`Self::split_ref`].
    pub fn clip_entry(&self, entry: &mut MapEntry, at: usize) -> Result<MapEntry> {
        assert!(
            at % PAGE_SIZE == 0 && at > entry.start && at < entry.end,
            "amap_clip: {at:#x} not inside {:#x}..{:#x}",
            entry.start,
            entry.end
        );
        let offset = (at - entry.start) / PAGE_SIZE;
        let aref = match entry.aref.amap {
            Some(_) => self.split_ref(&entry.aref, offset)?,
            None => AmapRef::default(),
        };
        let tail = MapEntry { start: at, end: entry.end, aref, flags: entry.flags };
        entry.end = at;
        Ok(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolLimits;
    use crate::host::HostPager;
    use crate::{AmapFlags, PprefRun, CHUNK_SIZE};

    fn system() -> (Arc<HostPager>, AmapSystem) {
        let pager = Arc::new(HostPager::new());
        let system = AmapSystem::new(pager.clone());
        (pager, system)
    }

    fn limited(limits: PoolLimits) -> (Arc<HostPager>, AmapSystem) {
        let pager = Arc::new(HostPager::new());
        let config = AmapConfig { limits, ..AmapConfig::default() };
        let system = AmapSystem::with_config(pager.clone(), config).expect("config");
        (pager, system)
    }

    fn run(start: usize, refs: usize, len: usize) -> PprefRun {
        PprefRun { start, refs, len }
    }

    #[test]
    fn create_registers_and_free_releases_everything() {
        let (_, system) = system();
        let amap = system.create(40, Blocking::NoWait, false).expect("create");
        assert!(system.is_live(amap.id()));
        assert_eq!(amap.chunk_count(), 3);
        assert_eq!(system.pool_usage(), PoolUsage { amaps: 1, chunks: 3, pprefs: 0 });
        system.unreference(&amap, 0, 40, RefFlags::empty());
        assert!(amap.is_dead());
        assert!(!system.is_live(amap.id()));
        assert_eq!(system.pool_usage(), PoolUsage::default());
    }

    #[test]
    fn create_rolls_back_on_chunk_exhaustion() {
        let (_, system) = limited(PoolLimits { chunks: Some(2), ..PoolLimits::default() });
        let err = system.create(64, Blocking::NoWait, false).expect_err("chunk limit");
        assert_eq!(err, AmapError::OutOfMemory { kind: "amap chunk" });
        assert_eq!(system.pool_usage(), PoolUsage::default());
        assert_eq!(system.live_count(), 0);
    }

    #[test]
    fn partial_reference_establishes_ppref_with_prior_count() {
        let (_, system) = system();
        let amap = system.create(32, Blocking::NoWait, true).expect("create");
        assert_eq!(amap.ppref_runs(), None);
        system.reference(&amap, 0, 16, RefFlags::empty()).expect("ref");
        assert_eq!(amap.refs(), 2);
        assert_eq!(amap.ppref_runs(), Some(vec![run(0, 2, 16), run(16, 1, 16)]));
        assert_eq!(system.pool_usage().pprefs, 1);
    }

    #[test]
    fn ppref_exhaustion_leaves_reference_unchanged() {
        let (_, system) = limited(PoolLimits { pprefs: Some(0), ..PoolLimits::default() });
        let amap = system.create(32, Blocking::NoWait, true).expect("create");
        let err = system.reference(&amap, 0, 8, RefFlags::empty()).expect_err("no ppref");
        assert_eq!(err, AmapError::OutOfMemory { kind: "ppref array" });
        assert_eq!(amap.refs(), 1);
        system.reference(&amap, 0, 32, RefFlags::SHARED).expect("whole ref needs no ppref");
        assert_eq!(amap.refs(), 2);
        assert!(amap.flags().contains(AmapFlags::SHARED));
    }

    #[test]
    fn partial_release_without_ppref_memory_disables_tracking() {
        let (_, system) = limited(PoolLimits { pprefs: Some(0), ..PoolLimits::default() });
        let amap = system.create(32, Blocking::NoWait, true).expect("create");
        system.reference(&amap, 0, 32, RefFlags::SHARED).expect("ref");
        system.unreference(&amap, 0, 8, RefFlags::empty());
        assert_eq!(amap.refs(), 1);
        assert_eq!(amap.ppref_runs(), None);
        assert!(!amap.flags().contains(AmapFlags::SHARED));
    }

    #[test]
    fn releasing_split_half_wipes_its_slots() {
        let (pager, system) = system();
        let amap = system.create(32, Blocking::NoWait, true).expect("create");
        let head = AmapRef::new(amap.clone(), 0);
        let low = pager.alloc(1).expect("page");
        let high = pager.alloc(2).expect("page");
        system.add(&head, 3, low, false).expect("add");
        system.add(&head, 20, high, false).expect("add");
        let tail = system.split_ref(&head, 16).expect("split");
        assert_eq!(tail.pageoff, 16);
        assert_eq!(amap.refs(), 2);
        assert_eq!(amap.ppref_runs(), Some(vec![run(0, 1, 32)]));

        system.unreference(&amap, 16, 16, RefFlags::empty());
        assert_eq!(amap.refs(), 1);
        assert_eq!(amap.nused(), 1);
        assert_eq!(system.lookup(&head, 20), None);
        assert!(!pager.is_live(high));
        assert!(pager.is_live(low));
        assert_eq!(amap.verify(), Ok(()));
    }

    #[test]
    fn last_unreference_frees_every_anon_in_one_batch() {
        let (pager, system) = system();
        let amap = system.create(100, Blocking::NoWait, true).expect("create");
        let aref = AmapRef::new(amap.clone(), 0);
        for slot in [0, 17, 99] {
            let anon = pager.alloc(slot as u64).expect("page");
            system.add(&aref, slot, anon, false).expect("add");
        }
        system.unreference(&amap, 0, 100, RefFlags::empty());
        assert_eq!(pager.live_pages(), 0);
        assert_eq!(pager.stats().free_batches, 1);
        assert_eq!(pager.stats().freed, 3);
        assert_eq!(system.pool_usage(), PoolUsage::default());
    }

    #[test]
    fn replace_on_shared_amap_revokes_write_access() {
        let (pager, system) = system();
        let amap = system.create(8, Blocking::NoWait, true).expect("create");
        let aref = AmapRef::new(amap.clone(), 0);
        let old = pager.alloc(1).expect("page");
        let new = pager.alloc(2).expect("page");
        system.add(&aref, 2, old, false).expect("add");
        system.reference(&amap, 0, 8, RefFlags::SHARED).expect("ref");
        assert_eq!(system.add(&aref, 2, new, true), Ok(Some(old)));
        assert_eq!(pager.stats().revokes, 1);
        assert_eq!(system.lookup(&aref, 2), Some(new));
        assert_eq!(amap.nused(), 1);
    }

    #[test]
    #[should_panic(expected = "amap_add: replacing empty slot")]
    fn replace_requires_occupant() {
        let (pager, system) = system();
        let amap = system.create(8, Blocking::NoWait, true).expect("create");
        let anon = pager.alloc(0).expect("page");
        let _ = system.add(&AmapRef::new(amap, 0), 1, anon, true);
    }

    #[test]
    #[should_panic(expected = "amap_unadd: slot 4")]
    fn unadd_requires_occupant() {
        let (_, system) = system();
        let amap = system.create(8, Blocking::NoWait, true).expect("create");
        system.unadd(&AmapRef::new(amap, 0), 4);
    }

    #[test]
    fn unadd_frees_emptied_chunk() {
        let (pager, system) = system();
        let amap = system.create(64, Blocking::NoWait, true).expect("create");
        let aref = AmapRef::new(amap.clone(), 0);
        let anon = pager.alloc(0).expect("page");
        system.add(&aref, 40, anon, false).expect("add");
        assert_eq!(system.pool_usage().chunks, 1);
        assert_eq!(system.unadd(&aref, 40), anon);
        assert_eq!(amap.chunk_count(), 0);
        assert_eq!(system.pool_usage().chunks, 0);
        assert!(pager.is_live(anon));
    }

    #[test]
    fn lookups_report_missing_chunks_as_empty() {
        let (pager, system) = system();
        let amap = system.create(64, Blocking::NoWait, true).expect("create");
        let aref = AmapRef::new(amap.clone(), 8);
        let anon = pager.alloc(0).expect("page");
        system.add(&aref, 10, anon, false).expect("add");
        let mut out = [Some(anon); 24];
        system.lookups(&aref, 0, &mut out);
        assert_eq!(out.iter().filter(|a| a.is_some()).count(), 1);
        assert_eq!(out[10], Some(anon));
        assert_eq!(amap.chunk_count(), 1);
    }

    #[test]
    fn populate_creates_chunk_without_occupying() {
        let (_, system) = system();
        let amap = system.create(64, Blocking::NoWait, true).expect("create");
        system.populate(&AmapRef::new(amap.clone(), 0), 50);
        assert_eq!(amap.chunk_count(), 1);
        assert_eq!(amap.nused(), 0);
    }

    #[test]
    fn wipe_range_frees_only_the_range() {
        let (pager, system) = system();
        let amap = system.create(64, Blocking::NoWait, true).expect("create");
        let aref = AmapRef::new(amap.clone(), 0);
        let anons: Vec<_> = (0..4).map(|n| pager.alloc(n).expect("page")).collect();
        for (anon, slot) in anons.iter().zip([1, 15, 16, 63]) {
            system.add(&aref, slot, *anon, false).expect("add");
        }
        system.wipe_range(&amap, 10, 20);
        assert_eq!(amap.nused(), 2);
        assert_eq!(amap.chunk_count(), 2);
        assert!(!pager.is_live(anons[1]) && !pager.is_live(anons[2]));
        assert_eq!(amap.verify(), Ok(()));
    }

    #[test]
    fn extend_refuses_shared_amap() {
        let (_, system) = system();
        let amap = system.create(4, Blocking::NoWait, true).expect("create");
        let mut entry = MapEntry::new(0, 4 * PAGE_SIZE, crate::EntryFlags::empty());
        entry.aref = AmapRef::new(amap.clone(), 0);
        system.reference(&amap, 0, 4, RefFlags::empty()).expect("ref");
        assert_eq!(system.extend(&mut entry, 4, Blocking::NoWait), Err(AmapError::Shared));
        assert_eq!(entry.npages(), 4);
    }

    #[test]
    fn extend_past_one_chunk_keeps_slots() {
        let (pager, system) = system();
        let amap = system.create(CHUNK_SIZE, Blocking::NoWait, true).expect("create");
        let mut entry = MapEntry::new(0, CHUNK_SIZE * PAGE_SIZE, crate::EntryFlags::empty());
        entry.aref = AmapRef::new(amap.clone(), 0);
        let anon = pager.alloc(5).expect("page");
        system.add(&entry.aref, 7, anon, false).expect("add");
        system.extend(&mut entry, 20, Blocking::NoWait).expect("extend");
        assert!(!amap.is_small());
        assert_eq!(amap.nslots(), CHUNK_SIZE + 20);
        assert_eq!(entry.npages(), CHUNK_SIZE + 20);
        assert_eq!(system.lookup(&entry.aref, 7), Some(anon));
        assert_eq!(amap.verify(), Ok(()));
    }

    #[test]
    fn clip_entry_splits_reference() {
        let (_, system) = system();
        let amap = system.create(8, Blocking::NoWait, true).expect("create");
        let mut entry = MapEntry::new(0x4000, 0xC000, crate::EntryFlags::COPY_ON_WRITE);
        entry.aref = AmapRef::new(amap.clone(), 0);
        let tail = system.clip_entry(&mut entry, 0x7000).expect("clip");
        assert_eq!((entry.start, entry.end), (0x4000, 0x7000));
        assert_eq!((tail.start, tail.end), (0x7000, 0xC000));
        assert_eq!(tail.aref.pageoff, 3);
        assert_eq!(tail.flags, entry.flags);
        assert_eq!(amap.refs(), 2);
    }

    #[test]
    #[should_panic(expected = "amap_free:")]
    fn free_rejects_referenced_amap() {
        let (_, system) = system();
        let amap = system.create(8, Blocking::NoWait, true).expect("create");
        system.free(&amap);
    }
}
