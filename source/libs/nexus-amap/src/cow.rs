// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write resolution for map entries
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AmapSystem::{copy, cow_now}
//! INVARIANTS: A failed copy leaves the entry untouched; a copied anon gains
//!             one reference per amap holding it; every decision taken before a
//!             sleep is re-checked after it
//!
//! `copy` gives an entry an amap of its own, sharing the pages: anons are
//! referenced, not duplicated. `cow_now` then (or instead) duplicates every
//! page still shared with someone else, for entries that cannot wait for a
//! write fault.

use core::ops::Range;

use log::{debug, trace, warn};

use crate::amap::Amap;
use crate::entry::{AmapRef, EntryFlags, MapEntry};
use crate::error::{AmapError, PageError, Result};
use crate::system::{amap_of, AmapSystem, Reclaim};
use crate::types::Blocking;
use crate::{AmapFlags, CHUNK_SIZE, LOG_TARGET, PAGE_SIZE};

/// What [`AmapSystem::copy`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyAction {
    /// The entry had no amap; a blank one was attached.
    Fresh,
    /// The entry's amap had no other holder and was kept as is.
    TookOver,
    /// A new amap sharing the entry's pages was attached.
    Copied,
}

/// Result of a successful [`AmapSystem::copy`].
#[derive(Debug)]
pub struct CopyOutcome {
    /// Action taken.
    pub action: CopyAction,
    /// Pieces clipped off the entry while aligning a fresh amap to chunk
    /// boundaries, in address order. They still need a copy.
    pub split: Vec<MapEntry>,
}

impl CopyOutcome {
    fn plain(action: CopyAction) -> Self {
        Self { action, split: Vec::new() }
    }
}

impl AmapSystem {
    /// Gives `entry` an amap it holds alone and clears `NEEDS_COPY`.
    ///
    /// An entry without an amap gets a blank one. When `can_chunk` is set and
    /// the entry spans at least `realign_min_slots` pages, the entry is first
    /// trimmed to the chunk-aligned cover of `window` (a byte range, usually
    /// around the faulting address) and the trimmed pieces are returned.
    ///
    /// On failure nothing changes; the caller retries on a later fault.
    pub fn copy(
        &self,
        entry: &mut MapEntry,
        blocking: Blocking,
        can_chunk: bool,
        window: Range<usize>,
    ) -> Result<CopyOutcome> {
        let Some(source) = entry.aref.amap.clone() else {
            return self.copy_fresh(entry, blocking, can_chunk, window);
        };
        let pageoff = entry.aref.pageoff;
        let npages = entry.npages();
        if source.refs() == 1 {
            entry.flags.remove(EntryFlags::NEEDS_COPY);
            trace!(target: LOG_TARGET, "copy {}: sole holder, taking over", source.id());
            return Ok(CopyOutcome::plain(CopyAction::TookOver));
        }

        let copy = self.create(npages, blocking, self.config.lazy_alloc)?;

        let mut src = source.write();
        assert!(!src.dead, "amap_copy: {} used after wipeout", source.id());
        if src.refs == 1 {
            // The other holders went away while we allocated.
            drop(src);
            self.discard(&copy);
            entry.flags.remove(EntryFlags::NEEDS_COPY);
            debug!(target: LOG_TARGET, "copy {}: became sole holder, took over", source.id());
            return Ok(CopyOutcome::plain(CopyAction::TookOver));
        }

        let mut dst = copy.write();
        let occupied: Vec<_> = src.storage.occupied(pageoff, pageoff + npages).collect();
        for (slot, anon) in occupied {
            let target = slot - pageoff;
            let placed = dst
                .storage
                .chunk_or_create(target, &self.pools, Blocking::NoWait)
                .map(|chunk| chunk.insert(target - chunk.base(), anon));
            if let Err(err) = placed {
                drop(src);
                dst.refs = 0;
                let reclaim = self.wipeout_locked(copy.id(), &mut dst);
                drop(dst);
                self.settle(reclaim);
                debug!(target: LOG_TARGET, "copy {} failed: {}", source.id(), err);
                return Err(err);
            }
            self.backend.add_ref(anon);
            dst.nused += 1;
        }
        drop(dst);

        src.refs -= 1;
        if src.refs == 1 {
            src.flags.remove(AmapFlags::SHARED);
        }
        let mut reclaim = Reclaim::default();
        self.drop_range(&mut src, pageoff, npages, &mut reclaim);
        debug!(
            target: LOG_TARGET,
            "copy {} [{}+{}] -> {} nused={}",
            source.id(),
            pageoff,
            npages,
            copy.id(),
            copy.nused()
        );
        drop(src);
        self.settle(reclaim);

        entry.aref = AmapRef::new(copy, 0);
        entry.flags.remove(EntryFlags::NEEDS_COPY);
        Ok(CopyOutcome::plain(CopyAction::Copied))
    }

    fn copy_fresh(
        &self,
        entry: &mut MapEntry,
        blocking: Blocking,
        can_chunk: bool,
        window: Range<usize>,
    ) -> Result<CopyOutcome> {
        let (mut start, mut end) = (entry.start, entry.end);
        if can_chunk && entry.npages() >= self.config.realign_min_slots {
            let chunk_bytes = CHUNK_SIZE * PAGE_SIZE;
            start = start.max(window.start - window.start % chunk_bytes);
            end = end.min(window.end.div_ceil(chunk_bytes).saturating_mul(chunk_bytes));
            assert!(
                start < end,
                "amap_copy: window {:#x}..{:#x} outside entry {:#x}..{:#x}",
                window.start,
                window.end,
                entry.start,
                entry.end
            );
        }
        let amap = self.create((end - start) / PAGE_SIZE, blocking, self.config.lazy_alloc)?;

        let mut split = Vec::new();
        if start > entry.start {
            split.push(MapEntry { start: entry.start, end: start, aref: AmapRef::default(), flags: entry.flags });
        }
        if end < entry.end {
            split.push(MapEntry { start: end, end: entry.end, aref: AmapRef::default(), flags: entry.flags });
        }
        if !split.is_empty() {
            debug!(target: LOG_TARGET, "copy: realigned entry to {:#x}..{:#x}", start, end);
        }
        entry.start = start;
        entry.end = end;
        entry.aref = AmapRef::new(amap, 0);
        entry.flags.remove(EntryFlags::NEEDS_COPY);
        Ok(CopyOutcome { action: CopyAction::Fresh, split })
    }

    /// Drops a just-created amap nobody else has seen.
    fn discard(&self, amap: &Amap) {
        let mut inner = amap.write();
        inner.refs = 0;
        let reclaim = self.free_locked(amap.id(), &mut inner);
        drop(inner);
        self.settle(reclaim);
    }

    /// Duplicates every page of `entry` whose anon is shared with another
    /// holder, so the entry's amap owns private copies.
    ///
    /// A busy page or a failed duplication releases the amap, waits, and
    /// rescans from the start. A warning is logged every
    /// `cow_restart_warn` restarts; with `cow_restart_limit` set the scan
    /// gives up with [`AmapError::CowRestartLimit`].
    pub fn cow_now(&self, entry: &MapEntry) -> Result<()> {
        let amap = amap_of(&entry.aref, "amap_cow_now");
        let start = entry.aref.pageoff;
        let end = start + entry.npages();
        let mut restarts = 0u32;
        'rescan: loop {
            let mut inner = amap.write();
            assert!(!inner.dead, "amap_cow_now: {} used after wipeout", amap.id());
            // Other holders lock their own amaps, so a shared anon may lose
            // every other reference while we duplicate it.
            let mut reclaim = Reclaim::default();
            let occupied: Vec<_> = inner.storage.occupied(start, end).collect();
            for (slot, anon) in occupied {
                if self.backend.refcount(anon) <= 1 {
                    continue;
                }
                if self.backend.is_busy(anon) {
                    self.backend.add_ref(anon);
                    drop(inner);
                    self.settle(reclaim);
                    self.backend.wait_unbusy(anon);
                    if self.backend.drop_ref(anon) {
                        self.backend.free_pages(&[anon]);
                    }
                    self.note_restart(amap, &mut restarts)?;
                    continue 'rescan;
                }
                let copy = match self.backend.duplicate(anon, Blocking::NoWait) {
                    Ok(copy) => copy,
                    Err(PageError::NoMemory) => {
                        drop(inner);
                        self.settle(reclaim);
                        self.backend.wait_for_memory();
                        self.note_restart(amap, &mut restarts)?;
                        continue 'rescan;
                    }
                    Err(err) => {
                        drop(inner);
                        self.settle(reclaim);
                        return Err(err.into());
                    }
                };
                let Some(chunk) = inner.storage.chunk_mut(slot) else {
                    panic!("amap_cow_now: chunk for slot {slot} vanished under the lock");
                };
                let index = slot - chunk.base();
                chunk.replace(index, copy);
                inner.touch();
                if self.backend.drop_ref(anon) {
                    debug!(target: LOG_TARGET, "cow_now {}: {} released by its other holders", amap.id(), anon);
                    reclaim.anons.push(anon);
                }
                trace!(target: LOG_TARGET, "cow_now {} slot {}: {} -> {}", amap.id(), slot, anon, copy);
            }
            drop(inner);
            self.settle(reclaim);
            return Ok(());
        }
    }

    fn note_restart(&self, amap: &Amap, restarts: &mut u32) -> Result<()> {
        *restarts += 1;
        if *restarts % self.config.cow_restart_warn == 0 {
            warn!(target: LOG_TARGET, "cow_now {}: {} restarts so far", amap.id(), restarts);
        }
        match self.config.cow_restart_limit {
            Some(limit) if *restarts >= limit => {
                warn!(target: LOG_TARGET, "cow_now {}: giving up after {} restarts", amap.id(), restarts);
                Err(AmapError::CowRestartLimit { restarts: *restarts })
            }
            _ => Ok(()),
        }
    }
}
