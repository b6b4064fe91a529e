// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The amap object: shared handle, locked body and read accessors
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Amap::{id, refs, flags, nslots, nused, chunk_count, ppref_runs, verify}
//! INVARIANTS: Bitmap bit and anon pointer of a slot change under the same write guard;
//!             a dead amap holds no storage and is never mutated again
//!
//! Mutation goes through [`crate::AmapSystem`]; this module only owns the
//! representation and the consistency check.

use core::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chunk::{Storage, StorageFault};
use crate::error::VerifyError;
use crate::ppref::PerPageRefs;
use crate::types::AmapId;

bitflags! {
    /// State bits of an amap.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AmapFlags: u8 {
        /// Referenced by more than one holder through a shared mapping.
        const SHARED = 1 << 0;
        /// A swap-off sweep is working on the amap; wipeout is deferred.
        const SWAPOFF = 1 << 1;
    }
}

/// Per-page reference tracking state.
#[derive(Debug)]
pub(crate) enum Ppref {
    /// Every reference covers the whole amap.
    Untracked,
    /// Establishing the array failed once; only the whole-amap count is kept.
    Disabled,
    Active(PerPageRefs),
}

/// A run of slots sharing one per-page reference count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PprefRun {
    /// First slot of the run.
    pub start: usize,
    /// Reference count of every slot in the run.
    pub refs: usize,
    /// Number of slots in the run.
    pub len: usize,
}

#[derive(Debug)]
pub(crate) struct AmapInner {
    pub(crate) nslots: usize,
    pub(crate) nused: usize,
    pub(crate) refs: usize,
    pub(crate) flags: AmapFlags,
    pub(crate) storage: Storage,
    pub(crate) ppref: Ppref,
    /// Bumped on every change to slot contents or storage layout.
    pub(crate) generation: u64,
    pub(crate) dead: bool,
}

impl AmapInner {
    pub(crate) fn new(nslots: usize, storage: Storage) -> Self {
        Self {
            nslots,
            nused: 0,
            refs: 1,
            flags: AmapFlags::empty(),
            storage,
            ppref: Ppref::Untracked,
            generation: 0,
            dead: false,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

struct AmapShared {
    id: AmapId,
    inner: RwLock<AmapInner>,
}

/// Shared handle to an anonymous memory map.
///
/// Cloning the handle does not take an amap reference; references are
/// counted explicitly through [`crate::AmapSystem::reference`] and friends.
#[derive(Clone)]
pub struct Amap(Arc<AmapShared>);

impl Amap {
    pub(crate) fn new(id: AmapId, inner: AmapInner) -> Self {
        Self(Arc::new(AmapShared { id, inner: RwLock::new(inner) }))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AmapInner> {
        self.0.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AmapInner> {
        self.0.inner.write()
    }

    /// Identity of the amap.
    pub fn id(&self) -> AmapId {
        self.0.id
    }

    /// Whether both handles name the same amap.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of references held on the amap.
    pub fn refs(&self) -> usize {
        self.read().refs
    }

    /// Current flags.
    pub fn flags(&self) -> AmapFlags {
        self.read().flags
    }

    /// Number of page slots.
    pub fn nslots(&self) -> usize {
        self.read().nslots
    }

    /// Number of occupied slots.
    pub fn nused(&self) -> usize {
        self.read().nused
    }

    /// Number of chunks currently materialised; a small amap reports its
    /// single inline chunk.
    pub fn chunk_count(&self) -> usize {
        match &self.read().storage {
            Storage::Small(_) => 1,
            Storage::Chunked(index) => index.len(),
        }
    }

    /// Whether the slots are held in one inline chunk.
    pub fn is_small(&self) -> bool {
        matches!(self.read().storage, Storage::Small(_))
    }

    /// Whether the amap has been wiped out and freed.
    pub fn is_dead(&self) -> bool {
        self.read().dead
    }

    /// Change counter of the slot contents.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Per-page reference runs, or `None` when per-page tracking is off.
    pub fn ppref_runs(&self) -> Option<Vec<PprefRun>> {
        match &self.read().ppref {
            Ppref::Active(ppref) => Some(
                ppref.runs().map(|(start, refs, len)| PprefRun { start, refs, len }).collect(),
            ),
            Ppref::Untracked | Ppref::Disabled => None,
        }
    }

    /// Checks the structural invariants of the amap.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let amap = self.id();
        let inner = self.read();
        if inner.dead {
            return Ok(());
        }
        let counted = inner.storage.bitmap_total();
        if counted != inner.nused {
            return Err(VerifyError::Occupancy { amap, nused: inner.nused, counted });
        }
        inner.storage.check(inner.nslots).map_err(|fault| match fault {
            StorageFault::Chunk(base) => VerifyError::Chunk { amap, base },
            StorageFault::Slot(slot) => VerifyError::Bitmap { amap, slot },
        })?;
        if let Ppref::Active(ppref) = &inner.ppref {
            if ppref.len() != inner.nslots {
                return Err(VerifyError::Ppref { amap, slot: ppref.len() });
            }
            ppref.check().map_err(|slot| VerifyError::Ppref { amap, slot })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Amap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Amap").field(&self.0.id).finish()
    }
}
