// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Chunked slot storage for amaps
//! OWNERS: @kernel-mm-team
//! INVARIANTS: A chunk of a chunked amap exists iff at least one of its slots is
//!             occupied (or the amap was created non-lazy and nothing was freed yet);
//!             bucket chains and the ordered list index the same chunks
//!
//! Small amaps keep their slots in one inline chunk. Larger amaps keep a slab
//! of chunks addressed by [`ChunkId`], indexed twice: by bucket (slot →
//! chunk lookup with a short chain scan) and by base slot in order (range
//! scans). A bucket covers `1 << shift` consecutive chunks.

use std::collections::btree_map::{self, BTreeMap};

use log::trace;

use crate::backend::PageBackend;
use crate::bitmap::SlotBitmap;
use crate::error::{AmapError, Result};
use crate::pool::Pools;
use crate::types::{AnonId, Blocking};
use crate::{CHUNK_SIZE, LOG_TARGET};

/// Allocates `len` default values, reporting OOM instead of aborting.
fn try_vec<T: Default>(len: usize, kind: &'static str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| AmapError::OutOfMemory { kind })?;
    v.resize_with(len, T::default);
    Ok(v)
}

pub(crate) const fn base_of(slot: usize) -> usize {
    slot - slot % CHUNK_SIZE
}

pub(crate) const fn chunks_for(nslots: usize) -> usize {
    nslots.div_ceil(CHUNK_SIZE)
}

/// Chunks per bucket, as a shift: the largest power of two not above the bit
/// width of `nchunks`, so a chain never holds more than ~log2(nchunks) chunks.
pub(crate) fn bucket_shift(nchunks: usize) -> u32 {
    let width = usize::BITS - nchunks.leading_zeros();
    if width <= 1 {
        0
    } else {
        u32::BITS - 1 - width.leading_zeros()
    }
}

/// A run of up to [`CHUNK_SIZE`] slots.
#[derive(Debug)]
pub(crate) struct Chunk {
    base: usize,
    anons: Vec<Option<AnonId>>,
    used: SlotBitmap,
}

impl Chunk {
    pub(crate) fn new(base: usize, len: usize) -> Self {
        debug_assert!(len <= CHUNK_SIZE);
        Self { base, anons: vec![None; len], used: SlotBitmap::empty() }
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.anons.len()
    }

    pub(crate) fn anon_at(&self, index: usize) -> Option<AnonId> {
        self.anons.get(index).copied().flatten()
    }

    pub(crate) fn insert(&mut self, index: usize, anon: AnonId) {
        debug_assert!(self.anons[index].is_none());
        self.anons[index] = Some(anon);
        self.used.insert(index);
    }

    pub(crate) fn replace(&mut self, index: usize, anon: AnonId) -> Option<AnonId> {
        self.anons[index].replace(anon)
    }

    pub(crate) fn take(&mut self, index: usize) -> Option<AnonId> {
        self.used.remove(index);
        self.anons[index].take()
    }

    pub(crate) fn grow_to(&mut self, len: usize) {
        debug_assert!(len <= CHUNK_SIZE);
        if len > self.anons.len() {
            self.anons.resize(len, None);
        }
    }

    /// Occupied slots within `[start, end)` as absolute `(slot, anon)` pairs.
    pub(crate) fn occupied(
        &self,
        start: usize,
        end: usize,
    ) -> impl Iterator<Item = (usize, AnonId)> + '_ {
        let lo = start.saturating_sub(self.base).min(self.len());
        let hi = end.saturating_sub(self.base).min(self.len());
        self.used
            .masked(lo, hi)
            .ones()
            .filter_map(move |i| self.anons[i].map(|anon| (self.base + i, anon)))
    }

    /// Drops every occupied slot in `[start, end)`; returns how many went.
    fn wipe(
        &mut self,
        start: usize,
        end: usize,
        backend: &dyn PageBackend,
        freed: &mut Vec<AnonId>,
    ) -> usize {
        let lo = start.saturating_sub(self.base).min(self.len());
        let hi = end.saturating_sub(self.base).min(self.len());
        let mut removed = 0;
        for index in self.used.masked(lo, hi).ones() {
            if let Some(anon) = self.take(index) {
                if backend.drop_ref(anon) {
                    freed.push(anon);
                }
            }
            removed += 1;
        }
        removed
    }
}

/// Stable handle of a chunk inside a [`ChunkIndex`] slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    fn from_index(index: usize) -> Self {
        match u32::try_from(index) {
            Ok(raw) => Self(raw),
            Err(_) => panic!("amap_chunk: slab index {index} overflows chunk ids"),
        }
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Chunk slab plus bucket and ordered indices for one chunked amap.
#[derive(Debug)]
pub(crate) struct ChunkIndex {
    nslots: usize,
    slab: Vec<Option<Chunk>>,
    vacant: Vec<ChunkId>,
    buckets: Vec<Vec<ChunkId>>,
    ordered: BTreeMap<usize, ChunkId>,
    shift: u32,
}

impl ChunkIndex {
    /// Builds the index; in non-lazy mode every chunk is created up front and
    /// a failure part-way releases the chunks already accounted for.
    pub(crate) fn new(nslots: usize, lazy: bool, pools: &Pools, blocking: Blocking) -> Result<Self> {
        let nchunks = chunks_for(nslots);
        let shift = bucket_shift(nchunks);
        let nbuckets = nchunks.div_ceil(1 << shift);
        let mut index = Self {
            nslots,
            slab: Vec::new(),
            vacant: Vec::new(),
            buckets: try_vec(nbuckets, "amap bucket table")?,
            ordered: BTreeMap::new(),
            shift,
        };
        if !lazy {
            index
                .slab
                .try_reserve_exact(nchunks)
                .map_err(|_| AmapError::OutOfMemory { kind: "amap chunk" })?;
            for n in 0..nchunks {
                if let Err(err) = pools.chunks.reserve(blocking) {
                    pools.chunks.release(n);
                    return Err(err);
                }
                index.link(Chunk::new(n * CHUNK_SIZE, index.chunk_len(n * CHUNK_SIZE)));
            }
        }
        Ok(index)
    }

    fn chunk_len(&self, base: usize) -> usize {
        CHUNK_SIZE.min(self.nslots - base)
    }

    fn bucket_of(&self, slot: usize) -> usize {
        (slot / CHUNK_SIZE) >> self.shift
    }

    pub(crate) fn len(&self) -> usize {
        self.ordered.len()
    }

    fn find(&self, slot: usize) -> Option<ChunkId> {
        let base = base_of(slot);
        self.buckets
            .get(self.bucket_of(slot))?
            .iter()
            .copied()
            .find(|id| self.slab[id.index()].as_ref().is_some_and(|c| c.base == base))
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Chunk> {
        self.find(slot).and_then(|id| self.slab[id.index()].as_ref())
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Chunk> {
        let id = self.find(slot)?;
        self.slab[id.index()].as_mut()
    }

    fn link(&mut self, chunk: Chunk) -> ChunkId {
        let base = chunk.base;
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slab[id.index()] = Some(chunk);
                id
            }
            None => {
                let id = ChunkId::from_index(self.slab.len());
                self.slab.push(Some(chunk));
                id
            }
        };
        let bucket = self.bucket_of(base);
        let pos = self.buckets[bucket]
            .partition_point(|other| self.slab[other.index()].as_ref().is_some_and(|c| c.base < base));
        self.buckets[bucket].insert(pos, id);
        self.ordered.insert(base, id);
        id
    }

    /// Returns the chunk owning `slot`, creating it if absent.
    pub(crate) fn get_or_create(&mut self, slot: usize, pools: &Pools, blocking: Blocking) -> Result<&mut Chunk> {
        let id = match self.find(slot) {
            Some(id) => id,
            None => {
                pools.chunks.reserve(blocking)?;
                let base = base_of(slot);
                trace!(target: LOG_TARGET, "chunk create base={}", base);
                self.link(Chunk::new(base, self.chunk_len(base)))
            }
        };
        self.slab[id.index()].as_mut().ok_or(AmapError::OutOfMemory { kind: "amap chunk" })
    }

    /// Unlinks and drops the chunk with base `base`; the caller releases the
    /// pool accounting.
    pub(crate) fn free(&mut self, base: usize) {
        let Some(id) = self.ordered.remove(&base) else {
            return;
        };
        let bucket = self.bucket_of(base);
        self.buckets[bucket].retain(|other| *other != id);
        self.slab[id.index()] = None;
        self.vacant.push(id);
        trace!(target: LOG_TARGET, "chunk free base={}", base);
    }

    /// Chunk bases overlapping `[start, end)`, from whichever index visits
    /// fewer chunks: the ordered list or the buckets the range touches.
    fn bases_in(&self, start: usize, end: usize) -> Vec<usize> {
        let end = end.min(self.nslots);
        if start >= end {
            return Vec::new();
        }
        let first = self.bucket_of(start);
        let last = self.bucket_of(end - 1);
        if last - first >= self.len() {
            self.ordered.range(base_of(start)..end).map(|(base, _)| *base).collect()
        } else {
            self.buckets[first..=last]
                .iter()
                .flatten()
                .filter_map(|id| self.slab[id.index()].as_ref())
                .filter(|c| c.base < end && c.base + c.len() > start)
                .map(|c| c.base)
                .collect()
        }
    }

    pub(crate) fn chunks(&self, start: usize, end: usize) -> btree_map::Range<'_, usize, ChunkId> {
        self.ordered.range(base_of(start.min(end))..end)
    }

    fn slab_chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.slab.get(id.index()).and_then(|c| c.as_ref())
    }

    /// Regrows the index to `nslots`, rebuilding the bucket table.
    pub(crate) fn grow(&mut self, nslots: usize) -> Result<()> {
        debug_assert!(nslots >= self.nslots);
        let shift = bucket_shift(chunks_for(nslots));
        let mut buckets: Vec<Vec<ChunkId>> =
            try_vec(chunks_for(nslots).div_ceil(1 << shift), "amap bucket table")?;
        for (base, id) in &self.ordered {
            buckets[(base / CHUNK_SIZE) >> shift].push(*id);
        }
        self.buckets = buckets;
        self.shift = shift;
        self.nslots = nslots;
        let tail = self.ordered.iter().next_back().map(|(base, id)| (*base, *id));
        if let Some((base, id)) = tail {
            let len = self.chunk_len(base);
            if let Some(chunk) = self.slab[id.index()].as_mut() {
                chunk.grow_to(len);
            }
        }
        Ok(())
    }

    /// Whether each chunk sits in its bucket and both indices agree.
    fn consistent(&self) -> core::result::Result<(), usize> {
        let chained: usize = self.buckets.iter().map(Vec::len).sum();
        for (base, id) in &self.ordered {
            let chunk = self.slab_chunk(*id).ok_or(*base)?;
            if chunk.base != *base
                || base % CHUNK_SIZE != 0
                || chunk.len() != self.chunk_len(*base)
                || !self.buckets[self.bucket_of(*base)].contains(id)
            {
                return Err(*base);
            }
        }
        if chained != self.ordered.len() {
            return Err(0);
        }
        Ok(())
    }
}

/// Slot storage of an amap.
#[derive(Debug)]
pub(crate) enum Storage {
    Small(Chunk),
    Chunked(ChunkIndex),
}

/// Counts returned by [`Storage::wipe_range`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Wiped {
    pub(crate) slots: usize,
    pub(crate) chunks: usize,
}

impl Storage {
    pub(crate) fn new(nslots: usize, lazy: bool, pools: &Pools, blocking: Blocking) -> Result<Self> {
        if nslots <= CHUNK_SIZE {
            Ok(Self::Small(Chunk::new(0, nslots)))
        } else {
            ChunkIndex::new(nslots, lazy, pools, blocking).map(Self::Chunked)
        }
    }

    /// Chunks accounted in the chunk pool (the inline chunk is not).
    pub(crate) fn pooled_chunks(&self) -> usize {
        match self {
            Self::Small(_) => 0,
            Self::Chunked(index) => index.len(),
        }
    }

    pub(crate) fn chunk(&self, slot: usize) -> Option<&Chunk> {
        match self {
            Self::Small(chunk) => Some(chunk),
            Self::Chunked(index) => index.get(slot),
        }
    }

    pub(crate) fn chunk_mut(&mut self, slot: usize) -> Option<&mut Chunk> {
        match self {
            Self::Small(chunk) => Some(chunk),
            Self::Chunked(index) => index.get_mut(slot),
        }
    }

    pub(crate) fn chunk_or_create(&mut self, slot: usize, pools: &Pools, blocking: Blocking) -> Result<&mut Chunk> {
        match self {
            Self::Small(chunk) => Ok(chunk),
            Self::Chunked(index) => index.get_or_create(slot, pools, blocking),
        }
    }

    /// Frees the chunk owning `slot` if it has become empty. Returns whether a
    /// pooled chunk was released.
    pub(crate) fn free_if_empty(&mut self, slot: usize) -> bool {
        match self {
            Self::Small(_) => false,
            Self::Chunked(index) => {
                let empty = index.get(slot).is_some_and(|c| c.used.is_empty());
                if empty {
                    index.free(base_of(slot));
                }
                empty
            }
        }
    }

    pub(crate) fn lookup(&self, slot: usize) -> Option<AnonId> {
        self.chunk(slot).and_then(|c| c.anon_at(slot - c.base))
    }

    /// Chunks overlapping `[start, end)` in slot order.
    pub(crate) fn chunks(&self, start: usize, end: usize) -> ChunkIter<'_> {
        match self {
            Self::Small(chunk) => ChunkIter::Small(Some(chunk)),
            Self::Chunked(index) => ChunkIter::Ordered { range: index.chunks(start, end), index },
        }
    }

    /// Occupied slots in `[start, end)`, lowest first.
    pub(crate) fn occupied(&self, start: usize, end: usize) -> impl Iterator<Item = (usize, AnonId)> + '_ {
        self.chunks(start, end).flat_map(move |c| c.occupied(start, end))
    }

    pub(crate) fn bitmap_total(&self) -> usize {
        self.chunks(0, usize::MAX).map(|c| c.used.count()).sum()
    }

    /// Drops every occupied slot in `[start, start + len)`, freeing chunks that
    /// become empty. Anons whose last reference went away land in `freed`.
    pub(crate) fn wipe_range(
        &mut self,
        start: usize,
        len: usize,
        backend: &dyn PageBackend,
        freed: &mut Vec<AnonId>,
    ) -> Wiped {
        let end = start + len;
        let mut wiped = Wiped::default();
        match self {
            Self::Small(chunk) => wiped.slots = chunk.wipe(start, end, backend, freed),
            Self::Chunked(index) => {
                for base in index.bases_in(start, end) {
                    let Some(chunk) = index.get_mut(base) else { continue };
                    wiped.slots += chunk.wipe(start, end, backend, freed);
                    if chunk.used.is_empty() {
                        index.free(base);
                        wiped.chunks += 1;
                    }
                }
            }
        }
        wiped
    }

    /// Empties the storage, returning every anon it held and the number of
    /// pooled chunks released.
    pub(crate) fn drain(&mut self) -> (Vec<AnonId>, usize) {
        let chunks = self.pooled_chunks();
        let anons = self.occupied(0, usize::MAX).map(|(_, anon)| anon).collect();
        *self = Self::Small(Chunk::new(0, 0));
        (anons, chunks)
    }

    /// Grows storage to `nslots`. A small amap that outgrows its inline chunk
    /// moves the chunk into a fresh lazy index.
    pub(crate) fn grow(&mut self, nslots: usize, pools: &Pools, blocking: Blocking) -> Result<()> {
        match self {
            Self::Small(chunk) if nslots <= CHUNK_SIZE => {
                chunk.grow_to(nslots);
                Ok(())
            }
            Self::Small(chunk) => {
                let mut index = ChunkIndex::new(nslots, true, pools, blocking)?;
                if !chunk.used.is_empty() {
                    pools.chunks.reserve(blocking)?;
                    let mut moved = core::mem::replace(chunk, Chunk::new(0, 0));
                    moved.grow_to(CHUNK_SIZE);
                    index.link(moved);
                }
                *self = Self::Chunked(index);
                Ok(())
            }
            Self::Chunked(index) => index.grow(nslots),
        }
    }

    /// Structural check used by `Amap::verify`.
    pub(crate) fn check(&self, nslots: usize) -> core::result::Result<(), StorageFault> {
        match self {
            Self::Small(chunk) => {
                if chunk.len() != nslots {
                    return Err(StorageFault::Chunk(0));
                }
                check_bits(chunk)
            }
            Self::Chunked(index) => {
                index.consistent().map_err(StorageFault::Chunk)?;
                for (base, id) in &index.ordered {
                    let chunk = index.slab_chunk(*id).ok_or(StorageFault::Chunk(*base))?;
                    check_bits(chunk)?;
                }
                Ok(())
            }
        }
    }
}

/// What [`Storage::check`] found wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StorageFault {
    /// Chunk with this base is misplaced or mis-sized.
    Chunk(usize),
    /// Bitmap and anon pointer disagree at this slot.
    Slot(usize),
}

fn check_bits(chunk: &Chunk) -> core::result::Result<(), StorageFault> {
    for (i, anon) in chunk.anons.iter().enumerate() {
        if anon.is_some() != chunk.used.contains(i) {
            return Err(StorageFault::Slot(chunk.base + i));
        }
    }
    Ok(())
}

/// Iterator over the chunks of a [`Storage`] in slot order.
pub(crate) enum ChunkIter<'a> {
    Small(Option<&'a Chunk>),
    Ordered { range: btree_map::Range<'a, usize, ChunkId>, index: &'a ChunkIndex },
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = &'a Chunk;

    fn next(&mut self) -> Option<&'a Chunk> {
        match self {
            Self::Small(chunk) => chunk.take(),
            Self::Ordered { range, index } => {
                let (_, id) = range.next()?;
                index.slab_chunk(*id)
            }
        }
    }
}
