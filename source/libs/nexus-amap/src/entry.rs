// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Region-side view of an amap: the `(amap, pageoff)` reference and the
//! minimal map entry copy-on-write and clipping operate on.

use bitflags::bitflags;

use crate::amap::Amap;
use crate::PAGE_SIZE;

bitflags! {
    /// Map entry state consumed by the amap layer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Writes to the region must not reach other holders of its pages.
        const COPY_ON_WRITE = 1 << 0;
        /// The entry's amap is still shared and must be copied before a write.
        const NEEDS_COPY = 1 << 1;
    }
}

/// Reference from a region into an amap, starting at slot `pageoff`.
#[derive(Clone, Debug, Default)]
pub struct AmapRef {
    /// Referenced amap; `None` until the region first needs anonymous memory.
    pub amap: Option<Amap>,
    /// Slot backing the first page of the region.
    pub pageoff: usize,
}

impl AmapRef {
    /// Reference to `amap` starting at `pageoff`.
    pub fn new(amap: Amap, pageoff: usize) -> Self {
        Self { amap: Some(amap), pageoff }
    }
}

/// A virtual address range `[start, end)` mapped through an amap reference.
#[derive(Clone, Debug)]
pub struct MapEntry {
    /// First address, page aligned.
    pub start: usize,
    /// One past the last address, page aligned.
    pub end: usize,
    /// Anonymous memory backing the range.
    pub aref: AmapRef,
    /// Copy-on-write state.
    pub flags: EntryFlags,
}

impl MapEntry {
    /// Creates an entry without an amap.
    ///
    /// Panics if the range is empty or not page aligned.
    pub fn new(start: usize, end: usize, flags: EntryFlags) -> Self {
        assert!(
            start < end && start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0,
            "amap_entry: bad range {start:#x}..{end:#x}"
        );
        Self { start, end, aref: AmapRef::default(), flags }
    }

    /// Number of pages covered.
    pub fn npages(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Whether a copy is pending.
    pub fn needs_copy(&self) -> bool {
        self.flags.contains(EntryFlags::NEEDS_COPY)
    }

    /// Page index of `addr` relative to the start of the entry.
    pub fn page_index(&self, addr: usize) -> usize {
        assert!(
            addr >= self.start && addr < self.end,
            "amap_entry: {addr:#x} outside {:#x}..{:#x}",
            self.start,
            self.end
        );
        (addr - self.start) / PAGE_SIZE
    }
}
