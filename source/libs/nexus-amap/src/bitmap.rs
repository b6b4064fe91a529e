// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-chunk occupancy bitmap.

use static_assertions::const_assert;

use crate::CHUNK_SIZE;

const WORD_BITS: usize = u64::BITS as usize;

const_assert!(CHUNK_SIZE <= WORD_BITS);
const_assert!(CHUNK_SIZE.is_power_of_two());

/// Occupancy of the slots of one chunk; bit `i` set iff slot `i` holds an anon.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotBitmap(u64);

impl SlotBitmap {
    pub(crate) const fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub(crate) fn contains(self, bit: usize) -> bool {
        bit < WORD_BITS && self.0 & (1 << bit) != 0
    }

    pub(crate) fn insert(&mut self, bit: usize) {
        self.0 |= 1 << bit;
    }

    pub(crate) fn remove(&mut self, bit: usize) {
        self.0 &= !(1 << bit);
    }

    /// Keeps only the bits in `[start, end)`.
    pub(crate) fn masked(self, start: usize, end: usize) -> Self {
        if start >= end {
            return Self::empty();
        }
        let width = end - start;
        let mask = if width >= WORD_BITS { u64::MAX } else { ((1u64 << width) - 1) << start };
        Self(self.0 & mask)
    }

    /// Set bits, lowest first.
    pub(crate) fn ones(self) -> Ones {
        Ones(self.0)
    }
}

impl core::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SlotBitmap({:#018b})", self.0)
    }
}

/// Iterator over the set bits of a [`SlotBitmap`] snapshot.
pub(crate) struct Ones(u64);

impl Iterator for Ones {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(bit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}
