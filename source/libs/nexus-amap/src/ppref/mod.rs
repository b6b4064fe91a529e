// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-page reference counts ("ppref") for partially referenced amaps
//! OWNERS: @kernel-mm-team
//! PUBLIC API: none (crate-internal; exposed as `Amap::ppref_runs`)
//! INVARIANTS: Runs partition [0, len) contiguously; counts never go negative
//!
//! Encoding, one `i32` per slot, only run heads are meaningful:
//! - `refs[i] > 0`: a single-slot run with count `refs[i] - 1`;
//! - `refs[i] < 0`: a run with count `-refs[i] - 1` whose length is `refs[i + 1]`.
//!
//! Entries inside a run are don't-care; headers absorbed by a merge are
//! zeroed so identical run structures have identical encodings.

use crate::error::{AmapError, Result};

/// Run-length encoded reference count per slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PerPageRefs {
    refs: Vec<i32>,
}

impl PerPageRefs {
    /// Creates the array with one run of `initial` covering all `nslots` slots.
    pub(crate) fn establish(nslots: usize, initial: usize) -> Result<Self> {
        let mut refs = Vec::new();
        refs.try_reserve_exact(nslots)
            .map_err(|_| AmapError::OutOfMemory { kind: "ppref array" })?;
        refs.resize(nslots, 0);
        let mut ppref = Self { refs };
        if nslots > 0 {
            ppref.set(0, initial, nslots);
        }
        Ok(ppref)
    }

    /// Number of slots tracked.
    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }

    /// Count and run length of the run starting at `slot`.
    ///
    /// `slot` must be the first slot of a run.
    pub(crate) fn get(&self, slot: usize) -> (usize, usize) {
        let head = self.refs[slot];
        debug_assert!(head != 0, "ppref: no run starts at slot {slot}");
        if head > 0 {
            ((head - 1) as usize, 1)
        } else {
            ((-head - 1) as usize, self.refs[slot + 1] as usize)
        }
    }

    fn set(&mut self, slot: usize, count: usize, len: usize) {
        let Some(encoded) = i32::try_from(count).ok().and_then(|count| count.checked_add(1)) else {
            panic!("amap_ppref: count {count} at slot {slot} does not fit the encoding");
        };
        if len == 1 {
            self.refs[slot] = encoded;
        } else {
            let Ok(run) = i32::try_from(len) else {
                panic!("amap_ppref: run of {len} slots at {slot} does not fit the encoding");
            };
            self.refs[slot] = -encoded;
            self.refs[slot + 1] = run;
        }
    }

    fn clear_header(&mut self, slot: usize, len: usize) {
        self.refs[slot] = 0;
        if len > 1 {
            self.refs[slot + 1] = 0;
        }
    }

    #[cfg(test)]
    fn as_raw(&self) -> &[i32] {
        &self.refs
    }

    /// Runs in slot order as `(start, count, len)`.
    pub(crate) fn runs(&self) -> Runs<'_> {
        Runs { ppref: self, next: 0 }
    }

    /// Count of an arbitrary slot.
    #[cfg(test)]
    pub(crate) fn count_at(&self, slot: usize) -> usize {
        self.runs()
            .find(|&(start, _, len)| slot >= start && slot < start + len)
            .map_or(0, |(_, count, _)| count)
    }

    /// Adds `delta` to every slot in `[start, start + len)`.
    ///
    /// Runs straddling either boundary are split, a modified run merges into
    /// the run before it when their counts match, and the last modified run
    /// merges with the run after the range likewise. `on_zero` is called for
    /// every modified run whose count reached zero, after the encoding for that
    /// run is written.
    pub(crate) fn adjust(
        &mut self,
        start: usize,
        len: usize,
        delta: i32,
        mut on_zero: impl FnMut(usize, usize),
    ) {
        let stop = start + len;
        assert!(stop <= self.len(), "ppref: adjust {start}+{len} beyond {} slots", self.len());
        if len == 0 {
            return;
        }

        // Walk to `start`, splitting the run that straddles it.
        let mut slot = 0;
        let mut prev: Option<(usize, usize, usize)> = None;
        while slot < start {
            let (count, mut run) = self.get(slot);
            if slot + run > start {
                self.set(slot, count, start - slot);
                self.set(start, count, run - (start - slot));
                run = start - slot;
            }
            prev = Some((slot, count, run));
            slot += run;
        }
        debug_assert_eq!(slot, start, "ppref: overshot adjust start");

        while slot < stop {
            let (count, mut run) = self.get(slot);
            if slot + run > stop {
                self.set(slot, count, stop - slot);
                self.set(stop, count, run - (stop - slot));
                run = stop - slot;
            }
            let adjusted = count as i64 + i64::from(delta);
            assert!(adjusted >= 0, "ppref: negative reference count at slot {slot}");
            let adjusted = adjusted as usize;
            match prev {
                Some((prev_start, prev_count, prev_len))
                    if prev_start + prev_len == slot && prev_count == adjusted =>
                {
                    self.clear_header(slot, run);
                    self.set(prev_start, adjusted, prev_len + run);
                    prev = Some((prev_start, adjusted, prev_len + run));
                }
                _ => {
                    self.set(slot, adjusted, run);
                    prev = Some((slot, adjusted, run));
                }
            }
            if adjusted == 0 {
                on_zero(slot, run);
            }
            slot += run;
        }

        if stop < self.len() {
            if let Some((prev_start, prev_count, prev_len)) = prev {
                let (next_count, next_len) = self.get(stop);
                if next_count == prev_count {
                    self.clear_header(stop, next_len);
                    self.set(prev_start, prev_count, prev_len + next_len);
                }
            }
        }
    }

    /// Makes room for `extra` more slots so a later [`Self::grow`] cannot fail.
    pub(crate) fn reserve(&mut self, extra: usize) -> Result<()> {
        self.refs
            .try_reserve_exact(extra)
            .map_err(|_| AmapError::OutOfMemory { kind: "ppref array" })
    }

    /// Appends `extra` slots with count zero.
    pub(crate) fn grow(&mut self, extra: usize) -> Result<()> {
        if extra == 0 {
            return Ok(());
        }
        let old = self.len();
        let tail = self.runs().last();
        self.reserve(extra)?;
        self.refs.resize(old + extra, 0);
        match tail {
            Some((tail_start, 0, tail_len)) => {
                self.set(tail_start, 0, tail_len + extra);
            }
            _ => self.set(old, 0, extra),
        }
        Ok(())
    }

    /// Checks that runs tile the slot range; returns the first bad slot.
    pub(crate) fn check(&self) -> core::result::Result<(), usize> {
        let mut slot = 0;
        while slot < self.len() {
            let head = self.refs[slot];
            if head == 0 || (head < 0 && slot + 1 >= self.len()) {
                return Err(slot);
            }
            let (_, run) = self.get(slot);
            if run == 0 || slot + run > self.len() {
                return Err(slot);
            }
            slot += run;
        }
        Ok(())
    }
}

/// Iterator over the runs of a [`PerPageRefs`].
pub(crate) struct Runs<'a> {
    ppref: &'a PerPageRefs,
    next: usize,
}

impl Iterator for Runs<'_> {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.ppref.len() {
            return None;
        }
        let start = self.next;
        let (count, len) = self.ppref.get(start);
        self.next = start + len.max(1);
        Some((start, count, len))
    }
}


#[cfg(test)]
mod tests_prop;
