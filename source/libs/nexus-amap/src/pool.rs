// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-object-kind allocation accounting for amaps, chunks and pprefs
//! OWNERS: @kernel-mm-team
//! INVARIANTS: in_use never exceeds the configured limit; every reserve is paired
//!             with exactly one release
//!
//! A pool does not hand out memory itself; it bounds how many objects of a
//! kind may exist and lets `Blocking::MayWait` callers sleep until another
//! thread releases one.

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::config::PoolLimits;
use crate::error::{AmapError, Result};
use crate::types::Blocking;
use crate::LOG_TARGET;

pub(crate) struct ObjectPool {
    kind: &'static str,
    limit: Option<usize>,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl ObjectPool {
    fn new(kind: &'static str, limit: Option<usize>) -> Self {
        Self { kind, limit, in_use: Mutex::new(0), released: Condvar::new() }
    }

    /// Accounts for one more object, sleeping for a release if the pool is full
    /// and the caller may wait.
    pub(crate) fn reserve(&self, blocking: Blocking) -> Result<()> {
        let mut in_use = self.in_use.lock();
        loop {
            match self.limit {
                Some(limit) if *in_use >= limit => match blocking {
                    Blocking::NoWait => return Err(AmapError::OutOfMemory { kind: self.kind }),
                    Blocking::MayWait => {
                        trace!(target: LOG_TARGET, "pool {}: full ({}), waiting", self.kind, limit);
                        self.released.wait(&mut in_use);
                    }
                },
                _ => {
                    *in_use += 1;
                    return Ok(());
                }
            }
        }
    }

    /// Sleeps until at least one more object fits, without reserving it.
    /// Callers re-validate and retry their `NoWait` path afterwards.
    pub(crate) fn wait_for_room(&self) {
        let mut in_use = self.in_use.lock();
        if let Some(limit) = self.limit {
            while *in_use >= limit {
                trace!(target: LOG_TARGET, "pool {}: full ({}), waiting", self.kind, limit);
                self.released.wait(&mut in_use);
            }
        }
    }

    pub(crate) fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut in_use = self.in_use.lock();
        assert!(*in_use >= count, "pool {}: releasing {} of {}", self.kind, count, *in_use);
        *in_use -= count;
        self.released.notify_all();
    }

    pub(crate) fn in_use(&self) -> usize {
        *self.in_use.lock()
    }
}

pub(crate) struct Pools {
    pub(crate) amaps: ObjectPool,
    pub(crate) chunks: ObjectPool,
    pub(crate) pprefs: ObjectPool,
}

impl Pools {
    pub(crate) fn new(limits: &PoolLimits) -> Self {
        Self {
            amaps: ObjectPool::new("amap", limits.amaps),
            chunks: ObjectPool::new("amap chunk", limits.chunks),
            pprefs: ObjectPool::new("ppref array", limits.pprefs),
        }
    }

    pub(crate) fn usage(&self) -> PoolUsage {
        PoolUsage {
            amaps: self.amaps.in_use(),
            chunks: self.chunks.in_use(),
            pprefs: self.pprefs.in_use(),
        }
    }
}

/// Snapshot of how many objects of each kind are currently allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Live amap bodies.
    pub amaps: usize,
    /// Chunks of chunked amaps (inline chunks of small amaps are not counted).
    pub chunks: usize,
    /// Per-page reference arrays.
    pub pprefs: usize,
}
