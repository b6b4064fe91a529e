// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Newtypes for anon and amap identities plus the allocation policy.

use core::fmt;
use core::num::NonZeroU64;

/// Handle naming one anonymous page owned by the page backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnonId(NonZeroU64);

impl AnonId {
    /// Constructs a handle from a raw value; zero is never a valid anon.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Returns the raw representation of the handle.
    pub fn to_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for AnonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "anon#{}", self.to_raw())
    }
}

/// Identity of an amap, unique for the lifetime of its [`crate::AmapSystem`].
///
/// Identities are handed out in increasing order, which is also the order the
/// swap-off sweep walks the live registry in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AmapId(u64);

impl AmapId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Exposes the raw numeric value, primarily for diagnostics.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amap#{}", self.0)
    }
}

/// Whether an allocating call may suspend the caller until memory is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blocking {
    /// Wait for memory to be released elsewhere.
    MayWait,
    /// Fail immediately with [`crate::AmapError::OutOfMemory`].
    NoWait,
}
