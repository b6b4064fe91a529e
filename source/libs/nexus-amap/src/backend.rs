// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boundary between the amap layer and the page/swap/protection layers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageBackend
//! INVARIANTS: Methods that may suspend are never called with an amap lock held

use crate::error::PageError;
use crate::types::{AnonId, Blocking};

/// Services the amap layer consumes from the rest of the VM system.
///
/// Anons are reference counted by the backend. Every occupied amap slot owns
/// one reference; the amap layer only adjusts counts and asks for freeing,
/// duplication and page-in.
pub trait PageBackend: Send + Sync {
    /// Takes an additional reference on `anon`.
    fn add_ref(&self, anon: AnonId);

    /// Drops one reference on `anon`. Returns `true` when it was the last one;
    /// the caller then owes the anon to [`PageBackend::free_pages`].
    fn drop_ref(&self, anon: AnonId) -> bool;

    /// Current reference count of `anon`.
    fn refcount(&self, anon: AnonId) -> usize;

    /// Reclaims anons whose last reference was dropped.
    fn free_pages(&self, anons: &[AnonId]);

    /// Allocates a new anon (one reference) holding a copy of `anon`'s page.
    fn duplicate(&self, anon: AnonId, blocking: Blocking) -> Result<AnonId, PageError>;

    /// Sleeps until the page daemon has freed some memory.
    fn wait_for_memory(&self);

    /// Whether `anon`'s page is busy (e.g. being written to swap).
    fn is_busy(&self, anon: AnonId) -> bool;

    /// Sleeps until `anon`'s page is no longer busy.
    fn wait_unbusy(&self, anon: AnonId);

    /// Removes write access to `anon`'s page from every mapping.
    fn revoke_write(&self, anon: AnonId);

    /// Swap slot holding `anon`'s content, if it has one.
    fn swap_slot(&self, anon: AnonId) -> Option<u32>;

    /// Reads `anon`'s content back from swap and releases its swap slot.
    /// May sleep.
    fn page_in(&self, anon: AnonId) -> Result<(), PageError>;
}
