// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Anonymous memory maps (amaps) backing private anonymous regions
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + proptest (ppref, occupancy) + integration tests under tests/
//! PUBLIC API: AmapSystem, Amap, AmapRef, MapEntry, PageBackend, AmapConfig
//! DEPENDS_ON: parking_lot, bitflags, log, thiserror, serde/toml
//! INVARIANTS: nused == Σ popcount(chunk bitmaps); ppref runs partition the slot range;
//!             wipeout runs exactly once, when the last reference goes away
//!
//! An amap maps the page slots of an anonymous region to reference-counted
//! anons. Storage is materialised lazily in chunks of [`CHUNK_SIZE`] slots;
//! fork-time sharing is resolved by [`AmapSystem::copy`] (deferred) or
//! [`AmapSystem::cow_now`] (eager), and partial unmaps are tracked with
//! run-length encoded per-page reference counts.
//!
//! All state hangs off an explicit [`AmapSystem`] handle: the page backend,
//! the allocation pools and the registry of live amaps scanned by
//! [`AmapSystem::swap_off`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

mod amap;
mod backend;
mod bitmap;
mod chunk;
mod config;
mod cow;
mod entry;
mod error;
#[cfg(feature = "backend-host")]
mod host;
mod pool;
mod ppref;
mod registry;
mod system;
mod types;

pub use amap::{Amap, AmapFlags, PprefRun};
pub use backend::PageBackend;
pub use config::{AmapConfig, PoolLimits};
pub use cow::{CopyAction, CopyOutcome};
pub use entry::{AmapRef, EntryFlags, MapEntry};
pub use error::{AmapError, ConfigError, PageError, Result, VerifyError};
#[cfg(feature = "backend-host")]
pub use host::{HostPager, HostStats};
pub use pool::PoolUsage;
pub use system::{AmapSystem, RefFlags};
pub use types::{AmapId, AnonId, Blocking};

/// Number of slots materialised together as one chunk.
pub const CHUNK_SIZE: usize = 16;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Log target used by every record emitted from this crate.
const LOG_TARGET: &str = "amap";

#[cfg(test)]
mod tests_prop;
