// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types. Caller bugs (precondition violations) are panics, not errors.

use crate::types::{AmapId, AnonId};

/// Result alias for amap operations.
pub type Result<T> = core::result::Result<T, AmapError>;

/// Recoverable failures reported by amap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AmapError {
    /// An allocation could not be satisfied under the requested blocking policy.
    #[error("out of memory allocating {kind}")]
    OutOfMemory {
        /// Object kind that failed to allocate.
        kind: &'static str,
    },
    /// The amap has more than one reference and cannot be grown in place.
    #[error("amap is shared")]
    Shared,
    /// CowNow restarted more often than the configured limit.
    #[error("copy-on-write scan gave up after {restarts} restarts")]
    CowRestartLimit {
        /// Number of restarts performed before giving up.
        restarts: u32,
    },
    /// The page backend reported a failure.
    #[error(transparent)]
    Page(#[from] PageError),
}

/// Failures reported by a [`crate::PageBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    /// No page could be allocated.
    #[error("no free pages")]
    NoMemory,
    /// Swap I/O for the anon failed.
    #[error("swap i/o failed for {anon}")]
    Io {
        /// Anon whose content could not be read.
        anon: AnonId,
    },
}

/// Errors produced while loading an [`crate::AmapConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading amap config: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML for this schema.
    #[error("parsing amap config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is syntactically fine but unusable.
    #[error("invalid amap config: {0}")]
    Invalid(&'static str),
}

/// Consistency violations found by [`crate::Amap::verify`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// `nused` disagrees with the occupancy bitmaps.
    #[error("{amap}: nused={nused} but bitmaps count {counted}")]
    Occupancy {
        /// Amap being verified.
        amap: AmapId,
        /// Recorded used-slot count.
        nused: usize,
        /// Sum of bitmap popcounts.
        counted: usize,
    },
    /// A bitmap bit and the anon pointer of a slot disagree.
    #[error("{amap}: bitmap and anon disagree at slot {slot}")]
    Bitmap {
        /// Amap being verified.
        amap: AmapId,
        /// Offending slot.
        slot: usize,
    },
    /// A chunk has the wrong geometry, sits in the wrong bucket, or is empty.
    #[error("{amap}: malformed chunk at base {base}")]
    Chunk {
        /// Amap being verified.
        amap: AmapId,
        /// Base slot of the chunk.
        base: usize,
    },
    /// The per-page reference runs do not partition the slot range.
    #[error("{amap}: ppref runs broken at slot {slot}")]
    Ppref {
        /// Amap being verified.
        amap: AmapId,
        /// First slot where the encoding is inconsistent.
        slot: usize,
    },
}
