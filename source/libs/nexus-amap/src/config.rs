// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tunables for an [`crate::AmapSystem`], loadable from TOML.
//!
//! ```toml
//! lazy_alloc = true
//! realign_min_slots = 256
//! cow_restart_warn = 64
//! cow_restart_limit = 4096
//!
//! [limits]
//! chunks = 65536
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::CHUNK_SIZE;

/// Configuration of an amap system.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AmapConfig {
    /// Create amaps made by [`crate::AmapSystem::copy`] with lazily allocated chunks.
    pub lazy_alloc: bool,
    /// Minimum entry size, in pages, before copy may clip an entry to chunk boundaries.
    pub realign_min_slots: usize,
    /// Log a warning every this many CowNow restarts.
    pub cow_restart_warn: u32,
    /// Give up CowNow after this many restarts; `None` retries forever.
    pub cow_restart_limit: Option<u32>,
    /// Object count limits per pool.
    pub limits: PoolLimits,
}

/// Upper bounds on live objects per kind; `None` means unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolLimits {
    /// Live amaps.
    pub amaps: Option<usize>,
    /// Chunks across all chunked amaps.
    pub chunks: Option<usize>,
    /// Per-page reference arrays.
    pub pprefs: Option<usize>,
}

impl Default for AmapConfig {
    fn default() -> Self {
        Self {
            lazy_alloc: true,
            realign_min_slots: 256,
            cow_restart_warn: 64,
            cow_restart_limit: None,
            limits: PoolLimits::default(),
        }
    }
}

impl AmapConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cow_restart_warn == 0 {
            return Err(ConfigError::Invalid("cow_restart_warn must be non-zero"));
        }
        if self.realign_min_slots < CHUNK_SIZE {
            return Err(ConfigError::Invalid("realign_min_slots must cover at least one chunk"));
        }
        if self.limits.amaps == Some(0) {
            return Err(ConfigError::Invalid("limits.amaps must allow at least one amap"));
        }
        Ok(())
    }
}
