// src/config.rs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloader::DEFAULT_CHUNK_SIZE;
use crate::pool::DEFAULT_POOL_SIZE;

/// Largest read chunk the engine allocates per transfer.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid speed limit '{0}': expected a number with an optional k or m suffix")]
    InvalidSpeedLimit(String),
}

/// Settings fixed at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of transfers running at once. 0 selects the default.
    pub workers: usize,
    /// Aggregate limit in bytes per second. 0 means unlimited.
    pub speed_limit: u64,
    /// Bytes read from a source per chunk. 0 selects the default; values
    /// above [`MAX_CHUNK_SIZE`] are clamped.
    pub chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_POOL_SIZE,
            speed_limit: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl EngineConfig {
    /// Replaces zero values with their defaults and clamps the chunk size.
    pub fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = DEFAULT_POOL_SIZE;
        }
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        self.chunk_size = self.chunk_size.min(MAX_CHUNK_SIZE);
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.speed_limit > 0
    }
}

/// Parses a speed limit such as `500`, `64k` or `2m` into bytes per second.
///
/// `k` multiplies by 1024 and `m` by 1024²; the suffix is case-insensitive.
pub fn parse_speed_limit(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidSpeedLimit(raw.to_string());

    let (digits, factor) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(factor).ok_or_else(invalid)
}
