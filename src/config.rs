//! Configuration types for nano-specdec.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::speculative::SpeculativeConfig;

/// Engine configuration: shape of the paged KV cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block size for the paged cache (tokens per block).
    pub block_size: usize,
    /// Total number of blocks, pre-allocated at construction.
    pub num_blocks: usize,
    /// Number of transformer layers whose key/value payloads are cached.
    pub num_layers: usize,
    /// Bytes of key payload (and, separately, of value payload) per token per layer.
    pub kv_bytes_per_token: usize,
    /// Token id written into padding positions of a batch.
    pub pad_token_id: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: 1024,
            num_layers: 2,
            kv_bytes_per_token: 64,
            pad_token_id: 0,
        }
    }
}

impl EngineConfig {
    /// Set the block size.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the number of blocks.
    pub fn num_blocks(mut self, num_blocks: usize) -> Self {
        self.num_blocks = num_blocks;
        self
    }

    /// Set the number of cached layers.
    pub fn num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    /// Set the per-token, per-layer payload size in bytes.
    pub fn kv_bytes_per_token(mut self, bytes: usize) -> Self {
        self.kv_bytes_per_token = bytes;
        self
    }

    /// Bytes of one K or V buffer for one layer, or `None` on overflow.
    pub fn layer_bytes(&self) -> Option<usize> {
        self.num_blocks
            .checked_mul(self.block_size)?
            .checked_mul(self.kv_bytes_per_token)
    }

    /// Bytes pre-allocated for the whole cache (all layers, K and V), or
    /// `None` when that does not fit in `usize`.
    pub fn cache_size_bytes(&self) -> Option<usize> {
        self.layer_bytes()?.checked_mul(self.num_layers)?.checked_mul(2)
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Config("num_layers must be positive".into()));
        }
        if self.kv_bytes_per_token == 0 {
            return Err(Error::Config("kv_bytes_per_token must be positive".into()));
        }
        if self.cache_size_bytes().is_none() {
            return Err(Error::Config(format!(
                "cache of {} blocks x {} tokens x {} bytes x {} layers overflows usize",
                self.num_blocks, self.block_size, self.kv_bytes_per_token, self.num_layers
            )));
        }
        Ok(())
    }
}

/// File-level configuration combining the cache and the decode loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Paged cache configuration.
    pub engine: EngineConfig,
    /// Speculative decoding configuration.
    pub speculative: SpeculativeConfig,
}

impl Config {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.speculative.validate()
    }
}
