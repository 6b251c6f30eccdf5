//! Flat key/value snapshots.
//!
//! A [`KvSnapshot`] is the representation a model backend natively produces or
//! consumes: for every layer, one contiguous key buffer and one contiguous
//! value buffer holding `num_tokens` consecutive positions. The cache never
//! interprets the bytes; it only moves them between snapshots and blocks.

use crate::error::{Error, Result};

/// Shape of the opaque per-token payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLayout {
    /// Number of layers.
    pub num_layers: usize,
    /// Bytes of key (and of value) per token per layer.
    pub bytes_per_token: usize,
}

impl KvLayout {
    /// Create a new layout.
    pub fn new(num_layers: usize, bytes_per_token: usize) -> Self {
        Self {
            num_layers,
            bytes_per_token,
        }
    }
}

/// Key and value bytes of one layer for a run of consecutive tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerKv {
    /// Key payload, `num_tokens * bytes_per_token` bytes.
    pub key: Vec<u8>,
    /// Value payload, same length as `key`.
    pub value: Vec<u8>,
}

/// Key/value payloads for a run of consecutive tokens across all layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSnapshot {
    layout: KvLayout,
    num_tokens: usize,
    layers: Vec<LayerKv>,
}

impl KvSnapshot {
    /// An empty snapshot with the given layout.
    pub fn empty(layout: KvLayout) -> Self {
        Self {
            layout,
            num_tokens: 0,
            layers: vec![LayerKv::default(); layout.num_layers],
        }
    }

    /// Build a snapshot from per-layer buffers, checking their shapes.
    pub fn from_layers(layout: KvLayout, layers: Vec<LayerKv>) -> Result<Self> {
        if layers.len() != layout.num_layers {
            return Err(Error::MalformedBatch(format!(
                "snapshot has {} layers, expected {}",
                layers.len(),
                layout.num_layers
            )));
        }
        if layout.bytes_per_token == 0 {
            return Err(Error::MalformedBatch("zero-sized token payload".into()));
        }

        let num_tokens = layers
            .first()
            .map(|l| l.key.len() / layout.bytes_per_token)
            .unwrap_or(0);
        let expected = num_tokens * layout.bytes_per_token;
        for (idx, layer) in layers.iter().enumerate() {
            if layer.key.len() != expected || layer.value.len() != expected {
                return Err(Error::MalformedBatch(format!(
                    "layer {idx} payload is {}+{} bytes, expected {expected} each",
                    layer.key.len(),
                    layer.value.len()
                )));
            }
        }

        Ok(Self {
            layout,
            num_tokens,
            layers,
        })
    }

    /// Payload layout.
    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    /// Number of tokens covered.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Check if the snapshot covers no tokens.
    pub fn is_empty(&self) -> bool {
        self.num_tokens == 0
    }

    /// Per-layer buffers.
    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    /// Buffers of one layer.
    pub fn layer(&self, layer: usize) -> Option<&LayerKv> {
        self.layers.get(layer)
    }

    /// Keep only the first `num_tokens` tokens.
    pub fn truncate(&mut self, num_tokens: usize) {
        if num_tokens >= self.num_tokens {
            return;
        }
        let bytes = num_tokens * self.layout.bytes_per_token;
        for layer in &mut self.layers {
            layer.key.truncate(bytes);
            layer.value.truncate(bytes);
        }
        self.num_tokens = num_tokens;
    }
}
