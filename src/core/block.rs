//! Block tables for the paged KV cache.
//!
//! The cache divides key/value storage into fixed-size blocks, similar to
//! how operating systems manage virtual memory with pages. A sequence never
//! owns a contiguous buffer; it owns an ordered list of block ids.

use crate::core::block_pool::BlockId;
use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// A physical location covering part of a logical token range.
///
/// `offset` and `len` are in token slots within block `block_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Physical block holding the tokens.
    pub block_id: BlockId,
    /// First slot within the block.
    pub offset: usize,
    /// Number of slots covered.
    pub len: usize,
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the shared pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// Every layer is written independently, so the table tracks one length per
/// layer. Blocks are reserved for the longest layer; `len()` reports that
/// reservation and `ceil(len() / block_size) == num_blocks()` always holds.
///
/// # Example
///
/// ```
/// use nano_specdec::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16, 1);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.advance(0, 21).unwrap();
///
/// // Token 20 -> logical block 1 -> physical block 12, slot 4
/// assert_eq!(table.translate(20).unwrap(), (12, 4));
/// ```
#[derive(Debug, Clone)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<BlockId>,
    /// Tokens written so far, per layer.
    layer_lens: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize, num_layers: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            layer_lens: vec![0; num_layers],
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of layers tracked by this table.
    pub fn num_layers(&self) -> usize {
        self.layer_lens.len()
    }

    /// Positions reserved for this sequence (the longest layer).
    pub fn len(&self) -> usize {
        self.layer_lens.iter().copied().max().unwrap_or(0)
    }

    /// Positions written in every layer.
    pub fn committed_len(&self) -> usize {
        self.layer_lens.iter().copied().min().unwrap_or(0)
    }

    /// Tokens written so far in one layer.
    pub fn layer_len(&self, layer: usize) -> Result<usize> {
        self.layer_lens
            .get(layer)
            .copied()
            .ok_or_else(|| layer_out_of_range(layer, self.layer_lens.len()))
    }

    /// Check if no token has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every layer has the same length.
    pub fn is_aligned(&self) -> bool {
        self.len() == self.committed_len()
    }

    /// Get physical block ID for a logical block index.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Option<BlockId> {
        self.block_ids.get(logical_block_idx).copied()
    }

    /// Translate a logical position into `(block_id, offset)`.
    ///
    /// Positions at or beyond the reserved length are not addressable.
    pub fn translate(&self, pos: usize) -> Result<(BlockId, usize)> {
        if pos >= self.len() {
            return Err(Error::MalformedBatch(format!(
                "position {pos} beyond sequence length {}",
                self.len()
            )));
        }
        let block_id = self.block_ids[pos / self.block_size];
        Ok((block_id, pos % self.block_size))
    }

    /// Add a new physical block to the table.
    ///
    /// Called when the sequence grows and needs more blocks.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Blocks that must be added before `layer` can take `num_tokens` more.
    pub fn blocks_needed_for(&self, layer: usize, num_tokens: usize) -> Result<usize> {
        let end = self.layer_len(layer)? + num_tokens;
        Ok(compute_num_blocks(end, self.block_size).saturating_sub(self.block_ids.len()))
    }

    /// Record `num_tokens` newly written positions in `layer`.
    ///
    /// The blocks backing them must already be in the table.
    pub fn advance(&mut self, layer: usize, num_tokens: usize) -> Result<()> {
        let capacity = self.block_ids.len() * self.block_size;
        let num_layers = self.layer_lens.len();
        let len = self
            .layer_lens
            .get_mut(layer)
            .ok_or_else(|| layer_out_of_range(layer, num_layers))?;
        if *len + num_tokens > capacity {
            return Err(Error::CacheCorruption(format!(
                "layer {layer} advanced to {} with only {capacity} slots reserved",
                *len + num_tokens
            )));
        }
        *len += num_tokens;
        Ok(())
    }

    /// Physical locations covering `[start, end)` of `layer`, in order.
    ///
    /// One span per block touched.
    pub fn spans(&self, layer: usize, start: usize, end: usize) -> Result<Vec<BlockSpan>> {
        let layer_len = self.layer_len(layer)?;
        if start > end || end > layer_len {
            return Err(Error::MalformedBatch(format!(
                "range [{start}, {end}) outside layer {layer} of length {layer_len}"
            )));
        }

        let mut spans = Vec::with_capacity(compute_num_blocks(end - start, self.block_size) + 1);
        let mut pos = start;
        while pos < end {
            let offset = pos % self.block_size;
            let len = (self.block_size - offset).min(end - pos);
            spans.push(BlockSpan {
                block_id: self.block_ids[pos / self.block_size],
                offset,
                len,
            });
            pos += len;
        }
        Ok(spans)
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Take every block out of the table, leaving it empty.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.layer_lens.iter_mut().for_each(|len| *len = 0);
        std::mem::take(&mut self.block_ids)
    }
}

fn layer_out_of_range(layer: usize, num_layers: usize) -> Error {
    Error::MalformedBatch(format!(
        "layer {layer} out of range for {num_layers} cached layers"
    ))
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_specdec::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
