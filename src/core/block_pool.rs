//! Block pool for the paged KV cache.
//!
//! The BlockPool hands out fixed-size storage blocks, similar to how an
//! operating system manages physical memory pages.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) block allocation and deallocation
//! - **LIFO reuse**: the most recently freed block is handed out first
//! - **Ownership audit**: every block is either free or allocated, never both
//!
//! Exhaustion is always reported to the caller. The pool never reclaims a
//! block on its own.
//!
//! ## Example
//!
//! ```
//! use nano_specdec::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(1024);
//!
//! // Allocate a block
//! let block_id = pool.allocate().unwrap();
//!
//! // Use the block...
//!
//! // Free when done
//! pool.free(block_id).unwrap();
//! ```

use crate::error::{Error, Result};

/// Physical block identifier.
pub type BlockId = usize;

/// Manages allocation and deallocation of cache blocks.
///
/// The pool maintains:
/// - A LIFO free list for O(1) allocation/deallocation
/// - An allocation bitmap used to detect double frees
#[derive(Debug)]
pub struct BlockPool {
    /// Free block IDs; the top of the stack is handed out next.
    free_list: Vec<BlockId>,
    /// Whether each block is currently handed out.
    allocated: Vec<bool>,
    /// Total number of blocks.
    num_blocks: usize,
}

impl BlockPool {
    /// Create a new block pool with the specified capacity.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_specdec::core::block_pool::BlockPool;
    ///
    /// let pool = BlockPool::new(1024);
    /// assert_eq!(pool.num_free_blocks(), 1024);
    /// ```
    pub fn new(num_blocks: usize) -> Self {
        // Reversed so that the first allocations return low IDs
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();

        Self {
            free_list,
            allocated: vec![false; num_blocks],
            num_blocks,
        }
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of allocated blocks.
    pub fn num_used_blocks(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Check whether a block is currently handed out.
    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        self.allocated.get(block_id).copied().unwrap_or(false)
    }

    /// Allocate a single block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if no free blocks are available.
    ///
    /// # Example
    ///
    /// ```
    /// use nano_specdec::core::block_pool::BlockPool;
    ///
    /// let mut pool = BlockPool::new(2);
    ///
    /// let b1 = pool.allocate().unwrap();
    /// let b2 = pool.allocate().unwrap();
    ///
    /// // Third allocation fails
    /// assert!(pool.allocate().is_err());
    /// ```
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = self.free_list.pop().ok_or(Error::ResourceExhausted {
            requested: 1,
            available: 0,
        })?;
        self.allocated[block_id] = true;
        Ok(block_id)
    }

    /// Allocate multiple blocks at once, or none at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if not enough free blocks are available.
    pub fn allocate_many(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::ResourceExhausted {
                requested: num_blocks,
                available: self.free_list.len(),
            });
        }

        let mut block_ids = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            block_ids.push(self.allocate()?);
        }

        Ok(block_ids)
    }

    /// Free a block and push it onto the free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheCorruption`] if the block is unknown or already free.
    pub fn free(&mut self, block_id: BlockId) -> Result<()> {
        match self.allocated.get_mut(block_id) {
            Some(slot) if *slot => {
                *slot = false;
                self.free_list.push(block_id);
                Ok(())
            }
            Some(_) => Err(Error::CacheCorruption(format!(
                "block {block_id} freed while not allocated"
            ))),
            None => Err(Error::CacheCorruption(format!(
                "block {block_id} outside pool of {} blocks",
                self.num_blocks
            ))),
        }
    }

    /// Free multiple blocks, stopping at the first corrupt entry.
    pub fn free_many(&mut self, block_ids: &[BlockId]) -> Result<()> {
        block_ids.iter().try_for_each(|&id| self.free(id))
    }

    /// Free block IDs, in stack order.
    pub fn free_block_ids(&self) -> &[BlockId] {
        &self.free_list
    }
}
