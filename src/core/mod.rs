//! Core infrastructure for nano-specdec.
//!
//! This module contains the memory-management building blocks:
//! - BlockPool for fixed-capacity block allocation
//! - BlockTable for logical-to-physical address translation
//! - PagedCache owning the pool, the payload storage and all block tables
//! - KvSnapshot, the flat key/value format exchanged with model backends
//! - Sequence for token bookkeeping

pub mod block;
pub mod block_pool;
pub mod paged_cache;
pub mod sequence;
pub mod snapshot;

pub use block::{compute_num_blocks, BlockSpan, BlockTable};
pub use block_pool::{BlockId, BlockPool};
pub use paged_cache::{CacheStats, PagedCache, SequenceHandle};
pub use sequence::{FinishReason, Sequence, SequenceId};
pub use snapshot::{KvLayout, KvSnapshot, LayerKv};
