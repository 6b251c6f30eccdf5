//! Paged KV cache.
//!
//! The PagedCache owns the [`BlockPool`], the pre-allocated payload storage and
//! one [`BlockTable`] per live sequence. Payloads are opaque bytes; the cache
//! moves them, it never computes on them.
//!
//! ## Memory Layout
//!
//! Each layer has separate key and value buffers of
//! `num_blocks * block_size * bytes_per_token` bytes. The payload of logical
//! position `p` of a sequence lives at global slot
//! `block_ids[p / block_size] * block_size + p % block_size`.
//!
//! ## Concurrency
//!
//! All pool and table mutations go through one mutex. This coarse lock is the
//! scalability bound of the cache; a sharded pool would lift it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::core::block::{compute_num_blocks, BlockSpan, BlockTable};
use crate::core::block_pool::{BlockId, BlockPool};
use crate::core::sequence::SequenceId;
use crate::core::snapshot::{KvLayout, KvSnapshot, LayerKv};
use crate::error::{Error, Result};

/// Point-in-time pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of blocks.
    pub num_blocks: usize,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Blocks owned by some sequence.
    pub used_blocks: usize,
    /// Sequences with a live block table.
    pub live_sequences: usize,
}

/// Key and value buffers of one layer, for every slot of every block.
#[derive(Debug)]
struct LayerStorage {
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Debug)]
struct CacheState {
    pool: BlockPool,
    tables: HashMap<SequenceId, BlockTable>,
    storage: Vec<LayerStorage>,
    next_sequence_id: SequenceId,
}

/// Block-addressed cache shared by every sequence of an engine.
#[derive(Debug)]
pub struct PagedCache {
    state: Mutex<CacheState>,
    block_size: usize,
    layout: KvLayout,
}

impl PagedCache {
    /// Create a cache and pre-allocate all of its storage.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let layer_bytes = config
            .layer_bytes()
            .ok_or_else(|| Error::Config("cache size overflows usize".into()))?;
        let storage = (0..config.num_layers)
            .map(|_| LayerStorage {
                key: vec![0; layer_bytes],
                value: vec![0; layer_bytes],
            })
            .collect();

        debug!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            bytes = ?config.cache_size_bytes(),
            "Paged cache allocated"
        );

        Ok(Self {
            state: Mutex::new(CacheState {
                pool: BlockPool::new(config.num_blocks),
                tables: HashMap::new(),
                storage,
                next_sequence_id: 0,
            }),
            block_size: config.block_size,
            layout: KvLayout::new(config.num_layers, config.kv_bytes_per_token),
        })
    }

    // A panic while holding the lock must not stop other sequences from
    // releasing their blocks during unwinding.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Payload layout.
    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    /// Create an empty block table for a new sequence. Never fails.
    ///
    /// Prefer [`SequenceHandle::allocate`], which releases the entry on drop.
    pub fn allocate_sequence(&self) -> SequenceId {
        let mut state = self.lock();
        let seq_id = state.next_sequence_id;
        state.next_sequence_id += 1;
        state
            .tables
            .insert(seq_id, BlockTable::new(self.block_size, self.layout.num_layers));
        debug!(seq_id, "Sequence allocated");
        seq_id
    }

    /// Append payloads for consecutive tokens of one layer.
    ///
    /// Blocks are reserved first when the tail block lacks room. Nothing is
    /// written when the pool cannot supply them.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSequenceHandle`] for an unknown sequence
    /// - [`Error::MalformedBatch`] for a bad layer index or ragged payload
    /// - [`Error::ResourceExhausted`] when the pool runs dry
    pub fn append(&self, seq_id: SequenceId, layer: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let num_tokens = self.payload_tokens(key, value)?;

        let mut guard = self.lock();
        let CacheState {
            pool,
            tables,
            storage,
            ..
        } = &mut *guard;
        let table = tables
            .get_mut(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?;

        let needed = table.blocks_needed_for(layer, num_tokens)?;
        reserve_blocks(pool, table, seq_id, needed)?;

        let start = table.layer_len(layer)?;
        table.advance(layer, num_tokens)?;
        write_run(&mut storage[layer], table, layer, start, key, value, self.layout)?;
        Ok(())
    }

    /// Append a snapshot's tokens to every layer of a sequence.
    ///
    /// The sequence must have equal length in all layers. Blocks for the whole
    /// snapshot are reserved up front, so the import is all-or-nothing.
    pub fn import_snapshot(&self, seq_id: SequenceId, snapshot: &KvSnapshot) -> Result<()> {
        if snapshot.layout() != self.layout {
            return Err(Error::MalformedBatch(format!(
                "snapshot layout {:?} does not match cache layout {:?}",
                snapshot.layout(),
                self.layout
            )));
        }

        let mut guard = self.lock();
        let CacheState {
            pool,
            tables,
            storage,
            ..
        } = &mut *guard;
        let table = tables
            .get_mut(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?;
        if !table.is_aligned() {
            return Err(Error::MalformedBatch(format!(
                "sequence {seq_id} has unevenly written layers"
            )));
        }
        if snapshot.is_empty() {
            return Ok(());
        }

        let needed = table.blocks_needed_for(0, snapshot.num_tokens())?;
        reserve_blocks(pool, table, seq_id, needed)?;

        let start = table.len();
        for (layer, kv) in snapshot.layers().iter().enumerate() {
            table.advance(layer, snapshot.num_tokens())?;
            write_run(&mut storage[layer], table, layer, start, &kv.key, &kv.value, self.layout)?;
        }
        debug!(seq_id, tokens = snapshot.num_tokens(), len = table.len(), "Snapshot imported");
        Ok(())
    }

    /// Copy out every position written in all layers as a flat snapshot.
    pub fn export_snapshot(&self, seq_id: SequenceId) -> Result<KvSnapshot> {
        let state = self.lock();
        let table = state
            .tables
            .get(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?;
        let len = table.committed_len();

        let layers = (0..self.layout.num_layers)
            .map(|layer| gather_run(&state.storage[layer], table, layer, 0, len, self.layout))
            .collect::<Result<Vec<_>>>()?;
        KvSnapshot::from_layers(self.layout, layers)
    }

    /// Physical locations covering `[start, end)` of one layer.
    ///
    /// Gathering them is the caller's job; its cost grows with the number of
    /// blocks touched, not with the range length.
    pub fn read_range(
        &self,
        seq_id: SequenceId,
        layer: usize,
        start: usize,
        end: usize,
    ) -> Result<Vec<BlockSpan>> {
        let state = self.lock();
        state
            .tables
            .get(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?
            .spans(layer, start, end)
    }

    /// Contiguous copy of `[start, end)` of one layer.
    pub fn gather(&self, seq_id: SequenceId, layer: usize, start: usize, end: usize) -> Result<LayerKv> {
        let state = self.lock();
        let table = state
            .tables
            .get(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?;
        let storage = state
            .storage
            .get(layer)
            .ok_or_else(|| Error::MalformedBatch(format!("layer {layer} out of range")))?;
        gather_run(storage, table, layer, start, end, self.layout)
    }

    /// Free every block of a sequence and forget it.
    ///
    /// Blocks go back in reverse table order, so the sequence's first block
    /// ends up on top of the free list. Returns the number of blocks freed.
    pub fn free_sequence(&self, seq_id: SequenceId) -> Result<usize> {
        let mut guard = self.lock();
        let CacheState { pool, tables, .. } = &mut *guard;
        let mut table = tables
            .remove(&seq_id)
            .ok_or(Error::InvalidSequenceHandle(seq_id))?;

        let mut block_ids = table.release();
        block_ids.reverse();
        let freed = pool.free_many(&block_ids);
        if let Err(err) = &freed {
            error!(seq_id, error = %err, "Freeing sequence blocks failed");
        }
        debug_assert!(
            freed.is_ok(),
            "cache corruption while freeing sequence {seq_id}: {freed:?}"
        );
        freed?;

        debug!(
            seq_id,
            freed = block_ids.len(),
            free = pool.num_free_blocks(),
            "Sequence freed"
        );
        Ok(block_ids.len())
    }

    /// Check whether a sequence is live.
    pub fn contains(&self, seq_id: SequenceId) -> bool {
        self.lock().tables.contains_key(&seq_id)
    }

    /// Reserved length of a sequence.
    pub fn sequence_len(&self, seq_id: SequenceId) -> Result<usize> {
        self.lock()
            .tables
            .get(&seq_id)
            .map(BlockTable::len)
            .ok_or(Error::InvalidSequenceHandle(seq_id))
    }

    /// Physical blocks of a sequence, in logical order.
    pub fn block_ids(&self, seq_id: SequenceId) -> Result<Vec<BlockId>> {
        self.lock()
            .tables
            .get(&seq_id)
            .map(|t| t.get_physical_block_ids().to_vec())
            .ok_or(Error::InvalidSequenceHandle(seq_id))
    }

    /// Number of blocks on the free list.
    pub fn num_free_blocks(&self) -> usize {
        self.lock().pool.num_free_blocks()
    }

    /// Current pool usage.
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            num_blocks: state.pool.num_blocks(),
            free_blocks: state.pool.num_free_blocks(),
            used_blocks: state.pool.num_used_blocks(),
            live_sequences: state.tables.len(),
        }
    }

    /// Audit block accounting and ownership.
    ///
    /// Checks that every table holds exactly `ceil(len / block_size)` blocks,
    /// that no block appears twice across tables or in both a table and the
    /// free list, and that allocated plus free equals the pool size.
    pub fn check_invariants(&self) -> Result<()> {
        let state = self.lock();
        let pool = &state.pool;

        if pool.num_used_blocks() + pool.num_free_blocks() != pool.num_blocks() {
            return Err(Error::CacheCorruption("pool accounting does not add up".into()));
        }

        let free: HashSet<BlockId> = pool.free_block_ids().iter().copied().collect();
        if free.len() != pool.num_free_blocks() {
            return Err(Error::CacheCorruption("free list holds a block twice".into()));
        }

        let mut owned = HashSet::new();
        for (&seq_id, table) in &state.tables {
            if compute_num_blocks(table.len(), self.block_size) != table.num_blocks() {
                return Err(Error::CacheCorruption(format!(
                    "sequence {seq_id} holds {} blocks for {} tokens",
                    table.num_blocks(),
                    table.len()
                )));
            }
            for &block_id in table.get_physical_block_ids() {
                if !owned.insert(block_id) || free.contains(&block_id) {
                    return Err(Error::CacheCorruption(format!(
                        "block {block_id} of sequence {seq_id} is aliased"
                    )));
                }
            }
        }

        if owned.len() != pool.num_used_blocks() {
            return Err(Error::CacheCorruption(format!(
                "{} blocks allocated but {} owned by sequences",
                pool.num_used_blocks(),
                owned.len()
            )));
        }
        Ok(())
    }

    fn payload_tokens(&self, key: &[u8], value: &[u8]) -> Result<usize> {
        let bytes = self.layout.bytes_per_token;
        if key.len() != value.len() || key.len() % bytes != 0 {
            return Err(Error::MalformedBatch(format!(
                "payload of {}+{} bytes is not a whole number of {bytes}-byte tokens",
                key.len(),
                value.len()
            )));
        }
        Ok(key.len() / bytes)
    }
}

fn reserve_blocks(
    pool: &mut BlockPool,
    table: &mut BlockTable,
    seq_id: SequenceId,
    needed: usize,
) -> Result<()> {
    if needed == 0 {
        return Ok(());
    }
    match pool.allocate_many(needed) {
        Ok(block_ids) => {
            for block_id in block_ids {
                table.append_block(block_id);
            }
            Ok(())
        }
        Err(err) => {
            warn!(seq_id, needed, free = pool.num_free_blocks(), "KV cache exhausted");
            Err(err)
        }
    }
}

fn write_run(
    storage: &mut LayerStorage,
    table: &BlockTable,
    layer: usize,
    start: usize,
    key: &[u8],
    value: &[u8],
    layout: KvLayout,
) -> Result<()> {
    let bytes = layout.bytes_per_token;
    let end = start + key.len() / bytes;
    let mut src = 0;
    for span in table.spans(layer, start, end)? {
        let dst = (span.block_id * table.block_size() + span.offset) * bytes;
        let n = span.len * bytes;
        storage.key[dst..dst + n].copy_from_slice(&key[src..src + n]);
        storage.value[dst..dst + n].copy_from_slice(&value[src..src + n]);
        src += n;
    }
    Ok(())
}

fn gather_run(
    storage: &LayerStorage,
    table: &BlockTable,
    layer: usize,
    start: usize,
    end: usize,
    layout: KvLayout,
) -> Result<LayerKv> {
    let bytes = layout.bytes_per_token;
    let spans = table.spans(layer, start, end)?;
    let mut out = LayerKv {
        key: Vec::with_capacity((end - start) * bytes),
        value: Vec::with_capacity((end - start) * bytes),
    };
    for span in spans {
        let src = (span.block_id * table.block_size() + span.offset) * bytes;
        let n = span.len * bytes;
        out.key.extend_from_slice(&storage.key[src..src + n]);
        out.value.extend_from_slice(&storage.value[src..src + n]);
    }
    Ok(out)
}

/// Scoped ownership of one sequence's cache entry.
///
/// Dropping the handle frees the sequence's blocks, so the entry is released
/// on every exit path: normal completion, early return, cancellation and
/// panic unwinding alike.
#[derive(Debug)]
pub struct SequenceHandle {
    cache: Arc<PagedCache>,
    seq_id: SequenceId,
    released: bool,
}

impl SequenceHandle {
    /// Allocate a new sequence in `cache`.
    pub fn allocate(cache: &Arc<PagedCache>) -> Self {
        Self {
            seq_id: cache.allocate_sequence(),
            cache: Arc::clone(cache),
            released: false,
        }
    }

    /// The sequence id.
    pub fn id(&self) -> SequenceId {
        self.seq_id
    }

    /// The cache the sequence lives in.
    pub fn cache(&self) -> &Arc<PagedCache> {
        &self.cache
    }

    /// Whether the entry has already been freed.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Free the entry now. Idempotent; returns the number of blocks freed.
    pub fn release(&mut self) -> Result<usize> {
        if self.released {
            return Ok(0);
        }
        self.released = true;
        self.cache.free_sequence(self.seq_id)
    }
}

impl Drop for SequenceHandle {
    fn drop(&mut self) {
        match self.release() {
            Ok(_) | Err(Error::InvalidSequenceHandle(_)) => {}
            Err(err) => warn!(seq_id = self.seq_id, error = %err, "Releasing sequence on drop failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(num_blocks: usize, block_size: usize) -> Arc<PagedCache> {
        let config = EngineConfig::default()
            .num_blocks(num_blocks)
            .block_size(block_size)
            .num_layers(2)
            .kv_bytes_per_token(2);
        Arc::new(PagedCache::new(&config).unwrap())
    }

    fn payload(tokens: usize, fill: u8) -> Vec<u8> {
        vec![fill; tokens * 2]
    }

    #[test]
    fn test_allocate_sequence_ids_are_unique() {
        let cache = test_cache(4, 4);
        let a = cache.allocate_sequence();
        let b = cache.allocate_sequence();
        assert_ne!(a, b);
        cache.free_sequence(a).unwrap();
        let c = cache.allocate_sequence();
        assert_ne!(a, c);
        assert_eq!(cache.stats().live_sequences, 2);
    }

    #[test]
    fn test_append_reserves_blocks_lazily() {
        let cache = test_cache(8, 4);
        let seq = cache.allocate_sequence();
        assert_eq!(cache.block_ids(seq).unwrap().len(), 0);

        cache.append(seq, 0, &payload(3, 1), &payload(3, 2)).unwrap();
        assert_eq!(cache.block_ids(seq).unwrap().len(), 1);

        // Second layer reuses the reservation
        cache.append(seq, 1, &payload(3, 1), &payload(3, 2)).unwrap();
        assert_eq!(cache.block_ids(seq).unwrap().len(), 1);

        cache.append(seq, 0, &payload(2, 1), &payload(2, 2)).unwrap();
        assert_eq!(cache.block_ids(seq).unwrap().len(), 2);
        assert_eq!(cache.sequence_len(seq).unwrap(), 5);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_append_rejects_ragged_payload() {
        let cache = test_cache(8, 4);
        let seq = cache.allocate_sequence();
        assert!(matches!(
            cache.append(seq, 0, &[1, 2, 3], &[1, 2, 3]),
            Err(Error::MalformedBatch(_))
        ));
        assert!(matches!(
            cache.append(seq, 0, &payload(1, 0), &payload(2, 0)),
            Err(Error::MalformedBatch(_))
        ));
        assert!(matches!(
            cache.append(seq, 5, &payload(1, 0), &payload(1, 0)),
            Err(Error::MalformedBatch(_))
        ));
    }

    #[test]
    fn test_gather_round_trips_across_blocks() {
        let cache = test_cache(8, 4);
        let seq = cache.allocate_sequence();
        let key: Vec<u8> = (0..20).collect();
        let value: Vec<u8> = (100..120).collect();
        cache.append(seq, 0, &key, &value).unwrap();

        let kv = cache.gather(seq, 0, 3, 9).unwrap();
        assert_eq!(kv.key, key[6..18].to_vec());
        assert_eq!(kv.value, value[6..18].to_vec());
        // Positions 3 | 4..8 | 8 touch three blocks
        assert_eq!(cache.read_range(seq, 0, 3, 9).unwrap().len(), 3);
    }

    #[test]
    fn test_handle_releases_on_drop() {
        let cache = test_cache(4, 4);
        {
            let handle = SequenceHandle::allocate(&cache);
            cache
                .append(handle.id(), 0, &payload(9, 0), &payload(9, 0))
                .unwrap();
            assert_eq!(cache.num_free_blocks(), 1);
        }
        assert_eq!(cache.num_free_blocks(), 4);
        assert_eq!(cache.stats().live_sequences, 0);
    }

    #[test]
    fn test_handle_release_is_idempotent() {
        let cache = test_cache(4, 4);
        let mut handle = SequenceHandle::allocate(&cache);
        cache
            .append(handle.id(), 0, &payload(5, 0), &payload(5, 0))
            .unwrap();
        assert_eq!(handle.release().unwrap(), 2);
        assert_eq!(handle.release().unwrap(), 0);
        assert!(handle.is_released());
        drop(handle);
        assert_eq!(cache.num_free_blocks(), 4);
    }

    #[test]
    fn test_handle_released_during_unwinding() {
        let cache = test_cache(4, 4);
        let inner = Arc::clone(&cache);
        let result = std::panic::catch_unwind(move || {
            let handle = SequenceHandle::allocate(&inner);
            inner
                .append(handle.id(), 0, &payload(8, 0), &payload(8, 0))
                .unwrap();
            panic!("compute failed");
        });
        assert!(result.is_err());
        assert_eq!(cache.num_free_blocks(), 4);
    }

    #[test]
    fn test_free_unknown_sequence() {
        let cache = test_cache(4, 4);
        assert!(matches!(
            cache.free_sequence(42),
            Err(Error::InvalidSequenceHandle(42))
        ));
    }
}
