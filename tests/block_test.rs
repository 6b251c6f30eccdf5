//! Integration tests for BlockTable and BlockPool.

use nano_specdec::core::block::{compute_num_blocks, BlockSpan, BlockTable};
use nano_specdec::core::block_pool::BlockPool;
use nano_specdec::Error;
use rstest::rstest;

/// Reserve blocks from `pool` and write `tokens` positions to every layer.
fn grow(table: &mut BlockTable, pool: &mut BlockPool, tokens: usize) {
    for layer in 0..table.num_layers() {
        let needed = table.blocks_needed_for(layer, tokens).unwrap();
        for id in pool.allocate_many(needed).unwrap() {
            table.append_block(id);
        }
        table.advance(layer, tokens).unwrap();
    }
}

#[test]
fn test_block_table_grows_from_pool() {
    let mut pool = BlockPool::new(8);
    let mut table = BlockTable::new(4, 2);

    grow(&mut table, &mut pool, 3);
    assert_eq!(table.num_blocks(), 1);
    grow(&mut table, &mut pool, 6);
    assert_eq!(table.len(), 9);
    assert_eq!(table.num_blocks(), 3);
    assert_eq!(table.num_blocks(), compute_num_blocks(table.len(), 4));
    assert_eq!(pool.num_free_blocks(), 5);

    // Logical order follows allocation order
    assert_eq!(table.get_physical_block_ids(), &[0, 1, 2]);
    assert_eq!(table.translate(8).unwrap(), (2, 0));
}

#[test]
fn test_release_returns_every_block() {
    let mut pool = BlockPool::new(4);
    let mut table = BlockTable::new(4, 1);
    grow(&mut table, &mut pool, 13);
    assert_eq!(pool.num_free_blocks(), 0);

    let blocks = table.release();
    pool.free_many(&blocks).unwrap();
    assert_eq!(pool.num_free_blocks(), 4);
    assert!(table.is_empty());

    // Freeing them twice is caught
    assert!(matches!(
        pool.free_many(&blocks),
        Err(Error::CacheCorruption(_))
    ));
}

#[test]
fn test_pool_exhaustion_is_reported() {
    let mut pool = BlockPool::new(2);
    let mut table = BlockTable::new(16, 1);
    grow(&mut table, &mut pool, 32);

    let err = table
        .blocks_needed_for(0, 1)
        .and_then(|n| pool.allocate_many(n))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ResourceExhausted {
            requested: 1,
            available: 0
        }
    ));
}

#[test]
fn test_spans_follow_physical_blocks() {
    let mut pool = BlockPool::new(8);
    let mut other = BlockTable::new(4, 1);
    let mut table = BlockTable::new(4, 1);

    // Interleave two sequences so physical ids are not contiguous
    grow(&mut table, &mut pool, 4);
    grow(&mut other, &mut pool, 4);
    grow(&mut table, &mut pool, 4);

    assert_eq!(
        table.spans(0, 2, 7).unwrap(),
        vec![
            BlockSpan { block_id: 0, offset: 2, len: 2 },
            BlockSpan { block_id: 2, offset: 0, len: 3 },
        ]
    );
}

#[rstest]
#[case(4, 0, 0)]
#[case(4, 4, 1)]
#[case(4, 5, 2)]
#[case(16, 33, 3)]
#[case(1, 7, 7)]
fn test_compute_num_blocks(#[case] block_size: usize, #[case] tokens: usize, #[case] expected: usize) {
    assert_eq!(compute_num_blocks(tokens, block_size), expected);
}
