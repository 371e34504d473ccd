//! Shared helpers for the per-channel index tree: depth arithmetic and node (de)serialization
//! glue used by both the read path ([`crate::block_manager`]) and the append path
//! ([`crate::append`]).

use crate::blockio::BlockIo;
use crate::constants::FANOUT;
use crate::error::{IndexError, Result};
use crate::lookup::LookupNode;

/// Tree depth for a channel holding `n_blocks` data blocks (`max(active, allocated)`), per
/// §3: `ceil(log_FANOUT(n_blocks))`, with a minimum depth of 1 once any block exists.
pub fn depth_for(n_blocks: u32) -> u8 {
    if n_blocks == 0 {
        return 0;
    }
    let mut depth = 1u32;
    let mut capacity = FANOUT as u64;
    while capacity < n_blocks as u64 {
        capacity *= FANOUT as u64;
        depth += 1;
    }
    depth as u8
}

/// Reads and parses one `DLSIZE`-byte lookup node from `offset`.
pub fn read_node(io: &BlockIo, offset: u64) -> Result<LookupNode, IndexError> {
    let mut buf = vec![0u8; crate::constants::DLSIZE];
    io.read(&mut buf, offset).map_err(|e| IndexError::CorruptNode { offset, reason: e.to_string() })?;
    LookupNode::from_bytes(&buf, offset)
}

/// Writes a lookup node back to its recorded offset.
pub fn write_node(io: &BlockIo, node: &LookupNode) -> Result<(), IndexError> {
    io.write(&node.to_bytes(), node.offset)
        .map_err(|e| IndexError::CorruptNode { offset: node.offset, reason: e.to_string() })?;
    Ok(())
}

/// Computes, for an ordinal leaf position `ordinal` (0-based, left to right across the whole
/// tree), the child index to follow at each level from the root down to level 1. Index `0` of
/// the returned vector is the level-1 index (closest to the data); the last element is the
/// root's own child index.
pub fn ordinal_path(ordinal: usize, depth: u8) -> Vec<usize> {
    let mut out = Vec::with_capacity(depth as usize);
    let mut rem = ordinal;
    for _ in 0..depth {
        out.push(rem % FANOUT);
        rem /= FANOUT;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_matches_spec_examples() {
        assert_eq!(depth_for(0), 0);
        assert_eq!(depth_for(1), 1);
        assert_eq!(depth_for(FANOUT as u32), 1);
        assert_eq!(depth_for(FANOUT as u32 + 1), 2);
    }

    #[test]
    fn ordinal_path_round_trips_for_small_tree() {
        let path = ordinal_path(3, 1);
        assert_eq!(path, vec![3]);
        let path2 = ordinal_path(FANOUT + 5, 2);
        assert_eq!(path2[0], 5);
        assert_eq!(path2[1], 1);
    }

    use proptest::{prop_assert, prop_assert_eq, proptest};

    proptest! {
        #[test]
        fn depth_is_smallest_power_that_covers_n_blocks(n_blocks in 1u32..2_000_000) {
            let depth = depth_for(n_blocks);
            let capacity = (FANOUT as u64).pow(depth as u32);
            let smaller_capacity = (FANOUT as u64).pow((depth - 1) as u32);
            prop_assert!(capacity >= n_blocks as u64, "depth {} must cover {} blocks", depth, n_blocks);
            prop_assert!(
                depth == 1 || smaller_capacity < n_blocks as u64,
                "depth {} is more than necessary for {} blocks",
                depth,
                n_blocks
            );
        }

        #[test]
        fn ordinal_path_digits_stay_within_fanout(ordinal in 0usize..10_000_000, depth in 1u8..6) {
            let path = ordinal_path(ordinal, depth);
            prop_assert!(path.iter().all(|&digit| digit < FANOUT));
            prop_assert_eq!(path.len(), depth as usize);
        }
    }
}
