//! The append path (§4.7): the writer's own vector of index nodes covering the current
//! write-end, tree growth when a node fills, and block reuse for deleted-and-recreated channels.
//!
//! `AppendTree` is the writer-side twin of [`crate::block_manager::BlockManager`]; the two share
//! lookup-node plumbing from [`crate::index`] but are kept as separate owned vectors per §4.5,
//! reconciled through `update_index`/`update_data` rather than aliased in place (§9, "Unsafe
//! aliasing of the write block").

use tracing::trace;

use crate::alloc::BlockAllocator;
use crate::blockio::BlockIo;
use crate::error::{IndexError, Result};
use crate::header::ChannelHeader;
use crate::index;
use crate::lookup::LookupNode;
use crate::types::Tick;

/// The writer's path from the level-1 node (index 0) up to the tree root (last index).
#[derive(Debug, Default)]
pub struct AppendTree {
    pub nodes: Vec<LookupNode>,
    /// Whether this channel is currently writing into blocks reused from a prior deletion
    /// (`allocated_blocks > active_blocks`).
    pub reuse_mode: bool,
    /// Per level, the index of the entry the reuse walk is currently positioned at.
    reuse_pos: Vec<usize>,
}

impl AppendTree {
    pub fn empty() -> Self {
        AppendTree { nodes: Vec::new(), reuse_mode: false, reuse_pos: Vec::new() }
    }

    pub fn depth(&self) -> u8 {
        self.nodes.len() as u8
    }

    /// Reconstructs the append tree for an already-populated channel by walking from the root
    /// down to the leaf at `target_ordinal` (0-based, left to right across all data blocks).
    pub fn open_existing(io: &BlockIo, header: &ChannelHeader, target_ordinal: usize) -> Result<Self, IndexError> {
        let n_blocks = header.active_blocks.max(header.allocated_blocks);
        let depth = index::depth_for(n_blocks);
        if depth == 0 {
            return Ok(AppendTree::empty());
        }
        let path = index::ordinal_path(target_ordinal, depth);
        let mut nodes_top_down = Vec::with_capacity(depth as usize);
        let mut offset = header.root_off;
        for lvl in (1..=depth).rev() {
            let node = index::read_node(io, offset)?;
            let child_idx = path[(lvl - 1) as usize].min(node.n_items().saturating_sub(1));
            let entry = node.entry(child_idx).ok_or(IndexError::CorruptNode {
                offset,
                reason: "append-tree walk ran past a node's entries".to_string(),
            })?;
            offset = entry.disk_off;
            nodes_top_down.push(node);
        }
        nodes_top_down.reverse();
        let reuse_mode = header.is_reusing();
        let reuse_pos = if reuse_mode {
            index::ordinal_path(target_ordinal, depth)
        } else {
            Vec::new()
        };
        Ok(AppendTree { nodes: nodes_top_down, reuse_mode, reuse_pos })
    }

    /// For the block-manager's reader: `Some(n_use)` if this level's currently-open node is being
    /// reused and only its first `n_use` entries are live data (the rest are stale ghosts from
    /// the deleted channel's previous tenancy); `None` when not reusing (use the node's full
    /// `n_items`).
    pub fn reuse_n_use(&self, level: usize) -> Option<usize> {
        if self.reuse_mode {
            self.reuse_pos.get(level).map(|&p| p + 1)
        } else {
            None
        }
    }

    pub fn node(&self, level: usize) -> Option<&LookupNode> {
        self.nodes.get(level)
    }

    /// Grows the tree so that `level` exists, then appends `(off, t)` at that level, recursing
    /// and allocating a fresh node at `level + 1` when the current one at `level` is full.
    pub fn add_index_entry(
        &mut self,
        level: usize,
        off: u64,
        t: Tick,
        alloc: &mut BlockAllocator,
        chan: u16,
        chan_id: u16,
        header: &mut ChannelHeader,
    ) -> Result<(), IndexError> {
        if level == self.nodes.len() {
            let new_off = alloc.allocate_lookup().map_err(|_| IndexError::Full { level: level as u8 })?;
            let mut node = LookupNode::new(chan, chan_id, (level + 1) as u8, new_off);
            if let Some(old_top) = self.nodes.last() {
                let old_top_first_time = old_top.entry(0).map(|e| e.first_time).unwrap_or(t);
                node.add_entry(header.root_off, old_top_first_time)?;
                trace!(level, new_off, "grew index tree: new root");
            }
            self.nodes.push(node);
            header.root_off = new_off;
        }

        match self.nodes[level].add_entry(off, t) {
            Ok(_) => Ok(()),
            Err(IndexError::Full { .. }) => {
                let new_off = alloc.allocate_lookup().map_err(|_| IndexError::Full { level: level as u8 })?;
                self.add_index_entry(level + 1, new_off, t, alloc, chan, chan_id, header)?;
                let mut fresh = LookupNode::new(chan, chan_id, (level + 1) as u8, new_off);
                fresh.add_entry(off, t)?;
                self.nodes[level] = fresh;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the node at `level` if dirty.
    pub fn save_append_index(&mut self, level: usize, io: &BlockIo) -> Result<(), IndexError> {
        if let Some(node) = self.nodes.get_mut(level) {
            if node.is_dirty() {
                index::write_node(io, node)?;
                node.mark_clean();
            }
        }
        Ok(())
    }

    /// Writes every dirty node from level 0 to the root.
    pub fn save_all(&mut self, io: &BlockIo) -> Result<(), IndexError> {
        for level in 0..self.nodes.len() {
            self.save_append_index(level, io)?;
        }
        Ok(())
    }

    /// Returns the disk offset of the next reusable block and, if this is the first entry of its
    /// node (reuse index 0), rewrites that entry's `first_time` to `new_first_time` and
    /// propagates the same rewrite upward through every ancestor level whose own reuse index is
    /// also 0 (so the chain of "first entry per node" times stays consistent up to the root).
    pub fn get_reuse_offset_set_time(&mut self, new_first_time: Tick) -> Result<u64, IndexError> {
        let idx0 = *self.reuse_pos.first().unwrap_or(&0);
        let entry = self.nodes[0].entry(idx0).ok_or(IndexError::CorruptNode {
            offset: self.nodes[0].offset,
            reason: "reuse cursor past end of level-1 node".to_string(),
        })?;
        if idx0 == 0 {
            self.nodes[0].rewrite_entry_time(0, new_first_time);
            for lvl in 1..self.nodes.len() {
                let parent_idx = self.reuse_pos.get(lvl).copied().unwrap_or(0);
                if parent_idx != 0 {
                    break;
                }
                self.nodes[lvl].rewrite_entry_time(0, new_first_time);
            }
        }
        Ok(entry.disk_off)
    }

    /// Advances the reuse cursor to the next reusable block, reloading sibling nodes from disk as
    /// needed (the reused subtree predates this writer session and is not held in full). Returns
    /// `false` once the reuse tree is exhausted (reuse mode should end).
    pub fn advance_reuse(&mut self, level: usize, io: &BlockIo) -> Result<bool, IndexError> {
        if level >= self.nodes.len() {
            return Ok(false);
        }
        let next = self.reuse_pos.get(level).copied().unwrap_or(0) + 1;
        if next >= self.nodes[level].n_items() {
            if !self.advance_reuse(level + 1, io)? {
                return Ok(false);
            }
            let parent = &self.nodes[level + 1];
            let parent_idx = self.reuse_pos[level + 1];
            let entry = parent.entry(parent_idx).ok_or(IndexError::CorruptNode {
                offset: parent.offset,
                reason: "reuse cursor past end of parent node".to_string(),
            })?;
            self.nodes[level] = index::read_node(io, entry.disk_off)?;
            while self.reuse_pos.len() <= level {
                self.reuse_pos.push(0);
            }
            self.reuse_pos[level] = 0;
        } else {
            while self.reuse_pos.len() <= level {
                self.reuse_pos.push(0);
            }
            self.reuse_pos[level] = next;
        }
        Ok(true)
    }

    /// Ends reuse mode: the allocated/active block counts have converged (all previously
    /// allocated blocks are once again live data), and further appends fall through to ordinary
    /// allocation.
    pub fn exit_reuse_mode(&mut self) {
        self.reuse_mode = false;
        self.reuse_pos.clear();
    }

    /// `add_index_entry` specialized to level 0 (the leaf/data level), returning the disk offset
    /// and in-node index of the newly inserted entry so the caller can stamp the data block's own
    /// `parent_off`/`parent_index` header fields.
    fn append_leaf(
        &mut self,
        off: u64,
        t: Tick,
        alloc: &mut BlockAllocator,
        chan: u16,
        chan_id: u16,
        header: &mut ChannelHeader,
    ) -> Result<(u64, u8), IndexError> {
        self.add_index_entry(0, off, t, alloc, chan, chan_id, header)?;
        let node = &self.nodes[0];
        Ok((node.offset, (node.n_items() - 1) as u8))
    }

    /// The full writer decision tree of §4.7 `append_block`, steps 1-3: decide whether this is a
    /// recommit of an already-placed block, a reuse of a deleted channel's old blocks, or a fresh
    /// allocation; update `header`'s block counts; and return where the block's own header should
    /// point. Does not write the block itself — the caller encodes payload bytes per channel kind
    /// and writes them via [`crate::blockio::BlockIo`], then calls [`Self::save_append_index`] /
    /// [`Self::save_all`] for the index side.
    pub fn append_block(
        &mut self,
        existing_offset: Option<u64>,
        first_time: Tick,
        header: &mut ChannelHeader,
        alloc: &mut BlockAllocator,
        io: &BlockIo,
        chan: u16,
    ) -> crate::error::Result<(u64, u16, u64, u8)> {
        if let Some(off) = existing_offset {
            let parent_off = self.nodes.first().map(|n| n.offset).unwrap_or(0);
            return Ok((off, header.reuse_gen, parent_off, 0));
        }
        if self.reuse_mode {
            let parent_off = self.nodes[0].offset;
            let parent_index = *self.reuse_pos.first().unwrap_or(&0) as u8;
            let off = self.get_reuse_offset_set_time(first_time)?;
            self.advance_reuse(0, io)?;
            header.active_blocks += 1;
            if header.active_blocks >= header.allocated_blocks {
                self.exit_reuse_mode();
            }
            Ok((off, header.reuse_gen, parent_off, parent_index))
        } else {
            let off = alloc.allocate_data()?;
            header.active_blocks += 1;
            header.allocated_blocks += 1;
            let (parent_off, parent_index) = self.append_leaf(off, first_time, alloc, chan, header.reuse_gen, header)?;
            Ok((off, header.reuse_gen, parent_off, parent_index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn io() -> BlockIo {
        let tmp = NamedTempFile::new().unwrap();
        BlockIo::new(tmp.reopen().unwrap())
    }

    #[test]
    fn first_append_creates_level1_root() {
        let io = io();
        let mut alloc = BlockAllocator::new(crate::constants::DBSIZE as u64, None);
        let mut header = ChannelHeader::default();
        let mut tree = AppendTree::empty();
        tree.add_index_entry(0, 2 * crate::constants::DBSIZE as u64, 0, &mut alloc, 5, 0, &mut header).unwrap();
        assert_eq!(tree.depth(), 1);
        assert_eq!(header.root_off, tree.nodes[0].offset);
        tree.save_all(&io).unwrap();
    }

    #[test]
    fn filling_a_node_grows_a_new_root() {
        let io = io();
        let mut alloc = BlockAllocator::new(crate::constants::DBSIZE as u64, None);
        let mut header = ChannelHeader::default();
        let mut tree = AppendTree::empty();
        for i in 0..crate::constants::FANOUT {
            let off = (i as u64 + 10) * crate::constants::DBSIZE as u64;
            tree.add_index_entry(0, off, i as i64 * 10, &mut alloc, 1, 0, &mut header).unwrap();
        }
        assert_eq!(tree.depth(), 1);
        // one more entry overflows the level-1 node and grows a level-2 root.
        let off = 9999 * crate::constants::DBSIZE as u64;
        tree.add_index_entry(0, off, crate::constants::FANOUT as i64 * 10, &mut alloc, 1, 0, &mut header).unwrap();
        assert_eq!(tree.depth(), 2);
        tree.save_all(&io).unwrap();
    }
}
