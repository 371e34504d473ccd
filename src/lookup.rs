//! Lookup nodes: the fixed-fanout B-tree-like index node (`TDiskLookup`) that maps
//! `first_time -> disk offset` for the level below.

use crate::block::BlockHeader;
use crate::constants::{BLOCK_HEAD_SIZE, DLSIZE, FANOUT, LOOKUP_ITEM_SIZE};
use crate::error::{IndexError, Result};
use crate::types::Tick;

/// One `(first_time, disk_off)` entry in a lookup node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LookupEntry {
    pub first_time: Tick,
    pub disk_off: u64,
}

/// A single in-memory lookup node: a block header plus up to [`FANOUT`] entries.
///
/// Invariant: entries `[0..n_items)` are strictly increasing in both `first_time` and
/// `disk_off`. Entries are append-only except that the *last* entry of the node may have its
/// `first_time` rewritten in place (used when a reused block's first timestamp changes, or when
/// the writer touches the still-open last block of the tree).
#[derive(Debug, Clone)]
pub struct LookupNode {
    pub header: BlockHeader,
    pub entries: Vec<LookupEntry>,
    pub offset: u64,
    dirty: bool,
}

impl LookupNode {
    pub fn new(chan: u16, chan_id: u16, level: u8, offset: u64) -> Self {
        let mut header = BlockHeader::new(chan, chan_id);
        header.level = level;
        LookupNode { header, entries: Vec::with_capacity(FANOUT), offset, dirty: true }
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn n_items(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= FANOUT
    }

    /// Appends a new `(disk_off, first_time)` entry. Requires `first_time` and `disk_off` to be
    /// strictly greater than the last entry's. Returns the new entry's index.
    pub fn add_entry(&mut self, off: u64, time: Tick) -> Result<usize, IndexError> {
        if self.is_full() {
            return Err(IndexError::Full { level: self.header.level });
        }
        if let Some(last) = self.entries.last() {
            debug_assert!(time > last.first_time, "lookup entries must be strictly increasing in time");
            debug_assert!(off > last.disk_off, "lookup entries must be strictly increasing in offset");
        }
        self.entries.push(LookupEntry { first_time: time, disk_off: off });
        self.header.n_items = self.entries.len() as u32;
        self.dirty = true;
        Ok(self.entries.len() - 1)
    }

    /// Rewrites the `first_time` of the last entry in place (the only mutation allowed on an
    /// already-written entry), used when a reused block's start time changes.
    pub fn rewrite_last_time(&mut self, time: Tick) {
        if let Some(last) = self.entries.last_mut() {
            last.first_time = time;
            self.dirty = true;
        }
    }

    /// Rewrites the `first_time` of the entry at `idx` in place. Used only by block reuse, which
    /// overwrites the first entry of a reused node (and propagates the change upward) while
    /// guaranteeing the strictly-increasing invariant against its neighbor still holds.
    pub fn rewrite_entry_time(&mut self, idx: usize, time: Tick) {
        if let Some(e) = self.entries.get_mut(idx) {
            e.first_time = time;
            self.dirty = true;
        }
    }

    /// First index `i` (within the first `n_use` entries, default all) whose `first_time` is
    /// strictly greater than `t`. Returns `n_use` if every entry's time is `<= t`.
    pub fn upper_bound(&self, t: Tick, n_use: Option<usize>) -> usize {
        let n_use = n_use.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries[..n_use].partition_point(|e| e.first_time <= t)
    }

    pub fn entry(&self, idx: usize) -> Option<LookupEntry> {
        self.entries.get(idx).copied()
    }

    /// Serializes this node to a `DLSIZE`-byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DLSIZE];
        buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&self.header.to_bytes());
        let mut pos = BLOCK_HEAD_SIZE;
        for e in &self.entries {
            buf[pos..pos + 8].copy_from_slice(&e.first_time.to_le_bytes());
            buf[pos + 8..pos + 16].copy_from_slice(&e.disk_off.to_le_bytes());
            pos += LOOKUP_ITEM_SIZE;
        }
        buf
    }

    /// Parses a `DLSIZE`-byte buffer read from `offset`. Validates that entries are strictly
    /// increasing; returns [`IndexError::CorruptNode`] otherwise.
    pub fn from_bytes(buf: &[u8], offset: u64) -> Result<Self, IndexError> {
        debug_assert_eq!(buf.len(), DLSIZE);
        let header = BlockHeader::from_bytes(buf[0..BLOCK_HEAD_SIZE].try_into().unwrap());
        let n = header.n_items as usize;
        if n > FANOUT {
            return Err(IndexError::CorruptNode {
                offset,
                reason: format!("n_items {n} exceeds FANOUT {FANOUT}"),
            });
        }
        let mut entries = Vec::with_capacity(n);
        let mut pos = BLOCK_HEAD_SIZE;
        for _ in 0..n {
            let first_time = Tick::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let disk_off = u64::from_le_bytes(buf[pos + 8..pos + 16].try_into().unwrap());
            entries.push(LookupEntry { first_time, disk_off });
            pos += LOOKUP_ITEM_SIZE;
        }
        for w in entries.windows(2) {
            if !(w[1].first_time > w[0].first_time && w[1].disk_off > w[0].disk_off) {
                return Err(IndexError::CorruptNode {
                    offset,
                    reason: "entries are not strictly increasing in time and offset".to_string(),
                });
            }
        }
        Ok(LookupNode { header, entries, offset, dirty: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_entry_enforces_fanout() {
        let mut node = LookupNode::new(0, 0, 1, 4096);
        for i in 0..FANOUT {
            node.add_entry((i as u64 + 1) * 64 * 1024, i as i64 * 10).unwrap();
        }
        assert!(node.is_full());
        assert!(matches!(node.add_entry(999_999, 999_999), Err(IndexError::Full { .. })));
    }

    #[test]
    fn upper_bound_finds_first_strictly_greater() {
        let mut node = LookupNode::new(0, 0, 1, 4096);
        for (i, t) in [0, 10, 20, 30].into_iter().enumerate() {
            node.add_entry((i as u64 + 1) * 64 * 1024, t).unwrap();
        }
        assert_eq!(node.upper_bound(15, None), 2);
        assert_eq!(node.upper_bound(30, None), 4);
        assert_eq!(node.upper_bound(-1, None), 0);
    }

    #[test]
    fn upper_bound_honors_reuse_cursor() {
        let mut node = LookupNode::new(0, 0, 1, 4096);
        for (i, t) in [0, 10, 20, 30].into_iter().enumerate() {
            node.add_entry((i as u64 + 1) * 64 * 1024, t).unwrap();
        }
        assert_eq!(node.upper_bound(25, Some(2)), 2);
    }

    #[test]
    fn serialize_round_trips() {
        let mut node = LookupNode::new(3, 1, 2, 4096);
        node.add_entry(65536, 0).unwrap();
        node.add_entry(131072, 100).unwrap();
        let bytes = node.to_bytes();
        let back = LookupNode::from_bytes(&bytes, 4096).unwrap();
        assert_eq!(back.entries, node.entries);
        assert_eq!(back.header.level, 2);
    }

    use proptest::{prop_assert, prop_assert_eq, proptest};

    proptest! {
        #[test]
        fn add_entry_then_upper_bound_matches_linear_scan(
            times in proptest::collection::vec(1i64..1_000_000, 1..FANOUT),
        ) {
            // Build a strictly-increasing time (and offset) sequence from arbitrary deltas so
            // the node's invariant holds no matter what the generator produces.
            let mut node = LookupNode::new(0, 0, 1, 4096);
            let mut t = -1i64;
            let mut off = 0u64;
            let mut pushed = Vec::new();
            for delta in times {
                t += delta.max(1);
                off += 64 * 1024;
                node.add_entry(off, t).unwrap();
                pushed.push(t);
            }
            for probe in [-1, 0, *pushed.first().unwrap(), *pushed.last().unwrap(), pushed.last().unwrap() + 1] {
                let got = node.upper_bound(probe, None);
                let want = pushed.iter().filter(|&&pt| pt <= probe).count();
                prop_assert_eq!(got, want);
            }
            let bytes = node.to_bytes();
            let back = LookupNode::from_bytes(&bytes, 4096).unwrap();
            prop_assert_eq!(back.entries, node.entries);
        }
    }

    #[test]
    fn corrupt_order_is_rejected() {
        let mut buf = vec![0u8; DLSIZE];
        let mut header = BlockHeader::new(0, 0);
        header.level = 1;
        header.n_items = 2;
        buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&header.to_bytes());
        // two entries with decreasing time
        buf[16..24].copy_from_slice(&10i64.to_le_bytes());
        buf[24..32].copy_from_slice(&65536u64.to_le_bytes());
        buf[32..40].copy_from_slice(&5i64.to_le_bytes());
        buf[40..48].copy_from_slice(&131072u64.to_le_bytes());
        assert!(LookupNode::from_bytes(&buf, 0).is_err());
    }
}
