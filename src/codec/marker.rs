//! Marker block codec: a strictly-increasing array of `{ time: i64, codes: [u8; 4], reserved:
//! i32 }` records, 16 bytes each.

use crate::constants::{BLOCK_HEAD_SIZE, MARKER_ITEM_SIZE, MAX_MARK};
use crate::types::{Filter, Range, Tick};

/// One marker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerRecord {
    pub time: Tick,
    pub codes: [u8; 4],
    pub reserved: i32,
}

#[derive(Debug, Clone)]
pub struct MarkerBlock {
    pub records: Vec<MarkerRecord>,
}

impl MarkerBlock {
    pub fn empty() -> Self {
        MarkerBlock { records: Vec::with_capacity(MAX_MARK) }
    }

    pub fn first_time(&self) -> Tick {
        self.records.first().map(|r| r.time).unwrap_or(-1)
    }

    pub fn last_time(&self) -> Tick {
        self.records.last().map(|r| r.time).unwrap_or(-1)
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= MAX_MARK
    }

    pub fn add_data(&mut self, items: &[MarkerRecord]) -> usize {
        let mut n = 0;
        for &rec in items {
            if self.is_full() || rec.time <= self.last_time() {
                break;
            }
            self.records.push(rec);
            n += 1;
        }
        n
    }

    pub fn get_data(&self, dst: &mut Vec<MarkerRecord>, range: &mut Range, filter: Option<&Filter>) -> usize {
        let start = self.records.partition_point(|r| r.time < range.from);
        let mut n = 0;
        for &rec in &self.records[start..] {
            if rec.time >= range.upto || n >= range.max {
                break;
            }
            if range.tick_yield() {
                break;
            }
            if filter.map_or(true, |f| f.test(rec.codes)) {
                dst.push(rec);
                n += 1;
            }
        }
        n
    }

    pub fn prev_n_time(&self, range: &Range, filter: Option<&Filter>) -> Tick {
        let end = self.records.partition_point(|r| r.time < range.upto);
        if end == 0 {
            return -1;
        }
        let mut count = 0usize;
        let mut idx = end;
        let mut last_hit: Option<Tick> = None;
        while idx > 0 {
            idx -= 1;
            let rec = self.records[idx];
            if rec.time < range.from {
                break;
            }
            if filter.map_or(true, |f| f.test(rec.codes)) {
                count += 1;
                last_hit = Some(rec.time);
                if count == range.max {
                    return rec.time;
                }
            }
        }
        last_hit.unwrap_or(-1)
    }

    /// Finds the marker whose timestamp equals `t` exactly and overwrites its `codes`/`reserved`
    /// fields using `new`'s, truncated to `n_copy` bytes past the timestamp (at most 8: 4 code
    /// bytes + 4 reserved bytes). Returns `true` if found.
    pub fn edit_marker(&mut self, t: Tick, new: MarkerRecord, n_copy: usize) -> bool {
        let Ok(idx) = self.records.binary_search_by_key(&t, |r| r.time) else {
            return false;
        };
        let n_copy = n_copy.min(8);
        let rec = &mut self.records[idx];
        let mut src = [0u8; 8];
        src[0..4].copy_from_slice(&new.codes);
        src[4..8].copy_from_slice(&new.reserved.to_le_bytes());
        let mut dst = [0u8; 8];
        dst[0..4].copy_from_slice(&rec.codes);
        dst[4..8].copy_from_slice(&rec.reserved.to_le_bytes());
        dst[..n_copy].copy_from_slice(&src[..n_copy]);
        rec.codes = dst[0..4].try_into().unwrap();
        rec.reserved = i32::from_le_bytes(dst[4..8].try_into().unwrap());
        true
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        let mut pos = BLOCK_HEAD_SIZE;
        for rec in &self.records {
            buf[pos..pos + 8].copy_from_slice(&rec.time.to_le_bytes());
            buf[pos + 8..pos + 12].copy_from_slice(&rec.codes);
            buf[pos + 12..pos + 16].copy_from_slice(&rec.reserved.to_le_bytes());
            pos += MARKER_ITEM_SIZE;
        }
    }

    pub fn from_bytes(buf: &[u8], n_items: usize) -> Self {
        let mut records = Vec::with_capacity(n_items);
        let mut pos = BLOCK_HEAD_SIZE;
        for _ in 0..n_items {
            let time = Tick::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let codes: [u8; 4] = buf[pos + 8..pos + 12].try_into().unwrap();
            let reserved = i32::from_le_bytes(buf[pos + 12..pos + 16].try_into().unwrap());
            records.push(MarkerRecord { time, codes, reserved });
            pos += MARKER_ITEM_SIZE;
        }
        MarkerBlock { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FilterMode;

    fn rec(t: Tick, c0: u8) -> MarkerRecord {
        MarkerRecord { time: t, codes: [c0, 0, 0, 0], reserved: 0 }
    }

    #[test]
    fn filtered_read_matches_scenario_3() {
        let mut block = MarkerBlock::empty();
        block.add_data(&[rec(10, 1), rec(20, 2), rec(30, 1)]);
        let mut filter = Filter::new(FilterMode::And);
        filter.allow(0, 1);
        for layer in 1..4 {
            for v in 0..=255u8 {
                filter.allow(layer, v);
            }
        }
        let mut dst = Vec::new();
        let mut range = Range::new(0, 100, 100);
        let n = block.get_data(&mut dst, &mut range, Some(&filter));
        assert_eq!(n, 2);
        assert_eq!(dst.iter().map(|r| r.time).collect::<Vec<_>>(), vec![10, 30]);
    }

    #[test]
    fn edit_marker_round_trip() {
        let mut block = MarkerBlock::empty();
        block.add_data(&[rec(10, 1), rec(20, 2)]);
        let found = block.edit_marker(20, rec(0, 99), 1);
        assert!(found);
        assert_eq!(block.records[1].codes[0], 99);
        assert!(!block.edit_marker(999, rec(0, 1), 1));
    }

    #[test]
    fn set_codes_serialize_round_trip() {
        let mut block = MarkerBlock::empty();
        block.add_data(&[rec(1, 5), rec(2, 6)]);
        let mut buf = vec![0u8; BLOCK_HEAD_SIZE + 32];
        block.to_bytes(&mut buf);
        let back = MarkerBlock::from_bytes(&buf, 2);
        assert_eq!(back.records, block.records);
    }
}
