//! Event block codec: a dense, strictly increasing array of `i64` timestamps.

use crate::constants::{BLOCK_HEAD_SIZE, MAX_EVENT};
use crate::types::{Range, Tick};

/// An in-memory event data block. `header_n_items` mirrors the on-disk block header's `n_items`
/// field; it is always `times.len()`.
#[derive(Debug, Clone)]
pub struct EventBlock {
    pub times: Vec<Tick>,
}

impl EventBlock {
    pub fn empty() -> Self {
        EventBlock { times: Vec::with_capacity(MAX_EVENT) }
    }

    pub fn first_time(&self) -> Tick {
        self.times.first().copied().unwrap_or(-1)
    }

    pub fn last_time(&self) -> Tick {
        self.times.last().copied().unwrap_or(-1)
    }

    pub fn is_full(&self) -> bool {
        self.times.len() >= MAX_EVENT
    }

    /// Appends as many of `items` as fit, in order; each must be strictly greater than the
    /// current last time. Returns the number accepted.
    pub fn add_data(&mut self, items: &[Tick]) -> usize {
        let mut n = 0;
        for &t in items {
            if self.is_full() || t <= self.last_time() {
                break;
            }
            self.times.push(t);
            n += 1;
        }
        n
    }

    /// Copies items whose time lies in `[range.from, range.upto)` into `dst`, up to
    /// `range.max`, honoring cooperative cancellation.
    pub fn get_data(&self, dst: &mut Vec<Tick>, range: &mut Range) -> usize {
        let start = self.times.partition_point(|&t| t < range.from);
        let mut n = 0;
        for &t in &self.times[start..] {
            if t >= range.upto || n >= range.max {
                break;
            }
            if range.tick_yield() {
                break;
            }
            dst.push(t);
            n += 1;
        }
        n
    }

    /// Returns the time reached by skipping `range.max` items backward from `range.upto`
    /// (exclusive), not going earlier than `range.from`. Returns `-1` if nothing qualifies.
    pub fn prev_n_time(&self, range: &Range) -> Tick {
        let end = self.times.partition_point(|&t| t < range.upto);
        if end == 0 {
            return -1;
        }
        let mut count = 0usize;
        let mut idx = end;
        while idx > 0 {
            idx -= 1;
            if self.times[idx] < range.from {
                break;
            }
            count += 1;
            if count == range.max {
                return self.times[idx];
            }
        }
        if count == 0 {
            -1
        } else {
            self.times[idx]
        }
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BLOCK_HEAD_SIZE + self.times.len() * 8);
        let mut pos = BLOCK_HEAD_SIZE;
        for &t in &self.times {
            buf[pos..pos + 8].copy_from_slice(&t.to_le_bytes());
            pos += 8;
        }
    }

    pub fn from_bytes(buf: &[u8], n_items: usize) -> Self {
        let mut times = Vec::with_capacity(n_items);
        let mut pos = BLOCK_HEAD_SIZE;
        for _ in 0..n_items {
            times.push(Tick::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        EventBlock { times }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_read_back_byte_equal() {
        let mut block = EventBlock::empty();
        let n = block.add_data(&[0, 100, 200, 300]);
        assert_eq!(n, 4);
        let mut dst = Vec::new();
        let mut range = Range::new(0, 400, 100);
        let read = block.get_data(&mut dst, &mut range);
        assert_eq!(read, 4);
        assert_eq!(dst, vec![0, 100, 200, 300]);
    }

    #[test]
    fn add_rejects_non_increasing() {
        let mut block = EventBlock::empty();
        block.add_data(&[10]);
        let n = block.add_data(&[5]);
        assert_eq!(n, 0);
    }

    #[test]
    fn prev_n_time_at_zero_upto_returns_sentinel() {
        let mut block = EventBlock::empty();
        block.add_data(&[10, 20, 30]);
        let range = Range::new(0, 0, 10);
        assert_eq!(block.prev_n_time(&range), -1);
    }

    #[test]
    fn prev_n_time_skips_back_n_items() {
        let mut block = EventBlock::empty();
        block.add_data(&[10, 20, 30, 40, 50]);
        let range = Range::new(0, 50, 2);
        // upto=50 exclusive -> candidates [10,20,30,40]; skip back 2 -> land on 30
        assert_eq!(block.prev_n_time(&range), 30);
    }

    #[test]
    fn serialize_round_trip() {
        let mut block = EventBlock::empty();
        block.add_data(&[1, 2, 3]);
        let mut buf = vec![0u8; BLOCK_HEAD_SIZE + 24];
        block.to_bytes(&mut buf);
        let back = EventBlock::from_bytes(&buf, 3);
        assert_eq!(back.times, block.times);
    }
}
