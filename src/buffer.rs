//! The per-channel circular write buffer and its save/discard list (§4.9).
//!
//! `SaveTimes` tracks a sequence of `(time, saving)` transitions describing which of the ring's
//! time ranges are destined to become persistent; `RingBuffer` is the ring itself, built on
//! `VecDeque` so that "the ring's up-to-two contiguous regions because of wrap" (the spec's own
//! phrase for flush/read) is just `VecDeque::as_slices`, the same trick the donor buffer
//! implementation's in-memory channel uses for its bounded queue.

use std::collections::VecDeque;

use crate::types::Tick;

/// A ring item that can report its own time, so the ring and the save list can cooperate without
/// the ring needing to know the channel-kind-specific record shape.
pub trait Timed {
    fn time(&self) -> Tick;
}

impl Timed for Tick {
    fn time(&self) -> Tick {
        *self
    }
}

/// Sequence of `(time, saving)` transitions: the save/discard list. The state at any time `t` is
/// the `saving` value of the last transition at or before `t` (default: not saving).
#[derive(Debug, Clone, Default)]
pub struct SaveTimes {
    transitions: Vec<(Tick, bool)>,
    dead_to: Tick,
    committed_from: Tick,
}

impl SaveTimes {
    pub fn new() -> Self {
        SaveTimes { transitions: Vec::new(), dead_to: -1, committed_from: -1 }
    }

    pub fn is_saving(&self, t: Tick) -> bool {
        match self.transitions.partition_point(|e| e.0 <= t) {
            0 => false,
            i => self.transitions[i - 1].1,
        }
    }

    fn normalize(&mut self) {
        self.transitions.sort_by_key(|e| e.0);
        let mut out: Vec<(Tick, bool)> = Vec::with_capacity(self.transitions.len());
        for &(t, s) in &self.transitions {
            if let Some(&(_, last)) = out.last() {
                if last == s {
                    continue;
                }
            } else if !s {
                // a leading "turn off" matches the implicit default state; drop it.
                continue;
            }
            out.push((t, s));
        }
        self.transitions = out;
    }

    /// Adds a transition no earlier than the last-committed write time, coalescing against the
    /// most recent transition (idempotent: `set_save(t, false); set_save(t, false)` is a no-op
    /// the second time).
    pub fn set_save(&mut self, t: Tick, save: bool) {
        let t = t.max(self.committed_from);
        self.transitions.retain(|e| e.0 < t);
        self.transitions.push((t, save));
        self.normalize();
    }

    /// Forces `[from, to)` to be saving, irrespective of whatever transitions previously governed
    /// that window.
    pub fn save_range(&mut self, from: Tick, to: Tick) {
        let resume_state = self.is_saving(to);
        self.transitions.retain(|e| e.0 < from || e.0 >= to);
        self.transitions.push((from, true));
        if !resume_state {
            self.transitions.push((to, false));
        }
        self.normalize();
    }

    /// Transition times within `[from, to)`, with any leading "still saving from before `from`"
    /// state dropped so the list always starts with a turn-off.
    pub fn no_save_list(&self, from: Tick, to: Tick) -> Vec<Tick> {
        let mut out = Vec::new();
        let mut seen_off = false;
        for &(t, s) in &self.transitions {
            if t < from || t >= to {
                continue;
            }
            if !seen_off {
                if s {
                    continue;
                }
                seen_off = true;
            }
            out.push(t);
        }
        out
    }

    /// The first maximal saving-true subrange intersecting `[from_default, upto)`, where
    /// `from_default` is used as the query start (mirroring the source's `from_default`
    /// parameter: the caller's notion of "where to start looking" absent a more specific cursor).
    pub fn first_save_range(&self, upto: Tick, from_default: Tick) -> Option<(Tick, Tick)> {
        self.next_save_range(from_default, upto)
    }

    /// The next maximal saving-true subrange at or after `from`, capped at `upto`. Used by commit
    /// to iterate the windows of buffered data that must reach disk.
    pub fn next_save_range(&self, from: Tick, upto: Tick) -> Option<(Tick, Tick)> {
        let mut cur = from;
        loop {
            if cur >= upto {
                return None;
            }
            if self.is_saving(cur) {
                let end = self
                    .transitions
                    .iter()
                    .find(|e| e.0 > cur && !e.1)
                    .map(|e| e.0)
                    .unwrap_or(upto)
                    .min(upto);
                return Some((cur, end));
            }
            match self.transitions.iter().find(|e| e.0 > cur && e.1) {
                Some(e) => cur = e.0,
                None => return None,
            }
        }
    }

    /// Marks the commit boundary: future `set_save` calls may not move it earlier than `t`.
    pub fn set_first_time(&mut self, t: Tick) {
        if t > self.committed_from {
            self.committed_from = t;
        }
    }

    /// Advances the dead-range boundary to prune transitions older than the oldest item still
    /// held in the ring, capped at `t`.
    pub fn advance_dead_to(&mut self, t: Tick) {
        if t > self.dead_to {
            self.dead_to = t;
            self.transitions.retain(|e| e.0 >= self.dead_to);
        }
    }
}

/// The last-`capacity` ring of buffered items for one channel.
#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T: Timed + Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer { capacity, items: VecDeque::with_capacity(capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.items.len() >= self.capacity
    }

    pub fn first_time(&self) -> Tick {
        self.items.front().map(Timed::time).unwrap_or(-1)
    }

    pub fn max_time(&self) -> Tick {
        self.items.back().map(Timed::time).unwrap_or(-1)
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Resizes the ring, preserving the most recent contents up to the new capacity. `n == 0`
    /// destroys the ring (the channel becomes unbuffered from then on).
    pub fn resize(&mut self, n: usize) {
        self.capacity = n;
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    /// Removes and returns the oldest `n` items, making room for new writes. `min_move` is the
    /// spec's `capacity >> 5` floor on how many items a single flush evicts at once.
    pub fn evict_front(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    /// The ring's contents as up to two contiguous slices (the wraparound `VecDeque` naturally
    /// produces), matching the spec's "copy the ring's contiguous ranges (up to two because of
    /// wrap)".
    pub fn as_slices(&self) -> (&[T], &[T]) {
        self.items.as_slices()
    }

    /// Iterates every item whose time lies in `[from, upto)`, in order.
    pub fn range(&self, from: Tick, upto: Tick) -> impl Iterator<Item = &T> {
        self.items.iter().filter(move |it| it.time() >= from && it.time() < upto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_save_idempotent() {
        let mut st = SaveTimes::new();
        st.set_save(100, false);
        let before = st.transitions.clone();
        st.set_save(100, false);
        assert_eq!(st.transitions, before);
    }

    #[test]
    fn save_range_overrides_regardless_of_background() {
        let mut st = SaveTimes::new();
        st.set_save(0, false);
        st.save_range(500_000, 700_000);
        assert!(!st.is_saving(0));
        assert!(st.is_saving(500_000));
        assert!(st.is_saving(699_999));
        assert!(!st.is_saving(700_000));
    }

    #[test]
    fn no_save_list_starts_with_turn_off() {
        let mut st = SaveTimes::new();
        st.save_range(100, 200);
        let list = st.no_save_list(0, 300);
        assert_eq!(list.first().copied(), Some(200));
    }

    #[test]
    fn ring_evicts_minimum_move_on_overflow() {
        let mut ring: RingBuffer<Tick> = RingBuffer::new(4);
        for t in [1, 2, 3, 4] {
            ring.push(t);
        }
        assert!(ring.is_full());
        let evicted = ring.evict_front(2);
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn ring_range_filters_by_time() {
        let mut ring: RingBuffer<Tick> = RingBuffer::new(8);
        for t in [10, 20, 30, 40] {
            ring.push(t);
        }
        let got: Vec<Tick> = ring.range(15, 35).copied().collect();
        assert_eq!(got, vec![20, 30]);
    }
}
