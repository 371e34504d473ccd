//! String store: a reference-counted intern table for the file header's comments, titles, units,
//! and per-channel text, addressed by 32-bit id. Id `0` always denotes the empty string and is
//! never itself stored.

use std::collections::HashMap;

use snafu::ensure;
use tracing::trace;

use crate::error::{CorruptRefcountSnafu, Result, StringStoreError, UnknownIdSnafu};

#[derive(Debug, Clone)]
struct RefString {
    text: String,
    ref_count: u32,
}

/// The in-memory string store. Serializes to/from the image format described in the file
/// header's string-store section.
#[derive(Debug, Default)]
pub struct StringStore {
    slots: Vec<Option<RefString>>,
    free: Vec<u32>,
}

impl StringStore {
    pub fn new() -> Self {
        StringStore { slots: Vec::new(), free: Vec::new() }
    }

    /// Returns the text for `id`, or the empty string for id `0` / an id with no live slot.
    pub fn get(&self, id: u32) -> &str {
        if id == 0 {
            return "";
        }
        match self.slots.get((id - 1) as usize).and_then(|s| s.as_ref()) {
            Some(rs) => rs.text.as_str(),
            None => "",
        }
    }

    /// Interns `s`, incrementing its refcount, and decrements `old_id`'s refcount (freeing it if
    /// it drops to zero). Returns the new id, or `0` if `s` is empty.
    pub fn add(&mut self, s: &str, old_id: u32) -> u32 {
        let new_id = if s.is_empty() {
            0
        } else if let Some(id) = self.find(s) {
            self.slots[(id - 1) as usize].as_mut().unwrap().ref_count += 1;
            id
        } else {
            self.insert(s)
        };

        if old_id != 0 && old_id != new_id {
            self.sub(old_id);
        }
        new_id
    }

    /// Decrements the refcount of `id`, freeing its slot for reuse once it reaches zero. A no-op
    /// for id `0`.
    pub fn sub(&mut self, id: u32) {
        if id == 0 {
            return;
        }
        let idx = (id - 1) as usize;
        let Some(slot) = self.slots.get_mut(idx) else { return };
        let Some(rs) = slot else { return };
        rs.ref_count -= 1;
        if rs.ref_count == 0 {
            *slot = None;
            self.free.push(id);
            trace!(id, "string slot freed");
        }
    }

    fn find(&self, s: &str) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match slot {
                Some(rs) if rs.text == s => Some((i + 1) as u32),
                _ => None,
            })
    }

    fn insert(&mut self, s: &str) -> u32 {
        let rs = RefString { text: s.to_string(), ref_count: 1 };
        if let Some(id) = self.free.pop() {
            self.slots[(id - 1) as usize] = Some(rs);
            id
        } else {
            self.slots.push(Some(rs));
            self.slots.len() as u32
        }
    }

    /// Serializes to the on-disk image: `[total_len_words, n_entries, entry...]`, each entry
    /// either a bare `0` (unused slot) or `refcount` followed by the zero-padded UTF-8 bytes of
    /// the string, rounded up to a 4-byte boundary.
    pub fn serialize(&self) -> Vec<u32> {
        let mut words = Vec::new();
        words.push(0); // placeholder for total length
        words.push(self.slots.len() as u32);
        for slot in &self.slots {
            match slot {
                None => words.push(0),
                Some(rs) => {
                    words.push(rs.ref_count);
                    let bytes = rs.text.as_bytes();
                    let padded = round_up4(bytes.len());
                    words.push(padded as u32 / 4);
                    let start = words.len();
                    words.resize(start + padded / 4, 0);
                    let out: &mut [u8] = bytemuck_u32_slice_mut(&mut words[start..]);
                    out[..bytes.len()].copy_from_slice(bytes);
                }
            }
        }
        let total = words.len() as u32;
        words[0] = total;
        words
    }

    /// Reconstructs a store from its serialized image, rejecting refcounts above `cap` (a sanity
    /// check against corruption; `None` disables the check).
    pub fn deserialize(words: &[u32], cap: Option<u32>) -> Result<Self, StringStoreError> {
        let mut store = StringStore::new();
        if words.len() < 2 {
            return Ok(store);
        }
        let n_entries = words[1] as usize;
        let mut pos = 2;
        for i in 0..n_entries {
            if pos >= words.len() {
                break;
            }
            let refcount = words[pos];
            pos += 1;
            if refcount == 0 {
                store.slots.push(None);
                store.free.push((i + 1) as u32);
                continue;
            }
            if let Some(cap) = cap {
                ensure!(refcount <= cap, CorruptRefcountSnafu { id: (i + 1) as u32, refcount, cap });
            }
            let len_words = words[pos] as usize;
            pos += 1;
            let byte_slice = bytemuck_u32_slice(&words[pos..pos + len_words]);
            let end = byte_slice.iter().position(|&b| b == 0).unwrap_or(byte_slice.len());
            let text = String::from_utf8_lossy(&byte_slice[..end]).into_owned();
            pos += len_words;
            store.slots.push(Some(RefString { text, ref_count: refcount }));
        }
        Ok(store)
    }

    /// Truncates `s` to at most `max_bytes`, never leaving a dangling UTF-8 continuation byte.
    pub fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
        if s.len() <= max_bytes {
            return s;
        }
        let mut end = max_bytes;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }

    /// Builds a lookup-by-id map of all currently live strings (debugging / test support).
    pub fn live_entries(&self) -> HashMap<u32, &str> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|rs| ((i + 1) as u32, rs.text.as_str())))
            .collect()
    }
}

fn round_up4(n: usize) -> usize {
    (n + 3) & !3
}

fn bytemuck_u32_slice(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn bytemuck_u32_slice_mut(words: &mut [u32]) -> &mut [u8] {
    // Safety: u32 has no padding and any byte pattern is valid; we only ever read/write through
    // this view within the bounds of `words`, which stays alive for the view's lifetime.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 4) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_round_trip_returns_to_prior_state() {
        let mut store = StringStore::new();
        let id = store.add("hello", 0);
        assert_ne!(id, 0);
        assert_eq!(store.get(id), "hello");
        store.sub(id);
        assert_eq!(store.get(id), "");
    }

    #[test]
    fn empty_string_is_id_zero() {
        let mut store = StringStore::new();
        assert_eq!(store.add("", 0), 0);
    }

    #[test]
    fn freed_ids_are_reissued() {
        let mut store = StringStore::new();
        let id1 = store.add("a", 0);
        store.sub(id1);
        let id2 = store.add("b", 0);
        assert_eq!(id1, id2);
    }

    #[test]
    fn serialize_deserialize_round_trip() {
        let mut store = StringStore::new();
        let a = store.add("alpha", 0);
        let b = store.add("beta-longer-string", 0);
        let words = store.serialize();
        let restored = StringStore::deserialize(&words, None).unwrap();
        assert_eq!(restored.get(a), "alpha");
        assert_eq!(restored.get(b), "beta-longer-string");
    }

    #[test]
    fn truncate_never_splits_a_multibyte_char() {
        let s = "a\u{1F600}"; // 'a' + 4-byte emoji
        let truncated = StringStore::truncate_at_char_boundary(s, 2);
        assert!(truncated.is_char_boundary(truncated.len()));
        assert_eq!(truncated, "a");
    }

    #[test]
    fn corrupt_refcount_is_rejected() {
        let words = vec![4, 1, u32::MAX, 0];
        let err = StringStore::deserialize(&words, Some(100));
        assert!(err.is_err());
    }
}
