//! A byte-slice-plus-stride view over a run of fixed-size records whose size is only known at
//! runtime (`obj_size` for extended markers is `16 + payload_bytes`, rounded to 8 bytes, which is
//! not `size_of::<T>()` for any single Rust type). This replaces the donor C++ source's
//! pointer-arithmetic "db_iterator" templates with an explicit, bounds-checked view type.

/// An immutable view over `n` fixed-`stride`-byte records packed into `bytes`.
#[derive(Debug, Clone, Copy)]
pub struct StridedView<'a> {
    bytes: &'a [u8],
    stride: usize,
    len: usize,
}

impl<'a> StridedView<'a> {
    pub fn new(bytes: &'a [u8], stride: usize, len: usize) -> Self {
        debug_assert!(bytes.len() >= stride * len);
        StridedView { bytes, stride, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn record(&self, idx: usize) -> &'a [u8] {
        let start = idx * self.stride;
        &self.bytes[start..start + self.stride]
    }

    pub fn time(&self, idx: usize) -> i64 {
        i64::from_le_bytes(self.record(idx)[0..8].try_into().unwrap())
    }

    pub fn codes(&self, idx: usize) -> [u8; 4] {
        self.record(idx)[8..12].try_into().unwrap()
    }

    pub fn payload(&self, idx: usize) -> &'a [u8] {
        &self.record(idx)[16..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.len).map(move |i| self.record(i))
    }
}

/// The mutable counterpart of [`StridedView`].
pub struct StridedViewMut<'a> {
    bytes: &'a mut [u8],
    stride: usize,
    len: usize,
}

impl<'a> StridedViewMut<'a> {
    pub fn new(bytes: &'a mut [u8], stride: usize, len: usize) -> Self {
        debug_assert!(bytes.len() >= stride * len);
        StridedViewMut { bytes, stride, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn record_mut(&mut self, idx: usize) -> &mut [u8] {
        let start = idx * self.stride;
        &mut self.bytes[start..start + self.stride]
    }

    pub fn set_time(&mut self, idx: usize, t: i64) {
        self.record_mut(idx)[0..8].copy_from_slice(&t.to_le_bytes());
    }

    pub fn set_codes(&mut self, idx: usize, codes: [u8; 4]) {
        self.record_mut(idx)[8..12].copy_from_slice(&codes);
    }

    pub fn payload_mut(&mut self, idx: usize) -> &mut [u8] {
        let stride = self.stride;
        &mut self.record_mut(idx)[16..stride]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reads_time_and_codes() {
        let mut buf = vec![0u8; 32];
        buf[0..8].copy_from_slice(&42i64.to_le_bytes());
        buf[8..12].copy_from_slice(&[1, 2, 3, 4]);
        let view = StridedView::new(&buf, 16, 2);
        assert_eq!(view.time(0), 42);
        assert_eq!(view.codes(0), [1, 2, 3, 4]);
    }

    #[test]
    fn mut_view_writes_back() {
        let mut buf = vec![0u8; 16];
        {
            let mut view = StridedViewMut::new(&mut buf, 16, 1);
            view.set_time(0, 7);
            view.set_codes(0, [9, 0, 0, 0]);
        }
        let view = StridedView::new(&buf, 16, 1);
        assert_eq!(view.time(0), 7);
        assert_eq!(view.codes(0), [9, 0, 0, 0]);
    }
}
