//! Block allocator: hands out fixed-size data blocks and sub-allocates lookup blocks from a
//! shared `DBSIZE` region. State lives in the file header and is mutated under the header lock
//! (see [`crate::engine::Engine`]).

use metrics::counter;
use tracing::trace;

use crate::constants::{DBSIZE, DLSIZE, DLU_PER_DB};
use crate::error::{AllocError, Result};

/// Allocator state, persisted as part of the file header.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockAllocator {
    next_block_off: u64,
    /// Offset of the next free `DLSIZE` sub-slot within the region currently being carved up for
    /// lookup blocks. `0` means "no partial region in progress, allocate a fresh one".
    next_sub_off: u64,
    /// Configured ceiling on `next_block_off`; `None` disables the check.
    max_file_size: Option<u64>,
}

impl BlockAllocator {
    pub fn new(first_free_off: u64, max_file_size: Option<u64>) -> Self {
        BlockAllocator { next_block_off: first_free_off, next_sub_off: 0, max_file_size }
    }

    /// Reconstructs allocator state from its two persisted cursors (see
    /// [`crate::header::FileHeader::open`]), restoring exactly where a prior session left off
    /// rather than re-deriving it from the file's current length.
    pub fn from_state(next_block_off: u64, next_sub_off: u64, max_file_size: Option<u64>) -> Self {
        BlockAllocator { next_block_off, next_sub_off, max_file_size }
    }

    pub fn next_block_off(&self) -> u64 {
        self.next_block_off
    }

    pub fn next_sub_off(&self) -> u64 {
        self.next_sub_off
    }

    /// Allocates one `DBSIZE` data block, returning its offset. The caller is responsible for
    /// marking the header dirty.
    pub fn allocate_data(&mut self) -> Result<u64, AllocError> {
        let off = self.next_block_off;
        if let Some(max) = self.max_file_size {
            if off.saturating_add(DBSIZE as u64) > max {
                return Err(AllocError::NoBlock);
            }
        }
        self.next_block_off += DBSIZE as u64;
        trace!(off, "allocated data block");
        counter!("tickstore_blocks_allocated_total", "kind" => "data").increment(1);
        Ok(off)
    }

    /// Allocates one `DLSIZE` lookup block, sub-carved from a shared `DBSIZE` region.
    pub fn allocate_lookup(&mut self) -> Result<u64, AllocError> {
        if self.next_sub_off == 0 {
            self.next_sub_off = self.allocate_data()?;
        }
        let off = self.next_sub_off;
        let last_sub_off_in_region = (off & !(DBSIZE as u64 - 1)) + (DBSIZE - DLSIZE) as u64;
        if off == last_sub_off_in_region {
            self.next_sub_off = 0;
        } else {
            self.next_sub_off = off + DLSIZE as u64;
        }
        trace!(off, "allocated lookup block");
        counter!("tickstore_blocks_allocated_total", "kind" => "lookup").increment(1);
        Ok(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_blocks_advance_by_dbsize() {
        let mut a = BlockAllocator::new(DBSIZE as u64, None);
        let b0 = a.allocate_data().unwrap();
        let b1 = a.allocate_data().unwrap();
        assert_eq!(b1 - b0, DBSIZE as u64);
    }

    #[test]
    fn lookup_blocks_carve_a_data_region_and_wrap() {
        let mut a = BlockAllocator::new(DBSIZE as u64, None);
        let first = a.allocate_lookup().unwrap();
        assert_eq!(first % DBSIZE as u64, 0);
        let mut offs = vec![first];
        for _ in 1..DLU_PER_DB {
            offs.push(a.allocate_lookup().unwrap());
        }
        // After DLU_PER_DB allocations, the shared region is exhausted and the cursor resets.
        assert_eq!(a.next_sub_off(), 0);
        for w in offs.windows(2) {
            assert_eq!(w[1] - w[0], DLSIZE as u64);
        }
        let next_region = a.allocate_lookup().unwrap();
        assert_eq!(next_region - first, DBSIZE as u64);
    }

    #[test]
    fn allocation_past_max_size_fails() {
        let mut a = BlockAllocator::new(0, Some(DBSIZE as u64));
        a.allocate_data().unwrap();
        assert!(matches!(a.allocate_data(), Err(AllocError::NoBlock)));
    }
}
