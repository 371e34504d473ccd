//! Fixed sizes and derived constants for the on-disk layout.

/// Size in bytes of a data block. Must be a power of two.
pub const DBSIZE: usize = 64 * 1024;

/// Size in bytes of a lookup (index) block, sub-allocated from a `DBSIZE` region.
/// Must be a power of two and `DLSIZE <= DBSIZE`.
pub const DLSIZE: usize = 4 * 1024;

/// Number of `DLSIZE` sub-blocks packed into one `DBSIZE` region.
pub const DLU_PER_DB: usize = DBSIZE / DLSIZE;

/// Size in bytes of the 16-byte block header common to every block.
pub const BLOCK_HEAD_SIZE: usize = 16;

/// Size in bytes of one `(first_time, disk_off)` lookup entry.
pub const LOOKUP_ITEM_SIZE: usize = 16;

/// Entries per lookup node: `(DLSIZE - 16) / 16`.
pub const FANOUT: usize = (DLSIZE - BLOCK_HEAD_SIZE) / LOOKUP_ITEM_SIZE;

/// Capacity of an event block: dense `i64` timestamps.
pub const MAX_EVENT: usize = (DBSIZE - BLOCK_HEAD_SIZE) / 8;

/// Size in bytes of one marker record (`time: i64` + `codes: [u8; 4]` + `reserved: i32`).
pub const MARKER_ITEM_SIZE: usize = 16;

/// Capacity of a marker block.
pub const MAX_MARK: usize = (DBSIZE - BLOCK_HEAD_SIZE) / MARKER_ITEM_SIZE;

/// Maximum number of logical channels a file may hold.
pub const MAX_CHANNELS: usize = 65_000;

/// Maximum number of file-header overflow blocks.
pub const HEAD_EXT_MAX: usize = 128;

/// Number of free-text comment slots in the file header.
pub const NUM_FILE_COMMENTS: usize = 8;

/// Sentinel meaning "no time".
pub const NO_TIME: i64 = -1;

/// Largest usable tick value, leaving headroom so that adding a tick delta smaller than
/// `i64::MAX / 8` can never overflow.
pub const T_MAX: i64 = i64::MAX - i64::MAX / 8;

/// Maximum number of lookup levels above the data-block level (level 0).
pub const MAX_LEVEL: u8 = 6;

const _: () = assert!(DBSIZE.is_power_of_two());
const _: () = assert!(DLSIZE.is_power_of_two());
const _: () = assert!(DLSIZE <= DBSIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_matches_spec_default() {
        assert_eq!(FANOUT, 255);
    }

    #[test]
    fn dlu_per_db_is_sixteen() {
        assert_eq!(DLU_PER_DB, 16);
    }

    #[test]
    fn max_event_and_mark_capacities() {
        assert_eq!(MAX_EVENT, (DBSIZE - 16) / 8);
        assert_eq!(MAX_MARK, (DBSIZE - 16) / 16);
    }
}
