//! The file header: fixed struct, user area, channel-header array, and string-store image, made
//! to look like one contiguous logical region backed physically by the first block plus a chain
//! of overflow blocks.

use snafu::ensure;
use tracing::warn;

use crate::alloc::BlockAllocator;
use crate::block::{BlockHeader, FirstBlockId, HEADER_CHAN};
use crate::blockio::BlockIo;
use crate::constants::{BLOCK_HEAD_SIZE, DBSIZE, HEAD_EXT_MAX, NUM_FILE_COMMENTS};
use crate::error::{CorruptFileSnafu, HeaderError, NoExtraSnafu, ReadOnlySnafu, Result, WrongFileSnafu};
use crate::strings::StringStore;
use crate::types::{ChanNum, ChannelKind, Tick};

/// Bytes of logical header payload held directly by the first block (after its 16-byte header)
/// and by each overflow block (after its own 16-byte header).
pub const PAYLOAD_PER_BLOCK: usize = DBSIZE - BLOCK_HEAD_SIZE;

/// A snapshot of one channel slot's persistent state.
#[derive(Debug, Clone)]
pub struct ChannelHeader {
    pub root_off: u64,
    pub last_time_on_disk: Tick,
    pub active_blocks: u32,
    pub allocated_blocks: u32,
    pub item_bytes: u32,
    pub rows: u32,
    pub cols: u32,
    pub pretrig: u32,
    pub tick_divide: i64,
    pub reuse_gen: u16,
    pub kind: ChannelKind,
    pub prev_kind: ChannelKind,
    pub phys_chan: u16,
    pub title_id: u32,
    pub units_id: u32,
    pub comment_id: u32,
    pub ideal_rate: f64,
    pub scale: f64,
    pub offset: f64,
    pub y_low: f64,
    pub y_high: f64,
    pub flags: u32,
}

impl Default for ChannelHeader {
    fn default() -> Self {
        ChannelHeader {
            root_off: 0,
            last_time_on_disk: -1,
            active_blocks: 0,
            allocated_blocks: 0,
            item_bytes: 0,
            rows: 0,
            cols: 0,
            pretrig: 0,
            tick_divide: 1,
            reuse_gen: 0,
            kind: ChannelKind::Off,
            prev_kind: ChannelKind::Off,
            phys_chan: 0,
            title_id: 0,
            units_id: 0,
            comment_id: 0,
            ideal_rate: 0.0,
            scale: 1.0,
            offset: 0.0,
            y_low: 0.0,
            y_high: 0.0,
            flags: 0,
        }
    }
}

/// Bytes of one serialized `ChannelHeader` entry in the channel-header array.
pub const CHANNEL_HEADER_ENCODED_LEN: usize = 8 + 8 + 4 + 4 + 4 + 4 + 4 + 4 + 8 + 2 + 1 + 1 + 2 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 8 + 4;

impl ChannelHeader {
    pub fn is_reusing(&self) -> bool {
        self.allocated_blocks > self.active_blocks
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.root_off.to_le_bytes());
        out.extend_from_slice(&self.last_time_on_disk.to_le_bytes());
        out.extend_from_slice(&self.active_blocks.to_le_bytes());
        out.extend_from_slice(&self.allocated_blocks.to_le_bytes());
        out.extend_from_slice(&self.item_bytes.to_le_bytes());
        out.extend_from_slice(&self.rows.to_le_bytes());
        out.extend_from_slice(&self.cols.to_le_bytes());
        out.extend_from_slice(&self.pretrig.to_le_bytes());
        out.extend_from_slice(&self.tick_divide.to_le_bytes());
        out.extend_from_slice(&self.reuse_gen.to_le_bytes());
        out.push(self.kind.to_u8());
        out.push(self.prev_kind.to_u8());
        out.extend_from_slice(&self.phys_chan.to_le_bytes());
        out.extend_from_slice(&self.title_id.to_le_bytes());
        out.extend_from_slice(&self.units_id.to_le_bytes());
        out.extend_from_slice(&self.comment_id.to_le_bytes());
        out.extend_from_slice(&self.ideal_rate.to_le_bytes());
        out.extend_from_slice(&self.scale.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.y_low.to_le_bytes());
        out.extend_from_slice(&self.y_high.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        let mut pos = 0usize;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(buf[pos..pos + N].try_into().unwrap());
                pos += N;
                v
            }};
        }
        let root_off = take!(u64);
        let last_time_on_disk = take!(i64);
        let active_blocks = take!(u32);
        let allocated_blocks = take!(u32);
        let item_bytes = take!(u32);
        let rows = take!(u32);
        let cols = take!(u32);
        let pretrig = take!(u32);
        let tick_divide = take!(i64);
        let reuse_gen = take!(u16);
        let kind = ChannelKind::from_u8(buf[pos]);
        pos += 1;
        let prev_kind = ChannelKind::from_u8(buf[pos]);
        pos += 1;
        let phys_chan = take!(u16);
        let title_id = take!(u32);
        let units_id = take!(u32);
        let comment_id = take!(u32);
        let ideal_rate = take!(f64);
        let scale = take!(f64);
        let offset = take!(f64);
        let y_low = take!(f64);
        let y_high = take!(f64);
        let flags = take!(u32);
        ChannelHeader {
            root_off,
            last_time_on_disk,
            active_blocks,
            allocated_blocks,
            item_bytes,
            rows,
            cols,
            pretrig,
            tick_divide,
            reuse_gen,
            kind,
            prev_kind,
            phys_chan,
            title_id,
            units_id,
            comment_id,
            ideal_rate,
            scale,
            offset,
            y_low,
            y_high,
            flags,
        }
    }
}

/// The file header. `dirty` tracks whether the fixed struct / user area / channel array itself
/// needs to be rewritten (separate from the string store's own dirtiness, since the string store
/// is always written first during commit because writing it may trigger header extension).
#[derive(Debug)]
pub struct FileHeader {
    pub creator: [u8; 8],
    pub minor_version: u8,
    pub major_version: u8,
    pub seconds_per_tick: f64,
    pub creation_time: i64,
    pub max_time: Tick,
    pub comment_ids: [u32; NUM_FILE_COMMENTS],
    /// Physical offsets of overflow blocks, in chain order. Length is the current overflow count.
    pub overflow_offsets: Vec<u64>,
    pub channels: Vec<ChannelHeader>,
    /// Free-form bytes reserved for an application-defined header extension, carried verbatim
    /// across save/reopen but never interpreted by the engine itself.
    pub user_area: Vec<u8>,
    pub allocator: BlockAllocator,
    pub string_store: StringStore,
    pub read_only: bool,
    dirty: bool,
}

/// Bytes of the fixed prefix (everything up to, but not including, the channel-header array) for
/// a header carrying `n_overflow` overflow-block offsets. Always small enough to live entirely in
/// the first block, since `overflow_offsets` must be known before [`FileHeader::head_offset`] can
/// resolve anything past it.
fn fixed_prefix_len(n_overflow: usize) -> usize {
    8 + 1 + 1 + 8 + 8 + 8 + 4 * NUM_FILE_COMMENTS + 4 + 8 * n_overflow + 4 + 8 + 8
}

impl FileHeader {
    pub fn new_empty(n_channels: usize, seconds_per_tick: f64, creation_time: i64, creator: [u8; 8]) -> Self {
        FileHeader {
            creator,
            minor_version: 0,
            major_version: 1,
            seconds_per_tick,
            creation_time,
            max_time: -1,
            comment_ids: [0; NUM_FILE_COMMENTS],
            overflow_offsets: Vec::new(),
            channels: (0..n_channels).map(|_| ChannelHeader::default()).collect(),
            user_area: Vec::new(),
            allocator: BlockAllocator::new(DBSIZE as u64, None),
            string_store: StringStore::new(),
            read_only: false,
            dirty: true,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn channel(&self, chan: ChanNum) -> Result<&ChannelHeader, HeaderError> {
        self.channels.get(chan as usize).ok_or_else(|| HeaderError::CorruptFile {
            reason: format!("channel {chan} out of range"),
        })
    }

    pub fn channel_mut(&mut self, chan: ChanNum) -> Result<&mut ChannelHeader, HeaderError> {
        let n = self.channels.len();
        self.channels.get_mut(chan as usize).ok_or_else(|| HeaderError::CorruptFile {
            reason: format!("channel {chan} out of range (have {n})"),
        })
    }

    /// Extends `extend_max_time`: updates the header's maximum-recorded time monotonically.
    /// Passing `-1` cancels and clears the recorded maximum.
    pub fn extend_max_time(&mut self, t: Tick) {
        if t < 0 {
            self.max_time = -1;
        } else if t > self.max_time {
            self.max_time = t;
        }
        self.dirty = true;
    }

    /// Converts a logical (contiguous) byte range within the header area into the list of
    /// physical `(offset, len)` transfers needed to cover it.
    pub fn head_offset(&self, byte_off: usize, len: usize) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        let mut remaining = len;
        let mut logical = byte_off;
        while remaining > 0 {
            let block_idx = logical / PAYLOAD_PER_BLOCK;
            let in_block = logical % PAYLOAD_PER_BLOCK;
            let phys_base = if block_idx == 0 {
                BLOCK_HEAD_SIZE as u64
            } else {
                self.overflow_offsets[block_idx - 1] + BLOCK_HEAD_SIZE as u64
            };
            let take = remaining.min(PAYLOAD_PER_BLOCK - in_block);
            out.push((phys_base + in_block as u64, take));
            remaining -= take;
            logical += take;
        }
        out
    }

    /// Total logical bytes currently addressable (first block plus all current overflow blocks).
    pub fn logical_capacity(&self) -> usize {
        (1 + self.overflow_offsets.len()) * PAYLOAD_PER_BLOCK
    }

    /// Ensures the logical header area can hold `required_len` bytes, allocating overflow blocks
    /// as needed. Fails with [`HeaderError::ReadOnly`] or [`HeaderError::NoExtra`].
    pub fn ensure_capacity(&mut self, required_len: usize) -> Result<(), HeaderError> {
        while self.logical_capacity() < required_len {
            ensure!(!self.read_only, ReadOnlySnafu);
            ensure!(self.overflow_offsets.len() < HEAD_EXT_MAX, NoExtraSnafu);
            let off = self.allocator.allocate_data().map_err(|_| HeaderError::NoExtra)?;
            self.overflow_offsets.push(off);
            self.dirty = true;
        }
        Ok(())
    }

    /// Bug-compat rule: a file written by version 1.0 may claim a string table that overruns the
    /// header space it actually allocated, provided the overrun still fits within `HEAD_EXT_MAX`
    /// overflow blocks. Rather than reject the file as corrupt, silently widen the recorded
    /// overflow count to match.
    pub fn apply_v1_bugcompat(&mut self, claimed_len: usize) -> Result<(), HeaderError> {
        if self.major_version != 1 || self.minor_version != 0 {
            return Ok(());
        }
        if claimed_len <= self.logical_capacity() {
            return Ok(());
        }
        let needed_blocks = claimed_len.div_ceil(PAYLOAD_PER_BLOCK).saturating_sub(1);
        if needed_blocks > HEAD_EXT_MAX {
            return Err(HeaderError::CorruptFile {
                reason: "v1.0 header claims a string table too large for any overflow chain".into(),
            });
        }
        warn!(
            claimed_len,
            needed_blocks, "widening overflow chain to satisfy a v1.0 bug-compat header claim"
        );
        while self.overflow_offsets.len() < needed_blocks {
            let off = self.allocator.allocate_data().map_err(|_| HeaderError::NoExtra)?;
            self.overflow_offsets.push(off);
        }
        self.dirty = true;
        Ok(())
    }

    /// Writes the first block's magic identifier, then the fixed struct / channel-header array /
    /// user area / string-store image as one logical payload across the physical overflow chain.
    /// Grows the overflow chain first if the current image no longer fits; growth only ever adds
    /// a handful of bytes to the fixed prefix (one `u64` per new block) against tens of thousands
    /// of bytes of freed capacity, so this converges in at most a couple of passes.
    pub fn write(&mut self, io: &BlockIo) -> Result<(), HeaderError> {
        ensure!(!self.read_only, ReadOnlySnafu);

        loop {
            let tail = self.serialize_tail();
            let required = fixed_prefix_len(self.overflow_offsets.len()) + tail.len();
            if self.logical_capacity() >= required {
                break;
            }
            self.ensure_capacity(required)?;
        }

        let first_id = FirstBlockId::for_build(self.minor_version, self.major_version);
        let mut first_block_header = [0u8; BLOCK_HEAD_SIZE];
        first_block_header[0..8].copy_from_slice(&first_id.to_bytes());
        let mut chan_bytes = [0u8; 2];
        chan_bytes.copy_from_slice(&HEADER_CHAN.to_le_bytes());
        first_block_header[8..10].copy_from_slice(&chan_bytes);
        io.write(&first_block_header, 0)
            .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;

        for &off in &self.overflow_offsets {
            let header = BlockHeader::new(HEADER_CHAN, 0);
            io.write(&header.to_bytes(), off)
                .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;
        }

        let payload = self.serialize_struct();
        let mut logical = 0usize;
        for (phys_off, len) in self.head_offset(0, payload.len()) {
            io.write(&payload[logical..logical + len], phys_off)
                .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;
            logical += len;
        }

        self.dirty = false;
        Ok(())
    }

    /// Reads and validates the file's magic first block, then reconstructs the whole header
    /// (fixed struct, channel array, user area, string store) from the overflow chain. The fixed
    /// prefix (through the overflow-offset list and channel count) is read directly out of the
    /// first block, since it must be known before [`Self::head_offset`] can resolve anything past
    /// it; everything after that point is read through `head_offset`, which may spill into the
    /// overflow chain the prefix just revealed.
    pub fn open(io: &BlockIo, read_only: bool) -> Result<Self, HeaderError> {
        let mut first_block = [0u8; PAYLOAD_PER_BLOCK];
        io.read(&mut first_block, BLOCK_HEAD_SIZE as u64)
            .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;

        let mut magic = [0u8; BLOCK_HEAD_SIZE];
        io.read(&mut magic, 0).map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;
        let id_bytes: [u8; 8] = magic[0..8].try_into().unwrap();
        let id = FirstBlockId::from_bytes(&id_bytes).ok_or(HeaderError::WrongFile)?;
        ensure!(id.matches_build(), WrongFileSnafu);

        let mut pos = 0usize;
        macro_rules! take {
            ($buf:expr, $ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes($buf[pos..pos + N].try_into().unwrap());
                pos += N;
                v
            }};
        }
        let mut creator = [0u8; 8];
        creator.copy_from_slice(&first_block[pos..pos + 8]);
        pos += 8;
        let minor_version = first_block[pos];
        pos += 1;
        let major_version = first_block[pos];
        pos += 1;
        let seconds_per_tick = take!(first_block, f64);
        let creation_time = take!(first_block, i64);
        let max_time = take!(first_block, Tick);
        let mut comment_ids = [0u32; NUM_FILE_COMMENTS];
        for id in comment_ids.iter_mut() {
            *id = take!(first_block, u32);
        }
        let n_overflow = take!(first_block, u32) as usize;
        ensure!(
            n_overflow <= HEAD_EXT_MAX,
            CorruptFileSnafu { reason: "overflow chain exceeds HEAD_EXT_MAX".to_string() }
        );
        let mut overflow_offsets = Vec::with_capacity(n_overflow);
        for _ in 0..n_overflow {
            overflow_offsets.push(take!(first_block, u64));
        }
        let n_channels = take!(first_block, u32) as usize;
        let next_block_off = take!(first_block, u64);
        let next_sub_off = take!(first_block, u64);

        let mut header = FileHeader {
            creator,
            minor_version,
            major_version,
            seconds_per_tick,
            creation_time,
            max_time,
            comment_ids,
            overflow_offsets,
            channels: Vec::new(),
            user_area: Vec::new(),
            allocator: BlockAllocator::from_state(next_block_off, next_sub_off, None),
            string_store: StringStore::new(),
            read_only,
            dirty: false,
        };

        let tail_off = fixed_prefix_len(header.overflow_offsets.len());
        let channel_array_len = n_channels * CHANNEL_HEADER_ENCODED_LEN;
        let channel_bytes = header.read_logical(io, tail_off, channel_array_len)?;
        header.channels = (0..n_channels)
            .map(|i| ChannelHeader::read_from(&channel_bytes[i * CHANNEL_HEADER_ENCODED_LEN..(i + 1) * CHANNEL_HEADER_ENCODED_LEN]))
            .collect();

        let user_area_len_off = tail_off + channel_array_len;
        let user_area_len_bytes = header.read_logical(io, user_area_len_off, 4)?;
        let user_area_len = u32::from_le_bytes(user_area_len_bytes.try_into().unwrap()) as usize;
        let user_area_off = user_area_len_off + 4;
        header.user_area = header.read_logical(io, user_area_off, user_area_len)?;

        let store_off = user_area_off + user_area_len;
        let total_len_bytes = header.read_logical(io, store_off, 4)?;
        let total_len_words = u32::from_le_bytes(total_len_bytes.try_into().unwrap()) as usize;
        let store_bytes = header.read_logical(io, store_off, total_len_words * 4)?;
        let store_words: Vec<u32> = store_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        header.string_store = StringStore::deserialize(&store_words, None)
            .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;

        Ok(header)
    }

    /// Reads `len` logical header bytes starting at `byte_off`, following the physical transfer
    /// list [`Self::head_offset`] produces.
    fn read_logical(&self, io: &BlockIo, byte_off: usize, len: usize) -> Result<Vec<u8>, HeaderError> {
        let mut out = vec![0u8; len];
        let mut logical = 0usize;
        for (phys_off, seg_len) in self.head_offset(byte_off, len) {
            io.read(&mut out[logical..logical + seg_len], phys_off)
                .map_err(|e| HeaderError::CorruptFile { reason: e.to_string() })?;
            logical += seg_len;
        }
        Ok(out)
    }

    /// The fixed prefix: everything up to, but not including, the channel-header array.
    fn serialize_prefix(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.creator);
        out.push(self.minor_version);
        out.push(self.major_version);
        out.extend_from_slice(&self.seconds_per_tick.to_le_bytes());
        out.extend_from_slice(&self.creation_time.to_le_bytes());
        out.extend_from_slice(&self.max_time.to_le_bytes());
        for id in &self.comment_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&(self.overflow_offsets.len() as u32).to_le_bytes());
        for &off in &self.overflow_offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.allocator.next_block_off().to_le_bytes());
        out.extend_from_slice(&self.allocator.next_sub_off().to_le_bytes());
        out
    }

    /// Everything after the fixed prefix: channel-header array, user area, string-store image.
    fn serialize_tail(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.channels.len() * CHANNEL_HEADER_ENCODED_LEN);
        for ch in &self.channels {
            ch.write_to(&mut out);
        }
        out.extend_from_slice(&(self.user_area.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.user_area);
        for word in self.string_store.serialize() {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn serialize_struct(&self) -> Vec<u8> {
        let mut out = self.serialize_prefix();
        out.extend_from_slice(&self.serialize_tail());
        out
    }

    /// Validates a structural invariant used both at open time and by a periodic self-check: the
    /// overflow chain must not exceed `HEAD_EXT_MAX` entries.
    pub fn validate(&self) -> Result<(), HeaderError> {
        ensure!(
            self.overflow_offsets.len() <= HEAD_EXT_MAX,
            CorruptFileSnafu { reason: "overflow chain exceeds HEAD_EXT_MAX".to_string() }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FileHeader {
        FileHeader::new_empty(4, 1e-6, 0, *b"tststore")
    }

    #[test]
    fn head_offset_stays_within_first_block_for_small_payload() {
        let h = header();
        let segs = h.head_offset(0, 100);
        assert_eq!(segs, vec![(BLOCK_HEAD_SIZE as u64, 100)]);
    }

    #[test]
    fn head_offset_splits_across_overflow_blocks() {
        let mut h = header();
        h.ensure_capacity(PAYLOAD_PER_BLOCK + 50).unwrap();
        let segs = h.head_offset(PAYLOAD_PER_BLOCK - 10, 60);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].1, 10);
        assert_eq!(segs[1].1, 50);
    }

    #[test]
    fn ensure_capacity_is_idempotent() {
        let mut h = header();
        h.ensure_capacity(10).unwrap();
        assert_eq!(h.overflow_offsets.len(), 0);
        h.ensure_capacity(PAYLOAD_PER_BLOCK + 1).unwrap();
        assert_eq!(h.overflow_offsets.len(), 1);
    }

    #[test]
    fn extend_max_time_is_monotonic_and_resettable() {
        let mut h = header();
        h.extend_max_time(100);
        h.extend_max_time(50);
        assert_eq!(h.max_time, 100);
        h.extend_max_time(-1);
        assert_eq!(h.max_time, -1);
    }

    #[test]
    fn write_then_open_reconstructs_channels_and_strings() {
        use crate::types::ChannelKind;

        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4 * DBSIZE as u64).unwrap();
        let io = BlockIo::new(tmp.reopen().unwrap());

        let mut h = header();
        h.extend_max_time(12345);
        let title = h.string_store.add("trace 0", 0);
        h.channels[0].kind = ChannelKind::Adc;
        h.channels[0].title_id = title;
        h.channels[0].ideal_rate = 1000.0;
        h.channels[0].root_off = DBSIZE as u64 * 2;
        h.user_area = vec![9, 8, 7, 6];
        h.write(&io).unwrap();
        assert!(!h.is_dirty());

        let reopened = FileHeader::open(&io, true).unwrap();
        assert_eq!(reopened.max_time, 12345);
        assert_eq!(reopened.channels.len(), h.channels.len());
        assert_eq!(reopened.channels[0].kind, ChannelKind::Adc);
        assert_eq!(reopened.channels[0].root_off, DBSIZE as u64 * 2);
        assert_eq!(reopened.string_store.get(title), "trace 0");
        assert_eq!(reopened.user_area, vec![9, 8, 7, 6]);
    }
}
