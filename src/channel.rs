//! The channel dispatcher (§4.11) and level-channel transcoding (§4.10).
//!
//! Per §9's "Polymorphic channels" redesign note, a channel is a sum type over its kind-specific
//! state (`ChannelData`) rather than the donor's single-inheritance hierarchy; shared behavior
//! (the index tree, the block manager, the append path) lives in each variant's embedded
//! `BlockManager`/`AppendTree` rather than a common base class. Buffering is a second, orthogonal
//! sum type (`ChannelBuffer`) attached alongside, matching the "possibly wrapped as `Buffered`"
//! shape from the same note.

use tracing::{instrument, trace};

use crate::alloc::BlockAllocator;
use crate::append::AppendTree;
use crate::block::BlockHeader;
use crate::block_manager::BlockManager;
use crate::blockio::BlockIo;
use crate::buffer::{RingBuffer, SaveTimes, Timed};
use crate::codec::{EventBlock, ExtMarkBlock, ExtMarkKind, MarkerBlock, MarkerRecord, WaveBlock, WaveSample};
use crate::constants::{BLOCK_HEAD_SIZE, DBSIZE, T_MAX};
use crate::error::{ChannelError, CodecError, Result};
use crate::header::ChannelHeader;
use crate::types::{ChanNum, ChannelKind, Filter, Range, Tick};

/// Rejects a write whose time lies past the usable tick range (§3, §8 boundary test: writes at
/// exactly `T_MAX` succeed, `T_MAX + 1` fails `PastEof`).
fn check_t_max(t: Tick) -> Result<()> {
    if t > T_MAX {
        return Err(CodecError::PastEof { t }.into());
    }
    Ok(())
}

impl Timed for MarkerRecord {
    fn time(&self) -> Tick {
        self.time
    }
}

/// A decoded-extended-marker ring item: time, codes, and an owned payload copy.
#[derive(Debug, Clone)]
pub struct ExtMarkItem {
    pub time: Tick,
    pub codes: [u8; 4],
    pub payload: Vec<u8>,
}
impl Timed for ExtMarkItem {
    fn time(&self) -> Tick {
        self.time
    }
}

/// A single ring-buffered waveform sample, generic sample payload carried as `f64` (the engine's
/// unit-scaling collaborator works in doubles; the codec narrows back to `i16`/`f32` on flush).
#[derive(Debug, Clone, Copy)]
pub struct WaveItem {
    pub time: Tick,
    pub value: f64,
}
impl Timed for WaveItem {
    fn time(&self) -> Tick {
        self.time
    }
}

fn raw_n_items(bytes: &[u8]) -> usize {
    BlockHeader::from_bytes(bytes[0..BLOCK_HEAD_SIZE].try_into().unwrap()).n_items as usize
}

/// Common per-kind state: the read tree/block manager, the write tree/append path, and the
/// currently-open (possibly partially filled) in-memory data block.
struct Core<B> {
    reader: BlockManager,
    writer: AppendTree,
    current: B,
    current_offset: Option<u64>,
}

impl<B> Core<B> {
    fn new(current: B) -> Self {
        Core { reader: BlockManager::new(), writer: AppendTree::empty(), current, current_offset: None }
    }
}

pub struct EventState {
    core: Core<EventBlock>,
}

pub struct MarkerState {
    core: Core<MarkerBlock>,
}

pub struct ExtMarkState {
    core: Core<ExtMarkBlock>,
    kind: ExtMarkKind,
    n_rows: usize,
    n_cols: usize,
}

pub struct WaveState<T: WaveSample> {
    core: Core<WaveBlock<T>>,
}

/// The channel-kind-specific half of a channel: the sum type from §9's redesign note.
pub enum ChannelData {
    /// An unassigned slot. Every operation except [`Channel::set_kind`] rejects this variant with
    /// [`ChannelError::ChannelType`] (or, from the coordinator, [`ChannelError::NoChannel`]).
    Off,
    Event(EventState),
    /// `EventBoth`: stored as a marker stream (`codes[0] ∈ {0,1}`), transcoded to/from level
    /// transitions at the dispatcher per §4.10. The `bool` is the channel's recorded initial
    /// level.
    LevelEvent(MarkerState, bool),
    Marker(MarkerState),
    ExtMark(ExtMarkState),
    WaveI16(WaveState<i16>),
    WaveF32(WaveState<f32>),
}

/// The buffering-kind-specific ring, matching `ChannelData`'s shape.
pub enum ChannelBuffer {
    Event(RingBuffer<Tick>),
    Marker(RingBuffer<MarkerRecord>),
    ExtMark(RingBuffer<ExtMarkItem>),
    Wave(RingBuffer<WaveItem>),
}

/// One logical channel: its kind-specific data path, optional circular buffer, and save/discard
/// list. Owned by the file coordinator's channel table; every method takes the file-wide
/// resources (`io`, `alloc`, `header`) explicitly rather than holding a back-reference to the
/// coordinator (§9, "Cyclic references").
pub struct Channel {
    pub chan: ChanNum,
    pub data: ChannelData,
    pub buffer: Option<ChannelBuffer>,
    pub save_times: SaveTimes,
}

const MIN_MOVE_SHIFT: u32 = 5;

impl Channel {
    /// An unassigned channel slot, as created by [`crate::engine::Engine`] for every channel
    /// number before a kind is first assigned, and restored to after [`Channel::delete`].
    pub fn new_off(chan: ChanNum) -> Self {
        Channel { chan, data: ChannelData::Off, buffer: None, save_times: SaveTimes::new() }
    }

    pub fn new_event(chan: ChanNum) -> Self {
        Channel {
            chan,
            data: ChannelData::Event(EventState { core: Core::new(EventBlock::empty()) }),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn new_level_event(chan: ChanNum, initial_level: bool) -> Self {
        Channel {
            chan,
            data: ChannelData::LevelEvent(MarkerState { core: Core::new(MarkerBlock::empty()) }, initial_level),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn new_marker(chan: ChanNum) -> Self {
        Channel {
            chan,
            data: ChannelData::Marker(MarkerState { core: Core::new(MarkerBlock::empty()) }),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn new_ext_mark(chan: ChanNum, kind: ExtMarkKind, n_rows: usize, n_cols: usize) -> Self {
        Channel {
            chan,
            data: ChannelData::ExtMark(ExtMarkState {
                core: Core::new(ExtMarkBlock::empty(kind, n_rows, n_cols)),
                kind,
                n_rows,
                n_cols,
            }),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn new_adc(chan: ChanNum, tick_divide: i64) -> Self {
        Channel {
            chan,
            data: ChannelData::WaveI16(WaveState { core: Core::new(WaveBlock::empty(tick_divide)) }),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn new_real_wave(chan: ChanNum, tick_divide: i64) -> Self {
        Channel {
            chan,
            data: ChannelData::WaveF32(WaveState { core: Core::new(WaveBlock::empty(tick_divide)) }),
            buffer: None,
            save_times: SaveTimes::new(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match &self.data {
            ChannelData::Off => ChannelKind::Off,
            ChannelData::Event(_) => ChannelKind::EventFall,
            ChannelData::LevelEvent(..) => ChannelKind::EventBoth,
            ChannelData::Marker(_) => ChannelKind::Marker,
            ChannelData::ExtMark(s) => match s.kind {
                ExtMarkKind::Text => ChannelKind::TextMark,
                ExtMarkKind::Real => ChannelKind::RealMark,
                ExtMarkKind::Adc { .. } => ChannelKind::AdcMark,
            },
            ChannelData::WaveI16(_) => ChannelKind::Adc,
            ChannelData::WaveF32(_) => ChannelKind::RealWave,
        }
    }

    /// §4.11 `set_buffering`: sizes (or destroys, if `n == 0`) this channel's ring. `bytes`/`secs`
    /// have already been converted to an item count by the file coordinator (which alone knows
    /// every channel's aggregate rate).
    #[instrument(level = "trace", skip(self))]
    pub fn set_buffering(&mut self, n_items: usize) {
        if n_items == 0 {
            self.buffer = None;
            return;
        }
        match (&mut self.buffer, &self.data) {
            (Some(ChannelBuffer::Event(r)), _) => r.resize(n_items),
            (Some(ChannelBuffer::Marker(r)), _) => r.resize(n_items),
            (Some(ChannelBuffer::ExtMark(r)), _) => r.resize(n_items),
            (Some(ChannelBuffer::Wave(r)), _) => r.resize(n_items),
            (None, ChannelData::Event(_)) | (None, ChannelData::LevelEvent(..)) => {
                self.buffer = Some(ChannelBuffer::Event(RingBuffer::new(n_items)))
            }
            (None, ChannelData::Marker(_)) => self.buffer = Some(ChannelBuffer::Marker(RingBuffer::new(n_items))),
            (None, ChannelData::ExtMark(_)) => self.buffer = Some(ChannelBuffer::ExtMark(RingBuffer::new(n_items))),
            (None, ChannelData::WaveI16(_)) | (None, ChannelData::WaveF32(_)) => {
                self.buffer = Some(ChannelBuffer::Wave(RingBuffer::new(n_items)))
            }
            (None, ChannelData::Off) => {}
        }
    }

    /// Replaces this slot's in-memory dispatch state to match a freshly assigned kind, discarding
    /// any buffer and save/discard history (the coordinator is responsible for the matching
    /// `ChannelHeader` reset — `kind`/`prev_kind`/block counts/reuse generation — since that state
    /// lives in the file header, not here). Used both by first assignment of a kind and by
    /// [`Channel::reset_for_reuse`].
    pub fn set_kind(&mut self, kind: ChannelKind, tick_divide: i64, ext_mark: Option<(ExtMarkKind, usize, usize)>) -> Result<()> {
        let chan = self.chan;
        self.data = match kind {
            ChannelKind::Off => ChannelData::Off,
            ChannelKind::EventRise | ChannelKind::EventFall => ChannelData::Event(EventState { core: Core::new(EventBlock::empty()) }),
            ChannelKind::EventBoth => ChannelData::LevelEvent(MarkerState { core: Core::new(MarkerBlock::empty()) }, false),
            ChannelKind::Marker => ChannelData::Marker(MarkerState { core: Core::new(MarkerBlock::empty()) }),
            ChannelKind::TextMark | ChannelKind::RealMark | ChannelKind::AdcMark => {
                let (ext_kind, n_rows, n_cols) = ext_mark.ok_or_else(|| ChannelError::ChannelType { chan, kind })?;
                ChannelData::ExtMark(ExtMarkState { core: Core::new(ExtMarkBlock::empty(ext_kind, n_rows, n_cols)), kind: ext_kind, n_rows, n_cols })
            }
            ChannelKind::Adc => ChannelData::WaveI16(WaveState { core: Core::new(WaveBlock::empty(tick_divide)) }),
            ChannelKind::RealWave => ChannelData::WaveF32(WaveState { core: Core::new(WaveBlock::empty(tick_divide)) }),
        };
        self.buffer = None;
        self.save_times = SaveTimes::new();
        Ok(())
    }

    /// Marks this slot `Off`: its in-memory dispatch state and buffer are discarded, but the
    /// coordinator leaves the channel header's block counts untouched so the disk blocks remain
    /// addressable as `allocated_blocks` for a future reuse.
    pub fn delete(&mut self) {
        self.data = ChannelData::Off;
        self.buffer = None;
        self.save_times = SaveTimes::new();
    }

    /// Restores a deleted channel to its previous kind without resetting block ownership (undoes
    /// [`Channel::delete`] before any reuse has happened). `prev_kind`/params are supplied by the
    /// coordinator, which alone remembers them (from the channel header's `prev_kind` field).
    pub fn undelete(&mut self, kind: ChannelKind, tick_divide: i64, ext_mark: Option<(ExtMarkKind, usize, usize)>) -> Result<()> {
        self.set_kind(kind, tick_divide, ext_mark)
    }

    /// Called by the coordinator once per channel right after reconstructing it from a reopened
    /// file's header: reloads the append tree positioned at whichever leaf the next write must
    /// land after. Reuse mode (`allocated_blocks > active_blocks`) always resumes at the first
    /// reusable block per §4.7 step 2; otherwise it resumes at the last already-written block so
    /// the writer's path is never left pointing at an empty, disconnected tree for a channel that
    /// already has data on disk. A channel with no blocks at all leaves the writer empty, matching
    /// a freshly assigned kind.
    pub fn prepare_append_tree(&mut self, io: &BlockIo, header: &ChannelHeader) -> Result<()> {
        if header.active_blocks == 0 && header.allocated_blocks == 0 {
            return Ok(());
        }
        let target_ordinal = if header.is_reusing() { 0 } else { (header.active_blocks as usize).saturating_sub(1) };
        let tree = AppendTree::open_existing(io, header, target_ordinal)?;
        match &mut self.data {
            ChannelData::Off => {}
            ChannelData::Event(s) => s.core.writer = tree,
            ChannelData::LevelEvent(s, _) => s.core.writer = tree,
            ChannelData::Marker(s) => s.core.writer = tree,
            ChannelData::ExtMark(s) => s.core.writer = tree,
            ChannelData::WaveI16(s) => s.core.writer = tree,
            ChannelData::WaveF32(s) => s.core.writer = tree,
        }
        Ok(())
    }

    pub fn save(&mut self, t: Tick, saving: bool) {
        self.save_times.set_save(t, saving);
    }

    pub fn save_range(&mut self, from: Tick, to: Tick) {
        self.save_times.save_range(from, to);
    }

    pub fn is_saving(&self, t: Tick) -> bool {
        self.save_times.is_saving(t)
    }

    pub fn no_save_list(&self, from: Tick, to: Tick) -> Vec<Tick> {
        self.save_times.no_save_list(from, to)
    }

    pub fn latest_time(&mut self, t: Tick) {
        let oldest_buffered = match &self.buffer {
            Some(ChannelBuffer::Event(r)) => r.first_time(),
            Some(ChannelBuffer::Marker(r)) => r.first_time(),
            Some(ChannelBuffer::ExtMark(r)) => r.first_time(),
            Some(ChannelBuffer::Wave(r)) => r.first_time(),
            None => t,
        };
        self.save_times.advance_dead_to(oldest_buffered.min(t).max(-1));
    }

    // ---- Event channels (EventRise / EventFall) --------------------------------------------

    #[instrument(level = "trace", skip(self, io, alloc, header, items))]
    pub fn write_events(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, items: &[Tick]) -> Result<usize> {
        if let Some(&t) = items.iter().find(|&&t| t > T_MAX) {
            return Err(CodecError::PastEof { t }.into());
        }
        if let Some(ChannelBuffer::Event(_)) = &self.buffer {
            return self.buffered_write_events(io, alloc, header, items);
        }
        let ChannelData::Event(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::EventFall }.into());
        };
        direct_write_events(io, alloc, header, self.chan, &mut state.core, items)
    }

    fn buffered_write_events(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, items: &[Tick]) -> Result<usize> {
        let Some(ChannelBuffer::Event(ring)) = &mut self.buffer else { unreachable!() };
        let ChannelData::Event(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::EventFall }.into());
        };
        for &t in items {
            if ring.is_full() {
                let min_move = (ring.capacity() >> MIN_MOVE_SHIFT).max(1);
                flush_event_ring(io, alloc, header, self.chan, &mut state.core, ring, &self.save_times, min_move)?;
            }
            ring.push(t);
        }
        self.save_times.set_first_time(ring.first_time());
        Ok(items.len())
    }

    pub fn read_events(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range) -> Result<Vec<Tick>> {
        let ChannelData::Event(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::EventFall }.into());
        };
        let mut out = Vec::new();
        let buffer_first = match &self.buffer {
            Some(ChannelBuffer::Event(r)) if !r.is_empty() => r.first_time(),
            _ => Tick::MAX,
        };
        let budget = range.max;
        if range.from < buffer_first {
            let mut disk_range = Range::new(range.from, range.upto.min(buffer_first), budget);
            direct_read_events(io, header, &mut state.core, &mut disk_range, &mut out)?;
        }
        if out.len() < budget {
            if let Some(ChannelBuffer::Event(r)) = &self.buffer {
                for &t in r.range(range.from.max(buffer_first), range.upto) {
                    if out.len() >= budget {
                        break;
                    }
                    out.push(t);
                }
            }
        }
        Ok(out)
    }

    // ---- EventBoth (level transcoding, §4.10) --------------------------------------------

    /// Writes raw transition times for a level channel. Duplicate times collapse per the parity
    /// rule: an even count at one time cancels out, an odd count leaves one transition.
    ///
    /// The running level is tracked in `header.flags` bit 0 (initialized to the channel's
    /// recorded initial level when the channel is created), rather than re-derived from the last
    /// in-memory record, so it survives across a flush or a reopen of the file.
    pub fn write_level_events(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, times: &[Tick]) -> Result<usize> {
        if let Some(&t) = times.iter().find(|&&t| t > T_MAX) {
            return Err(CodecError::PastEof { t }.into());
        }
        let ChannelData::LevelEvent(state, _initial_level) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::EventBoth }.into());
        };
        let mut collapsed: Vec<Tick> = Vec::new();
        for &t in times {
            if collapsed.last() == Some(&t) {
                collapsed.pop();
            } else {
                collapsed.push(t);
            }
        }
        let mut level = header.flags & 1 != 0;
        let mut records = Vec::with_capacity(collapsed.len());
        for t in collapsed {
            level = !level;
            records.push(MarkerRecord { time: t, codes: [level as u8, 0, 0, 0], reserved: 0 });
        }
        header.flags = (header.flags & !1u32) | level as u32;
        direct_write_markers(io, alloc, header, self.chan, &mut state.core, &records)
    }

    /// Reads the channel back as alternating rise/fall transitions; if nothing has been written
    /// yet at `from`, the caller is instead told the level in effect just before `from` via one
    /// backward `prev_n_time`.
    pub fn read_level_events(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range) -> Result<(bool, Vec<MarkerRecord>)> {
        let ChannelData::LevelEvent(state, initial_level) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::EventBoth }.into());
        };
        let mut out = Vec::new();
        direct_read_markers(io, header, &mut state.core, range, &mut out, None)?;
        let level_before = if out.is_empty() {
            let prev_range = Range::new(-1, range.from.max(0), 1);
            let t = direct_prev_marker_time(io, header, &mut state.core, &prev_range, None)?;
            if t < 0 {
                *initial_level
            } else {
                let mut probe = Range::new(t, t + 1, 1);
                let mut rec = Vec::new();
                direct_read_markers(io, header, &mut state.core, &mut probe, &mut rec, None)?;
                rec.first().map(|r| r.codes[0] != 0).unwrap_or(*initial_level)
            }
        } else {
            out[0].codes[0] == 0
        };
        Ok((level_before, out))
    }

    // ---- Marker channels --------------------------------------------------------------------

    pub fn write_markers(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, items: &[MarkerRecord]) -> Result<usize> {
        if let Some(r) = items.iter().find(|r| r.time > T_MAX) {
            return Err(CodecError::PastEof { t: r.time }.into());
        }
        let ChannelData::Marker(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::Marker }.into());
        };
        direct_write_markers(io, alloc, header, self.chan, &mut state.core, items)
    }

    pub fn read_markers(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range, filter: Option<&Filter>) -> Result<Vec<MarkerRecord>> {
        let ChannelData::Marker(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::Marker }.into());
        };
        let mut out = Vec::new();
        direct_read_markers(io, header, &mut state.core, range, &mut out, filter)?;
        Ok(out)
    }

    pub fn edit_marker(&mut self, io: &BlockIo, header: &ChannelHeader, t: Tick, new: MarkerRecord, n_copy: usize) -> Result<bool> {
        match &mut self.data {
            ChannelData::Marker(state) => direct_edit_marker(io, header, &mut state.core, t, new, n_copy),
            ChannelData::LevelEvent(state, _) => direct_edit_marker(io, header, &mut state.core, t, new, n_copy),
            _ => Err(ChannelError::ChannelType { chan: self.chan, kind: self.kind() }.into()),
        }
    }

    pub fn max_time(&self, header: &ChannelHeader) -> Tick {
        match &self.buffer {
            Some(ChannelBuffer::Event(r)) if !r.is_empty() => r.max_time(),
            Some(ChannelBuffer::Marker(r)) if !r.is_empty() => r.max_time(),
            Some(ChannelBuffer::ExtMark(r)) if !r.is_empty() => r.max_time(),
            Some(ChannelBuffer::Wave(r)) if !r.is_empty() => r.max_time(),
            _ => header.last_time_on_disk,
        }
    }

    /// Flushes buffered writes selected by the save/discard list, and writes any dirty current
    /// block plus every dirty append-tree node, per §4.11 `commit`.
    pub fn commit(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader) -> Result<()> {
        match &mut self.data {
            ChannelData::Off => {}
            ChannelData::Event(state) => {
                if let Some(ChannelBuffer::Event(ring)) = &mut self.buffer {
                    flush_event_ring(io, alloc, header, self.chan, &mut state.core, ring, &self.save_times, ring.len())?;
                }
                flush_current_event(io, alloc, header, self.chan, &mut state.core)?;
                state.core.writer.save_all(io)?;
            }
            ChannelData::LevelEvent(state, _) => {
                flush_current_marker(io, alloc, header, self.chan, &mut state.core)?;
                state.core.writer.save_all(io)?;
            }
            ChannelData::Marker(state) => {
                if let Some(ChannelBuffer::Marker(ring)) = &mut self.buffer {
                    flush_marker_ring(io, alloc, header, self.chan, &mut state.core, ring, &self.save_times, ring.len())?;
                }
                flush_current_marker(io, alloc, header, self.chan, &mut state.core)?;
                state.core.writer.save_all(io)?;
            }
            ChannelData::ExtMark(state) => {
                flush_current_ext_mark(io, alloc, header, self.chan, state)?;
                state.core.writer.save_all(io)?;
            }
            ChannelData::WaveI16(state) => {
                flush_current_wave(io, alloc, header, self.chan, &mut state.core)?;
                state.core.writer.save_all(io)?;
            }
            ChannelData::WaveF32(state) => {
                flush_current_wave(io, alloc, header, self.chan, &mut state.core)?;
                state.core.writer.save_all(io)?;
            }
        }
        Ok(())
    }
}

// ---- Free functions: the direct (unbuffered) codec append/read paths, reused by both the
// dispatcher's direct write path and the ring-flush path. ------------------------------------

fn direct_write_events(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    core: &mut Core<EventBlock>,
    items: &[Tick],
) -> Result<usize> {
    let mut remaining = items;
    let mut total = 0;
    while !remaining.is_empty() {
        let n = core.current.add_data(remaining);
        total += n;
        remaining = &remaining[n..];
        if remaining.is_empty() {
            break;
        }
        flush_current_event(io, alloc, header, chan, core)?;
        core.current = EventBlock::empty();
    }
    Ok(total)
}

fn flush_current_event(io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, chan: ChanNum, core: &mut Core<EventBlock>) -> Result<()> {
    if core.current.times.is_empty() {
        return Ok(());
    }
    let first_time = core.current.first_time();
    let (offset, chan_id, parent_off, parent_index) =
        core.writer.append_block(core.current_offset, first_time, header, alloc, io, chan)?;
    let mut bh = BlockHeader::new(chan, chan_id);
    bh.parent_off = parent_off;
    bh.parent_index = parent_index;
    bh.n_items = core.current.times.len() as u32;
    let mut buf = vec![0u8; DBSIZE];
    buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&bh.to_bytes());
    core.current.to_bytes(&mut buf);
    io.write(&buf, offset)?;
    core.reader.update_data(offset, &buf);
    core.current_offset = Some(offset);
    header.last_time_on_disk = core.current.last_time();
    trace!(chan, offset, "flushed event block");
    Ok(())
}

fn direct_read_events(io: &BlockIo, header: &ChannelHeader, core: &mut Core<EventBlock>, range: &mut Range, out: &mut Vec<Tick>) -> Result<()> {
    let last_time_of = |bytes: &[u8]| EventBlock::from_bytes(bytes, raw_n_items(bytes)).last_time();
    match core.reader.seek(io, header, &core.writer, range.from, last_time_of)? {
        crate::block_manager::SeekOutcome::NoData => {}
        crate::block_manager::SeekOutcome::Found => loop {
            let block = core.reader.block.as_ref().unwrap();
            let decoded = EventBlock::from_bytes(&block.bytes, raw_n_items(&block.bytes));
            decoded.get_data(out, range);
            let last = decoded.last_time();
            if out.len() >= range.max || last < 0 || last >= range.upto - 1 {
                break;
            }
            if !core.reader.next_block(0, io, header, &core.writer, last_time_of)? {
                break;
            }
        },
    }
    Ok(())
}

fn direct_write_markers(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    core: &mut Core<MarkerBlock>,
    items: &[MarkerRecord],
) -> Result<usize> {
    let mut remaining = items;
    let mut total = 0;
    while !remaining.is_empty() {
        let n = core.current.add_data(remaining);
        total += n;
        remaining = &remaining[n..];
        if remaining.is_empty() {
            break;
        }
        flush_current_marker(io, alloc, header, chan, core)?;
        core.current = MarkerBlock::empty();
    }
    Ok(total)
}

fn flush_current_marker(io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, chan: ChanNum, core: &mut Core<MarkerBlock>) -> Result<()> {
    if core.current.records.is_empty() {
        return Ok(());
    }
    let first_time = core.current.first_time();
    let (offset, chan_id, parent_off, parent_index) =
        core.writer.append_block(core.current_offset, first_time, header, alloc, io, chan)?;
    let mut bh = BlockHeader::new(chan, chan_id);
    bh.parent_off = parent_off;
    bh.parent_index = parent_index;
    bh.n_items = core.current.records.len() as u32;
    let mut buf = vec![0u8; DBSIZE];
    buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&bh.to_bytes());
    core.current.to_bytes(&mut buf);
    io.write(&buf, offset)?;
    core.reader.update_data(offset, &buf);
    core.current_offset = Some(offset);
    header.last_time_on_disk = core.current.last_time();
    Ok(())
}

fn direct_read_markers(
    io: &BlockIo,
    header: &ChannelHeader,
    core: &mut Core<MarkerBlock>,
    range: &mut Range,
    out: &mut Vec<MarkerRecord>,
    filter: Option<&Filter>,
) -> Result<()> {
    let last_time_of = |bytes: &[u8]| MarkerBlock::from_bytes(bytes, raw_n_items(bytes)).last_time();
    match core.reader.seek(io, header, &core.writer, range.from, last_time_of)? {
        crate::block_manager::SeekOutcome::NoData => {}
        crate::block_manager::SeekOutcome::Found => loop {
            let block = core.reader.block.as_ref().unwrap();
            let decoded = MarkerBlock::from_bytes(&block.bytes, raw_n_items(&block.bytes));
            decoded.get_data(out, range, filter);
            let last = decoded.last_time();
            if out.len() >= range.max || last < 0 || last >= range.upto - 1 {
                break;
            }
            if !core.reader.next_block(0, io, header, &core.writer, last_time_of)? {
                break;
            }
        },
    }
    Ok(())
}

fn direct_prev_marker_time(io: &BlockIo, header: &ChannelHeader, core: &mut Core<MarkerBlock>, range: &Range, filter: Option<&Filter>) -> Result<Tick> {
    let last_time_of = |bytes: &[u8]| MarkerBlock::from_bytes(bytes, raw_n_items(bytes)).last_time();
    match core.reader.seek(io, header, &core.writer, range.upto.max(0) - 1, last_time_of)? {
        crate::block_manager::SeekOutcome::NoData => Ok(-1),
        crate::block_manager::SeekOutcome::Found => {
            let block = core.reader.block.as_ref().unwrap();
            let decoded = MarkerBlock::from_bytes(&block.bytes, raw_n_items(&block.bytes));
            Ok(decoded.prev_n_time(range, filter))
        }
    }
}

fn direct_edit_marker(io: &BlockIo, header: &ChannelHeader, core: &mut Core<MarkerBlock>, t: Tick, new: MarkerRecord, n_copy: usize) -> Result<bool> {
    if core.current.records.iter().any(|r| r.time == t) {
        return Ok(core.current.edit_marker(t, new, n_copy));
    }
    let last_time_of = |bytes: &[u8]| MarkerBlock::from_bytes(bytes, raw_n_items(bytes)).last_time();
    match core.reader.seek(io, header, &core.writer, t, last_time_of)? {
        crate::block_manager::SeekOutcome::NoData => Ok(false),
        crate::block_manager::SeekOutcome::Found => {
            let block = core.reader.block.as_ref().unwrap().clone();
            let mut decoded = MarkerBlock::from_bytes(&block.bytes, raw_n_items(&block.bytes));
            let found = decoded.edit_marker(t, new, n_copy);
            if found {
                let mut bytes = block.bytes.clone();
                decoded.to_bytes(&mut bytes);
                io.write(&bytes, block.offset)?;
                core.reader.update_data(block.offset, &bytes);
            }
            Ok(found)
        }
    }
}

fn flush_event_ring(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    core: &mut Core<EventBlock>,
    ring: &mut RingBuffer<Tick>,
    save_times: &SaveTimes,
    min_move: usize,
) -> Result<()> {
    let n = min_move.max(ring.len() >> MIN_MOVE_SHIFT).min(ring.len());
    if n == 0 {
        return Ok(());
    }
    let window_from = ring.first_time();
    let window_to = ring.range(window_from, Tick::MAX).nth(n.saturating_sub(1)).map(|t| t + 1).unwrap_or(window_from);
    let mut cursor = window_from;
    while let Some((save_from, save_to)) = save_times.next_save_range(cursor, window_to) {
        let batch: Vec<Tick> = ring.range(save_from, save_to).copied().collect();
        direct_write_events(io, alloc, header, chan, core, &batch)?;
        cursor = save_to;
    }
    ring.evict_front(n);
    metrics::counter!("tickstore_ring_flushed_items_total", "kind" => "event").increment(n as u64);
    Ok(())
}

fn flush_marker_ring(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    core: &mut Core<MarkerBlock>,
    ring: &mut RingBuffer<MarkerRecord>,
    save_times: &SaveTimes,
    min_move: usize,
) -> Result<()> {
    let n = min_move.max(ring.len() >> MIN_MOVE_SHIFT).min(ring.len());
    if n == 0 {
        return Ok(());
    }
    let window_from = ring.first_time();
    let window_to = ring.range(window_from, Tick::MAX).nth(n.saturating_sub(1)).map(|r| r.time + 1).unwrap_or(window_from);
    let mut cursor = window_from;
    while let Some((save_from, save_to)) = save_times.next_save_range(cursor, window_to) {
        let batch: Vec<MarkerRecord> = ring.range(save_from, save_to).copied().collect();
        direct_write_markers(io, alloc, header, chan, core, &batch)?;
        cursor = save_to;
    }
    ring.evict_front(n);
    Ok(())
}

// ---- Extended markers ------------------------------------------------------------------------

impl Channel {
    pub fn write_ext_marks(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, items: &[(Tick, [u8; 4], &[u8])]) -> Result<usize> {
        if let Some(&(t, ..)) = items.iter().find(|&&(t, ..)| t > T_MAX) {
            return Err(CodecError::PastEof { t }.into());
        }
        let ChannelData::ExtMark(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::TextMark }.into());
        };
        direct_write_ext_marks(io, alloc, header, self.chan, state, items)
    }

    pub fn read_ext_marks(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range, filter: Option<&Filter>) -> Result<Vec<(Tick, [u8; 4], Vec<u8>)>> {
        let ChannelData::ExtMark(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::TextMark }.into());
        };
        let mut out = Vec::new();
        let kind = state.kind;
        let n_rows = state.n_rows;
        let n_cols = state.n_cols;
        let last_time_of = move |bytes: &[u8]| {
            let n = raw_n_items(bytes);
            ExtMarkBlock::from_bytes(bytes, n, kind, n_rows, n_cols).last_time()
        };
        match state.core.reader.seek(io, header, &state.core.writer, range.from, last_time_of)? {
            crate::block_manager::SeekOutcome::NoData => {}
            crate::block_manager::SeekOutcome::Found => loop {
                let block = state.core.reader.block.as_ref().unwrap();
                let n = raw_n_items(&block.bytes);
                let decoded = ExtMarkBlock::from_bytes(&block.bytes, n, kind, n_rows, n_cols);
                decoded.get_data(&mut out, range, filter);
                let last = decoded.last_time();
                if out.len() >= range.max || last < 0 || last >= range.upto - 1 {
                    break;
                }
                if !state.core.reader.next_block(0, io, header, &state.core.writer, last_time_of)? {
                    break;
                }
            },
        }
        Ok(out)
    }

    pub fn prev_ext_mark_time(&mut self, io: &BlockIo, header: &ChannelHeader, range: &Range, filter: Option<&Filter>, as_wave: bool) -> Result<Tick> {
        let ChannelData::ExtMark(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::TextMark }.into());
        };
        if !state.core.current.is_empty() {
            return Ok(state.core.current.prev_n_time(range, filter, as_wave));
        }
        let kind = state.kind;
        let n_rows = state.n_rows;
        let n_cols = state.n_cols;
        let last_time_of = move |bytes: &[u8]| {
            let n = raw_n_items(bytes);
            ExtMarkBlock::from_bytes(bytes, n, kind, n_rows, n_cols).last_time()
        };
        match state.core.reader.seek(io, header, &state.core.writer, (range.upto - 1).max(0), last_time_of)? {
            crate::block_manager::SeekOutcome::NoData => Ok(-1),
            crate::block_manager::SeekOutcome::Found => {
                let block = state.core.reader.block.as_ref().unwrap();
                let n = raw_n_items(&block.bytes);
                let decoded = ExtMarkBlock::from_bytes(&block.bytes, n, kind, n_rows, n_cols);
                Ok(decoded.prev_n_time(range, filter, as_wave))
            }
        }
    }

    pub fn edit_ext_mark(&mut self, io: &BlockIo, header: &ChannelHeader, t: Tick, new_payload: &[u8], n_copy: usize) -> Result<bool> {
        let ChannelData::ExtMark(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::TextMark }.into());
        };
        if state.core.current.first_time() <= t && t <= state.core.current.last_time().max(state.core.current.first_time()) {
            if state.core.current.edit_marker(t, new_payload, n_copy) {
                return Ok(true);
            }
        }
        let kind = state.kind;
        let n_rows = state.n_rows;
        let n_cols = state.n_cols;
        let last_time_of = move |bytes: &[u8]| {
            let n = raw_n_items(bytes);
            ExtMarkBlock::from_bytes(bytes, n, kind, n_rows, n_cols).last_time()
        };
        match state.core.reader.seek(io, header, &state.core.writer, t, last_time_of)? {
            crate::block_manager::SeekOutcome::NoData => Ok(false),
            crate::block_manager::SeekOutcome::Found => {
                let block = state.core.reader.block.as_ref().unwrap().clone();
                let n = raw_n_items(&block.bytes);
                let mut decoded = ExtMarkBlock::from_bytes(&block.bytes, n, kind, n_rows, n_cols);
                let found = decoded.edit_marker(t, new_payload, n_copy);
                if found {
                    let mut bytes = block.bytes.clone();
                    decoded.to_bytes(&mut bytes);
                    io.write(&bytes, block.offset)?;
                    state.core.reader.update_data(block.offset, &bytes);
                }
                Ok(found)
            }
        }
    }
}

fn direct_write_ext_marks(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    state: &mut ExtMarkState,
    items: &[(Tick, [u8; 4], &[u8])],
) -> Result<usize> {
    let mut remaining = items;
    let mut total = 0;
    while !remaining.is_empty() {
        let n = state.core.current.add_data(remaining);
        total += n;
        remaining = &remaining[n..];
        if remaining.is_empty() {
            break;
        }
        flush_current_ext_mark(io, alloc, header, chan, state)?;
        state.core.current = ExtMarkBlock::empty(state.kind, state.n_rows, state.n_cols);
    }
    Ok(total)
}

fn flush_current_ext_mark(io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, chan: ChanNum, state: &mut ExtMarkState) -> Result<()> {
    if state.core.current.is_empty() {
        return Ok(());
    }
    let first_time = state.core.current.first_time();
    let (offset, chan_id, parent_off, parent_index) =
        state.core.writer.append_block(state.core.current_offset, first_time, header, alloc, io, chan)?;
    let mut bh = BlockHeader::new(chan, chan_id);
    bh.parent_off = parent_off;
    bh.parent_index = parent_index;
    bh.n_items = state.core.current.len() as u32;
    let mut buf = vec![0u8; DBSIZE];
    buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&bh.to_bytes());
    state.core.current.to_bytes(&mut buf);
    io.write(&buf, offset)?;
    state.core.reader.update_data(offset, &buf);
    state.core.current_offset = Some(offset);
    header.last_time_on_disk = state.core.current.last_time();
    Ok(())
}

// ---- Waveforms (Adc / RealWave) ----------------------------------------------------------

impl Channel {
    pub fn write_wave_i16(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, t_from: Tick, samples: &[i16]) -> Result<usize> {
        check_t_max(t_from)?;
        let ChannelData::WaveI16(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::Adc }.into());
        };
        direct_write_wave(io, alloc, header, self.chan, &mut state.core, t_from, samples)
    }

    pub fn write_wave_f32(&mut self, io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, t_from: Tick, samples: &[f32]) -> Result<usize> {
        check_t_max(t_from)?;
        let ChannelData::WaveF32(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::RealWave }.into());
        };
        direct_write_wave(io, alloc, header, self.chan, &mut state.core, t_from, samples)
    }

    pub fn read_wave_i16(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range) -> Result<(Option<Tick>, Vec<i16>)> {
        let ChannelData::WaveI16(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::Adc }.into());
        };
        direct_read_wave(io, header, &mut state.core, range)
    }

    pub fn read_wave_f32(&mut self, io: &BlockIo, header: &ChannelHeader, range: &mut Range) -> Result<(Option<Tick>, Vec<f32>)> {
        let ChannelData::WaveF32(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::RealWave }.into());
        };
        direct_read_wave(io, header, &mut state.core, range)
    }

    pub fn change_wave_i16(&mut self, src: &[i16], t_from: Tick) -> Result<usize> {
        let ChannelData::WaveI16(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::Adc }.into());
        };
        Ok(state.core.current.change_wave(src, t_from))
    }

    pub fn change_wave_f32(&mut self, src: &[f32], t_from: Tick) -> Result<usize> {
        let ChannelData::WaveF32(state) = &mut self.data else {
            return Err(ChannelError::ChannelType { chan: self.chan, kind: ChannelKind::RealWave }.into());
        };
        Ok(state.core.current.change_wave(src, t_from))
    }
}

fn direct_write_wave<T: WaveSample + Copy>(
    io: &BlockIo,
    alloc: &mut BlockAllocator,
    header: &mut ChannelHeader,
    chan: ChanNum,
    core: &mut Core<WaveBlock<T>>,
    t_from: Tick,
    samples: &[T],
) -> Result<usize> {
    let mut t = t_from;
    let mut remaining = samples;
    let mut total = 0;
    while !remaining.is_empty() {
        let n = core.current.add_data(t, remaining);
        total += n;
        if n == 0 && !core.current.runs.is_empty() {
            flush_current_wave(io, alloc, header, chan, core)?;
            let tick_divide = core.current.tick_divide;
            core.current = WaveBlock::empty(tick_divide);
            continue;
        }
        remaining = &remaining[n..];
        t += n as i64 * core.current.tick_divide;
        if !remaining.is_empty() {
            flush_current_wave(io, alloc, header, chan, core)?;
            let tick_divide = core.current.tick_divide;
            core.current = WaveBlock::empty(tick_divide);
        }
    }
    Ok(total)
}

fn flush_current_wave<T: WaveSample + Copy>(io: &BlockIo, alloc: &mut BlockAllocator, header: &mut ChannelHeader, chan: ChanNum, core: &mut Core<WaveBlock<T>>) -> Result<()> {
    if core.current.runs.is_empty() {
        return Ok(());
    }
    let first_time = core.current.first_time();
    let (offset, chan_id, parent_off, parent_index) =
        core.writer.append_block(core.current_offset, first_time, header, alloc, io, chan)?;
    let mut bh = BlockHeader::new(chan, chan_id);
    bh.parent_off = parent_off;
    bh.parent_index = parent_index;
    bh.n_items = core.current.runs.len() as u32;
    let mut buf = vec![0u8; DBSIZE];
    buf[0..BLOCK_HEAD_SIZE].copy_from_slice(&bh.to_bytes());
    core.current.to_bytes(&mut buf);
    io.write(&buf, offset)?;
    core.reader.update_data(offset, &buf);
    core.current_offset = Some(offset);
    header.last_time_on_disk = core.current.last_time();
    Ok(())
}

fn direct_read_wave<T: WaveSample + Copy>(io: &BlockIo, header: &ChannelHeader, core: &mut Core<WaveBlock<T>>, range: &mut Range) -> Result<(Option<Tick>, Vec<T>)> {
    let tick_divide = core.current.tick_divide;
    let last_time_of = move |bytes: &[u8]| {
        let n = raw_n_items(bytes);
        WaveBlock::<T>::from_bytes(bytes, n, tick_divide).last_time()
    };
    let mut out = Vec::new();
    let mut t_first = None;
    match core.reader.seek(io, header, &core.writer, range.from, last_time_of)? {
        crate::block_manager::SeekOutcome::NoData => {}
        crate::block_manager::SeekOutcome::Found => loop {
            let block = core.reader.block.as_ref().unwrap();
            let n = raw_n_items(&block.bytes);
            let decoded = WaveBlock::<T>::from_bytes(&block.bytes, n, tick_divide);
            let (first, got) = decoded.get_data(&mut out, range);
            if t_first.is_none() {
                t_first = first;
            }
            if got == 0 || out.len() >= range.max {
                break;
            }
            range.from = decoded.last_time() + tick_divide;
            if !core.reader.next_block(0, io, header, &core.writer, last_time_of)? {
                break;
            }
        },
    }
    Ok((t_first, out))
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
    fn event_write_then_read_matches_scenario_1() {
        let io = io();
        let mut alloc = BlockAllocator::new(DBSIZE as u64, None);
        let mut header = ChannelHeader::default();
        let mut chan = Channel::new_event(0);
        chan.write_events(&io, &mut alloc, &mut header, &[0, 100, 200, 300]).unwrap();
        chan.commit(&io, &mut alloc, &mut header).unwrap();
        let mut range = Range::new(0, 400, 100);
        let got = chan.read_events(&io, &header, &mut range).unwrap();
        assert_eq!(got, vec![0, 100, 200, 300]);
    }

    #[test]
    fn write_events_rejects_past_t_max() {
        let io = io();
        let mut alloc = BlockAllocator::new(DBSIZE as u64, None);
        let mut header = ChannelHeader::default();
        let mut chan = Channel::new_event(0);
        assert_eq!(chan.write_events(&io, &mut alloc, &mut header, &[T_MAX]).unwrap(), 1);
        let err = chan.write_events(&io, &mut alloc, &mut header, &[T_MAX + 1]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Codec { source: CodecError::PastEof { t } } if t == T_MAX + 1));
    }

    #[test]
    fn marker_filtered_read_matches_scenario_3() {
        let io = io();
        let mut alloc = BlockAllocator::new(DBSIZE as u64, None);
        let mut header = ChannelHeader::default();
        let mut chan = Channel::new_marker(2);
        let recs = [
            MarkerRecord { time: 10, codes: [1, 0, 0, 0], reserved: 0 },
            MarkerRecord { time: 20, codes: [2, 0, 0, 0], reserved: 0 },
            MarkerRecord { time: 30, codes: [1, 0, 0, 0], reserved: 0 },
        ];
        chan.write_markers(&io, &mut alloc, &mut header, &recs).unwrap();
        chan.commit(&io, &mut alloc, &mut header).unwrap();
        let mut filter = Filter::new(crate::types::FilterMode::And);
        filter.allow(0, 1);
        for layer in 1..4 {
            for v in 0..=255u8 {
                filter.allow(layer, v);
            }
        }
        let mut range = Range::new(0, 100, 100);
        let got = chan.read_markers(&io, &header, &mut range, Some(&filter)).unwrap();
        assert_eq!(got.iter().map(|r| r.time).collect::<Vec<_>>(), vec![10, 30]);
    }
}
