//! The engine facade and file coordinator (§4.11-4.12): the outermost surface a caller actually
//! touches, and the component that owns every lock in the concurrency model (§5).
//!
//! `Engine` owns one `Coordinator`; the coordinator owns the file header (itself owning the
//! allocator and string store) and the channel table. Per §5's lock ordering, every public
//! method here acquires the channel-vector lock, then (for a single channel) that channel's own
//! mutex, then the header lock, then lets `BlockIo`'s internal mutex serialize the actual
//! transfer. This crate folds the buffer mutex into the channel mutex: a channel's ring lives
//! embedded in its `Channel` struct rather than as a sibling object, so there is no point in the
//! call graph where the buffer must be locked ahead of, but separately from, the rest of the
//! channel's state. `commit` and the global form of `set_buffering` touch every channel at once,
//! so each locks every channel mutex (ascending index order) before the header lock, keeping the
//! channel-before-header ordering intact even there. See `DESIGN.md` for the reasoning.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

use crate::alloc::BlockAllocator;
use crate::blockio::BlockIo;
use crate::channel::{Channel, ChannelData};
use crate::codec::{extmark, ExtMarkKind, MarkerRecord};
use crate::constants::DBSIZE;
use crate::error::{ChannelError, CodecError, Error, HeaderError, Result};
use crate::header::{ChannelHeader, FileHeader};
use crate::types::{ChanNum, ChannelKind, Filter, Range, Tick};

/// Construction parameters for [`Engine::create`]/[`Engine::open`], in the builder shape of
/// §2.3. `dbsize`/`dlsize`/`fanout` are carried here for round-tripping through an embedding
/// application's own configuration layer, but since this engine's block sizes are fixed at
/// compile time (`crate::constants::DBSIZE`/`DLSIZE`/`FANOUT`), they are validated against the
/// compiled build rather than used to parameterize it — see `DESIGN.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub dbsize: usize,
    pub dlsize: usize,
    pub fanout: usize,
    pub n_channels: usize,
    pub seconds_per_tick: f64,
    pub max_blocks: Option<u64>,
    pub default_buffer_seconds: f64,
    pub read_only: bool,
    pub creator: [u8; 8],
}

impl EngineConfig {
    pub fn builder(path: impl Into<PathBuf>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(path)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            path: PathBuf::new(),
            dbsize: DBSIZE,
            dlsize: crate::constants::DLSIZE,
            fanout: crate::constants::FANOUT,
            n_channels: 64,
            seconds_per_tick: 1e-6,
            max_blocks: None,
            default_buffer_seconds: 0.0,
            read_only: false,
            creator: *b"tickstor",
        }
    }
}

/// Builder for [`EngineConfig`], in the donor's `DiskBufferConfigBuilder` shape.
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EngineConfigBuilder { config: EngineConfig { path: path.into(), ..Default::default() } }
    }

    pub fn n_channels(mut self, n: usize) -> Self {
        self.config.n_channels = n;
        self
    }

    pub fn seconds_per_tick(mut self, s: f64) -> Self {
        self.config.seconds_per_tick = s;
        self
    }

    pub fn max_blocks(mut self, n: u64) -> Self {
        self.config.max_blocks = Some(n);
        self
    }

    pub fn default_buffer_seconds(mut self, s: f64) -> Self {
        self.config.default_buffer_seconds = s;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.config.read_only = v;
        self
    }

    pub fn creator(mut self, c: [u8; 8]) -> Self {
        self.config.creator = c;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        if self.config.dbsize != DBSIZE || self.config.dlsize != crate::constants::DLSIZE {
            return Err(CodecError::BadParam {
                reason: "dbsize/dlsize overrides must match this build's compiled constants".to_string(),
            }
            .into());
        }
        Ok(self.config)
    }
}

/// Flags for [`Engine::commit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitFlags {
    /// Call `fsync` after writing, once every channel and the header have been flushed.
    pub flush_os: bool,
    /// Destroy every channel's circular buffer after flushing it (used by [`Engine::close`]).
    pub destroy_buffers: bool,
}

/// A friendlier, parameterized request to assign a channel its kind, mirroring the raw
/// `(ChannelKind, tick_divide, ext_mark)` triple [`crate::channel::Channel::set_kind`] takes but
/// computing the derived `item_bytes`/`rows`/`cols` for the caller.
#[derive(Debug, Clone, Copy)]
pub enum NewChannel {
    EventRise,
    EventFall,
    EventBoth { initial_level: bool },
    Marker,
    TextMark { n_rows: usize },
    RealMark { n_rows: usize, n_cols: usize },
    AdcMark { n_rows: usize, n_cols: usize, tick_divide: i64 },
    Adc { tick_divide: i64 },
    RealWave { tick_divide: i64 },
}

struct ResolvedKind {
    kind: ChannelKind,
    tick_divide: i64,
    ext_mark: Option<(ExtMarkKind, usize, usize)>,
    item_bytes: u32,
    rows: u32,
    cols: u32,
    initial_level: bool,
}

impl NewChannel {
    fn resolve(self) -> ResolvedKind {
        match self {
            NewChannel::EventRise => ResolvedKind {
                kind: ChannelKind::EventRise,
                tick_divide: 1,
                ext_mark: None,
                item_bytes: 8,
                rows: 0,
                cols: 0,
                initial_level: false,
            },
            NewChannel::EventFall => ResolvedKind {
                kind: ChannelKind::EventFall,
                tick_divide: 1,
                ext_mark: None,
                item_bytes: 8,
                rows: 0,
                cols: 0,
                initial_level: false,
            },
            NewChannel::EventBoth { initial_level } => ResolvedKind {
                kind: ChannelKind::EventBoth,
                tick_divide: 1,
                ext_mark: None,
                item_bytes: 16,
                rows: 0,
                cols: 0,
                initial_level,
            },
            NewChannel::Marker => ResolvedKind {
                kind: ChannelKind::Marker,
                tick_divide: 1,
                ext_mark: None,
                item_bytes: 16,
                rows: 0,
                cols: 0,
                initial_level: false,
            },
            NewChannel::TextMark { n_rows } => ResolvedKind {
                kind: ChannelKind::TextMark,
                tick_divide: 1,
                ext_mark: Some((ExtMarkKind::Text, n_rows, 1)),
                item_bytes: extmark::obj_size(ExtMarkKind::Text, n_rows, 1) as u32,
                rows: n_rows as u32,
                cols: 1,
                initial_level: false,
            },
            NewChannel::RealMark { n_rows, n_cols } => ResolvedKind {
                kind: ChannelKind::RealMark,
                tick_divide: 1,
                ext_mark: Some((ExtMarkKind::Real, n_rows, n_cols)),
                item_bytes: extmark::obj_size(ExtMarkKind::Real, n_rows, n_cols) as u32,
                rows: n_rows as u32,
                cols: n_cols as u32,
                initial_level: false,
            },
            NewChannel::AdcMark { n_rows, n_cols, tick_divide } => {
                let ext_kind = ExtMarkKind::Adc { tick_divide };
                ResolvedKind {
                    kind: ChannelKind::AdcMark,
                    tick_divide,
                    ext_mark: Some((ext_kind, n_rows, n_cols)),
                    item_bytes: extmark::obj_size(ext_kind, n_rows, n_cols) as u32,
                    rows: n_rows as u32,
                    cols: n_cols as u32,
                    initial_level: false,
                }
            }
            NewChannel::Adc { tick_divide } => ResolvedKind {
                kind: ChannelKind::Adc,
                tick_divide,
                ext_mark: None,
                item_bytes: 2,
                rows: 0,
                cols: 0,
                initial_level: false,
            },
            NewChannel::RealWave { tick_divide } => ResolvedKind {
                kind: ChannelKind::RealWave,
                tick_divide,
                ext_mark: None,
                item_bytes: 4,
                rows: 0,
                cols: 0,
                initial_level: false,
            },
        }
    }
}

fn ext_mark_for(h: &ChannelHeader) -> Option<(ExtMarkKind, usize, usize)> {
    match h.kind {
        ChannelKind::TextMark => Some((ExtMarkKind::Text, h.rows as usize, h.cols as usize)),
        ChannelKind::RealMark => Some((ExtMarkKind::Real, h.rows as usize, h.cols as usize)),
        ChannelKind::AdcMark => Some((ExtMarkKind::Adc { tick_divide: h.tick_divide }, h.rows as usize, h.cols as usize)),
        _ => None,
    }
}

fn ext_mark_for_fields(kind: ChannelKind, tick_divide: i64, n_rows: usize, n_cols: usize) -> Option<(ExtMarkKind, usize, usize)> {
    match kind {
        ChannelKind::TextMark => Some((ExtMarkKind::Text, n_rows, n_cols)),
        ChannelKind::RealMark => Some((ExtMarkKind::Real, n_rows, n_cols)),
        ChannelKind::AdcMark => Some((ExtMarkKind::Adc { tick_divide }, n_rows, n_cols)),
        _ => None,
    }
}

fn items_for_seconds(header: &ChannelHeader, seconds: f64) -> usize {
    if header.ideal_rate <= 0.0 || seconds <= 0.0 {
        return 0;
    }
    (header.ideal_rate * seconds).round().max(0.0) as usize
}

fn open_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::PermissionDenied {
        Error::NoAccess { source: e }
    } else {
        Error::NoFile { source: e }
    }
}

#[cfg(unix)]
fn is_path_read_only(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.permissions().mode() & 0o200 == 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_path_read_only(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.permissions().readonly()).unwrap_or(false)
}

/// The file coordinator: owns the allocator/header/string-store (bundled in [`FileHeader`]), the
/// channel table, and the lock hierarchy of §5.
struct Coordinator {
    io: BlockIo,
    header: Mutex<FileHeader>,
    channels: RwLock<Vec<Mutex<Channel>>>,
    default_buffer_seconds: Mutex<f64>,
}

/// The public engine surface (§4.12). Owns one [`Coordinator`] and the config it was opened
/// with.
pub struct Engine {
    coordinator: Coordinator,
    config: EngineConfig,
    closed: bool,
}

impl Engine {
    /// Creates a new file at `config.path`, truncating any existing contents, with every channel
    /// slot initially `Off`.
    #[instrument(level = "debug", skip(config), fields(path = %config.path.display()))]
    pub fn create(config: EngineConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)
            .map_err(open_error)?;
        file.set_len(DBSIZE as u64).map_err(open_error)?;
        let io = BlockIo::new(file);

        let mut header = FileHeader::new_empty(config.n_channels, config.seconds_per_tick, 0, config.creator);
        header.allocator = BlockAllocator::new(DBSIZE as u64, config.max_blocks.map(|n| n * DBSIZE as u64));
        header.write(&io)?;

        let channels = (0..config.n_channels).map(|i| Mutex::new(Channel::new_off(i as ChanNum))).collect();
        Ok(Engine {
            coordinator: Coordinator {
                io,
                header: Mutex::new(header),
                channels: RwLock::new(channels),
                default_buffer_seconds: Mutex::new(config.default_buffer_seconds),
            },
            config,
            closed: false,
        })
    }

    /// Opens an existing file, reconstructing every non-`Off` channel's in-memory dispatch state
    /// and positioning its append tree at the write end (§4.12).
    #[instrument(level = "debug", skip(config), fields(path = %config.path.display()))]
    pub fn open(config: EngineConfig) -> Result<Self> {
        let read_only = config.read_only || is_path_read_only(&config.path);
        let file = OpenOptions::new().read(true).write(!read_only).open(&config.path).map_err(open_error)?;
        let io = BlockIo::new(file);

        let mut header = FileHeader::open(&io, read_only)?;
        if let Some(max) = config.max_blocks {
            header.allocator = BlockAllocator::from_state(header.allocator.next_block_off(), header.allocator.next_sub_off(), Some(max * DBSIZE as u64));
        }

        let mut channels = Vec::with_capacity(header.channels.len());
        for (i, chan_header) in header.channels.iter().enumerate() {
            let mut ch = Channel::new_off(i as ChanNum);
            if chan_header.kind != ChannelKind::Off {
                let ext_mark = ext_mark_for(chan_header);
                ch.set_kind(chan_header.kind, chan_header.tick_divide, ext_mark)?;
                if let ChannelData::LevelEvent(_, level) = &mut ch.data {
                    *level = chan_header.flags & 1 != 0;
                }
                ch.prepare_append_tree(&io, chan_header)?;
            }
            channels.push(Mutex::new(ch));
        }

        let mut config = config;
        config.read_only = read_only;
        Ok(Engine {
            coordinator: Coordinator {
                io,
                header: Mutex::new(header),
                channels: RwLock::new(channels),
                default_buffer_seconds: Mutex::new(config.default_buffer_seconds),
            },
            config,
            closed: false,
        })
    }

    /// Flushes everything (with OS buffers synced and circular buffers destroyed) and consumes
    /// the engine. Equivalent to dropping it, except errors are surfaced instead of logged.
    pub fn close(mut self) -> Result<()> {
        self.commit(CommitFlags { flush_os: true, destroy_buffers: true })?;
        self.closed = true;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.coordinator.header.lock().read_only {
            return Err(HeaderError::ReadOnly.into());
        }
        Ok(())
    }

    fn channel_slot(&self, chan: ChanNum) -> Result<()> {
        let channels = self.coordinator.channels.read();
        if (chan as usize) < channels.len() {
            Ok(())
        } else {
            Err(ChannelError::NoChannel { chan }.into())
        }
    }

    // ---- Channel lifecycle (§4.11) --------------------------------------------------------

    /// Assigns a kind to a previously `Off` channel slot. `ideal_rate` is a hint used only by
    /// [`Engine::set_buffering`]'s global sizing pass.
    #[instrument(level = "debug", skip(self))]
    pub fn set_kind(&self, chan: ChanNum, spec: NewChannel, ideal_rate: f64) -> Result<()> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        if chan_header.kind != ChannelKind::Off {
            return Err(ChannelError::ChannelUsed { chan }.into());
        }

        let phys_chan = chan_header.phys_chan;
        let resolved = spec.resolve();
        ch.set_kind(resolved.kind, resolved.tick_divide, resolved.ext_mark)?;
        if let ChannelData::LevelEvent(_, level) = &mut ch.data {
            *level = resolved.initial_level;
        }
        *chan_header = ChannelHeader {
            kind: resolved.kind,
            prev_kind: ChannelKind::Off,
            item_bytes: resolved.item_bytes,
            rows: resolved.rows,
            cols: resolved.cols,
            tick_divide: resolved.tick_divide,
            ideal_rate,
            flags: resolved.initial_level as u32,
            phys_chan,
            ..Default::default()
        };
        header.mark_dirty();

        let default_secs = *self.coordinator.default_buffer_seconds.lock();
        if default_secs > 0.0 {
            let n = items_for_seconds(&header.channels[chan as usize], default_secs);
            ch.set_buffering(n);
        }
        Ok(())
    }

    /// Marks a channel `Off`. Its disk blocks remain allocated for a future
    /// [`Engine::reset_for_reuse`].
    pub fn delete(&self, chan: ChanNum) -> Result<()> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header = self.coordinator.header.lock();
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        chan_header.prev_kind = chan_header.kind;
        chan_header.kind = ChannelKind::Off;
        ch.delete();
        header.mark_dirty();
        Ok(())
    }

    /// Restores a deleted channel to the kind it had before [`Engine::delete`], keeping its
    /// block ownership (no reuse).
    pub fn undelete(&self, chan: ChanNum) -> Result<()> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        if chan_header.kind != ChannelKind::Off {
            return Err(ChannelError::ChannelUsed { chan }.into());
        }
        let kind = chan_header.prev_kind;
        let ext_mark = ext_mark_for_fields(kind, chan_header.tick_divide, chan_header.rows as usize, chan_header.cols as usize);
        ch.undelete(kind, chan_header.tick_divide, ext_mark)?;
        if let ChannelData::LevelEvent(_, level) = &mut ch.data {
            *level = chan_header.flags & 1 != 0;
        }
        ch.prepare_append_tree(&self.coordinator.io, chan_header)?;
        chan_header.kind = kind;
        chan_header.prev_kind = ChannelKind::Off;
        header.mark_dirty();
        Ok(())
    }

    /// Bumps the reuse generation and zeroes the active-block count, reassigning the slot a
    /// (possibly different) kind; subsequent writes reuse its previously allocated blocks until
    /// they are exhausted.
    pub fn reset_for_reuse(&self, chan: ChanNum, spec: NewChannel, ideal_rate: f64) -> Result<()> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;

        let resolved = spec.resolve();
        ch.set_kind(resolved.kind, resolved.tick_divide, resolved.ext_mark)?;
        if let ChannelData::LevelEvent(_, level) = &mut ch.data {
            *level = resolved.initial_level;
        }
        chan_header.reuse_gen = chan_header.reuse_gen.wrapping_add(1);
        chan_header.active_blocks = 0;
        chan_header.kind = resolved.kind;
        chan_header.prev_kind = ChannelKind::Off;
        chan_header.item_bytes = resolved.item_bytes;
        chan_header.rows = resolved.rows;
        chan_header.cols = resolved.cols;
        chan_header.tick_divide = resolved.tick_divide;
        chan_header.ideal_rate = ideal_rate;
        chan_header.flags = resolved.initial_level as u32;
        chan_header.last_time_on_disk = -1;
        ch.prepare_append_tree(&self.coordinator.io, chan_header)?;
        header.mark_dirty();
        Ok(())
    }

    /// Like [`Engine::reset_for_reuse`], but keeps the channel's current kind — restarts writing
    /// into its own previously allocated blocks from scratch.
    pub fn empty_for_reuse(&self, chan: ChanNum) -> Result<()> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        if chan_header.kind == ChannelKind::Off {
            return Err(ChannelError::NoChannel { chan }.into());
        }

        let ext_mark = ext_mark_for(chan_header);
        ch.set_kind(chan_header.kind, chan_header.tick_divide, ext_mark)?;
        if let ChannelData::LevelEvent(_, level) = &mut ch.data {
            *level = chan_header.flags & 1 != 0;
        }
        chan_header.reuse_gen = chan_header.reuse_gen.wrapping_add(1);
        chan_header.active_blocks = 0;
        chan_header.last_time_on_disk = -1;
        ch.prepare_append_tree(&self.coordinator.io, chan_header)?;
        header.mark_dirty();
        Ok(())
    }

    // ---- Event channels ---------------------------------------------------------------------

    pub fn write_events(&self, chan: ChanNum, items: &[Tick]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_events(io, alloc, hdr, items))
    }

    pub fn read_events(&self, chan: ChanNum, range: &mut Range) -> Result<Vec<Tick>> {
        self.read_op(chan, |ch, hdr, io| ch.read_events(io, hdr, range))
    }

    // ---- EventBoth (level channels, §4.10) ---------------------------------------------------

    pub fn write_level_events(&self, chan: ChanNum, times: &[Tick]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_level_events(io, alloc, hdr, times))
    }

    pub fn read_level_events(&self, chan: ChanNum, range: &mut Range) -> Result<(bool, Vec<MarkerRecord>)> {
        self.read_op(chan, |ch, hdr, io| ch.read_level_events(io, hdr, range))
    }

    // ---- Marker channels ----------------------------------------------------------------------

    pub fn write_markers(&self, chan: ChanNum, items: &[MarkerRecord]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_markers(io, alloc, hdr, items))
    }

    pub fn read_markers(&self, chan: ChanNum, range: &mut Range, filter: Option<&Filter>) -> Result<Vec<MarkerRecord>> {
        self.read_op(chan, |ch, hdr, io| ch.read_markers(io, hdr, range, filter))
    }

    pub fn edit_marker(&self, chan: ChanNum, t: Tick, new: MarkerRecord, n_copy: usize) -> Result<bool> {
        self.ensure_writable()?;
        self.read_op(chan, |ch, hdr, io| ch.edit_marker(io, hdr, t, new, n_copy))
    }

    // ---- Extended markers -----------------------------------------------------------------

    pub fn write_ext_marks(&self, chan: ChanNum, items: &[(Tick, [u8; 4], &[u8])]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_ext_marks(io, alloc, hdr, items))
    }

    pub fn read_ext_marks(&self, chan: ChanNum, range: &mut Range, filter: Option<&Filter>) -> Result<Vec<(Tick, [u8; 4], Vec<u8>)>> {
        self.read_op(chan, |ch, hdr, io| ch.read_ext_marks(io, hdr, range, filter))
    }

    pub fn prev_ext_mark_time(&self, chan: ChanNum, range: &Range, filter: Option<&Filter>, as_wave: bool) -> Result<Tick> {
        self.read_op(chan, |ch, hdr, io| ch.prev_ext_mark_time(io, hdr, range, filter, as_wave))
    }

    pub fn edit_ext_mark(&self, chan: ChanNum, t: Tick, new_payload: &[u8], n_copy: usize) -> Result<bool> {
        self.ensure_writable()?;
        self.read_op(chan, |ch, hdr, io| ch.edit_ext_mark(io, hdr, t, new_payload, n_copy))
    }

    // ---- Waveforms ----------------------------------------------------------------------------

    pub fn write_wave_i16(&self, chan: ChanNum, t_from: Tick, samples: &[i16]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_wave_i16(io, alloc, hdr, t_from, samples))
    }

    pub fn write_wave_f32(&self, chan: ChanNum, t_from: Tick, samples: &[f32]) -> Result<usize> {
        self.ensure_writable()?;
        self.write_op(chan, |ch, hdr, alloc, io| ch.write_wave_f32(io, alloc, hdr, t_from, samples))
    }

    pub fn read_wave_i16(&self, chan: ChanNum, range: &mut Range) -> Result<(Option<Tick>, Vec<i16>)> {
        self.read_op(chan, |ch, hdr, io| ch.read_wave_i16(io, hdr, range))
    }

    pub fn read_wave_f32(&self, chan: ChanNum, range: &mut Range) -> Result<(Option<Tick>, Vec<f32>)> {
        self.read_op(chan, |ch, hdr, io| ch.read_wave_f32(io, hdr, range))
    }

    pub fn change_wave_i16(&self, chan: ChanNum, src: &[i16], t_from: Tick) -> Result<usize> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        ch.change_wave_i16(src, t_from)
    }

    pub fn change_wave_f32(&self, chan: ChanNum, src: &[f32], t_from: Tick) -> Result<usize> {
        self.ensure_writable()?;
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        ch.change_wave_f32(src, t_from)
    }

    // ---- Save/discard list, buffering, bookkeeping (§4.9, §4.11) ----------------------------

    pub fn save(&self, chan: ChanNum, t: Tick, saving: bool) -> Result<()> {
        self.channel_slot(chan)?;
        let channels = self.coordinator.channels.read();
        channels[chan as usize].lock().save(t, saving);
        Ok(())
    }

    pub fn save_range(&self, chan: ChanNum, from: Tick, to: Tick) -> Result<()> {
        self.channel_slot(chan)?;
        let channels = self.coordinator.channels.read();
        channels[chan as usize].lock().save_range(from, to);
        Ok(())
    }

    pub fn is_saving(&self, chan: ChanNum, t: Tick) -> Result<bool> {
        self.channel_slot(chan)?;
        let channels = self.coordinator.channels.read();
        Ok(channels[chan as usize].lock().is_saving(t))
    }

    pub fn no_save_list(&self, chan: ChanNum, from: Tick, to: Tick) -> Result<Vec<Tick>> {
        self.channel_slot(chan)?;
        let channels = self.coordinator.channels.read();
        Ok(channels[chan as usize].lock().no_save_list(from, to))
    }

    pub fn latest_time(&self, chan: ChanNum, t: Tick) -> Result<()> {
        self.channel_slot(chan)?;
        let channels = self.coordinator.channels.read();
        channels[chan as usize].lock().latest_time(t);
        Ok(())
    }

    pub fn max_time(&self, chan: ChanNum) -> Result<Tick> {
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let ch = slot.lock();
        let header = self.coordinator.header.lock();
        let chan_header = header.channel(chan)?;
        Ok(ch.max_time(chan_header))
    }

    /// `set_buffering(chan, bytes, seconds)` per §4.11. `chan = None` applies globally: the
    /// aggregate byte rate across every active channel scales the effective seconds to fit
    /// `bytes`, each channel is resized to `ideal_rate * effective_seconds` items, and
    /// `effective_seconds` is remembered for channels assigned a kind afterward.
    pub fn set_buffering(&self, chan: Option<ChanNum>, bytes: usize, seconds: f64) -> Result<()> {
        self.ensure_writable()?;
        match chan {
            Some(c) => {
                let channels = self.coordinator.channels.read();
                let slot = channels.get(c as usize).ok_or(ChannelError::NoChannel { chan: c })?;
                let mut ch = slot.lock();
                let header = self.coordinator.header.lock();
                let chan_header = header.channel(c)?;
                ch.set_buffering(items_for_seconds(chan_header, seconds));
                Ok(())
            }
            None => {
                // Lock every channel (ascending index order) before the header, so this still
                // respects the channel-before-header ordering even though it touches every slot.
                let channels = self.coordinator.channels.read();
                let mut guards: Vec<_> = channels.iter().map(|slot| slot.lock()).collect();
                let mut header = self.coordinator.header.lock();
                let total_bytes_per_sec: f64 =
                    header.channels.iter().filter(|c| c.kind != ChannelKind::Off).map(|c| c.ideal_rate * c.item_bytes as f64).sum();
                let effective_seconds = if total_bytes_per_sec > 0.0 && bytes > 0 {
                    seconds.min(bytes as f64 / total_bytes_per_sec)
                } else {
                    seconds
                };
                for (i, chan_header) in header.channels.iter().enumerate() {
                    if chan_header.kind == ChannelKind::Off {
                        continue;
                    }
                    guards[i].set_buffering(items_for_seconds(chan_header, effective_seconds));
                }
                *self.coordinator.default_buffer_seconds.lock() = effective_seconds;
                Ok(())
            }
        }
    }

    // ---- String-interned metadata -----------------------------------------------------------

    pub fn set_channel_title(&self, chan: ChanNum, title: &str) -> Result<()> {
        self.set_channel_string(chan, title, |h| h.title_id, |h, id| h.title_id = id)
    }

    pub fn set_channel_units(&self, chan: ChanNum, units: &str) -> Result<()> {
        self.set_channel_string(chan, units, |h| h.units_id, |h, id| h.units_id = id)
    }

    pub fn set_channel_comment(&self, chan: ChanNum, comment: &str) -> Result<()> {
        self.set_channel_string(chan, comment, |h| h.comment_id, |h, id| h.comment_id = id)
    }

    fn set_channel_string(
        &self,
        chan: ChanNum,
        text: &str,
        get: impl Fn(&ChannelHeader) -> u32,
        set: impl Fn(&mut ChannelHeader, u32),
    ) -> Result<()> {
        self.ensure_writable()?;
        self.channel_slot(chan)?;
        let mut header = self.coordinator.header.lock();
        let old_id = get(header.channel(chan)?);
        let new_id = header.string_store.add(text, old_id);
        set(header.channel_mut(chan)?, new_id);
        header.mark_dirty();
        Ok(())
    }

    pub fn set_file_comment(&self, index: usize, text: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut header = self.coordinator.header.lock();
        if index >= header.comment_ids.len() {
            return Err(CodecError::BadParam { reason: format!("comment index {index} out of range") }.into());
        }
        let old_id = header.comment_ids[index];
        let new_id = header.string_store.add(text, old_id);
        header.comment_ids[index] = new_id;
        header.mark_dirty();
        Ok(())
    }

    /// A read-only snapshot of a channel slot's persistent header, for introspection.
    pub fn channel_header(&self, chan: ChanNum) -> Result<ChannelHeader> {
        let header = self.coordinator.header.lock();
        Ok(header.channel(chan)?.clone())
    }

    // ---- Commit (§4.11) ------------------------------------------------------------------

    /// Flushes every channel's buffered-and-selected-for-save data and dirty tree nodes, then
    /// the string store and file header (in that order, since writing the string store may
    /// trigger header extension). Accumulates errors across channels and returns the first one
    /// encountered, having still attempted every channel.
    #[instrument(level = "debug", skip(self))]
    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        metrics::counter!("tickstore_commits_total").increment(1);
        let channels = self.coordinator.channels.read();
        // Lock every channel (ascending index order) before the header — see `set_buffering`.
        let mut guards: Vec<_> = channels.iter().map(|slot| slot.lock()).collect();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let mut first_err: Option<Error> = None;

        for (i, ch) in guards.iter_mut().enumerate() {
            let mut max_seen = None;
            if let Some(chan_header) = header.channels.get_mut(i) {
                if let Err(e) = ch.commit(&self.coordinator.io, &mut header.allocator, chan_header) {
                    warn!(chan = i, error = %e, "channel commit failed, continuing with remaining channels");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                } else {
                    max_seen = Some(ch.max_time(chan_header));
                }
            }
            if let Some(mx) = max_seen {
                header.extend_max_time(mx);
            }
            if flags.destroy_buffers {
                ch.set_buffering(0);
            }
        }

        if header.is_dirty() {
            if let Err(e) = header.write(&self.coordinator.io) {
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
        }

        if flags.flush_os {
            if let Err(e) = self.coordinator.io.sync_all() {
                if first_err.is_none() {
                    first_err = Some(Error::NoFile { source: e });
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- Internal helpers ------------------------------------------------------------------

    fn write_op<R>(&self, chan: ChanNum, f: impl FnOnce(&mut Channel, &mut ChannelHeader, &mut BlockAllocator, &BlockIo) -> Result<R>) -> Result<R> {
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let mut header_guard = self.coordinator.header.lock();
        let header = &mut *header_guard;
        let chan_header = header.channels.get_mut(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let result = f(&mut ch, chan_header, &mut header.allocator, &self.coordinator.io)?;
        let mx = ch.max_time(&header.channels[chan as usize]);
        header.extend_max_time(mx);
        Ok(result)
    }

    fn read_op<R>(&self, chan: ChanNum, f: impl FnOnce(&mut Channel, &ChannelHeader, &BlockIo) -> Result<R>) -> Result<R> {
        let channels = self.coordinator.channels.read();
        let slot = channels.get(chan as usize).ok_or(ChannelError::NoChannel { chan })?;
        let mut ch = slot.lock();
        let header = self.coordinator.header.lock();
        let chan_header = header.channel(chan)?;
        f(&mut ch, chan_header, &self.coordinator.io)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.commit(CommitFlags::default()) {
            error!(error = %e, "best-effort commit on drop failed; buffered writes may be lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, n_channels: usize) -> EngineConfig {
        EngineConfig::builder(dir.join("test.s64")).n_channels(n_channels).seconds_per_tick(1e-6).build().unwrap()
    }

    #[test]
    fn create_then_open_round_trips_an_event_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.s64");
        {
            let engine = Engine::create(config(dir.path(), 4)).unwrap();
            engine.set_kind(0, NewChannel::EventFall, 1000.0).unwrap();
            engine.write_events(0, &[0, 100, 200, 300]).unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(EngineConfig::builder(&path).build().unwrap()).unwrap();
        let mut range = Range::new(0, 400, 100);
        let got = engine.read_events(0, &mut range).unwrap();
        assert_eq!(got, vec![0, 100, 200, 300]);
        assert_eq!(engine.max_time(0).unwrap(), 300);
    }

    #[test]
    fn set_kind_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(config(dir.path(), 2)).unwrap();
        engine.set_kind(0, NewChannel::Marker, 10.0).unwrap();
        let err = engine.set_kind(0, NewChannel::Marker, 10.0).unwrap_err();
        assert!(matches!(err, Error::Channel { source: ChannelError::ChannelUsed { .. } }));
    }

    #[test]
    fn delete_then_reset_for_reuse_restarts_the_channel() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(config(dir.path(), 2)).unwrap();
        engine.set_kind(0, NewChannel::EventFall, 10.0).unwrap();
        engine.write_events(0, &[0, 10, 20]).unwrap();
        engine.commit(CommitFlags::default()).unwrap();
        engine.delete(0).unwrap();
        assert_eq!(engine.channel_header(0).unwrap().kind, ChannelKind::Off);
        engine.reset_for_reuse(0, NewChannel::EventFall, 10.0).unwrap();
        engine.write_events(0, &[5, 15]).unwrap();
        let mut range = Range::new(0, 100, 100);
        let got = engine.read_events(0, &mut range).unwrap();
        assert_eq!(got, vec![5, 15]);
        assert!(engine.channel_header(0).unwrap().allocated_blocks >= engine.channel_header(0).unwrap().active_blocks);
    }

    #[test]
    fn read_only_engine_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.s64");
        {
            let engine = Engine::create(config(dir.path(), 1)).unwrap();
            drop(engine);
        }
        let mut cfg = EngineConfig::builder(&path).build().unwrap();
        cfg.read_only = true;
        let engine = Engine::open(cfg).unwrap();
        let err = engine.set_kind(0, NewChannel::Marker, 1.0).unwrap_err();
        assert!(matches!(err, Error::Header { source: HeaderError::ReadOnly }));
    }

    #[test]
    fn global_set_buffering_sizes_by_aggregate_rate() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(config(dir.path(), 2)).unwrap();
        engine.set_kind(0, NewChannel::EventFall, 100.0).unwrap();
        engine.set_kind(1, NewChannel::Adc { tick_divide: 1 }, 1000.0).unwrap();
        engine.set_buffering(None, 1_000_000, 2.0).unwrap();
        engine.write_events(0, &[0, 1]).unwrap();
        engine.write_wave_i16(1, 0, &[1, 2, 3]).unwrap();
        assert!(engine.max_time(0).unwrap() >= 0);
    }
}
