//! `tickstore`: a 64-bit block-structured storage engine for multi-channel time-series
//! experimental data.
//!
//! A `tickstore` file holds a fixed number of independent channels, each an append-only sequence
//! of timestamped records addressed by a per-channel index tree (§3-§4 of the design notes in
//! `DESIGN.md`). Channels come in a handful of kinds — plain events, level-carrying event pairs,
//! markers, extended (fixed-stride) markers, and 16-bit/32-bit waveforms — selected per channel
//! slot at [`Channel::set_kind`][channel::Channel::set_kind] time. [`Engine`] is the entry point
//! most callers want; it wraps the file-level coordinator and per-channel dispatch in a
//! lock-ordered, thread-safe facade (§5).
//!
//! ```no_run
//! use tickstore::{Engine, EngineConfig, NewChannel, Range};
//!
//! # fn main() -> tickstore::Result<()> {
//! let config = EngineConfig::builder("/tmp/run1.s64").n_channels(16).build()?;
//! let engine = Engine::create(config)?;
//! engine.set_kind(0, NewChannel::EventFall, 1000.0)?;
//! engine.write_events(0, &[0, 100, 200])?;
//! let mut range = Range::new(0, 1000, 100);
//! let events = engine.read_events(0, &mut range)?;
//! assert_eq!(events, vec![0, 100, 200]);
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod append;
pub mod block;
pub mod block_manager;
pub mod blockio;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod constants;
pub mod engine;
pub mod error;
pub mod header;
pub mod index;
pub mod lookup;
pub mod strings;
pub mod types;

pub use channel::{Channel, ChannelBuffer, ChannelData};
pub use codec::{EventBlock, ExtMarkBlock, ExtMarkKind, MarkerBlock, MarkerRecord, Run, WaveBlock, WaveSample};
pub use engine::{CommitFlags, Engine, EngineConfig, EngineConfigBuilder, NewChannel};
pub use error::{Code, Error, Result};
pub use header::{ChannelHeader, FileHeader};
pub use types::{ChanNum, ChannelKind, Filter, FilterMode, Range, Tick};
