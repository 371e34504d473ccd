//! Per-channel-kind data block codecs.
//!
//! Each codec owns the payload encoding for one data block and speaks the contract described in
//! the specification §4.8: `add_data`/`get_data` in terms of the channel's native item type,
//! plus a few kind-specific operations (`change_wave`, `edit_marker`, `prev_n_time`).

pub mod event;
pub mod extmark;
pub mod marker;
pub mod strided;
pub mod wave;

pub use event::EventBlock;
pub use extmark::{ExtMarkBlock, ExtMarkKind};
pub use marker::{MarkerBlock, MarkerRecord};
pub use wave::{Run, WaveBlock, WaveSample};
