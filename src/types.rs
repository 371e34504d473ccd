//! Small shared value types used across the engine's public surface.

use crate::constants::NO_TIME;

/// A signed tick count; the file's indivisible time unit.
pub type Tick = i64;

/// A channel number. Valid channels are `0..MAX_CHANNELS`; `0xFFFF` is reserved to mark
/// file-header blocks in the block header's `chan` field.
pub type ChanNum = u16;

/// The schema of a channel's data blocks.
///
/// `EventRise`/`EventFall`/`EventBoth` are level channels stored as marker blocks with an
/// initial-level flag (see [`crate::channel`]); the remaining variants are one-to-one with a
/// data-block codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Off,
    EventRise,
    EventFall,
    EventBoth,
    Marker,
    TextMark,
    RealMark,
    AdcMark,
    Adc,
    RealWave,
}

impl ChannelKind {
    /// The on-disk tag stored in a channel header's `kind`/`prev_kind` byte.
    pub fn to_u8(self) -> u8 {
        match self {
            ChannelKind::Off => 0,
            ChannelKind::EventRise => 1,
            ChannelKind::EventFall => 2,
            ChannelKind::EventBoth => 3,
            ChannelKind::Marker => 4,
            ChannelKind::TextMark => 5,
            ChannelKind::RealMark => 6,
            ChannelKind::AdcMark => 7,
            ChannelKind::Adc => 8,
            ChannelKind::RealWave => 9,
        }
    }

    /// Inverse of [`Self::to_u8`]. Unrecognized tags decode as `Off` rather than erroring; a
    /// corrupt tag byte should surface as a data-shape mismatch the first time the channel is
    /// used, not block the rest of the header from loading.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelKind::EventRise,
            2 => ChannelKind::EventFall,
            3 => ChannelKind::EventBoth,
            4 => ChannelKind::Marker,
            5 => ChannelKind::TextMark,
            6 => ChannelKind::RealMark,
            7 => ChannelKind::AdcMark,
            8 => ChannelKind::Adc,
            9 => ChannelKind::RealWave,
            _ => ChannelKind::Off,
        }
    }

    /// Whether this kind denotes a level/event channel (dense `i64` timestamps on disk).
    pub fn is_event(self) -> bool {
        matches!(self, ChannelKind::EventRise | ChannelKind::EventFall | ChannelKind::EventBoth)
    }

    /// Whether this kind denotes a plain marker channel (16-byte records, no payload).
    pub fn is_marker(self) -> bool {
        matches!(self, ChannelKind::Marker)
    }

    /// Whether this kind denotes an extended-marker channel (fixed-size payload per record).
    pub fn is_ext_mark(self) -> bool {
        matches!(self, ChannelKind::TextMark | ChannelKind::RealMark | ChannelKind::AdcMark)
    }

    /// Whether this kind denotes a waveform channel (runs of evenly spaced samples).
    pub fn is_wave(self) -> bool {
        matches!(self, ChannelKind::Adc | ChannelKind::RealWave)
    }
}

/// A request window for a read, a `prev_n_time` skip, or a cooperative-cancellation budget.
///
/// `from`/`upto` form a half-open interval `[from, upto)`. `max` bounds how many items a read may
/// deliver; callers that want cooperative cancellation set `yield_after` and check
/// [`Range::should_yield`] is consulted by the inner loop, which returns early with
/// [`crate::error::ChannelError::CallAgain`] when it trips, leaving `from`/`max` adjusted so the
/// same `Range` can be passed back in to resume.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub from: Tick,
    pub upto: Tick,
    pub max: usize,
    /// Cooperative cancellation: number of items the inner loop may still process before it must
    /// yield control back to the caller. `None` means "run to completion".
    pub yield_after: Option<usize>,
}

impl Range {
    pub fn new(from: Tick, upto: Tick, max: usize) -> Self {
        Range { from, upto, max, yield_after: None }
    }

    pub fn with_yield(mut self, n: usize) -> Self {
        self.yield_after = Some(n);
        self
    }

    /// Called by inner loops once per processed item; returns true once the yield budget (if any)
    /// is exhausted.
    pub fn tick_yield(&mut self) -> bool {
        match &mut self.yield_after {
            None => false,
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
        }
    }
}

/// Filter mode for marker code matching. See [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// All four code layers must match their masks.
    And,
    /// Only layer 0 is tested; a non-zero code matches if its bit is set in the layer-0 mask.
    Or,
}

/// The marker-filter collaborator: an input predicate over a marker's four code bytes, plus an
/// optional column selector used by multi-trace `AdcMark` reads.
///
/// This is treated as an external collaborator by the specification; the engine only calls
/// [`Filter::test`] and [`Filter::column`].
#[derive(Debug, Clone)]
pub struct Filter {
    /// Eight 256-bit masks: one pair (accept-set represented as a 256-bit bitmap) per code layer,
    /// stored as `[u64; 4]` per layer for two layers worth of headroom beyond the four code bytes
    /// the engine currently inspects.
    masks: [[u64; 4]; 4],
    mode: FilterMode,
    column: Option<usize>,
}

impl Filter {
    pub fn new(mode: FilterMode) -> Self {
        Filter { masks: [[0; 4]; 4], mode, column: None }
    }

    pub fn with_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    /// Allow `value` (0..=255) to match at code layer `layer` (0..=3).
    pub fn allow(&mut self, layer: usize, value: u8) {
        let word = (value >> 6) as usize;
        let bit = value & 0x3f;
        self.masks[layer][word] |= 1u64 << bit;
    }

    fn layer_matches(&self, layer: usize, value: u8) -> bool {
        let word = (value >> 6) as usize;
        let bit = value & 0x3f;
        (self.masks[layer][word] >> bit) & 1 != 0
    }

    /// Tests whether a marker's four code bytes pass this filter.
    pub fn test(&self, codes: [u8; 4]) -> bool {
        match self.mode {
            FilterMode::And => (0..4).all(|layer| self.layer_matches(layer, codes[layer])),
            FilterMode::Or => codes[0] != 0 && self.layer_matches(0, codes[0]),
        }
    }

    pub fn column(&self) -> Option<usize> {
        self.column
    }
}

/// Returns true if `t` is the sentinel meaning "no time".
pub fn is_no_time(t: Tick) -> bool {
    t == NO_TIME
}
