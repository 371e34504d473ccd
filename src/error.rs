//! Error types for the storage engine.
//!
//! Each subsystem gets its own `#[derive(Snafu)]` enum, the way the donor buffer implementation
//! splits `LedgerLoadCreateError`/`WriterError`/`ReaderError` by concern. All of them flatten into
//! [`Error`] via `#[snafu(context(false))]`, so call sites can use `?` without naming a context
//! selector, while callers that need the closed, legacy numeric contract from the on-disk format's
//! documentation can convert any [`Error`] to a [`Code`].

use std::io;

use snafu::Snafu;

/// Errors raised while allocating data or lookup blocks.
#[derive(Debug, Snafu)]
pub enum AllocError {
    /// The file has reached its configured maximum size; no more blocks are available.
    #[snafu(display("no more blocks available (file at configured maximum size)"))]
    NoBlock,
}

/// Errors raised by the raw block I/O layer.
#[derive(Debug, Snafu)]
pub enum BlockIoError {
    /// A read failed after exhausting retries on transient errors.
    #[snafu(display("failed to read {len} bytes at offset {offset}: {source}"))]
    BadRead {
        offset: u64,
        len: usize,
        source: io::Error,
    },

    /// A write failed after exhausting retries on transient errors.
    #[snafu(display("failed to write {len} bytes at offset {offset}: {source}"))]
    BadWrite {
        offset: u64,
        len: usize,
        source: io::Error,
    },
}

/// Errors raised by the string store.
#[derive(Debug, Snafu)]
pub enum StringStoreError {
    /// A reloaded string table claimed a refcount above the configured sanity cap, which only
    /// happens when the table has been corrupted.
    #[snafu(display(
        "string id {id} has refcount {refcount}, exceeding sanity cap {cap}; table is corrupt"
    ))]
    CorruptRefcount { id: u32, refcount: u32, cap: u32 },

    /// `sub` (or `add` with an `old_id`) was given an id that was never issued, or was already
    /// fully freed.
    #[snafu(display("string id {id} is not currently live"))]
    UnknownId { id: u32 },
}

/// Errors raised while reading or writing the file header and its overflow chain.
#[derive(Debug, Snafu)]
pub enum HeaderError {
    /// The file does not begin with the expected `S64` magic, or its `DBSIZE`/`DLSIZE` encoding
    /// does not match this build's constants.
    #[snafu(display("file does not have a recognized tickstore header"))]
    WrongFile,

    /// The header or one of its overflow blocks failed a structural check.
    #[snafu(display("file header is corrupt: {reason}"))]
    CorruptFile { reason: String },

    /// An extension of the logical header area was requested on a read-only file.
    #[snafu(display("cannot extend file header: file is open read-only"))]
    ReadOnly,

    /// The header has used all `HEAD_EXT_MAX` overflow blocks and cannot grow further.
    #[snafu(display("file header has exhausted its overflow block chain"))]
    NoExtra,
}

/// Errors raised while walking or mutating the per-channel index tree.
#[derive(Debug, Snafu)]
pub enum IndexError {
    /// A lookup node rejected an entry because it is full.
    #[snafu(display("lookup node at level {level} is full"))]
    Full { level: u8 },

    /// A lookup node failed its strictly-increasing-entries check on load.
    #[snafu(display("lookup node at offset {offset} is corrupt: {reason}"))]
    CorruptNode { offset: u64, reason: String },
}

/// Errors raised by the per-channel-kind data block codecs.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// A write would have fallen at or before the last item already committed to this channel.
    #[snafu(display("write at time {t} is not after the last committed time {last}"))]
    OverWrite { t: i64, last: i64 },

    /// A requested time lies past the usable tick range.
    #[snafu(display("time {t} is past the end of the usable tick range"))]
    PastEof { t: i64 },

    /// A requested time lies before the start of the usable tick range.
    #[snafu(display("time {t} is before the start of the usable tick range"))]
    PastSof { t: i64 },

    /// A parameter describing the payload shape (rows, columns, item size) was invalid for the
    /// channel kind it was given to.
    #[snafu(display("bad parameter for codec: {reason}"))]
    BadParam { reason: String },
}

/// Errors raised by the channel dispatcher and file coordinator.
#[derive(Debug, Snafu)]
pub enum ChannelError {
    /// The channel number named does not exist, or is `Off`.
    #[snafu(display("channel {chan} does not exist"))]
    NoChannel { chan: u16 },

    /// The channel number named is already assigned a kind other than `Off`.
    #[snafu(display("channel {chan} is already in use"))]
    ChannelUsed { chan: u16 },

    /// An operation was attempted against a channel using a type it does not support (for
    /// example, reading waveform samples from an event channel).
    #[snafu(display("channel {chan} does not support this operation (kind is {kind:?})"))]
    ChannelType { chan: u16, kind: crate::ChannelKind },

    /// A caller's cooperative-cancellation budget was exhausted mid-call; partial progress was
    /// made and the caller should re-enter with the same range to continue.
    #[snafu(display("call budget exhausted, call again to continue"))]
    CallAgain,
}

/// The flattened, top-level error type returned by public engine operations.
#[derive(Debug, Snafu)]
#[snafu(context(false))]
pub enum Error {
    #[snafu(display("{source}"))]
    Alloc { source: AllocError },

    #[snafu(display("{source}"))]
    BlockIo { source: BlockIoError },

    #[snafu(display("{source}"))]
    Strings { source: StringStoreError },

    #[snafu(display("{source}"))]
    Header { source: HeaderError },

    #[snafu(display("{source}"))]
    Index { source: IndexError },

    #[snafu(display("{source}"))]
    Codec { source: CodecError },

    #[snafu(display("{source}"))]
    Channel { source: ChannelError },

    /// The process could not allocate memory for an internal buffer.
    #[snafu(display("out of memory"))]
    NoMemory,

    /// The file does not exist, or could not be opened.
    #[snafu(display("file not found or could not be opened: {source}"))]
    NoFile { source: io::Error },

    /// The caller does not have permission to open the file in the requested mode.
    #[snafu(display("access denied opening file: {source}"))]
    NoAccess { source: io::Error },
}

/// The closed, fixed error vocabulary from the on-disk format's historical interface, for
/// callers that need the legacy numeric contract (`Ok = 0`, all others negative) rather than
/// matching on [`Error`]'s rich enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    NoFile = -1,
    NoAccess = -2,
    NoMemory = -3,
    BadRead = -4,
    BadWrite = -5,
    NoChannel = -6,
    ChannelUsed = -7,
    ChannelType = -8,
    PastEof = -9,
    PastSof = -10,
    WrongFile = -11,
    NoExtra = -12,
    CorruptFile = -13,
    ReadOnly = -14,
    BadParam = -15,
    OverWrite = -16,
    MoreData = -17,
    NoBlock = -18,
    CallAgain = -19,
}

impl From<&Error> for Code {
    fn from(err: &Error) -> Self {
        match err {
            Error::Alloc { source: AllocError::NoBlock } => Code::NoBlock,
            Error::BlockIo { source: BlockIoError::BadRead { .. } } => Code::BadRead,
            Error::BlockIo { source: BlockIoError::BadWrite { .. } } => Code::BadWrite,
            Error::Strings { .. } => Code::CorruptFile,
            Error::Header {
                source: HeaderError::WrongFile,
            } => Code::WrongFile,
            Error::Header {
                source: HeaderError::CorruptFile { .. },
            } => Code::CorruptFile,
            Error::Header {
                source: HeaderError::ReadOnly,
            } => Code::ReadOnly,
            Error::Header {
                source: HeaderError::NoExtra,
            } => Code::NoExtra,
            Error::Index { source: IndexError::Full { .. } } => Code::BadParam,
            Error::Index {
                source: IndexError::CorruptNode { .. },
            } => Code::CorruptFile,
            Error::Codec { source: CodecError::OverWrite { .. } } => Code::OverWrite,
            Error::Codec { source: CodecError::PastEof { .. } } => Code::PastEof,
            Error::Codec { source: CodecError::PastSof { .. } } => Code::PastSof,
            Error::Codec { source: CodecError::BadParam { .. } } => Code::BadParam,
            Error::Channel { source: ChannelError::NoChannel { .. } } => Code::NoChannel,
            Error::Channel {
                source: ChannelError::ChannelUsed { .. },
            } => Code::ChannelUsed,
            Error::Channel {
                source: ChannelError::ChannelType { .. },
            } => Code::ChannelType,
            Error::Channel { source: ChannelError::CallAgain } => Code::CallAgain,
            Error::NoMemory => Code::NoMemory,
            Error::NoFile { .. } => Code::NoFile,
            Error::NoAccess { .. } => Code::NoAccess,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
