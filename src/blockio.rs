//! Raw block I/O: read/write fixed-length buffers at byte offsets against a random-access file
//! handle, retrying transient (network-class) errors.
//!
//! Which OS errors count as "transient" is platform-specific, so it is exposed as a policy
//! parameter ([`is_retryable`]) rather than hardcoded; the default treats `Interrupted` and
//! `WouldBlock` as retryable, which covers the common case of a local filesystem and gives a
//! network filesystem implementation a seam to widen.

use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::warn;

use crate::error::{BadReadSnafu, BadWriteSnafu, BlockIoError};

/// Number of attempts made before a transient error is surfaced to the caller.
pub const MAX_RETRIES: u32 = 100;

/// Returns true if `err` belongs to a class of error considered transient and worth retrying.
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Thin wrapper around a file handle providing the engine's two I/O primitives.
///
/// `lock` stands in for the file mutex of the concurrency model (§5): `read_at`/`write_at` never
/// race on a shared cursor, so it carries no data and isn't required for memory safety, but every
/// transfer still takes it so the file handle behaves as the single serialized resource the rest
/// of the engine's lock ordering assumes.
#[derive(Debug)]
pub struct BlockIo {
    file: File,
    lock: Mutex<()>,
}

impl BlockIo {
    pub fn new(file: File) -> Self {
        BlockIo { file, lock: Mutex::new(()) }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`, retrying transient errors up to
    /// [`MAX_RETRIES`] times with a short exponential backoff.
    #[cfg_attr(test, tracing::instrument(level = "trace", skip(self, buf)))]
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<(), BlockIoError> {
        let _guard = self.lock.lock();
        let mut attempts = 0;
        loop {
            match self.read_at(buf, offset) {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable(&e) && attempts < MAX_RETRIES => {
                    attempts += 1;
                    warn!(offset, attempts, "retrying transient read error: {e}");
                    backoff(attempts);
                }
                Err(source) => {
                    return Err(source).context(BadReadSnafu { offset, len: buf.len() });
                }
            }
        }
    }

    /// Writes all of `buf` starting at `offset`, retrying transient errors up to
    /// [`MAX_RETRIES`] times with a short exponential backoff.
    #[cfg_attr(test, tracing::instrument(level = "trace", skip(self, buf)))]
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<(), BlockIoError> {
        let _guard = self.lock.lock();
        let mut attempts = 0;
        loop {
            match self.write_at(buf, offset) {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable(&e) && attempts < MAX_RETRIES => {
                    attempts += 1;
                    warn!(offset, attempts, "retrying transient write error: {e}");
                    backoff(attempts);
                }
                Err(source) => {
                    return Err(source).context(BadWriteSnafu { offset, len: buf.len() });
                }
            }
        }
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Short exponential backoff capped at 10ms, so `MAX_RETRIES` consecutive transient errors can't
/// stall a caller for more than a couple hundred milliseconds in total.
fn backoff(attempts: u32) {
    let millis = 1u64 << attempts.min(4);
    std::thread::sleep(Duration::from_millis(millis.min(10)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let file = tmp.reopen().unwrap();
        let io = BlockIo::new(file);
        let data = b"hello tickstore";
        io.write(data, 4096).unwrap();
        let mut buf = vec![0u8; data.len()];
        io.read(&mut buf, 4096).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn retryable_classifier() {
        let e = io::Error::from(io::ErrorKind::Interrupted);
        assert!(is_retryable(&e));
        let e = io::Error::from(io::ErrorKind::NotFound);
        assert!(!is_retryable(&e));
    }
}
