//! Seekable byte streams feeding the demuxers.
//!
//! A [`ByteSource`] is the pipeline's only window onto bytes: local files
//! ([`FileByteSource`]) and HTTP resources ([`HttpByteSource`]) present one
//! uniform, seekable contract. Sources are memory-accounted through the
//! [`crate::pool::MemoryGovernor`] under a single attribution tag per live
//! handle.
//!
//! # Concurrency
//!
//! Each source is single-owner: one thread drives `read`/`seek`. Internal
//! mutexes make every individual call atomic, and the read-only accessors
//! (`tell`, `size`, `is_eof`, `last_error`) may be called concurrently from
//! any thread without blocking behind in-flight I/O. The source does not
//! promise that a position observed via `tell` survives a concurrent seek;
//! interleaving correctness belongs to the caller.
//!
//! # Cancellation
//!
//! Sources accept a [`CancelToken`](crate::config::CancelToken). On
//! cancellation mid-read a short read is returned and `last_error` reports
//! `Cancelled`. Cancellation is cooperative; nothing is preempted.

pub mod file;
pub mod http;

pub use file::FileByteSource;
pub use http::HttpByteSource;

use std::io::SeekFrom;

use crate::error::{ErrorKind, Result};

/// Uniform seekable byte stream.
///
/// All operations are serialised per instance. Reading past the end returns
/// a short or zero-length read, never an error. After a successful
/// `seek(SeekFrom::Start(p))`, `tell()` returns `p`.
pub trait ByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes at the current position.
    ///
    /// Returns the number of bytes read; `0` at end of stream, on a closed
    /// source, or when cancelled (with `last_error` set accordingly).
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures; end of stream is not an
    /// error.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Repositions the stream.
    ///
    /// # Errors
    ///
    /// Returns `Closed` on a closed source, `InvalidArgument` for
    /// positions that cannot be represented, and transport errors for
    /// sources that must re-request data to honour the seek.
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    /// Returns the current position.
    fn tell(&self) -> u64;

    /// Returns the total size in bytes, if known.
    fn size(&self) -> Option<u64>;

    /// Returns whether the last read hit end of stream.
    fn is_eof(&self) -> bool;

    /// Closes the source. Subsequent operations fail with `Closed`.
    ///
    /// # Errors
    ///
    /// Returns any error from releasing the underlying resource; closing
    /// an already-closed source is a no-op.
    fn close(&self) -> Result<()>;

    /// Returns the most recent non-ok condition without clearing it.
    fn last_error(&self) -> Option<ErrorKind>;

    /// MIME type of the resource, when the transport knows it.
    fn content_type(&self) -> Option<String> {
        None
    }

    /// Path or URL hint for extension-based probing, when available.
    fn path_hint(&self) -> Option<String> {
        None
    }

    /// Reads exactly `buf.len()` bytes or fails.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedHeader` when the stream ends mid-fill, plus any
    /// transport error from `read`.
    fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(crate::error::Error::truncated_header(format!(
                    "stream ended after {filled} of {} bytes",
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }
}
