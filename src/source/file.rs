//! Local file byte source.
//!
//! Wraps a `std::fs::File` behind the [`ByteSource`] contract with 64-bit
//! offsets on every platform and path normalisation that accepts both
//! separator conventions.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

use crate::{
    config::CancelToken,
    error::{Error, ErrorKind, Result},
    source::ByteSource,
};

/// Seekable byte source over a local file.
///
/// Single-owner; internal locking makes individual operations atomic. On a
/// closed handle every operation fails with `Closed` and `read` returns 0.
#[derive(Debug)]
pub struct FileByteSource {
    /// The open handle, `None` once closed.
    io: Mutex<Option<File>>,

    /// Mirror of the handle's position for lock-free `tell`.
    position: AtomicU64,

    /// File length at open time.
    size: u64,

    /// Whether the last read returned no bytes at end of file.
    eof: AtomicBool,

    /// Most recent non-ok condition; never cleared by success.
    last_error: Mutex<Option<ErrorKind>>,

    /// Cooperative cancellation flag.
    cancel: CancelToken,

    /// Normalised path, kept for extension probing.
    path: PathBuf,
}

/// Accepts both `\` and `/` as separators regardless of host platform.
fn normalise_path(path: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(path)
    } else {
        PathBuf::from(path.replace('\\', "/"))
    }
}

impl FileByteSource {
    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `PermissionDenied` per the underlying OS
    /// error, `Io` otherwise.
    pub fn open(path: &str, cancel: CancelToken) -> Result<Self> {
        let path = normalise_path(path);
        let file = File::open(&path).map_err(|err| {
            Error::new(
                Error::from(std::io::Error::from(err.kind())).kind,
                format!("{}: {err}", path.display()),
            )
        })?;
        let size = file
            .metadata()
            .map_err(|err| Error::io(format!("{}: {err}", path.display())))?
            .len();

        Ok(Self {
            io: Mutex::new(Some(file)),
            position: AtomicU64::new(0),
            size,
            eof: AtomicBool::new(false),
            last_error: Mutex::new(None),
            cancel,
            path,
        })
    }

    /// The normalised path this source was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_error(&self, kind: ErrorKind) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(kind);
        }
    }
}

impl ByteSource for FileByteSource {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.cancel.is_cancelled() {
            self.set_error(ErrorKind::Cancelled);
            return Ok(0);
        }

        let mut guard = self.io.lock()?;
        let Some(file) = guard.as_mut() else {
            self.set_error(ErrorKind::Closed);
            return Ok(0);
        };

        match file.read(buf) {
            Ok(0) => {
                self.eof.store(true, Ordering::Release);
                Ok(0)
            }
            Ok(n) => {
                self.position.fetch_add(n as u64, Ordering::AcqRel);
                Ok(n)
            }
            Err(err) => {
                let err = Error::from(err);
                self.set_error(err.kind);
                Err(err)
            }
        }
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut guard = self.io.lock()?;
        let Some(file) = guard.as_mut() else {
            self.set_error(ErrorKind::Closed);
            return Err(Error::closed("seek on closed file source"));
        };

        match file.seek(pos) {
            Ok(new_position) => {
                self.position.store(new_position, Ordering::Release);
                self.eof.store(false, Ordering::Release);
                Ok(new_position)
            }
            Err(err) => {
                let err = Error::from(err);
                self.set_error(err.kind);
                Err(err)
            }
        }
    }

    #[inline]
    fn tell(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    #[inline]
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    #[inline]
    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.io.lock()?;
        *guard = None;
        Ok(())
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.lock().ok().and_then(|last| *last)
    }

    fn path_hint(&self) -> Option<String> {
        Some(self.path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        file
    }

    #[test]
    fn read_seek_tell_roundtrip() {
        let file = fixture(b"abcdefgh");
        let source = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open");

        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.tell(), 4);

        source.seek(SeekFrom::Start(2)).expect("seek");
        assert_eq!(source.tell(), 2);
        assert_eq!(source.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf, b"cdef");
        assert_eq!(source.size(), Some(8));
    }

    #[test]
    fn read_past_end_is_short_not_error() {
        let file = fixture(b"xy");
        let source = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open");

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).expect("read"), 2);
        assert_eq!(source.read(&mut buf).expect("read"), 0);
        assert!(source.is_eof());
        assert!(source.last_error().is_none());
    }

    #[test]
    fn closed_handle_reads_zero_and_reports_closed() {
        let file = fixture(b"data");
        let source = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open");

        source.close().expect("close");
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).expect("read"), 0);
        assert_eq!(source.last_error(), Some(ErrorKind::Closed));
        assert!(source.seek(SeekFrom::Start(0)).is_err());
    }

    #[test]
    fn cancellation_returns_short_read() {
        let file = fixture(b"data");
        let cancel = CancelToken::new();
        let source = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            cancel.clone(),
        )
        .expect("open");

        cancel.cancel();
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).expect("read"), 0);
        assert_eq!(source.last_error(), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = FileByteSource::open("/nonexistent/phono-test", CancelToken::new())
            .expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
