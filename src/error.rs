//! Error handling for phono.
//!
//! Provides a unified error handling system for the demux/decode pipeline,
//! with mapping from underlying I/O, network and decoder errors to the
//! pipeline's error taxonomy.
//!
//! # Error Categories
//!
//! Errors fall into four broad groups:
//! * Transport: I/O, network timeouts, protocol violations, cancellation
//! * Container: bad magic, truncated headers, corrupt frames
//! * Codec: bad setup headers, undecodable frames, unsupported configurations
//! * Resource: memory denial, invalid state, stalled pipelines
//!
//! # Example
//!
//! ```rust
//! use phono::error::{Error, ErrorKind, Result};
//!
//! fn parse_marker(marker: &[u8]) -> Result<()> {
//!     if marker != b"OggS" {
//!         return Err(Error::bad_magic("expected Ogg capture pattern"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Allows accessing the original error when its concrete type is known.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns `true` if this error represents a condition a pull loop may
    /// skip over (a single corrupt frame or page).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::CorruptFrame
    }
}

/// Standard result type for phono operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for the demux/decode pipeline.
///
/// Each variant represents a distinct failure category with a standard
/// message; the boxed detail carries the layer context (demuxer name,
/// stream id, byte offset).
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Cooperative cancellation was observed mid-operation.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Operation on a closed byte source.
    #[error("Source is closed")]
    Closed,

    /// Generic read/seek failure.
    #[error("I/O error")]
    Io,

    /// Argument failed validation.
    #[error("Invalid argument specified")]
    InvalidArgument,

    /// API misuse, e.g. reading chunks before parsing the container.
    #[error("Invalid state")]
    InvalidState,

    /// URI did not resolve to a readable resource.
    #[error("Not found")]
    NotFound,

    /// The operating system refused access.
    #[error("Permission denied")]
    PermissionDenied,

    /// The server cannot satisfy the requested byte range.
    #[error("Range not satisfiable")]
    RangeNotSatisfiable,

    /// An HTTP request exceeded its time budget.
    #[error("Network timeout")]
    NetworkTimeout,

    /// The remote peer violated the HTTP protocol.
    #[error("Network protocol error")]
    NetworkProtocol,

    /// The memory governor denied an allocation.
    #[error("Out of memory")]
    OutOfMemory,

    /// No container signature matched.
    #[error("Bad magic bytes")]
    BadMagic,

    /// A declared header length exceeds the file.
    #[error("Truncated header")]
    TruncatedHeader,

    /// Recognised container, but an unsupported codec or configuration.
    #[error("Unsupported variant")]
    UnsupportedVariant,

    /// No demuxer claims the stream at all.
    #[error("Unsupported format")]
    UnsupportedFormat,

    /// A single frame or page is corrupt.
    #[error("Corrupt frame")]
    CorruptFrame,

    /// Codec-specific setup data is invalid.
    #[error("Bad codec header")]
    BadHeader,

    /// A compressed frame could not be decoded.
    #[error("Bad frame")]
    BadFrame,

    /// The codec cannot be configured for this stream.
    #[error("Unsupported configuration")]
    UnsupportedConfiguration,

    /// A pull loop made no progress across its retry bound.
    #[error("Stall detected")]
    StallDetected,
}

macro_rules! error_constructor {
    ($(#[$meta:meta])* $name:ident, $kind:ident) => {
        $(#[$meta])*
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self {
                kind: ErrorKind::$kind,
                error: error.into(),
            }
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    error_constructor!(
        /// Creates an error for cooperatively cancelled operations.
        cancelled,
        Cancelled
    );

    error_constructor!(
        /// Creates an error for operations on a closed source.
        closed,
        Closed
    );

    error_constructor!(
        /// Creates an error for generic read/seek failures.
        io,
        Io
    );

    error_constructor!(
        /// Creates an error for invalid arguments.
        invalid_argument,
        InvalidArgument
    );

    error_constructor!(
        /// Creates an error for API misuse.
        ///
        /// Use when a call sequence violates the component contract, such as
        /// `read_chunk` before `parse_container`.
        invalid_state,
        InvalidState
    );

    error_constructor!(
        /// Creates an error for unresolvable URIs and missing files.
        not_found,
        NotFound
    );

    error_constructor!(
        /// Creates an error for OS-level access refusal.
        permission_denied,
        PermissionDenied
    );

    error_constructor!(
        /// Creates an error for unsatisfiable HTTP byte ranges.
        range_not_satisfiable,
        RangeNotSatisfiable
    );

    error_constructor!(
        /// Creates an error for HTTP requests that exceeded their budget.
        ///
        /// The HTTP source retries these with exponential backoff before
        /// surfacing them.
        network_timeout,
        NetworkTimeout
    );

    error_constructor!(
        /// Creates an error for malformed HTTP exchanges.
        network_protocol,
        NetworkProtocol
    );

    error_constructor!(
        /// Creates an error for denied allocations.
        ///
        /// Fatal for the current operation; the caller may retry after
        /// pressure relief.
        out_of_memory,
        OutOfMemory
    );

    error_constructor!(
        /// Creates an error for absent container signatures.
        bad_magic,
        BadMagic
    );

    error_constructor!(
        /// Creates an error for headers whose declared length exceeds the file.
        truncated_header,
        TruncatedHeader
    );

    error_constructor!(
        /// Creates an error for recognised containers with unsupported
        /// codecs or configurations. The message should name the codec.
        unsupported_variant,
        UnsupportedVariant
    );

    error_constructor!(
        /// Creates an error for streams no demuxer claims.
        unsupported_format,
        UnsupportedFormat
    );

    error_constructor!(
        /// Creates an error for a single corrupt frame or page.
        ///
        /// Recoverable: demuxers skip and count these unless `strict_mode`
        /// is set.
        corrupt_frame,
        CorruptFrame
    );

    error_constructor!(
        /// Creates an error for invalid codec setup data.
        bad_header,
        BadHeader
    );

    error_constructor!(
        /// Creates an error for undecodable compressed frames.
        bad_frame,
        BadFrame
    );

    error_constructor!(
        /// Creates an error for codec configurations this build cannot decode.
        unsupported_configuration,
        UnsupportedConfiguration
    );

    error_constructor!(
        /// Creates an error for pull loops that made no progress.
        stall_detected,
        StallDetected
    );
}

impl std::error::Error for Error {
    /// Returns the underlying error source.
    ///
    /// This allows error chains to be examined for root causes.
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    /// Formats the error for display, showing both kind and details.
    ///
    /// Format: "{kind}: {details}"
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    /// Converts IO errors into appropriate error kinds.
    ///
    /// Maps standard IO errors to their logical equivalents:
    /// * `NotFound` -> `NotFound`
    /// * `PermissionDenied` -> `PermissionDenied`
    /// * `TimedOut` -> `NetworkTimeout`
    /// * etc.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::truncated_header(err),
            TimedOut => Self::network_timeout(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::io(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    /// Converts HTTP client errors into appropriate error kinds.
    ///
    /// Maps HTTP errors based on their nature:
    /// * Timeout errors -> `NetworkTimeout`
    /// * Connect/redirect/status/decode errors -> `NetworkProtocol`
    /// * Everything else -> `Io`
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::network_timeout(err);
        }

        if err.is_connect() || err.is_redirect() || err.is_status() || err.is_decode() {
            return Self::network_protocol(err);
        }

        Self::io(err)
    }
}

impl From<url::ParseError> for Error {
    /// Converts URL parsing errors to `InvalidArgument`.
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    /// Converts mutex poisoning errors to `InvalidState`.
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::invalid_state(e.to_string())
    }
}

impl From<lewton::VorbisError> for Error {
    /// Converts Vorbis decoder errors into appropriate error kinds.
    ///
    /// Header errors are fatal setup failures; audio read errors are
    /// frame-level and recoverable.
    fn from(e: lewton::VorbisError) -> Self {
        use lewton::VorbisError::*;
        match e {
            BadHeader(e) => Self::bad_header(e),
            BadAudio(e) => Self::corrupt_frame(e),
            OggError(e) => Self::corrupt_frame(e),
        }
    }
}

impl From<audiopus::Error> for Error {
    /// Converts Opus decoder errors to `CorruptFrame`.
    ///
    /// Setup failures are wrapped as `BadHeader` explicitly at the call
    /// site; every other libopus error surfaces during packet decode.
    fn from(e: audiopus::Error) -> Self {
        Self::corrupt_frame(e.to_string())
    }
}

impl From<symphonia::core::errors::Error> for Error {
    /// Converts symphonia decoder errors into appropriate error kinds.
    ///
    /// * `DecodeError` -> `CorruptFrame` (skippable)
    /// * `IoError` -> mapped through the IO conversion
    /// * `Unsupported`/`ResetRequired` -> `UnsupportedVariant`
    /// * `LimitError` -> `OutOfMemory`
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match e {
            DecodeError(e) => Self::corrupt_frame(e),
            IoError(e) => e.into(),
            LimitError(e) => Self::out_of_memory(e),
            SeekError(_) => Self::invalid_argument(e.to_string()),
            Unsupported(e) => Self::unsupported_variant(e),
            ResetRequired => Self::unsupported_variant("decoder reset required"),
        }
    }
}
