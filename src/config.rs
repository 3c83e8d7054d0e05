//! Per-stream configuration for phono.
//!
//! This module defines the knobs a caller can set when opening a stream:
//! * Format selection overrides (`prefer_format_id`, `mime_hint`)
//! * Memory and network budgets
//! * FLAC integrity checking
//! * Corruption policy (`strict_mode`)
//! * Raw-PCM stream parameters
//!
//! All settings have defaults suitable for local file playback; network
//! sources usually want an explicit [`OpenOptions::network_timeout_ms`].
//!
//! # Examples
//!
//! ```rust
//! use phono::config::OpenOptions;
//!
//! let options = OpenOptions {
//!     mime_hint: Some("audio/ogg".to_string()),
//!     strict_mode: false,
//!     ..OpenOptions::default()
//! };
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Default per-request budget for HTTP operations.
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;

/// Default cap on per-stream buffer growth.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 16 * 1024 * 1024;

/// Cooperative cancellation handle.
///
/// Cloneable; all clones observe the same flag. A source checks the flag at
/// operation boundaries and mid-read, returning a short read with
/// `Cancelled` recorded as the last error. There is no preemption of
/// in-progress decodes.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a new, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Irrevocable for this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Sample parameters for streams without any container structure.
///
/// Used by the raw-PCM demuxer when the extension alone decides the format.
/// The extension provides defaults; any field here overrides them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawParams {
    /// Channel count.
    pub channels: u16,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Bits per sample of the stored data.
    pub bits_per_sample: u16,

    /// Codec token, e.g. `"pcm_s16le"`, `"ulaw"`, `"alaw"`.
    pub codec: RawCodec,
}

/// Encodings the raw-PCM demuxer can label a stream with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawCodec {
    /// Signed little-endian linear PCM at `bits_per_sample` depth.
    SignedLe,
    /// Signed big-endian linear PCM at `bits_per_sample` depth.
    SignedBe,
    /// G.711 µ-law, 8 bits stored.
    Ulaw,
    /// G.711 A-law, 8 bits stored.
    Alaw,
}

impl Default for RawParams {
    /// Raw defaults: CD-style stereo s16le at 44.1 kHz.
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            codec: RawCodec::SignedLe,
        }
    }
}

/// Options for opening a single stream through the factory.
///
/// Passed to `MediaFactory::open` and threaded through to the byte source,
/// demuxer and codec that the open resolves to.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    /// Overrides auto-detection with a specific registered format.
    ///
    /// When set, probing is skipped and the named demuxer is constructed
    /// directly; `BadMagic` from its `parse_container` is then fatal.
    pub prefer_format_id: Option<String>,

    /// MIME type hint for byte-only sources.
    ///
    /// Consulted when magic-byte probing fails, before extension fallback.
    /// HTTP sources fill this from `Content-Type` when the caller does not.
    pub mime_hint: Option<String>,

    /// Cap on per-stream buffer growth, in bytes.
    ///
    /// `None` applies [`DEFAULT_MAX_MEMORY_BYTES`]. Exceeding the cap
    /// surfaces `OutOfMemory` on the allocating operation.
    pub max_memory_bytes: Option<usize>,

    /// Per-request budget for HTTP operations, in milliseconds.
    ///
    /// `None` applies [`DEFAULT_NETWORK_TIMEOUT_MS`]. Timed-out requests
    /// are retried with exponential backoff before failing.
    pub network_timeout_ms: Option<u64>,

    /// Enables FLAC whole-stream MD5 verification.
    ///
    /// Off by default; when on, the FLAC codec accumulates decoded audio
    /// and compares against the STREAMINFO signature at end of stream.
    pub enable_md5_check: bool,

    /// Treats recoverable corruption as fatal.
    ///
    /// With this set, a demuxer surfaces the first `CorruptFrame` instead
    /// of skipping it.
    pub strict_mode: bool,

    /// Parameters for containerless streams.
    pub raw_params: Option<RawParams>,

    /// Cancellation handle shared with the byte source.
    pub cancel: Option<CancelToken>,
}

impl OpenOptions {
    /// Effective network timeout, applying the default.
    #[must_use]
    pub fn network_timeout_ms_or_default(&self) -> u64 {
        self.network_timeout_ms.unwrap_or(DEFAULT_NETWORK_TIMEOUT_MS)
    }

    /// Effective memory cap, applying the default.
    #[must_use]
    pub fn max_memory_bytes_or_default(&self) -> usize {
        self.max_memory_bytes.unwrap_or(DEFAULT_MAX_MEMORY_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_clones_share_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn defaults_apply() {
        let options = OpenOptions::default();
        assert_eq!(
            options.network_timeout_ms_or_default(),
            DEFAULT_NETWORK_TIMEOUT_MS
        );
        assert_eq!(
            options.max_memory_bytes_or_default(),
            DEFAULT_MAX_MEMORY_BYTES
        );
        assert!(!options.enable_md5_check);
        assert!(!options.strict_mode);
    }
}
