//! Container demuxing framework.
//!
//! A [`Demuxer`] parses one container format and hands out [`MediaChunk`]s —
//! coded units with sample-accurate timestamps — for the codec layer to
//! decode. Concrete demuxers compose the shared [`DemuxerCore`] for source
//! ownership, clock state and binary I/O helpers instead of inheriting from
//! a base class.
//!
//! Implemented containers: Ogg ([`ogg`]), native FLAC ([`flac`]), RIFF/WAVE
//! ([`riff`]), AIFF ([`aiff`]), ISO-BMFF/MP4 ([`mp4`]) and raw PCM
//! ([`raw`]).

pub mod aiff;
pub mod flac;
pub mod mp4;
pub mod ogg;
pub mod raw;
pub mod riff;

use std::{
    io::SeekFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use crate::{
    error::{Error, ErrorKind, Result},
    source::ByteSource,
    tag::{NullTag, StandardTag, Tag},
};

/// Sentinel timestamp for demuxers that cannot clock a chunk.
pub const TIMESTAMP_UNKNOWN: u64 = u64::MAX;

/// Elementary stream classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecType {
    /// Audio samples.
    Audio,
    /// Video frames. Parsed past, never decoded.
    Video,
    /// Subtitle data. Parsed past, never decoded.
    Subtitle,
}

impl CodecType {
    /// The lowercase token used in diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Subtitle => "subtitle",
        }
    }
}

/// One elementary stream inside a container.
///
/// Produced by [`Demuxer::parse_container`]; immutable for the demuxer's
/// lifetime. Accessors on the demuxer return clones, never borrows into
/// demuxer internals.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Unique id within the container.
    pub stream_id: u32,

    /// Stream classification.
    pub codec_type: CodecType,

    /// Lowercase codec token, e.g. `"vorbis"`, `"flac"`, `"pcm_s16le"`.
    pub codec_name: String,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count.
    pub channels: u16,

    /// Bits per sample of the coded data, 0 when not meaningful.
    pub bits_per_sample: u16,

    /// Total duration in milliseconds, 0 when unknown.
    pub duration_ms: u64,

    /// Total duration in samples, 0 when unknown.
    pub duration_samples: u64,

    /// Bitrate in bits per second, 0 when unknown.
    pub bitrate: u32,

    /// Opaque codec setup data: Vorbis identification header, OpusHead,
    /// FLAC STREAMINFO, AAC AudioSpecificConfig, ALAC magic cookie, or the
    /// raw `fmt ` chunk for ADPCM block layout.
    pub codec_private: Vec<u8>,

    /// Tags scoped to this stream.
    pub tags: StandardTag,
}

impl StreamInfo {
    /// A blank audio stream with the given id; fields are filled in by the
    /// demuxer as it parses.
    #[must_use]
    pub fn audio(stream_id: u32, codec_name: &str) -> Self {
        Self {
            stream_id,
            codec_type: CodecType::Audio,
            codec_name: codec_name.to_string(),
            sample_rate: 0,
            channels: 0,
            bits_per_sample: 0,
            duration_ms: 0,
            duration_samples: 0,
            bitrate: 0,
            codec_private: Vec::new(),
            tags: StandardTag::default(),
        }
    }
}

/// One coded unit handed from a demuxer to a codec.
///
/// An empty `data` signals end of stream for this read; valid chunks are
/// never empty.
#[derive(Clone, Debug)]
pub struct MediaChunk {
    /// Owning stream id.
    pub stream_id: u32,

    /// The coded bytes.
    pub data: Vec<u8>,

    /// Presentation timestamp in samples ([`TIMESTAMP_UNKNOWN`] when the
    /// demuxer cannot clock this chunk). For Ogg this is the page granule
    /// position; frame-based demuxers use the running sample count at the
    /// chunk start.
    pub timestamp_samples: u64,

    /// End timestamp in samples, when known.
    pub end_timestamp_samples: Option<u64>,

    /// Whether decode can restart from this chunk without prior context.
    pub is_keyframe: bool,
}

impl MediaChunk {
    /// The end-of-stream marker for `stream_id`.
    #[must_use]
    pub fn end_of_stream(stream_id: u32) -> Self {
        Self {
            stream_id,
            data: Vec::new(),
            timestamp_samples: TIMESTAMP_UNKNOWN,
            end_timestamp_samples: None,
            is_keyframe: false,
        }
    }

    /// Whether this chunk signals end of stream.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }
}

/// The empty tag returned by demuxers without metadata support.
pub static NULL_TAG: NullTag = NullTag;

/// Container demuxer contract.
///
/// `parse_container` must succeed before any other method is meaningful;
/// calling `read_chunk` first is API misuse and fails `InvalidState`.
/// Read-only methods (`duration_ms`, `position_ms`, `is_eof`, `streams`,
/// `tag`) are safe to call concurrently with an in-flight `read_chunk` on
/// another thread.
pub trait Demuxer: Send {
    /// Short lowercase name for diagnostics, e.g. `"ogg"`.
    fn name(&self) -> &'static str;

    /// Parses the container structure up to the first coded data.
    ///
    /// # Errors
    ///
    /// `BadMagic` when the signature is absent, `TruncatedHeader` /
    /// `CorruptFrame` for structural damage, `UnsupportedVariant` for
    /// recognised containers this build cannot serve.
    fn parse_container(&mut self) -> Result<()>;

    /// All streams found by `parse_container`.
    fn streams(&self) -> Vec<StreamInfo>;

    /// The stream with the given id, if present.
    fn stream_info(&self, stream_id: u32) -> Option<StreamInfo> {
        self.streams()
            .into_iter()
            .find(|info| info.stream_id == stream_id)
    }

    /// Reads the next chunk of the primary audio stream.
    ///
    /// # Errors
    ///
    /// `InvalidState` before `parse_container`; transport errors from the
    /// byte source; `CorruptFrame` in strict mode.
    fn read_chunk(&mut self) -> Result<MediaChunk>;

    /// Reads the next chunk of a specific stream.
    ///
    /// # Errors
    ///
    /// As [`Demuxer::read_chunk`], plus `InvalidArgument` for unknown ids.
    fn read_chunk_of(&mut self, stream_id: u32) -> Result<MediaChunk>;

    /// Seeks so the next chunk lands at or before `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` beyond the stream duration; transport errors.
    fn seek_to(&mut self, timestamp_ms: u64) -> Result<()>;

    /// Total duration in milliseconds, 0 when unknown.
    fn duration_ms(&self) -> u64;

    /// Current position in milliseconds.
    fn position_ms(&self) -> u64;

    /// Whether the primary stream is exhausted.
    fn is_eof(&self) -> bool;

    /// Container-level metadata.
    fn tag(&self) -> &dyn Tag {
        &NULL_TAG
    }

    /// The most recent recorded failure, if any; success does not clear
    /// it.
    fn last_error(&self) -> Option<(ErrorKind, String)> {
        None
    }

    /// Whether any failure has been recorded.
    fn has_error(&self) -> bool {
        self.last_error().is_some()
    }
}

/// Clock state shared by all demuxers.
#[derive(Clone, Copy, Debug, Default)]
struct Clock {
    position_ms: u64,
    duration_ms: u64,
}

/// Shared state and binary I/O helpers composed into every demuxer.
///
/// Owns the byte source exclusively. The clock sits under a small mutex so
/// position/duration reads are safe from any thread; EOF is atomic; the
/// error channel records the most recent failure without clearing it.
pub struct DemuxerCore {
    src: Box<dyn ByteSource>,
    clock: Mutex<Clock>,
    eof: AtomicBool,
    last_error: Mutex<Option<(ErrorKind, String)>>,
    parsed: AtomicBool,
    strict: bool,
}

impl DemuxerCore {
    /// Wraps a byte source.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, strict: bool) -> Self {
        Self {
            src,
            clock: Mutex::new(Clock::default()),
            eof: AtomicBool::new(false),
            last_error: Mutex::new(None),
            parsed: AtomicBool::new(false),
            strict,
        }
    }

    /// The owned byte source.
    #[must_use]
    pub fn src(&self) -> &dyn ByteSource {
        self.src.as_ref()
    }

    /// Whether recoverable corruption should be treated as fatal.
    #[must_use]
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Marks the container as parsed; gates the read path.
    pub fn set_parsed(&self) {
        self.parsed.store(true, Ordering::Release);
    }

    /// Fails `InvalidState` unless `parse_container` succeeded.
    ///
    /// # Errors
    ///
    /// `InvalidState` when called before a successful parse.
    pub fn ensure_parsed(&self, who: &str) -> Result<()> {
        if self.parsed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{who}: read before parse_container"
            )))
        }
    }

    /// Records an error in the channel and passes it through.
    pub fn record_error(&self, err: Error) -> Error {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some((err.kind, err.to_string()));
        }
        err
    }

    /// The most recent error, without clearing it.
    #[must_use]
    pub fn last_error(&self) -> Option<(ErrorKind, String)> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }

    /// Whether any error has been recorded.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.last_error
            .lock()
            .map(|last| last.is_some())
            .unwrap_or(false)
    }

    /// Clears the error channel.
    pub fn clear_error(&self) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = None;
        }
    }

    /// Current position in milliseconds.
    #[must_use]
    pub fn position_ms(&self) -> u64 {
        self.clock.lock().map(|clock| clock.position_ms).unwrap_or(0)
    }

    /// Total duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.clock.lock().map(|clock| clock.duration_ms).unwrap_or(0)
    }

    /// Updates the position clock.
    pub fn set_position_ms(&self, position_ms: u64) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.position_ms = position_ms;
        }
    }

    /// Updates the duration clock.
    pub fn set_duration_ms(&self, duration_ms: u64) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.duration_ms = duration_ms;
        }
    }

    /// Whether the primary stream is exhausted.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    /// Sets or clears the EOF flag.
    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::Release);
    }

    // --- binary I/O helpers ---------------------------------------------

    /// Reads exactly `len` bytes into a fresh buffer.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` when the stream ends mid-fill.
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.src.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u8(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.src.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a big-endian u16.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u16_be(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.src.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Reads a little-endian u16.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u16_le(&self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.src.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a big-endian u24 into a u32.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u24_be(&self) -> Result<u32> {
        let mut buf = [0u8; 3];
        self.src.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes([0, buf[0], buf[1], buf[2]]))
    }

    /// Reads a little-endian u24 into a u32.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u24_le(&self) -> Result<u32> {
        let mut buf = [0u8; 3];
        self.src.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], 0]))
    }

    /// Reads a big-endian u32.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u32_be(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.src.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Reads a little-endian u32.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u32_le(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.src.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a big-endian u64.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u64_be(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.src.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a little-endian u64.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_u64_le(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.src.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a four-byte identifier (FourCC).
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` at end of stream.
    pub fn read_fourcc(&self) -> Result<[u8; 4]> {
        let mut buf = [0u8; 4];
        self.src.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Skips forward by `len` bytes.
    ///
    /// # Errors
    ///
    /// Transport errors from the underlying seek.
    pub fn skip_bytes(&self, len: u64) -> Result<()> {
        let len = i64::try_from(len)
            .map_err(|_| Error::invalid_argument("skip length exceeds i64"))?;
        self.src.seek(SeekFrom::Current(len))?;
        Ok(())
    }

    /// Reads bytes until NUL or `max` bytes, lossily decoded.
    ///
    /// # Errors
    ///
    /// Transport errors from the underlying reads.
    pub fn read_null_terminated_string(&self, max: usize) -> Result<String> {
        let mut bytes = Vec::new();
        for _ in 0..max {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads a u32-LE length then that many bytes, lossily decoded.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the declared length exceeds `max`;
    /// `TruncatedHeader` at end of stream.
    pub fn read_length_prefixed_string(&self, max: usize) -> Result<String> {
        let len = self.read_u32_le()? as usize;
        if len > max {
            return Err(Error::invalid_argument(format!(
                "string length {len} exceeds limit {max}"
            )));
        }
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
