//! The demuxer/codec binding: a seekable PCM stream.
//!
//! [`DemuxedStream`] owns one demuxer and one codec and exposes the
//! pull-driven PCM surface the audio sink consumes: `next_frame` until an
//! empty frame with `is_eof()`, with `seek_to_ms` in between. Stream
//! selection picks the first audio stream, preferring the highest bitrate
//! when the container carries several.
//!
//! A corrupt-frame loop (codec emitting empty frames chunk after chunk) is
//! bounded per call and surfaced as `StallDetected` instead of spinning.

use crate::{
    codec::{AudioFrame, Codec, CodecStats},
    config::OpenOptions,
    demux::{Demuxer, StreamInfo},
    error::{Error, ErrorKind, Result},
    pool::MemoryGovernor,
    registry::FormatRegistry,
    source::ByteSource,
    tag::Tag,
};

/// Chunk pulls attempted per `next_frame` before declaring a stall.
const MAX_PULL_ATTEMPTS: u32 = 64;

/// Aggregate pipeline statistics.
#[derive(Clone, Debug)]
pub struct StreamStats {
    /// Decode counters from the codec.
    pub codec: CodecStats,
    /// Current position in milliseconds.
    pub position_ms: u64,
    /// Total duration in milliseconds, 0 when unknown.
    pub duration_ms: u64,
    /// Process-wide bytes held by the memory governor.
    pub memory_bytes: usize,
}

/// One demuxer stream bound to its codec, producing PCM frames.
pub struct DemuxedStream {
    demuxer: Box<dyn Demuxer>,
    codec: Box<dyn Codec>,
    info: StreamInfo,
    /// Samples per channel still to discard after a seek (codec warm-up).
    discard_remaining: u64,
    flushed: bool,
    eof: bool,
}

impl std::fmt::Debug for DemuxedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxedStream")
            .field("demuxer", &self.demuxer.name())
            .field("codec", &self.codec.codec_name())
            .field("info", &self.info)
            .field("discard_remaining", &self.discard_remaining)
            .field("flushed", &self.flushed)
            .field("eof", &self.eof)
            .finish()
    }
}

/// First audio stream, preferring the highest bitrate on ties of "first".
fn pick_stream(streams: &[StreamInfo]) -> Result<StreamInfo> {
    let mut best: Option<&StreamInfo> = None;
    for stream in streams {
        match best {
            None => best = Some(stream),
            Some(current) if stream.bitrate > current.bitrate => best = Some(stream),
            Some(_) => {}
        }
    }
    best.cloned()
        .ok_or_else(|| Error::unsupported_variant("container has no audio stream"))
}

impl DemuxedStream {
    /// Opens a stream with auto-detection over the given source.
    ///
    /// Probe order: magic bytes, then the MIME hint, then the path
    /// extension. For multi-candidate retry semantics use
    /// [`MediaFactory`](crate::factory::MediaFactory), which can re-open
    /// the source.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` when nothing claims the stream; parse and
    /// codec initialisation errors pass through.
    pub fn open(src: Box<dyn ByteSource>, options: &OpenOptions) -> Result<Self> {
        let registry = FormatRegistry::global();
        let path_hint = src.path_hint();
        let mime_hint = options.mime_hint.clone().or_else(|| src.content_type());

        let format_id = match &options.prefer_format_id {
            Some(id) => Some(id.clone()),
            None => registry
                .probe(src.as_ref(), None)?
                .or_else(|| mime_hint.as_deref().and_then(|mime| registry.format_for_mime(mime)))
                .or_else(|| {
                    path_hint
                        .as_deref()
                        .and_then(|path| registry.format_for_extension(path))
                }),
        };
        let format_id = format_id.ok_or_else(|| {
            Error::unsupported_format("no magic, MIME or extension match for stream")
        })?;

        Self::open_with_format(src, &format_id, options)
    }

    /// Opens a stream with a known format id, skipping probing.
    ///
    /// # Errors
    ///
    /// As [`DemuxedStream::open`]; additionally `BadMagic` when the named
    /// demuxer rejects the stream.
    pub fn open_with_format(
        src: Box<dyn ByteSource>,
        format_id: &str,
        options: &OpenOptions,
    ) -> Result<Self> {
        let registry = FormatRegistry::global();
        let mut demuxer = registry.make_demuxer(format_id, src, options)?;
        demuxer.parse_container()?;

        let info = pick_stream(&demuxer.streams())?;
        let mut codec = registry.make_codec(&info, options)?;
        codec.initialise()?;

        debug!(
            "stream open: {} / {} ({} Hz, {} ch, {} ms)",
            format_id, info.codec_name, info.sample_rate, info.channels, info.duration_ms
        );

        Ok(Self {
            demuxer,
            codec,
            info,
            discard_remaining: 0,
            flushed: false,
            eof: false,
        })
    }

    /// Pulls chunks until the codec produces a non-empty frame, end of
    /// stream, or the stall bound.
    ///
    /// At end of stream the codec is flushed once; after that, empty
    /// frames with [`DemuxedStream::is_eof`] true.
    ///
    /// # Errors
    ///
    /// `StallDetected` after [`MAX_PULL_ATTEMPTS`] without progress;
    /// demuxer and codec hard errors pass through.
    pub fn next_frame(&mut self) -> Result<AudioFrame> {
        if self.eof {
            return Ok(AudioFrame::empty());
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > MAX_PULL_ATTEMPTS {
                return Err(Error::stall_detected(format!(
                    "no decodable frame in {MAX_PULL_ATTEMPTS} chunks of {}",
                    self.info.codec_name
                )));
            }

            let chunk = match self.demuxer.read_chunk_of(self.info.stream_id) {
                Ok(chunk) => chunk,
                Err(err) if err.is_recoverable() => {
                    debug!("skipping corrupt chunk: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if chunk.is_end_of_stream() {
                if !self.flushed {
                    self.flushed = true;
                    let frame = self.codec.flush()?;
                    if !frame.is_empty() {
                        return Ok(self.apply_discard(frame));
                    }
                }
                self.eof = true;
                return Ok(AudioFrame::empty());
            }

            let frame = self.codec.decode(&chunk)?;
            if frame.is_empty() {
                continue;
            }

            let frame = self.apply_discard(frame);
            if frame.is_empty() {
                continue;
            }
            return Ok(frame);
        }
    }

    /// Trims the post-seek warm-up prefix off a frame.
    fn apply_discard(&mut self, mut frame: AudioFrame) -> AudioFrame {
        if frame.warmup_samples > 0 {
            self.discard_remaining += u64::from(frame.warmup_samples);
            frame.warmup_samples = 0;
        }
        if self.discard_remaining == 0 {
            return frame;
        }

        let discard = self.discard_remaining.min(frame.sample_count as u64) as usize;
        frame.samples.drain(..discard * usize::from(frame.channels.max(1)));
        frame.sample_count -= discard;
        frame.pts += discard as u64;
        self.discard_remaining -= discard as u64;
        frame
    }

    /// Seeks to the given position.
    ///
    /// The demuxer repositions, the codec resets (when it supports seek
    /// reset), and any warm-up prefix the codec reports on its next frame
    /// is discarded before samples reach the caller.
    ///
    /// # Errors
    ///
    /// Demuxer seek errors pass through.
    pub fn seek_to_ms(&mut self, timestamp_ms: u64) -> Result<()> {
        self.demuxer.seek_to(timestamp_ms)?;
        if self.codec.supports_seek_reset() {
            self.codec.reset();
        }
        self.discard_remaining = 0;
        self.flushed = false;
        self.eof = false;
        Ok(())
    }

    /// Total duration in milliseconds, 0 when unknown.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.demuxer.duration_ms()
    }

    /// Current position in milliseconds.
    #[must_use]
    pub fn position_ms(&self) -> u64 {
        self.demuxer.position_ms()
    }

    /// Whether the stream is exhausted.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Container-level metadata.
    #[must_use]
    pub fn tag(&self) -> &dyn Tag {
        self.demuxer.tag()
    }

    /// The selected stream's description.
    #[must_use]
    pub fn stream_info(&self) -> StreamInfo {
        self.info.clone()
    }

    /// Aggregate codec, clock and memory statistics.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            codec: self.codec.stats(),
            position_ms: self.position_ms(),
            duration_ms: self.duration_ms(),
            memory_bytes: MemoryGovernor::global().stats().current_bytes,
        }
    }

    /// The demuxer's most recent recorded failure, if any. Exposed for
    /// diagnostics surfaces; success does not clear it.
    #[must_use]
    pub fn last_error(&self) -> Option<(ErrorKind, String)> {
        self.demuxer.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_stream_prefers_highest_bitrate() {
        let mut low = StreamInfo::audio(0, "aac");
        low.bitrate = 96_000;
        let mut high = StreamInfo::audio(1, "aac");
        high.bitrate = 256_000;

        let picked = pick_stream(&[low, high]).expect("pick");
        assert_eq!(picked.stream_id, 1);
    }

    #[test]
    fn pick_stream_takes_first_on_tie() {
        let first = StreamInfo::audio(0, "vorbis");
        let second = StreamInfo::audio(1, "vorbis");
        let picked = pick_stream(&[first, second]).expect("pick");
        assert_eq!(picked.stream_id, 0);
    }

    #[test]
    fn pick_stream_fails_on_empty() {
        let err = pick_stream(&[]).expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::UnsupportedVariant);
    }
}
