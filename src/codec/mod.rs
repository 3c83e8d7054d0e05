//! Codec framework: compressed chunks in, PCM frames out.
//!
//! A [`Codec`] consumes [`MediaChunk`](crate::demux::MediaChunk)s from a
//! demuxer and produces interleaved signed 16-bit [`AudioFrame`]s. Codecs
//! that decode in float (Vorbis, Opus gain application) downconvert at the
//! edge with TPDF dither; higher-depth integer sources are reduced to 16
//! bits with the original depth recorded in the frame.
//!
//! Corrupt frames are absorbed: `decode` returns an empty frame after
//! recording the error in [`CodecStats`], and only an unbroken run of
//! failures above a threshold escalates to a hard error.

pub mod adapter;
pub mod flac;
pub mod opus;
pub mod pcm;
pub mod vorbis;

use crate::{
    demux::StreamInfo,
    error::{Error, Result},
};

/// Consecutive decode failures tolerated before a hard error.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 16;

/// Decoded PCM audio.
///
/// Samples are interleaved i16; `samples.len() == sample_count * channels`.
#[derive(Clone, Debug, Default)]
pub struct AudioFrame {
    /// Interleaved samples.
    pub samples: Vec<i16>,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Channel count.
    pub channels: u16,

    /// Bit depth of the source material (the frame itself is 16-bit).
    pub bits_per_sample: u16,

    /// Samples per channel.
    pub sample_count: usize,

    /// Presentation timestamp in samples.
    pub pts: u64,

    /// Samples the consumer must discard from the start of this frame
    /// (decoder warm-up after a reset). Zero in steady state.
    pub warmup_samples: u32,
}

impl AudioFrame {
    /// The empty frame: emitted for header packets, deferred output and
    /// absorbed corrupt frames.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this frame carries no audio.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// Decode counters surfaced through [`Codec::stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CodecStats {
    /// Frames decoded successfully.
    pub frames_decoded: u64,
    /// Samples (per channel) decoded successfully.
    pub samples_decoded: u64,
    /// Frames absorbed as corrupt.
    pub error_count: u64,
}

/// Tracks the run of consecutive failures that escalates to a hard error.
#[derive(Debug, Default)]
pub(crate) struct CorruptionGate {
    consecutive: u32,
}

impl CorruptionGate {
    /// Absorbs one failure: counts it, returns an empty frame, or
    /// escalates once the consecutive run exceeds the threshold.
    pub fn absorb(
        &mut self,
        stats: &mut CodecStats,
        err: &Error,
        codec: &str,
    ) -> Result<AudioFrame> {
        stats.error_count += 1;
        self.consecutive += 1;
        if self.consecutive > MAX_CONSECUTIVE_FAILURES {
            return Err(Error::corrupt_frame(format!(
                "{codec}: {} consecutive undecodable frames, giving up (last: {err})",
                self.consecutive
            )));
        }
        debug!("{codec}: skipping undecodable frame: {err}");
        Ok(AudioFrame::empty())
    }

    /// Resets the run after a successful decode.
    pub fn succeed(&mut self) {
        self.consecutive = 0;
    }
}

/// Audio decoder contract.
///
/// One codec instance serves one elementary stream. `initialise` must be
/// called before the first `decode`; header chunks (Ogg) or codec-private
/// data (everything else) configure the decoder.
pub trait Codec: Send {
    /// Lowercase codec token, e.g. `"vorbis"`.
    fn codec_name(&self) -> &str;

    /// Prepares the decoder.
    ///
    /// # Errors
    ///
    /// `BadHeader` when codec-private data is invalid,
    /// `UnsupportedConfiguration` when the stream layout cannot be decoded.
    fn initialise(&mut self) -> Result<()>;

    /// Whether this codec can decode the described stream.
    fn can_decode(&self, info: &StreamInfo) -> bool;

    /// Decodes one chunk.
    ///
    /// Header packets and deferred output yield an empty frame. Corrupt
    /// frames yield an empty frame and are counted in [`CodecStats`].
    ///
    /// # Errors
    ///
    /// Hard errors only: invalid state, or the consecutive-corruption
    /// threshold being exceeded.
    fn decode(&mut self, chunk: &crate::demux::MediaChunk) -> Result<AudioFrame>;

    /// Drains any samples buffered at end of stream.
    ///
    /// # Errors
    ///
    /// Integrity failures detected at stream end (e.g. FLAC MD5 mismatch).
    fn flush(&mut self) -> Result<AudioFrame>;

    /// Clears decoder state after a discontinuous seek.
    fn reset(&mut self);

    /// Whether `reset` suffices to restart at an arbitrary keyframe.
    fn supports_seek_reset(&self) -> bool {
        true
    }

    /// Running count of samples decoded since start or reset.
    fn current_sample(&self) -> u64;

    /// Decode counters.
    fn stats(&self) -> CodecStats;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("codec_name", &self.codec_name())
            .finish()
    }
}

/// Converts a float sample in [-1, 1] to i16 with TPDF dither and
/// saturation.
///
/// The dither is two independent uniform draws (triangular PDF) at ±0.5
/// LSB, which decorrelates quantisation error from the signal.
pub(crate) fn dither_to_i16(sample: f32, rng: &mut fastrand::Rng) -> i16 {
    let dither = (rng.f32() - rng.f32()) * 0.5;
    let scaled = sample * 32_767.0 + dither;
    if scaled >= f32::from(i16::MAX) {
        i16::MAX
    } else if scaled <= f32::from(i16::MIN) {
        i16::MIN
    } else {
        // Rounds toward nearest; cast truncates, so shift by half.
        (scaled + if scaled >= 0.0 { 0.5 } else { -0.5 }) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dither_saturates_out_of_range() {
        let mut rng = fastrand::Rng::with_seed(7);
        assert_eq!(dither_to_i16(2.0, &mut rng), i16::MAX);
        assert_eq!(dither_to_i16(-2.0, &mut rng), i16::MIN);
    }

    #[test]
    fn dither_stays_within_one_lsb() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..1000 {
            let value = dither_to_i16(0.5, &mut rng);
            assert!((value - 16_384).abs() <= 1, "got {value}");
        }
    }

    #[test]
    fn corruption_gate_escalates_after_threshold() {
        let mut gate = CorruptionGate::default();
        let mut stats = CodecStats::default();
        let err = Error::corrupt_frame("test");

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            let frame = gate.absorb(&mut stats, &err, "test").expect("absorbed");
            assert!(frame.is_empty());
        }
        assert!(gate.absorb(&mut stats, &err, "test").is_err());
        assert_eq!(stats.error_count, u64::from(MAX_CONSECUTIVE_FAILURES) + 1);
    }

    #[test]
    fn corruption_gate_resets_on_success() {
        let mut gate = CorruptionGate::default();
        let mut stats = CodecStats::default();
        let err = Error::corrupt_frame("test");

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            gate.absorb(&mut stats, &err, "test").expect("absorbed");
        }
        gate.succeed();
        assert!(gate.absorb(&mut stats, &err, "test").is_ok());
    }
}
