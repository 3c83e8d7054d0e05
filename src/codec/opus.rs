//! Opus codec backed by libopus through audiopus.
//!
//! Consumes the OpusHead and OpusTags header packets, then decodes one
//! Opus packet per chunk at the decoder's native 48 kHz regardless of the
//! input material's original rate. Per RFC 7845 the codec:
//!
//! 1. decodes the packet to PCM at 48 kHz,
//! 2. discards the first `pre_skip` samples cumulatively across the first
//!    frames of the stream,
//! 3. applies the Q7.8 dB output gain in the linear domain, saturating to
//!    the i16 range.
//!
//! `reset()` resets libopus decoder state only — the cumulative pre-skip
//! is armed once at stream start and not re-armed by seeks. Instead, the
//! first frame after a reset reports an 80 ms warm-up prefix through
//! [`AudioFrame::warmup_samples`], which the stream layer discards.

use audiopus::{
    coder::{Decoder as OpusDecoder, GenericCtl},
    Channels, SampleRate,
};

use crate::{
    codec::{AudioFrame, Codec, CodecStats, CorruptionGate},
    demux::{MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
};

/// Decoder output rate; Opus always reconstructs at 48 kHz.
const OUTPUT_RATE: u32 = 48_000;

/// Largest Opus frame: 120 ms at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5_760;

/// Post-reset warm-up the consumer should discard (80 ms at 48 kHz).
const RESET_WARMUP_SAMPLES: u32 = 3_840;

/// Parsed OpusHead identification header.
#[derive(Clone, Debug)]
pub struct OpusHead {
    /// Encapsulation version; major must be 0 (i.e. version 1 encoding).
    pub version: u8,
    /// Output channel count.
    pub channels: u8,
    /// Samples at 48 kHz to discard from the start of the stream.
    pub pre_skip: u16,
    /// Original input sample rate; informational only.
    pub input_sample_rate: u32,
    /// Output gain in Q7.8 dB.
    pub output_gain: i16,
    /// Channel mapping family (0 = mono/stereo, 1 = Vorbis order).
    pub mapping_family: u8,
    /// Opus streams multiplexed per packet. Implicitly 1 for family 0.
    pub stream_count: u8,
    /// Streams carrying a coupled (stereo) pair.
    pub coupled_count: u8,
    /// Output-channel to decoded-channel table; 255 marks a silent
    /// channel. Implicit for family 0.
    pub channel_mapping: Vec<u8>,
}

impl OpusHead {
    /// Parses an OpusHead packet, including the channel mapping table for
    /// families other than 0 (RFC 7845 §5.1.1).
    ///
    /// # Errors
    ///
    /// `BadHeader` for a missing magic, short packet or inconsistent
    /// mapping table; `UnsupportedConfiguration` for an incompatible
    /// version.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 19 || &data[0..8] != b"OpusHead" {
            return Err(Error::bad_header("opus: missing OpusHead magic"));
        }
        let version = data[8];
        if version >> 4 != 0 {
            return Err(Error::unsupported_configuration(format!(
                "opus: encapsulation version {version}"
            )));
        }

        let channels = data[9];
        let mapping_family = data[18];
        let (stream_count, coupled_count, channel_mapping) = if mapping_family == 0 {
            // Family 0 carries no table: one stream, coupled for stereo.
            if !(1..=2).contains(&channels) {
                return Err(Error::bad_header(format!(
                    "opus: family 0 with {channels} channel(s)"
                )));
            }
            (1, channels - 1, (0..channels).collect())
        } else {
            let table_end = 21usize + usize::from(channels);
            if data.len() < table_end {
                return Err(Error::bad_header("opus: truncated channel mapping table"));
            }
            let stream_count = data[19];
            let coupled_count = data[20];
            if stream_count == 0
                || coupled_count > stream_count
                || usize::from(stream_count) + usize::from(coupled_count) > 255
            {
                return Err(Error::bad_header(format!(
                    "opus: {stream_count} stream(s) with {coupled_count} coupled"
                )));
            }
            let mapping = data[21..table_end].to_vec();
            if mapping
                .iter()
                .any(|&entry| entry != 255 && entry >= stream_count + coupled_count)
            {
                return Err(Error::bad_header("opus: mapping entry beyond stream count"));
            }
            (stream_count, coupled_count, mapping)
        };

        Ok(Self {
            version,
            channels,
            pre_skip: u16::from_le_bytes([data[10], data[11]]),
            input_sample_rate: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            output_gain: i16::from_le_bytes([data[16], data[17]]),
            mapping_family,
            stream_count,
            coupled_count,
            channel_mapping,
        })
    }

    /// The linear scale factor for the Q7.8 dB output gain.
    #[must_use]
    pub fn gain_factor(&self) -> f32 {
        10f32.powf(f32::from(self.output_gain) / 256.0 / 20.0)
    }

    /// Whether the header describes a single stream in natural channel
    /// order — the layouts one plain decoder instance can serve.
    #[must_use]
    pub fn is_single_stream(&self) -> bool {
        self.stream_count == 1
            && self.coupled_count == u8::from(self.channels == 2)
            && self
                .channel_mapping
                .iter()
                .enumerate()
                .all(|(index, &entry)| usize::from(entry) == index)
    }
}

/// Opus decoder.
pub struct OpusCodec {
    head: Option<OpusHead>,
    decoder: Option<OpusDecoder>,
    headers_seen: u8,
    /// Remaining start-of-stream samples to discard.
    pre_skip_remaining: u32,
    gain: f32,
    /// Report a warm-up prefix on the next decoded frame.
    warmup_pending: bool,
    current_sample: u64,
    stats: CodecStats,
    gate: CorruptionGate,
}

impl OpusCodec {
    /// Creates an uninitialised decoder; headers arrive as the first
    /// chunks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: None,
            decoder: None,
            headers_seen: 0,
            pre_skip_remaining: 0,
            gain: 1.0,
            warmup_pending: false,
            current_sample: 0,
            stats: CodecStats::default(),
            gate: CorruptionGate::default(),
        }
    }

    fn consume_header(&mut self, data: &[u8]) -> Result<()> {
        match self.headers_seen {
            0 => {
                let head = OpusHead::parse(data)?;
                // Family 1 in Vorbis order collapses to the family-0
                // layouts for mono and stereo; anything wider needs
                // per-stream decoders this codec does not instantiate.
                let channels = match (head.mapping_family, head.channels) {
                    (0 | 1, 1) => Channels::Mono,
                    (0 | 1, 2) => Channels::Stereo,
                    (family, channels) => {
                        return Err(Error::unsupported_configuration(format!(
                            "opus: mapping family {family} with {channels} channel(s)"
                        )))
                    }
                };
                if head.mapping_family == 1 && !head.is_single_stream() {
                    return Err(Error::unsupported_configuration(format!(
                        "opus: family 1 with {} stream(s), {} coupled, mapping {:?}",
                        head.stream_count, head.coupled_count, head.channel_mapping
                    )));
                }
                let decoder = OpusDecoder::new(SampleRate::Hz48000, channels)
                    .map_err(|err| Error::bad_header(format!("opus: decoder init: {err}")))?;
                self.pre_skip_remaining = u32::from(head.pre_skip);
                self.gain = head.gain_factor();
                self.decoder = Some(decoder);
                self.head = Some(head);
            }
            1 => {
                if !data.starts_with(b"OpusTags") {
                    return Err(Error::bad_header("opus: missing OpusTags magic"));
                }
            }
            _ => return Err(Error::invalid_state("opus: more than two headers")),
        }
        self.headers_seen += 1;
        Ok(())
    }

    /// Consumes up to `decoded` samples' worth of the remaining
    /// start-of-stream pre-skip, returning how many to drop from this
    /// frame.
    fn take_pre_skip(&mut self, decoded: usize) -> usize {
        let skip = (self.pre_skip_remaining as usize).min(decoded);
        self.pre_skip_remaining -= skip as u32;
        skip
    }

    /// Applies the output gain in place, saturating.
    fn apply_gain(&self, samples: &mut [i16]) {
        if (self.gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in samples {
            let scaled = f32::from(*sample) * self.gain;
            *sample = if scaled >= f32::from(i16::MAX) {
                i16::MAX
            } else if scaled <= f32::from(i16::MIN) {
                i16::MIN
            } else {
                scaled as i16
            };
        }
    }
}

impl Default for OpusCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for OpusCodec {
    fn codec_name(&self) -> &str {
        "opus"
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        info.codec_name == "opus"
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }

        if self.headers_seen < 2 {
            self.consume_header(&chunk.data)?;
            return Ok(AudioFrame::empty());
        }

        let head = self
            .head
            .clone()
            .ok_or_else(|| Error::invalid_state("opus: decode before OpusHead"))?;
        let channels = usize::from(head.channels);
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::invalid_state("opus: decode before OpusHead"))?;

        let mut output = vec![0i16; MAX_FRAME_SAMPLES * channels];
        let decoded = match decoder.decode(Some(chunk.data.as_slice()), &mut output, false) {
            Ok(samples_per_channel) => samples_per_channel,
            Err(err) => {
                return self
                    .gate
                    .absorb(&mut self.stats, &Error::from(err), "opus");
            }
        };
        self.gate.succeed();
        output.truncate(decoded * channels);

        // Cumulative start-of-stream pre-skip.
        let skip = self.take_pre_skip(decoded);
        if skip > 0 {
            output.drain(..skip * channels);
        }
        let sample_count = decoded - skip;
        if sample_count == 0 {
            return Ok(AudioFrame::empty());
        }

        self.apply_gain(&mut output);

        // Granules clock 48 kHz samples including the pre-skip offset.
        let pts = if chunk.timestamp_samples == TIMESTAMP_UNKNOWN {
            self.current_sample
        } else {
            chunk
                .timestamp_samples
                .saturating_sub(decoded as u64)
                .saturating_sub(u64::from(head.pre_skip))
                .saturating_add(skip as u64)
        };
        self.current_sample = pts + sample_count as u64;
        self.stats.frames_decoded += 1;
        self.stats.samples_decoded += sample_count as u64;

        let warmup_samples = if self.warmup_pending {
            self.warmup_pending = false;
            RESET_WARMUP_SAMPLES
        } else {
            0
        };

        Ok(AudioFrame {
            samples: output,
            sample_rate: OUTPUT_RATE,
            channels: u16::from(head.channels),
            bits_per_sample: 16,
            sample_count,
            pts,
            warmup_samples,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
        // Library reset only; the application-level pre-skip stays
        // consumed. The next frame reports the lookahead warm-up instead.
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(err) = decoder.reset_state() {
                warn!("opus: decoder reset failed: {err}");
            }
        }
        if self.headers_seen >= 2 {
            self.warmup_pending = true;
        }
        self.current_sample = 0;
    }

    fn current_sample(&self) -> u64 {
        self.current_sample
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_head(pre_skip: u16, gain: i16, channels: u8) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"OpusHead");
        packet.push(1); // version
        packet.push(channels);
        packet.extend_from_slice(&pre_skip.to_le_bytes());
        packet.extend_from_slice(&48_000u32.to_le_bytes());
        packet.extend_from_slice(&gain.to_le_bytes());
        packet.push(0); // mapping family
        packet
    }

    /// A family-1 OpusHead with an explicit mapping table.
    fn opus_head_family1(
        channels: u8,
        stream_count: u8,
        coupled_count: u8,
        mapping: &[u8],
    ) -> Vec<u8> {
        let mut packet = opus_head(0, 0, channels);
        if let Some(family) = packet.last_mut() {
            *family = 1;
        }
        packet.push(stream_count);
        packet.push(coupled_count);
        packet.extend_from_slice(mapping);
        packet
    }

    #[test]
    fn opus_head_fields_parse() {
        let head = OpusHead::parse(&opus_head(312, 0, 2)).expect("parse");
        assert_eq!(head.channels, 2);
        assert_eq!(head.pre_skip, 312);
        assert_eq!(head.mapping_family, 0);
        assert!((head.gain_factor() - 1.0).abs() < 1e-6);
        // Family 0 implies the single-stream stereo layout.
        assert_eq!(head.stream_count, 1);
        assert_eq!(head.coupled_count, 1);
        assert_eq!(head.channel_mapping, vec![0, 1]);
        assert!(head.is_single_stream());
    }

    #[test]
    fn gain_factor_follows_q78_db() {
        // +6.02 dB ≈ factor 2: 6.02 * 256 ≈ 1541.
        let head = OpusHead::parse(&opus_head(0, 1_541, 2)).expect("parse");
        assert!((head.gain_factor() - 2.0).abs() < 0.01);

        let head = OpusHead::parse(&opus_head(0, -1_541, 2)).expect("parse");
        assert!((head.gain_factor() - 0.5).abs() < 0.01);
    }

    #[test]
    fn family_one_stereo_is_supported() {
        // Family 1 in single-stream natural order is the stereo layout a
        // plain decoder serves; it must be accepted like family 0.
        let mut codec = OpusCodec::new();
        codec
            .consume_header(&opus_head_family1(2, 1, 1, &[0, 1]))
            .expect("family 1 stereo");
        assert!(codec.decoder.is_some());

        let head = codec.head.as_ref().expect("head stored");
        assert_eq!(head.mapping_family, 1);
        assert_eq!(head.channels, 2);
        assert!(head.is_single_stream());
    }

    #[test]
    fn family_one_mono_is_supported() {
        let mut codec = OpusCodec::new();
        codec
            .consume_header(&opus_head_family1(1, 1, 0, &[0]))
            .expect("family 1 mono");
        assert!(codec.decoder.is_some());
    }

    #[test]
    fn surround_mapping_is_unsupported() {
        // 5.1 in Vorbis order: four streams, two coupled.
        let mut codec = OpusCodec::new();
        let chunk = MediaChunk {
            stream_id: 0,
            data: opus_head_family1(6, 4, 2, &[0, 4, 1, 2, 3, 5]),
            timestamp_samples: 0,
            end_timestamp_samples: None,
            is_keyframe: true,
        };
        let err = codec.decode(&chunk).expect_err("must fail");
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::UnsupportedConfiguration
        );
    }

    #[test]
    fn multi_stream_stereo_is_unsupported() {
        // Two uncoupled streams feeding two channels cannot be decoded by
        // a single decoder instance even though the channel count fits.
        let mut codec = OpusCodec::new();
        let err = codec
            .consume_header(&opus_head_family1(2, 2, 0, &[0, 1]))
            .expect_err("must fail");
        assert_eq!(
            err.kind,
            crate::error::ErrorKind::UnsupportedConfiguration
        );
    }

    #[test]
    fn truncated_mapping_table_is_bad_header() {
        let mut head = opus_head(0, 0, 2);
        if let Some(family) = head.last_mut() {
            *family = 1;
        }
        // Table missing entirely.
        let err = OpusHead::parse(&head).expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::BadHeader);
    }

    #[test]
    fn bad_magic_is_bad_header() {
        let err = OpusHead::parse(b"NotOpusHead").expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::BadHeader);
    }

    #[test]
    fn pre_skip_is_cumulative_across_frames() {
        // OpusHead.pre_skip = 312: with 240-sample frames, the first frame
        // is dropped whole, the second loses 72, and the 313th decoded
        // sample is the first one emitted.
        let mut codec = OpusCodec::new();
        codec
            .consume_header(&opus_head(312, 0, 2))
            .expect("OpusHead");

        assert_eq!(codec.take_pre_skip(240), 240);
        assert_eq!(codec.take_pre_skip(240), 72);
        assert_eq!(codec.take_pre_skip(240), 0);
        assert_eq!(codec.pre_skip_remaining, 0);
    }

    #[test]
    fn reset_does_not_rearm_pre_skip() {
        let mut codec = OpusCodec::new();
        codec
            .consume_header(&opus_head(312, 0, 2))
            .expect("OpusHead");
        codec.headers_seen = 2;
        assert_eq!(codec.take_pre_skip(512), 312);

        codec.reset();
        assert_eq!(codec.take_pre_skip(512), 0);
        assert!(codec.warmup_pending);
    }
}
