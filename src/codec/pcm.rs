//! Linear PCM, G.711 and ADPCM codecs.
//!
//! [`PcmCodec`] handles every linear flavour (signed 8/16/24/32 both
//! endiannesses, unsigned 8, IEEE float 32/64) plus the stateless G.711
//! µ-law/A-law expansions. Higher depths are reduced to 16 bits at the
//! edge; floats are dithered. [`AdpcmCodec`] decodes the IMA and Microsoft
//! ADPCM block formats, taking the block layout from the `fmt ` chunk the
//! demuxer forwards as codec-private data.

use crate::{
    codec::{dither_to_i16, AudioFrame, Codec, CodecStats, CorruptionGate},
    demux::{MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
};

/// µ-law expansion to linear, per G.711.
///
/// Yields 14-bit magnitudes widened to the i16 range (±32124 full scale).
#[must_use]
pub fn ulaw_to_linear(encoded: u8) -> i16 {
    let encoded = !encoded;
    let sign = encoded & 0x80;
    let exponent = (encoded >> 4) & 0x07;
    let mantissa = encoded & 0x0F;
    let magnitude = ((i16::from(mantissa) << 3) + 0x84) << exponent;
    let sample = magnitude - 0x84;
    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// A-law expansion to linear, per G.711.
#[must_use]
pub fn alaw_to_linear(encoded: u8) -> i16 {
    let encoded = encoded ^ 0x55;
    let sign = encoded & 0x80;
    let exponent = (encoded >> 4) & 0x07;
    let mantissa = encoded & 0x0F;
    let sample = if exponent > 0 {
        ((i16::from(mantissa) << 4) | 0x08 | 0x100) << (exponent - 1)
    } else {
        (i16::from(mantissa) << 4) | 0x08
    };
    // In A-law a set sign bit marks the positive half.
    if sign != 0 {
        sample
    } else {
        -sample
    }
}

/// The linear sample layouts [`PcmCodec`] decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SampleLayout {
    U8,
    S8,
    S16Le,
    S16Be,
    S24Le,
    S24Be,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
    F64Le,
    F64Be,
    Ulaw,
    Alaw,
}

impl SampleLayout {
    fn from_token(token: &str) -> Option<Self> {
        let layout = match token {
            "pcm_u8" => Self::U8,
            "pcm_s8" => Self::S8,
            "pcm_s16le" => Self::S16Le,
            "pcm_s16be" => Self::S16Be,
            "pcm_s24le" => Self::S24Le,
            "pcm_s24be" => Self::S24Be,
            "pcm_s32le" => Self::S32Le,
            "pcm_s32be" => Self::S32Be,
            "pcm_f32le" => Self::F32Le,
            "pcm_f32be" => Self::F32Be,
            "pcm_f64le" => Self::F64Le,
            "pcm_f64be" => Self::F64Be,
            "ulaw" => Self::Ulaw,
            "alaw" => Self::Alaw,
            _ => return None,
        };
        Some(layout)
    }

    fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 | Self::S8 | Self::Ulaw | Self::Alaw => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::S24Le | Self::S24Be => 3,
            Self::S32Le | Self::S32Be | Self::F32Le | Self::F32Be => 4,
            Self::F64Le | Self::F64Be => 8,
        }
    }
}

/// Linear PCM and G.711 codec. No inter-frame state; every chunk is a
/// keyframe.
#[derive(Debug)]
pub struct PcmCodec {
    token: String,
    layout: SampleLayout,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    current_sample: u64,
    stats: CodecStats,
    rng: fastrand::Rng,
}

impl PcmCodec {
    /// Creates a codec for the given stream.
    ///
    /// # Errors
    ///
    /// `UnsupportedConfiguration` for tokens outside the PCM family.
    pub fn new(info: &StreamInfo) -> Result<Self> {
        let layout = SampleLayout::from_token(&info.codec_name).ok_or_else(|| {
            Error::unsupported_configuration(format!(
                "pcm: unknown codec token {}",
                info.codec_name
            ))
        })?;
        Ok(Self {
            token: info.codec_name.clone(),
            layout,
            sample_rate: info.sample_rate,
            channels: info.channels.max(1),
            bits_per_sample: info.bits_per_sample,
            current_sample: 0,
            stats: CodecStats::default(),
            rng: fastrand::Rng::new(),
        })
    }

    fn convert(&mut self, data: &[u8]) -> Vec<i16> {
        let width = self.layout.bytes_per_sample();
        let usable = data.len() - data.len() % width;
        let mut samples = Vec::with_capacity(usable / width);

        for raw in data[..usable].chunks_exact(width) {
            let sample = match self.layout {
                SampleLayout::U8 => (i16::from(raw[0]) - 128) << 8,
                SampleLayout::S8 => i16::from(raw[0] as i8) << 8,
                SampleLayout::S16Le => i16::from_le_bytes([raw[0], raw[1]]),
                SampleLayout::S16Be => i16::from_be_bytes([raw[0], raw[1]]),
                SampleLayout::S24Le => i16::from_le_bytes([raw[1], raw[2]]),
                SampleLayout::S24Be => i16::from_be_bytes([raw[0], raw[1]]),
                SampleLayout::S32Le => i16::from_le_bytes([raw[2], raw[3]]),
                SampleLayout::S32Be => i16::from_be_bytes([raw[0], raw[1]]),
                SampleLayout::F32Le => {
                    let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    dither_to_i16(value, &mut self.rng)
                }
                SampleLayout::F32Be => {
                    let value = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                    dither_to_i16(value, &mut self.rng)
                }
                SampleLayout::F64Le => {
                    let value = f64::from_le_bytes([
                        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                    ]);
                    dither_to_i16(value as f32, &mut self.rng)
                }
                SampleLayout::F64Be => {
                    let value = f64::from_be_bytes([
                        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                    ]);
                    dither_to_i16(value as f32, &mut self.rng)
                }
                SampleLayout::Ulaw => ulaw_to_linear(raw[0]),
                SampleLayout::Alaw => alaw_to_linear(raw[0]),
            };
            samples.push(sample);
        }
        samples
    }
}

impl Codec for PcmCodec {
    fn codec_name(&self) -> &str {
        &self.token
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        SampleLayout::from_token(&info.codec_name).is_some()
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }

        let samples = self.convert(&chunk.data);
        let sample_count = samples.len() / usize::from(self.channels);
        let pts = if chunk.timestamp_samples == TIMESTAMP_UNKNOWN {
            self.current_sample
        } else {
            chunk.timestamp_samples
        };
        self.current_sample = pts + sample_count as u64;
        self.stats.frames_decoded += 1;
        self.stats.samples_decoded += sample_count as u64;

        Ok(AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            sample_count,
            pts,
            warmup_samples: 0,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
        self.current_sample = 0;
    }

    fn current_sample(&self) -> u64 {
        self.current_sample
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}

/// IMA step size table.
const IMA_STEPS: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

/// IMA step index adjustment per nibble.
const IMA_INDEX: [i32; 8] = [-1, -1, -1, -1, 2, 4, 6, 8];

/// MS ADPCM adaptation table.
const MS_ADAPT: [i32; 16] = [
    230, 230, 230, 230, 307, 409, 512, 614, 768, 614, 512, 409, 307, 230, 230, 230,
];

/// MS ADPCM predictor coefficient pairs.
const MS_COEFS: [(i32, i32); 7] = [
    (256, 0),
    (512, -256),
    (0, 0),
    (192, 64),
    (240, 0),
    (460, -208),
    (392, -232),
];

/// The ADPCM flavour being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AdpcmVariant {
    Ima,
    Ms,
}

/// IMA / MS ADPCM block decoder.
///
/// Chunks must contain whole blocks of `block_align` bytes, which is how
/// the RIFF demuxer slabs them; a trailing partial block is dropped with a
/// count in the stats.
pub struct AdpcmCodec {
    variant: AdpcmVariant,
    sample_rate: u32,
    channels: usize,
    block_align: usize,
    current_sample: u64,
    stats: CodecStats,
    gate: CorruptionGate,
}

impl AdpcmCodec {
    /// Creates a codec for the given stream; the `fmt ` image in
    /// `codec_private` supplies `block_align`.
    ///
    /// # Errors
    ///
    /// `UnsupportedConfiguration` for non-ADPCM tokens or a missing/short
    /// `fmt ` image.
    pub fn new(info: &StreamInfo) -> Result<Self> {
        let variant = match info.codec_name.as_str() {
            "adpcm_ima" => AdpcmVariant::Ima,
            "adpcm_ms" => AdpcmVariant::Ms,
            other => {
                return Err(Error::unsupported_configuration(format!(
                    "adpcm: unknown codec token {other}"
                )))
            }
        };
        if info.codec_private.len() < 16 {
            return Err(Error::unsupported_configuration(
                "adpcm: missing fmt image in codec-private data",
            ));
        }
        let block_align =
            usize::from(u16::from_le_bytes([info.codec_private[12], info.codec_private[13]]));
        let channels = usize::from(info.channels.max(1));
        let min_block = match variant {
            AdpcmVariant::Ima => 4 * channels,
            AdpcmVariant::Ms => 7 * channels,
        };
        if block_align <= min_block {
            return Err(Error::unsupported_configuration(format!(
                "adpcm: block align {block_align} too small for {channels} channel(s)"
            )));
        }

        Ok(Self {
            variant,
            sample_rate: info.sample_rate,
            channels,
            block_align,
            current_sample: 0,
            stats: CodecStats::default(),
            gate: CorruptionGate::default(),
        })
    }

    fn decode_block_ima(&self, block: &[u8], out: &mut Vec<i16>) -> Result<()> {
        let channels = self.channels;
        let mut predictors = vec![0i32; channels];
        let mut indices = vec![0i32; channels];

        for channel in 0..channels {
            let base = channel * 4;
            predictors[channel] =
                i32::from(i16::from_le_bytes([block[base], block[base + 1]]));
            indices[channel] = i32::from(block[base + 2]).clamp(0, 88);
            if block[base + 3] != 0 {
                return Err(Error::corrupt_frame("adpcm: bad IMA block preamble"));
            }
        }

        // The preamble predictor is the first output sample per channel.
        for channel in 0..channels {
            out.push(predictors[channel] as i16);
        }

        let data = &block[channels * 4..];
        // Data is interleaved in 4-byte groups per channel; each byte holds
        // two nibbles, low first.
        let group_len = 4 * channels;
        for group in data.chunks_exact(group_len) {
            let mut decoded = vec![[0i16; 8]; channels];
            for channel in 0..channels {
                for (byte_index, byte) in
                    group[channel * 4..channel * 4 + 4].iter().enumerate()
                {
                    for (nibble_index, nibble) in
                        [byte & 0x0F, byte >> 4].into_iter().enumerate()
                    {
                        let step = IMA_STEPS[indices[channel] as usize];
                        let mut diff = step >> 3;
                        if nibble & 1 != 0 {
                            diff += step >> 2;
                        }
                        if nibble & 2 != 0 {
                            diff += step >> 1;
                        }
                        if nibble & 4 != 0 {
                            diff += step;
                        }
                        if nibble & 8 != 0 {
                            diff = -diff;
                        }
                        predictors[channel] =
                            (predictors[channel] + diff).clamp(-32_768, 32_767);
                        indices[channel] =
                            (indices[channel] + IMA_INDEX[(nibble & 0x7) as usize]).clamp(0, 88);
                        decoded[channel][byte_index * 2 + nibble_index] =
                            predictors[channel] as i16;
                    }
                }
            }
            // Re-interleave the 8 samples per channel.
            for sample_index in 0..8 {
                for channel_samples in decoded.iter() {
                    out.push(channel_samples[sample_index]);
                }
            }
        }
        Ok(())
    }

    fn decode_block_ms(&self, block: &[u8], out: &mut Vec<i16>) -> Result<()> {
        let channels = self.channels;
        let mut coefs = vec![(0i32, 0i32); channels];
        let mut deltas = vec![0i32; channels];
        let mut sample1 = vec![0i32; channels];
        let mut sample2 = vec![0i32; channels];

        for channel in 0..channels {
            let index = usize::from(block[channel]);
            coefs[channel] = *MS_COEFS
                .get(index)
                .ok_or_else(|| Error::corrupt_frame("adpcm: bad MS predictor index"))?;
        }
        let mut cursor = channels;
        for channel in 0..channels {
            deltas[channel] =
                i32::from(i16::from_le_bytes([block[cursor], block[cursor + 1]]));
            cursor += 2;
        }
        for channel in 0..channels {
            sample1[channel] =
                i32::from(i16::from_le_bytes([block[cursor], block[cursor + 1]]));
            cursor += 2;
        }
        for channel in 0..channels {
            sample2[channel] =
                i32::from(i16::from_le_bytes([block[cursor], block[cursor + 1]]));
            cursor += 2;
        }

        // The two preamble samples are emitted oldest first.
        for channel in 0..channels {
            out.push(sample2[channel] as i16);
        }
        for channel in 0..channels {
            out.push(sample1[channel] as i16);
        }

        let mut channel = 0usize;
        for byte in &block[cursor..] {
            for nibble in [byte >> 4, byte & 0x0F] {
                let signed = if nibble >= 8 {
                    i32::from(nibble) - 16
                } else {
                    i32::from(nibble)
                };
                let (coef1, coef2) = coefs[channel];
                let predicted =
                    (sample1[channel] * coef1 + sample2[channel] * coef2) / 256
                        + signed * deltas[channel];
                let clamped = predicted.clamp(-32_768, 32_767);

                sample2[channel] = sample1[channel];
                sample1[channel] = clamped;
                deltas[channel] =
                    ((MS_ADAPT[usize::from(nibble)] * deltas[channel]) / 256).max(16);

                out.push(clamped as i16);
                channel = (channel + 1) % channels;
            }
        }
        Ok(())
    }
}

impl Codec for AdpcmCodec {
    fn codec_name(&self) -> &str {
        match self.variant {
            AdpcmVariant::Ima => "adpcm_ima",
            AdpcmVariant::Ms => "adpcm_ms",
        }
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        matches!(info.codec_name.as_str(), "adpcm_ima" | "adpcm_ms")
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }

        let mut samples = Vec::new();
        for block in chunk.data.chunks(self.block_align) {
            if block.len() < self.block_align {
                debug!("adpcm: dropping {}-byte partial block", block.len());
                self.stats.error_count += 1;
                break;
            }
            let result = match self.variant {
                AdpcmVariant::Ima => self.decode_block_ima(block, &mut samples),
                AdpcmVariant::Ms => self.decode_block_ms(block, &mut samples),
            };
            if let Err(err) = result {
                let name = match self.variant {
                    AdpcmVariant::Ima => "adpcm_ima",
                    AdpcmVariant::Ms => "adpcm_ms",
                };
                self.gate.absorb(&mut self.stats, &err, name)?;
                continue;
            }
            self.gate.succeed();
        }

        let sample_count = samples.len() / self.channels;
        let pts = if chunk.timestamp_samples == TIMESTAMP_UNKNOWN {
            self.current_sample
        } else {
            chunk.timestamp_samples
        };
        self.current_sample = pts + sample_count as u64;
        self.stats.frames_decoded += 1;
        self.stats.samples_decoded += sample_count as u64;

        Ok(AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels as u16,
            bits_per_sample: 16,
            sample_count,
            pts,
            warmup_samples: 0,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
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
    use crate::demux::StreamInfo;

    fn pcm_info(token: &str, channels: u16, bits: u16) -> StreamInfo {
        let mut info = StreamInfo::audio(0, token);
        info.sample_rate = 44_100;
        info.channels = channels;
        info.bits_per_sample = bits;
        info
    }

    fn chunk(data: Vec<u8>, timestamp: u64) -> MediaChunk {
        MediaChunk {
            stream_id: 0,
            data,
            timestamp_samples: timestamp,
            end_timestamp_samples: None,
            is_keyframe: true,
        }
    }

    #[test]
    fn s16le_roundtrips_bit_exactly() {
        let mut codec = PcmCodec::new(&pcm_info("pcm_s16le", 1, 16)).expect("codec");
        let samples: Vec<i16> = vec![0, 1, -1, 32_767, -32_768, 12_345];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let frame = codec.decode(&chunk(bytes, 0)).expect("decode");
        assert_eq!(frame.samples, samples);
        assert_eq!(frame.sample_count, 6);
    }

    #[test]
    fn s24be_reduces_to_top_bits() {
        let mut codec = PcmCodec::new(&pcm_info("pcm_s24be", 1, 24)).expect("codec");
        // 0x123456 -> 0x1234.
        let frame = codec
            .decode(&chunk(vec![0x12, 0x34, 0x56], 0))
            .expect("decode");
        assert_eq!(frame.samples, vec![0x1234]);
        assert_eq!(frame.bits_per_sample, 24);
    }

    #[test]
    fn ulaw_expansion_hits_reference_points() {
        // 0xFF encodes zero; 0x00 is the most negative full-scale value.
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(ulaw_to_linear(0x7F), 0);
        assert_eq!(ulaw_to_linear(0x00), -32_124);
        assert_eq!(ulaw_to_linear(0x80), 32_124);
    }

    #[test]
    fn alaw_expansion_hits_reference_points() {
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32_256);
        assert_eq!(alaw_to_linear(0x2A), -32_256);
    }

    #[test]
    fn pts_follows_chunk_timestamps() {
        let mut codec = PcmCodec::new(&pcm_info("pcm_s16le", 2, 16)).expect("codec");
        let frame = codec.decode(&chunk(vec![0u8; 400], 1_000)).expect("decode");
        assert_eq!(frame.pts, 1_000);
        assert_eq!(frame.sample_count, 100);
        assert_eq!(codec.current_sample(), 1_100);
    }

    #[test]
    fn ima_block_decodes_preamble_as_first_sample() {
        let mut info = pcm_info("adpcm_ima", 1, 4);
        // fmt image with block_align = 12.
        let mut fmt = vec![0u8; 16];
        fmt[12..14].copy_from_slice(&12u16.to_le_bytes());
        info.codec_private = fmt;

        let mut codec = AdpcmCodec::new(&info).expect("codec");
        // Preamble: predictor 1000, index 0; one 8-nibble data group of
        // zero deltas (nibble 0 still moves by step >> 3).
        let mut block = Vec::new();
        block.extend_from_slice(&1000i16.to_le_bytes());
        block.push(0); // step index
        block.push(0); // reserved
        block.extend_from_slice(&[0u8; 8]);

        let frame = codec.decode(&chunk(block, 0)).expect("decode");
        assert_eq!(frame.sample_count, 17);
        assert_eq!(frame.samples[0], 1000);
        // Zero nibbles drift by tiny positive steps, never backwards.
        assert!(frame.samples.iter().all(|&s| s >= 1000));
    }

    #[test]
    fn ms_block_emits_preamble_samples_oldest_first() {
        let mut info = pcm_info("adpcm_ms", 1, 4);
        let mut fmt = vec![0u8; 16];
        fmt[12..14].copy_from_slice(&10u16.to_le_bytes());
        info.codec_private = fmt;

        let mut codec = AdpcmCodec::new(&info).expect("codec");
        let mut block = Vec::new();
        block.push(0); // predictor index (coef 256/0)
        block.extend_from_slice(&16i16.to_le_bytes()); // delta
        block.extend_from_slice(&500i16.to_le_bytes()); // sample1
        block.extend_from_slice(&400i16.to_le_bytes()); // sample2
        block.extend_from_slice(&[0u8; 3]); // six zero nibbles

        let frame = codec.decode(&chunk(block, 0)).expect("decode");
        // 2 preamble + 6 nibble samples.
        assert_eq!(frame.sample_count, 8);
        assert_eq!(frame.samples[0], 400);
        assert_eq!(frame.samples[1], 500);
        // coef1=256: prediction = previous sample exactly.
        assert_eq!(frame.samples[2], 500);
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = PcmCodec::new(&pcm_info("vorbis", 2, 16)).expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::UnsupportedConfiguration);
    }
}
