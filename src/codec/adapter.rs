//! Symphonia-backed codecs: AAC, ALAC and MP3.
//!
//! These formats need battle-tested transform decoders rather than fresh
//! implementations, so the crate wraps symphonia's decoders behind its own
//! [`Codec`] contract. Codec-private data from the demuxer (the AAC
//! AudioSpecificConfig or the ALAC magic cookie) becomes symphonia's
//! `extra_data`; each [`MediaChunk`] is wrapped as a symphonia packet and
//! the decoded buffer is copied out interleaved.

use symphonia::core::{
    audio::{Channels as SymphoniaChannels, SampleBuffer},
    codecs::{
        CodecParameters, CodecType, Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_AAC,
        CODEC_TYPE_ALAC, CODEC_TYPE_MP3,
    },
    errors::Error as SymphoniaError,
    formats::Packet,
};

use crate::{
    codec::{AudioFrame, Codec, CodecStats, CorruptionGate},
    demux::{MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
};

/// Builds the symphonia channel set for a plain channel count.
pub(crate) fn channel_layout(channels: u16) -> Option<SymphoniaChannels> {
    match channels {
        1 => Some(SymphoniaChannels::FRONT_LEFT),
        2 => Some(SymphoniaChannels::FRONT_LEFT | SymphoniaChannels::FRONT_RIGHT),
        count => {
            // Positional bits in order; enough for the layouts we demux.
            SymphoniaChannels::from_bits((1u32 << count) - 1)
        }
    }
}

/// One symphonia decoder behind the crate's codec contract.
pub struct SymphoniaCodec {
    token: &'static str,
    codec_type: CodecType,
    params: CodecParameters,
    decoder: Option<Box<dyn SymphoniaDecoder>>,
    buffer: Option<SampleBuffer<i16>>,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    current_sample: u64,
    stats: CodecStats,
    gate: CorruptionGate,
}

impl SymphoniaCodec {
    fn from_info(token: &'static str, codec_type: CodecType, info: &StreamInfo) -> Self {
        let mut params = CodecParameters::new();
        params.for_codec(codec_type);
        if info.sample_rate > 0 {
            params.with_sample_rate(info.sample_rate);
        }
        if let Some(channels) = channel_layout(info.channels) {
            params.with_channels(channels);
        }
        if info.bits_per_sample > 0 {
            params.with_bits_per_sample(u32::from(info.bits_per_sample));
        }
        if !info.codec_private.is_empty() {
            params.with_extra_data(info.codec_private.clone().into_boxed_slice());
        }

        Self {
            token,
            codec_type,
            params,
            decoder: None,
            buffer: None,
            sample_rate: info.sample_rate,
            channels: info.channels,
            bits_per_sample: info.bits_per_sample,
            current_sample: 0,
            stats: CodecStats::default(),
            gate: CorruptionGate::default(),
        }
    }

    /// AAC-LC / HE-AAC decoder initialised from the ASC in the stream's
    /// codec-private data.
    #[must_use]
    pub fn aac(info: &StreamInfo) -> Self {
        Self::from_info("aac", CODEC_TYPE_AAC, info)
    }

    /// ALAC decoder initialised from the magic cookie.
    #[must_use]
    pub fn alac(info: &StreamInfo) -> Self {
        Self::from_info("alac", CODEC_TYPE_ALAC, info)
    }

    /// MP3 decoder; frames are self-describing, no private data needed.
    #[must_use]
    pub fn mp3(info: &StreamInfo) -> Self {
        Self::from_info("mp3", CODEC_TYPE_MP3, info)
    }
}

impl Codec for SymphoniaCodec {
    fn codec_name(&self) -> &str {
        self.token
    }

    fn initialise(&mut self) -> Result<()> {
        let decoder = symphonia::default::get_codecs()
            .make(&self.params, &DecoderOptions::default())
            .map_err(|err| Error::bad_header(format!("{}: {err}", self.token)))?;

        // Decoder initialisation may surface parameters the container
        // did not carry.
        let refined = decoder.codec_params();
        if let Some(rate) = refined.sample_rate {
            self.sample_rate = rate;
        }
        if let Some(channels) = refined.channels {
            self.channels = u16::try_from(channels.count()).unwrap_or(self.channels);
        }

        self.decoder = Some(decoder);
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        match info.codec_name.as_str() {
            "aac" => self.codec_type == CODEC_TYPE_AAC,
            "alac" => self.codec_type == CODEC_TYPE_ALAC,
            "mp3" => self.codec_type == CODEC_TYPE_MP3,
            _ => false,
        }
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("{}: decode before initialise", self.token)))?;

        let timestamp = if chunk.timestamp_samples == TIMESTAMP_UNKNOWN {
            self.current_sample
        } else {
            chunk.timestamp_samples
        };
        let packet = Packet::new_from_slice(0, timestamp, 0, &chunk.data);

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                return self
                    .gate
                    .absorb(&mut self.stats, &Error::corrupt_frame(err), self.token);
            }
            Err(SymphoniaError::IoError(err)) => {
                return self
                    .gate
                    .absorb(&mut self.stats, &Error::corrupt_frame(err.to_string()), self.token);
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                return self.gate.absorb(
                    &mut self.stats,
                    &Error::corrupt_frame("decoder demanded reset"),
                    self.token,
                );
            }
            Err(err) => return Err(Error::from(err)),
        };
        self.gate.succeed();

        let spec = *decoded.spec();
        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => self
                .buffer
                .insert(SampleBuffer::new(decoded.capacity() as u64, spec)),
        };
        buffer.copy_interleaved_ref(decoded);

        let channels = u16::try_from(spec.channels.count()).unwrap_or(self.channels);
        let sample_count = buffer.len() / usize::from(channels.max(1));
        let samples = buffer.samples().to_vec();

        self.sample_rate = spec.rate;
        self.channels = channels;
        self.current_sample = timestamp + sample_count as u64;
        self.stats.frames_decoded += 1;
        self.stats.samples_decoded += sample_count as u64;

        Ok(AudioFrame {
            samples,
            sample_rate: spec.rate,
            channels,
            bits_per_sample: if self.bits_per_sample > 0 {
                self.bits_per_sample
            } else {
                16
            },
            sample_count,
            pts: timestamp,
            warmup_samples: 0,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.buffer = None;
        self.current_sample = 0;
    }

    fn supports_seek_reset(&self) -> bool {
        // AAC frames lean on the previous frame's window; the stream layer
        // discards a short post-reset prefix.
        true
    }

    fn current_sample(&self) -> u64 {
        self.current_sample
    }

    fn stats(&self) -> CodecStats {
        self.stats
    }
}
