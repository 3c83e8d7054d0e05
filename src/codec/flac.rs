//! FLAC codec backed by symphonia, with optional MD5 verification.
//!
//! One chunk is one FLAC frame; the decoder is initialised from the
//! STREAMINFO image the demuxer carries as codec-private data. Output is
//! integer PCM reduced to 16 bits (the source depth stays visible in the
//! frame).
//!
//! When `enable_md5_check` is set, decoded audio is re-serialised at the
//! source bit depth (interleaved little-endian, as the format defines) and
//! hashed; `flush()` compares against the STREAMINFO signature and fails
//! the stream on mismatch. Off by default.

use md5::{Digest, Md5};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CodecParameters, Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_FLAC},
    errors::Error as SymphoniaError,
    formats::Packet,
};

use crate::{
    codec::{adapter::channel_layout, AudioFrame, Codec, CodecStats, CorruptionGate},
    demux::{MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
};

/// FLAC decoder.
pub struct FlacCodec {
    params: CodecParameters,
    decoder: Option<Box<dyn SymphoniaDecoder>>,
    /// Output copy-out buffer (16-bit edge format).
    buffer: Option<SampleBuffer<i16>>,
    /// Full-scale integer buffer for MD5 re-serialisation.
    verify_buffer: Option<SampleBuffer<i32>>,
    md5: Option<Md5>,
    /// Expected signature from STREAMINFO.
    expected_md5: [u8; 16],
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    current_sample: u64,
    stats: CodecStats,
    gate: CorruptionGate,
}

impl FlacCodec {
    /// Creates a decoder for the stream; `verify` enables the whole-stream
    /// MD5 check.
    #[must_use]
    pub fn new(info: &StreamInfo, verify: bool) -> Self {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_FLAC);
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

        let mut expected_md5 = [0u8; 16];
        if info.codec_private.len() >= 34 {
            expected_md5.copy_from_slice(&info.codec_private[18..34]);
        }

        Self {
            params,
            decoder: None,
            buffer: None,
            verify_buffer: None,
            md5: verify.then(Md5::new),
            expected_md5,
            sample_rate: info.sample_rate,
            channels: info.channels,
            bits_per_sample: info.bits_per_sample,
            current_sample: 0,
            stats: CodecStats::default(),
            gate: CorruptionGate::default(),
        }
    }

    /// Feeds the hash with samples restored to source depth.
    fn hash_samples(md5: &mut Md5, bits_per_sample: u16, full_scale: &[i32]) {
        let bits = u32::from(bits_per_sample.clamp(4, 32));
        let shift = 32 - bits;
        let bytes_per_sample = usize::from(bits_per_sample.div_ceil(8));

        let mut serialised = Vec::with_capacity(full_scale.len() * bytes_per_sample);
        for &sample in full_scale {
            let original = sample >> shift;
            serialised.extend_from_slice(&original.to_le_bytes()[..bytes_per_sample]);
        }
        md5.update(&serialised);
    }
}

impl Codec for FlacCodec {
    fn codec_name(&self) -> &str {
        "flac"
    }

    fn initialise(&mut self) -> Result<()> {
        let decoder = symphonia::default::get_codecs()
            .make(&self.params, &DecoderOptions::default())
            .map_err(|err| Error::bad_header(format!("flac: {err}")))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        info.codec_name == "flac"
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }

        // FLAC-in-Ogg streams deliver their mapping and metadata packets
        // as leading header chunks; the decoder needs none of them. Audio
        // frames always open with the 0xFF sync byte.
        if chunk.timestamp_samples == 0
            && chunk.is_keyframe
            && chunk.data.first().is_some_and(|first| *first != 0xFF)
        {
            return Ok(AudioFrame::empty());
        }

        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::invalid_state("flac: decode before initialise"))?;

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
                    .absorb(&mut self.stats, &Error::corrupt_frame(err), "flac");
            }
            Err(SymphoniaError::IoError(err)) => {
                return self.gate.absorb(
                    &mut self.stats,
                    &Error::corrupt_frame(err.to_string()),
                    "flac",
                );
            }
            Err(err) => return Err(Error::from(err)),
        };
        self.gate.succeed();

        let spec = *decoded.spec();
        let channels = u16::try_from(spec.channels.count()).unwrap_or(self.channels);

        if let Some(md5) = self.md5.as_mut() {
            let verify_buffer = match self.verify_buffer.as_mut() {
                Some(buffer) => buffer,
                None => self
                    .verify_buffer
                    .insert(SampleBuffer::new(decoded.capacity() as u64, spec)),
            };
            verify_buffer.copy_interleaved_ref(decoded.clone());
            Self::hash_samples(md5, self.bits_per_sample, verify_buffer.samples());
        }

        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => self
                .buffer
                .insert(SampleBuffer::new(decoded.capacity() as u64, spec)),
        };
        buffer.copy_interleaved_ref(decoded);

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
            bits_per_sample: self.bits_per_sample.max(16),
            sample_count,
            pts: timestamp,
            warmup_samples: 0,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        if let Some(md5) = self.md5.take() {
            let computed: [u8; 16] = md5.finalize().into();
            let unset = self.expected_md5 == [0u8; 16];
            if !unset && computed != self.expected_md5 {
                warn!(
                    "flac: MD5 mismatch: decoded {:02x?} vs STREAMINFO {:02x?}",
                    computed, self.expected_md5
                );
                return Err(Error::corrupt_frame("flac: whole-stream MD5 mismatch"));
            }
            debug!("flac: MD5 verification passed");
        }
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.buffer = None;
        self.verify_buffer = None;
        // A seek invalidates whole-stream verification.
        if self.md5.take().is_some() {
            debug!("flac: MD5 verification abandoned after seek");
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
