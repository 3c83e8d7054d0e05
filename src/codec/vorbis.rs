//! Vorbis codec backed by lewton's low-level packet API.
//!
//! Consumes the three Vorbis header packets (identification, comment,
//! setup) in order before any audio, then decodes one audio packet per
//! chunk. lewton produces float output; the edge conversion to i16 applies
//! TPDF dither with saturation. The windowed MDCT overlap is carried in
//! [`PreviousWindowRight`] between packets, so the first packet after a
//! reset yields no samples while the overlap warms back up.

use lewton::{
    audio::{read_audio_packet_generic, PreviousWindowRight},
    header::{read_header_comment, read_header_ident, read_header_setup, IdentHeader, SetupHeader},
    samples::InterleavedSamples,
};

use crate::{
    codec::{dither_to_i16, AudioFrame, Codec, CodecStats, CorruptionGate},
    demux::{MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
};

/// Vorbis decoder.
pub struct VorbisCodec {
    ident: Option<IdentHeader>,
    setup: Option<SetupHeader>,
    /// MDCT overlap-add state carried between packets.
    pwr: PreviousWindowRight,
    headers_seen: u8,
    current_sample: u64,
    stats: CodecStats,
    gate: CorruptionGate,
    rng: fastrand::Rng,
}

impl VorbisCodec {
    /// Creates an uninitialised decoder; headers arrive as the first
    /// chunks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ident: None,
            setup: None,
            pwr: PreviousWindowRight::new(),
            headers_seen: 0,
            current_sample: 0,
            stats: CodecStats::default(),
            gate: CorruptionGate::default(),
            rng: fastrand::Rng::new(),
        }
    }

    fn consume_header(&mut self, data: &[u8]) -> Result<()> {
        match self.headers_seen {
            0 => {
                let ident = read_header_ident(data)
                    .map_err(|err| Error::bad_header(format!("vorbis: ident: {err}")))?;
                self.ident = Some(ident);
            }
            1 => {
                read_header_comment(data)
                    .map_err(|err| Error::bad_header(format!("vorbis: comment: {err}")))?;
            }
            2 => {
                let ident = self
                    .ident
                    .as_ref()
                    .ok_or_else(|| Error::invalid_state("vorbis: setup before ident"))?;
                let setup = read_header_setup(
                    data,
                    ident.audio_channels,
                    (ident.blocksize_0, ident.blocksize_1),
                )
                .map_err(|err| Error::bad_header(format!("vorbis: setup: {err}")))?;
                self.setup = Some(setup);
            }
            _ => return Err(Error::invalid_state("vorbis: more than three headers")),
        }
        self.headers_seen += 1;
        Ok(())
    }
}

impl Default for VorbisCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for VorbisCodec {
    fn codec_name(&self) -> &str {
        "vorbis"
    }

    fn initialise(&mut self) -> Result<()> {
        // Setup happens through the three header chunks.
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        info.codec_name == "vorbis"
    }

    fn decode(&mut self, chunk: &MediaChunk) -> Result<AudioFrame> {
        if chunk.is_end_of_stream() {
            return Ok(AudioFrame::empty());
        }

        if self.headers_seen < 3 {
            self.consume_header(&chunk.data)?;
            return Ok(AudioFrame::empty());
        }

        let (ident, setup) = match (self.ident.as_ref(), self.setup.as_ref()) {
            (Some(ident), Some(setup)) => (ident, setup),
            _ => return Err(Error::invalid_state("vorbis: decode before headers")),
        };

        let decoded: InterleavedSamples<f32> =
            match read_audio_packet_generic(ident, setup, &chunk.data, &mut self.pwr) {
                Ok(decoded) => decoded,
                Err(err) => {
                    return self.gate.absorb(
                        &mut self.stats,
                        &Error::from(lewton::VorbisError::BadAudio(err)),
                        "vorbis",
                    );
                }
            };
        self.gate.succeed();

        let channels = decoded.channel_count.max(1);
        let sample_count = decoded.samples.len() / channels;
        if sample_count == 0 {
            // First packet after start or reset: pure window priming.
            return Ok(AudioFrame::empty());
        }

        let samples: Vec<i16> = decoded
            .samples
            .iter()
            .map(|&sample| dither_to_i16(sample, &mut self.rng))
            .collect();

        // The page granule clocks the END of the packet that completed it.
        let pts = if chunk.timestamp_samples == TIMESTAMP_UNKNOWN {
            self.current_sample
        } else {
            chunk.timestamp_samples.saturating_sub(sample_count as u64)
        };
        self.current_sample = pts + sample_count as u64;
        self.stats.frames_decoded += 1;
        self.stats.samples_decoded += sample_count as u64;

        Ok(AudioFrame {
            samples,
            sample_rate: ident.audio_sample_rate,
            channels: u16::from(ident.audio_channels),
            bits_per_sample: 16,
            sample_count,
            pts,
            warmup_samples: 0,
        })
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        // All output is emitted per packet; nothing is held back.
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {
        // Seek discontinuity: clear the overlap, keep the headers. The
        // next packet primes the window and produces no samples, which is
        // exactly the discard the format requires.
        self.pwr = PreviousWindowRight::new();
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

    fn header_chunk(data: Vec<u8>) -> MediaChunk {
        MediaChunk {
            stream_id: 0,
            data,
            timestamp_samples: 0,
            end_timestamp_samples: None,
            is_keyframe: true,
        }
    }

    /// A structurally valid identification header.
    fn ident_packet() -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x01vorbis");
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.push(2); // channels
        packet.extend_from_slice(&44_100u32.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.extend_from_slice(&128_000u32.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes());
        packet.push(0xB8); // blocksizes 256/2048
        packet.push(0x01); // framing
        packet
    }

    #[test]
    fn ident_header_is_accepted() {
        let mut codec = VorbisCodec::new();
        let frame = codec.decode(&header_chunk(ident_packet())).expect("decode");
        assert!(frame.is_empty());
        assert_eq!(codec.headers_seen, 1);
    }

    #[test]
    fn garbage_ident_is_bad_header() {
        let mut codec = VorbisCodec::new();
        let err = codec
            .decode(&header_chunk(b"not a header".to_vec()))
            .expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::BadHeader);
    }

    #[test]
    fn decode_before_headers_never_panics() {
        let mut codec = VorbisCodec::new();
        codec.headers_seen = 3; // simulate misuse
        let err = codec
            .decode(&header_chunk(vec![0u8; 16]))
            .expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
    }
}
