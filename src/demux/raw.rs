//! Raw audio demuxer for containerless streams.
//!
//! Activated by extension hint only — there is no magic to probe, except
//! for `.au` files whose `.snd` header is sniffed when present. Stream
//! parameters come from the extension defaults (`.ulaw`/`.alaw` are 8 kHz
//! mono G.711 telephony captures, `.pcm`/`.raw` default to CD-style
//! stereo s16le) and may be overridden through
//! [`RawParams`](crate::config::RawParams) in the open options.
//!
//! Chunks are fixed-size slabs with running sample counts; seeking is
//! exact.

use std::io::SeekFrom;

use crate::{
    config::{OpenOptions, RawCodec, RawParams},
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{Error, Result},
    source::ByteSource,
    tag::Tag,
};

/// Target payload size of an emitted slab, rounded to whole frames.
const SLAB_LEN: usize = 32 * 1024;

/// Sun audio file magic.
const AU_MAGIC: [u8; 4] = *b".snd";

/// Derives default parameters from a path's extension.
///
/// Returns `None` for extensions the raw demuxer does not claim.
#[must_use]
pub fn params_for_extension(path: &str) -> Option<RawParams> {
    let extension = path.rsplit('.').next()?.to_ascii_lowercase();
    let params = match extension.as_str() {
        "ulaw" | "au" => RawParams {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 8,
            codec: RawCodec::Ulaw,
        },
        "alaw" => RawParams {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 8,
            codec: RawCodec::Alaw,
        },
        "pcm" | "raw" => RawParams::default(),
        _ => return None,
    };
    Some(params)
}

/// Raw audio demuxer.
pub struct RawDemuxer {
    core: DemuxerCore,
    params: RawParams,
    info: Option<StreamInfo>,
    /// Byte offset where audio data begins (after a `.snd` header, if any).
    data_start: u64,
    consumed: u64,
}

impl RawDemuxer {
    /// Creates a demuxer over `src` with explicit parameters.
    ///
    /// Callers going through the registry get parameters resolved from the
    /// open options or the path extension; this constructor is the
    /// programmatic entry.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, params: RawParams, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            params,
            info: None,
            data_start: 0,
            consumed: 0,
        }
    }

    /// Creates a demuxer resolving parameters from options and path hint.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when neither the options nor the extension supply
    /// parameters.
    pub fn from_options(src: Box<dyn ByteSource>, options: &OpenOptions) -> Result<Self> {
        let params = options
            .raw_params
            .or_else(|| src.path_hint().as_deref().and_then(params_for_extension))
            .ok_or_else(|| {
                Error::invalid_argument("raw: no parameters for containerless stream")
            })?;
        Ok(Self::new(src, params, options))
    }

    fn codec_token(&self) -> &'static str {
        match self.params.codec {
            RawCodec::Ulaw => "ulaw",
            RawCodec::Alaw => "alaw",
            RawCodec::SignedBe => match self.params.bits_per_sample {
                8 => "pcm_s8",
                24 => "pcm_s24be",
                32 => "pcm_s32be",
                _ => "pcm_s16be",
            },
            RawCodec::SignedLe => match self.params.bits_per_sample {
                8 => "pcm_s8",
                24 => "pcm_s24le",
                32 => "pcm_s32le",
                _ => "pcm_s16le",
            },
        }
    }

    fn frame_len(&self) -> u64 {
        u64::from(self.params.channels) * u64::from(self.params.bits_per_sample.max(8)) / 8
    }

    /// Sniffs a Sun audio header, adjusting parameters when one exists.
    fn sniff_au_header(&mut self) -> Result<()> {
        let mut magic = [0u8; 4];
        let n = self.core.src().read(&mut magic)?;
        if n == 4 && magic == AU_MAGIC {
            let data_offset = self.core.read_u32_be()?;
            let _data_size = self.core.read_u32_be()?;
            let encoding = self.core.read_u32_be()?;
            let sample_rate = self.core.read_u32_be()?;
            let channels = self.core.read_u32_be()?;

            let (codec, bits) = match encoding {
                1 => (RawCodec::Ulaw, 8),
                2 => (RawCodec::SignedBe, 8),
                3 => (RawCodec::SignedBe, 16),
                4 => (RawCodec::SignedBe, 24),
                5 => (RawCodec::SignedBe, 32),
                27 => (RawCodec::Alaw, 8),
                other => {
                    return Err(Error::unsupported_variant(format!(
                        "raw: .snd encoding {other}"
                    )))
                }
            };
            self.params = RawParams {
                channels: u16::try_from(channels.clamp(1, 64)).unwrap_or(1),
                sample_rate: sample_rate.max(1),
                bits_per_sample: bits,
                codec,
            };
            self.data_start = u64::from(data_offset.max(24));
        } else {
            self.data_start = 0;
        }

        self.core.src().seek(SeekFrom::Start(self.data_start))?;
        Ok(())
    }
}

impl Demuxer for RawDemuxer {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn parse_container(&mut self) -> Result<()> {
        self.sniff_au_header()?;

        let frame_len = self.frame_len().max(1);
        let duration_samples = self
            .core
            .src()
            .size()
            .map_or(0, |size| size.saturating_sub(self.data_start) / frame_len);
        let duration_ms =
            duration_samples.saturating_mul(1000) / u64::from(self.params.sample_rate);

        let mut info = StreamInfo::audio(0, self.codec_token());
        info.sample_rate = self.params.sample_rate;
        info.channels = self.params.channels;
        info.bits_per_sample = self.params.bits_per_sample;
        info.duration_samples = duration_samples;
        info.duration_ms = duration_ms;
        info.bitrate = u32::try_from(
            u64::from(self.params.sample_rate).saturating_mul(frame_len).saturating_mul(8),
        )
        .unwrap_or(0);

        self.core.set_duration_ms(duration_ms);
        self.consumed = 0;
        self.info = Some(info);
        self.core.set_parsed();
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.info.iter().cloned().collect()
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.read_chunk_of(0)
    }

    fn read_chunk_of(&mut self, stream_id: u32) -> Result<MediaChunk> {
        self.core.ensure_parsed(self.name())?;
        if stream_id != 0 {
            return Err(Error::invalid_argument(format!(
                "raw: unknown stream id {stream_id}"
            )));
        }

        let frame_len = self.frame_len().max(1);
        let frames_per_slab = (SLAB_LEN as u64 / frame_len).max(1);
        let want = (frames_per_slab * frame_len) as usize;

        let mut data = vec![0u8; want];
        let mut filled = 0usize;
        while filled < data.len() {
            let n = self.core.src().read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled - filled % frame_len as usize);

        if data.is_empty() {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        }

        let timestamp = self.consumed / frame_len;
        self.consumed += data.len() as u64;
        let end_timestamp = self.consumed / frame_len;
        self.core.set_position_ms(
            timestamp.saturating_mul(1000) / u64::from(self.params.sample_rate),
        );

        Ok(MediaChunk {
            stream_id,
            data,
            timestamp_samples: timestamp,
            end_timestamp_samples: Some(end_timestamp),
            is_keyframe: true,
        })
    }

    fn seek_to(&mut self, timestamp_ms: u64) -> Result<()> {
        self.core.ensure_parsed(self.name())?;
        let frame_len = self.frame_len().max(1);
        let target_frame =
            timestamp_ms.saturating_mul(u64::from(self.params.sample_rate)) / 1000;
        let offset = target_frame * frame_len;

        self.core
            .src()
            .seek(SeekFrom::Start(self.data_start + offset))?;
        self.consumed = offset;
        self.core.set_eof(false);
        self.core.set_position_ms(
            target_frame.saturating_mul(1000) / u64::from(self.params.sample_rate),
        );
        Ok(())
    }

    fn duration_ms(&self) -> u64 {
        self.core.duration_ms()
    }

    fn position_ms(&self) -> u64 {
        self.core.position_ms()
    }

    fn is_eof(&self) -> bool {
        self.core.is_eof()
    }

    fn last_error(&self) -> Option<(crate::error::ErrorKind, String)> {
        self.core.last_error()
    }

    fn tag(&self) -> &dyn Tag {
        &crate::demux::NULL_TAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CancelToken;
    use crate::source::FileByteSource;
    use std::io::Write;

    fn open_demuxer_on(
        bytes: &[u8],
        suffix: &str,
        options: &OpenOptions,
    ) -> (RawDemuxer, tempfile::NamedTempFile) {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(bytes).expect("write fixture");
        let src = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open source");
        (
            RawDemuxer::from_options(Box::new(src), options).expect("params"),
            file,
        )
    }

    #[test]
    fn extension_defaults_cover_telephony() {
        let ulaw = params_for_extension("capture.ulaw").expect("params");
        assert_eq!(ulaw.sample_rate, 8_000);
        assert_eq!(ulaw.channels, 1);
        assert!(matches!(ulaw.codec, RawCodec::Ulaw));

        let pcm = params_for_extension("take.pcm").expect("params");
        assert_eq!(pcm.sample_rate, 44_100);
        assert_eq!(pcm.channels, 2);

        assert!(params_for_extension("cover.jpg").is_none());
    }

    #[test]
    fn running_sample_counts_and_exact_seek() {
        let bytes = vec![0u8; 16_000];
        let (mut demuxer, _file) =
            open_demuxer_on(&bytes, ".ulaw", &OpenOptions::default());
        demuxer.parse_container().expect("parse");

        assert_eq!(demuxer.duration_ms(), 2_000);

        demuxer.seek_to(1_000).expect("seek");
        let chunk = demuxer.read_chunk().expect("chunk");
        assert_eq!(chunk.timestamp_samples, 8_000);
        assert_eq!(demuxer.position_ms(), 1_000);
    }

    #[test]
    fn au_header_overrides_extension_defaults() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b".snd");
        bytes.extend_from_slice(&28u32.to_be_bytes()); // data offset
        bytes.extend_from_slice(&8u32.to_be_bytes()); // data size
        bytes.extend_from_slice(&3u32.to_be_bytes()); // encoding: s16be
        bytes.extend_from_slice(&16_000u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes()); // channels
        bytes.extend_from_slice(&[0u8; 4]); // annotation
        bytes.extend_from_slice(&[1u8; 8]); // two stereo frames

        let (mut demuxer, _file) = open_demuxer_on(&bytes, ".au", &OpenOptions::default());
        demuxer.parse_container().expect("parse");

        let streams = demuxer.streams();
        assert_eq!(streams[0].codec_name, "pcm_s16be");
        assert_eq!(streams[0].sample_rate, 16_000);
        assert_eq!(streams[0].channels, 2);
        assert_eq!(streams[0].duration_samples, 2);
    }

    #[test]
    fn explicit_params_win_over_extension() {
        let params = RawParams {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            codec: RawCodec::SignedLe,
        };
        let options = OpenOptions {
            raw_params: Some(params),
            ..OpenOptions::default()
        };
        let (mut demuxer, _file) = open_demuxer_on(&vec![0u8; 44_100], ".raw", &options);
        demuxer.parse_container().expect("parse");
        assert_eq!(demuxer.streams()[0].sample_rate, 22_050);
        assert_eq!(demuxer.duration_ms(), 1_000);
    }
}
