//! RIFF/WAVE demuxer.
//!
//! Walks the canonical chunk hierarchy (`RIFF` → `WAVE` → `fmt `, `data`,
//! optional `LIST/INFO` and `id3 `), exposes a single audio stream and
//! emits fixed-size slabs from the `data` chunk with monotonic running
//! sample counts. Supported sample formats: linear PCM 8/16/24/32 LE, IEEE
//! float 32/64, A-law, µ-law and the IMA/MS ADPCM variants.
//!
//! Seeking is exact: positions land on a block-aligned sample boundary.

use std::io::SeekFrom;

use crate::{
    config::OpenOptions,
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{Error, Result},
    source::ByteSource,
    tag::{parse_id3v2, StandardTag, Tag},
};

/// WAVE format tags this demuxer understands.
const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_ADPCM_MS: u16 = 0x0002;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_ALAW: u16 = 0x0006;
const WAVE_FORMAT_ULAW: u16 = 0x0007;
const WAVE_FORMAT_ADPCM_IMA: u16 = 0x0011;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Target payload size of an emitted slab, rounded to whole blocks.
const SLAB_LEN: usize = 32 * 1024;

/// Parsed `fmt ` chunk.
#[derive(Clone, Debug)]
pub(crate) struct WavFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// The raw chunk bytes, forwarded as codec-private data so block-based
    /// codecs can read their layout fields.
    pub raw: Vec<u8>,
}

impl WavFormat {
    fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 16 {
            return Err(Error::truncated_header("riff: fmt chunk too short"));
        }
        let mut format_tag = u16::from_le_bytes([raw[0], raw[1]]);
        let channels = u16::from_le_bytes([raw[2], raw[3]]);
        let sample_rate = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let block_align = u16::from_le_bytes([raw[12], raw[13]]);
        let bits_per_sample = u16::from_le_bytes([raw[14], raw[15]]);

        if format_tag == WAVE_FORMAT_EXTENSIBLE {
            // The subformat GUID's first two bytes carry the real tag.
            if raw.len() < 26 {
                return Err(Error::truncated_header(
                    "riff: extensible fmt chunk too short",
                ));
            }
            format_tag = u16::from_le_bytes([raw[24], raw[25]]);
        }

        if channels == 0 || sample_rate == 0 {
            return Err(Error::corrupt_frame(
                "riff: zero channels or sample rate in fmt chunk",
            ));
        }

        Ok(Self {
            format_tag,
            channels,
            sample_rate,
            block_align,
            bits_per_sample,
            raw,
        })
    }

    /// Lowercase codec token for this format.
    fn codec_name(&self) -> Result<&'static str> {
        let name = match self.format_tag {
            WAVE_FORMAT_PCM => match self.bits_per_sample {
                8 => "pcm_u8",
                16 => "pcm_s16le",
                24 => "pcm_s24le",
                32 => "pcm_s32le",
                other => {
                    return Err(Error::unsupported_variant(format!(
                        "riff: {other}-bit pcm"
                    )))
                }
            },
            WAVE_FORMAT_IEEE_FLOAT => match self.bits_per_sample {
                32 => "pcm_f32le",
                64 => "pcm_f64le",
                other => {
                    return Err(Error::unsupported_variant(format!(
                        "riff: {other}-bit float"
                    )))
                }
            },
            WAVE_FORMAT_ALAW => "alaw",
            WAVE_FORMAT_ULAW => "ulaw",
            WAVE_FORMAT_ADPCM_MS => "adpcm_ms",
            WAVE_FORMAT_ADPCM_IMA => "adpcm_ima",
            other => {
                return Err(Error::unsupported_variant(format!(
                    "riff: unknown format tag {other:#06x}"
                )))
            }
        };
        Ok(name)
    }

    /// Samples per channel carried by one block (`block_align` bytes).
    pub(crate) fn samples_per_block(&self) -> u64 {
        let channels = u64::from(self.channels);
        let block = u64::from(self.block_align);
        match self.format_tag {
            WAVE_FORMAT_ADPCM_IMA => {
                // 4-byte preamble per channel, then 4-bit deltas.
                ((block - 4 * channels) * 2) / channels + 1
            }
            WAVE_FORMAT_ADPCM_MS => {
                // 7-byte preamble per channel holds two full samples.
                ((block - 7 * channels) * 2) / channels + 2
            }
            _ => {
                if block == 0 {
                    0
                } else {
                    1
                }
            }
        }
    }
}

/// Mapping from `LIST/INFO` ids to tag fields.
fn apply_info_entry(tag: &mut StandardTag, id: [u8; 4], value: String) {
    match &id {
        b"INAM" => tag.title = Some(value),
        b"IART" => tag.artist = Some(value),
        b"IPRD" => tag.album = Some(value),
        b"IGNR" => tag.genre = Some(value),
        b"ICRD" => {
            tag.year = value
                .chars()
                .take(4)
                .collect::<String>()
                .parse()
                .ok();
        }
        b"ITRK" | b"IPRT" => tag.track = value.trim().parse().ok(),
        b"ICMT" => tag.comment = Some(value),
        _ => {}
    }
}

/// RIFF/WAVE demuxer.
pub struct RiffDemuxer {
    core: DemuxerCore,
    format: Option<WavFormat>,
    info: Option<StreamInfo>,
    tag: StandardTag,
    /// Byte extent of the `data` chunk.
    data_start: u64,
    data_len: u64,
    /// Bytes of the data chunk consumed so far.
    consumed: u64,
}

impl RiffDemuxer {
    /// Creates a demuxer over `src`. Call `parse_container` next.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            format: None,
            info: None,
            tag: StandardTag::default(),
            data_start: 0,
            data_len: 0,
            consumed: 0,
        }
    }

    fn format(&self) -> Result<&WavFormat> {
        self.format
            .as_ref()
            .ok_or_else(|| Error::invalid_state("riff: read before parse_container"))
    }

    /// Samples per channel represented by `bytes` of payload.
    fn bytes_to_samples(format: &WavFormat, bytes: u64) -> u64 {
        let block = u64::from(format.block_align.max(1));
        (bytes / block) * format.samples_per_block()
    }

    fn parse_list_info(&mut self, chunk_len: u64) -> Result<()> {
        let mut remaining = chunk_len;
        let kind = self.core.read_fourcc()?;
        remaining -= 4;
        if &kind != b"INFO" {
            self.core.skip_bytes(remaining)?;
            return Ok(());
        }

        while remaining >= 8 {
            let id = self.core.read_fourcc()?;
            let len = u64::from(self.core.read_u32_le()?);
            remaining -= 8;
            if len > remaining {
                break;
            }
            let body = self.core.read_bytes(len as usize)?;
            let value = String::from_utf8_lossy(&body)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if !value.is_empty() {
                apply_info_entry(&mut self.tag, id, value);
            }
            remaining -= len;
            if len % 2 == 1 && remaining > 0 {
                self.core.skip_bytes(1)?;
                remaining -= 1;
            }
        }
        if remaining > 0 {
            self.core.skip_bytes(remaining)?;
        }
        Ok(())
    }
}

impl Demuxer for RiffDemuxer {
    fn name(&self) -> &'static str {
        "riff"
    }

    fn parse_container(&mut self) -> Result<()> {
        let riff = self.core.read_fourcc().map_err(|err| {
            self.core
                .record_error(Error::bad_magic(format!("riff: {err}")))
        })?;
        let declared_len = u64::from(self.core.read_u32_le()?);
        let wave = self.core.read_fourcc()?;
        if &riff != b"RIFF" || &wave != b"WAVE" {
            return Err(self
                .core
                .record_error(Error::bad_magic("riff: missing RIFF/WAVE signature")));
        }
        if let Some(size) = self.core.src().size() {
            if declared_len.saturating_add(8) > size {
                debug!("riff: declared length {declared_len} exceeds file, clamping");
            }
        }

        // Chunk walk; `data` may precede metadata chunks, so remember its
        // extent and keep going.
        loop {
            let id = match self.core.read_fourcc() {
                Ok(id) => id,
                Err(_) => break, // clean end of chunk list
            };
            let len = u64::from(self.core.read_u32_le()?);

            match &id {
                b"fmt " => {
                    let raw = self.core.read_bytes(len as usize)?;
                    self.format = Some(WavFormat::parse(raw)?);
                }
                b"data" => {
                    self.data_start = self.core.src().tell();
                    self.data_len = len;
                    if let Some(size) = self.core.src().size() {
                        let available = size.saturating_sub(self.data_start);
                        if self.data_len > available {
                            debug!("riff: data chunk truncated by file end");
                            self.data_len = available;
                        }
                    }
                    self.core.skip_bytes(self.data_len)?;
                }
                b"LIST" => self.parse_list_info(len)?,
                b"id3 " | b"ID3 " => {
                    let body = self.core.read_bytes(len as usize)?;
                    match parse_id3v2(&body) {
                        Ok(id3) => {
                            // INFO entries win over ID3 duplicates only
                            // when already present.
                            if self.tag.is_empty() {
                                self.tag = id3;
                            }
                        }
                        Err(err) => debug!("riff: unreadable id3 chunk: {err}"),
                    }
                }
                _ => self.core.skip_bytes(len)?,
            }

            // Chunks are word-aligned.
            if len % 2 == 1 {
                let _ = self.core.skip_bytes(1);
            }
        }

        let format = self
            .format
            .clone()
            .ok_or_else(|| self.core.record_error(Error::truncated_header("riff: no fmt chunk")))?;
        if self.data_len == 0 {
            return Err(self
                .core
                .record_error(Error::truncated_header("riff: no data chunk")));
        }

        let codec_name = format.codec_name().map_err(|err| self.core.record_error(err))?;
        let duration_samples = Self::bytes_to_samples(&format, self.data_len);
        let duration_ms =
            duration_samples.saturating_mul(1000) / u64::from(format.sample_rate);

        let mut info = StreamInfo::audio(0, codec_name);
        info.sample_rate = format.sample_rate;
        info.channels = format.channels;
        info.bits_per_sample = format.bits_per_sample;
        info.duration_samples = duration_samples;
        info.duration_ms = duration_ms;
        info.bitrate = format
            .sample_rate
            .saturating_mul(u32::from(format.block_align))
            .saturating_mul(8)
            / format.samples_per_block().max(1) as u32;
        info.codec_private = format.raw.clone();
        info.tags = self.tag.clone();

        self.core.set_duration_ms(duration_ms);
        self.core.src().seek(SeekFrom::Start(self.data_start))?;
        self.consumed = 0;
        self.format = Some(format);
        self.info = Some(info);
        self.core.set_parsed();

        debug!(
            "riff: {codec_name}, {} Hz, {} ch, {duration_samples} samples",
            self.format.as_ref().map_or(0, |f| f.sample_rate),
            self.format.as_ref().map_or(0, |f| f.channels),
        );
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
                "riff: unknown stream id {stream_id}"
            )));
        }
        let format = self.format()?.clone();

        let remaining = self.data_len.saturating_sub(self.consumed);
        if remaining == 0 {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        }

        let block = u64::from(format.block_align.max(1));
        let blocks_per_slab = (SLAB_LEN as u64 / block).max(1);
        let want = (blocks_per_slab * block).min(remaining);
        // Trailing partial block: emit as-is, the codec tolerates it.
        let data = {
            let mut buf = vec![0u8; want as usize];
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = self.core.src().read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            buf
        };
        if data.is_empty() {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        }

        let timestamp = Self::bytes_to_samples(&format, self.consumed);
        self.consumed += data.len() as u64;
        let end_timestamp = Self::bytes_to_samples(&format, self.consumed);
        self.core
            .set_position_ms(timestamp.saturating_mul(1000) / u64::from(format.sample_rate));

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
        let format = self.format()?.clone();

        let target_sample =
            timestamp_ms.saturating_mul(u64::from(format.sample_rate)) / 1000;
        let samples_per_block = format.samples_per_block().max(1);
        let block_index = target_sample / samples_per_block;
        let offset = (block_index * u64::from(format.block_align)).min(self.data_len);

        self.core
            .src()
            .seek(SeekFrom::Start(self.data_start + offset))?;
        self.consumed = offset;
        self.core.set_eof(false);
        let landed = block_index * samples_per_block;
        self.core
            .set_position_ms(landed.saturating_mul(1000) / u64::from(format.sample_rate));
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
        &self.tag
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::CancelToken;
    use crate::source::FileByteSource;
    use std::io::Write;

    /// Builds a minimal WAVE file around the given PCM payload.
    pub(crate) fn wav_bytes(
        format_tag: u16,
        channels: u16,
        sample_rate: u32,
        bits: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let byte_rate = sample_rate * u32::from(block_align);

        let mut fmt = Vec::new();
        fmt.extend_from_slice(&format_tag.to_le_bytes());
        fmt.extend_from_slice(&channels.to_le_bytes());
        fmt.extend_from_slice(&sample_rate.to_le_bytes());
        fmt.extend_from_slice(&byte_rate.to_le_bytes());
        fmt.extend_from_slice(&block_align.to_le_bytes());
        fmt.extend_from_slice(&bits.to_le_bytes());

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        let riff_len = 4 + 8 + fmt.len() + 8 + payload.len();
        bytes.extend_from_slice(&(riff_len as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&(fmt.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&fmt);
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    pub(crate) fn open_demuxer_on(bytes: &[u8]) -> (RiffDemuxer, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        let src = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open source");
        (
            RiffDemuxer::new(Box::new(src), &OpenOptions::default()),
            file,
        )
    }

    #[test]
    fn parses_pcm_fmt() {
        let payload: Vec<u8> = (0..(44_100u32 * 2 * 2))
            .map(|index| (index & 0xFF) as u8)
            .collect();
        let (mut demuxer, _file) = open_demuxer_on(&wav_bytes(1, 2, 44_100, 16, &payload));
        demuxer.parse_container().expect("parse");

        let streams = demuxer.streams();
        assert_eq!(streams[0].codec_name, "pcm_s16le");
        assert_eq!(streams[0].sample_rate, 44_100);
        assert_eq!(streams[0].channels, 2);
        assert_eq!(streams[0].duration_samples, 44_100);
        assert_eq!(streams[0].duration_ms, 1000);
    }

    #[test]
    fn chunks_are_block_aligned_with_running_timestamps() {
        let payload = vec![0u8; 100_000];
        let (mut demuxer, _file) = open_demuxer_on(&wav_bytes(1, 2, 48_000, 16, &payload));
        demuxer.parse_container().expect("parse");

        let mut expected_sample = 0u64;
        loop {
            let chunk = demuxer.read_chunk().expect("chunk");
            if chunk.is_end_of_stream() {
                break;
            }
            assert_eq!(chunk.timestamp_samples, expected_sample);
            assert_eq!(chunk.data.len() % 4, 0, "whole frames only");
            expected_sample += chunk.data.len() as u64 / 4;
        }
        assert_eq!(expected_sample, 25_000);
    }

    #[test]
    fn seek_is_sample_exact() {
        let payload = vec![0u8; 48_000 * 4];
        let (mut demuxer, _file) = open_demuxer_on(&wav_bytes(1, 2, 48_000, 16, &payload));
        demuxer.parse_container().expect("parse");

        demuxer.seek_to(500).expect("seek");
        let chunk = demuxer.read_chunk().expect("chunk");
        assert_eq!(chunk.timestamp_samples, 24_000);
        assert_eq!(demuxer.position_ms(), 500);
    }

    #[test]
    fn list_info_tags_surface() {
        let mut bytes = wav_bytes(1, 1, 8_000, 16, &[0u8; 16]);
        // Append a LIST/INFO chunk with INAM and IART.
        let mut list = Vec::new();
        list.extend_from_slice(b"INFO");
        for (id, value) in [(b"INAM", b"Name\0" as &[u8]), (b"IART", b"Arty\0")] {
            list.extend_from_slice(id);
            list.extend_from_slice(&(value.len() as u32).to_le_bytes());
            list.extend_from_slice(value);
            if value.len() % 2 == 1 {
                list.push(0);
            }
        }
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&(list.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&list);

        let (mut demuxer, _file) = open_demuxer_on(&bytes);
        demuxer.parse_container().expect("parse");
        assert_eq!(demuxer.tag().title(), Some("Name"));
        assert_eq!(demuxer.tag().artist(), Some("Arty"));
    }

    #[test]
    fn unknown_format_tag_is_unsupported_variant() {
        let (mut demuxer, _file) = open_demuxer_on(&wav_bytes(0x1234, 2, 44_100, 16, &[0u8; 64]));
        let err = demuxer.parse_container().expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::UnsupportedVariant);
    }
}
