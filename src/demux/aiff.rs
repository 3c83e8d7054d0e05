//! AIFF / AIFF-C demuxer.
//!
//! Walks the `FORM` chunk hierarchy: `COMM` (with the 80-bit extended
//! sample rate), `SSND` for payload, and the NAME/AUTH/ANNO text chunks for
//! tags. AIFF-C compression types `NONE`, `sowt`, `fl32`/`FL32`, `fl64`,
//! `ulaw` and `alaw` are recognised; everything else is an unsupported
//! variant.
//!
//! Like the RIFF demuxer, payload is emitted as fixed-size slabs with
//! monotonic running sample counts and exact block-aligned seeking.

use std::io::SeekFrom;

use crate::{
    config::OpenOptions,
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{Error, Result},
    source::ByteSource,
    tag::{StandardTag, Tag},
};

/// Target payload size of an emitted slab, rounded to whole frames.
const SLAB_LEN: usize = 32 * 1024;

/// Decodes an 80-bit IEEE 754 extended-precision float (the `COMM` sample
/// rate field) to the nearest u32.
fn extended_to_u32(bytes: [u8; 10]) -> u32 {
    let sign_exponent = u16::from_be_bytes([bytes[0], bytes[1]]);
    let mantissa = u64::from_be_bytes([
        bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9],
    ]);
    if sign_exponent & 0x8000 != 0 || mantissa == 0 {
        return 0;
    }
    let exponent = i32::from(sign_exponent & 0x7FFF) - 16_383 - 63;
    // Sample rates fit comfortably; shift the integer mantissa into place.
    let value = match exponent {
        0 => mantissa,
        1..=63 => mantissa << exponent,
        -63..=-1 => mantissa >> (-exponent),
        _ => return 0,
    };
    u32::try_from(value).unwrap_or(0)
}

/// Parsed `COMM` chunk plus the AIFF-C compression type.
#[derive(Clone, Debug)]
struct CommChunk {
    channels: u16,
    num_frames: u32,
    bits_per_sample: u16,
    sample_rate: u32,
    compression: [u8; 4],
}

impl CommChunk {
    fn codec_name(&self) -> Result<&'static str> {
        let name = match &self.compression {
            b"NONE" => match self.bits_per_sample {
                8 => "pcm_s8",
                16 => "pcm_s16be",
                24 => "pcm_s24be",
                32 => "pcm_s32be",
                other => {
                    return Err(Error::unsupported_variant(format!(
                        "aiff: {other}-bit pcm"
                    )))
                }
            },
            b"sowt" => "pcm_s16le",
            b"fl32" | b"FL32" => "pcm_f32be",
            b"fl64" | b"FL64" => "pcm_f64be",
            b"ulaw" | b"ULAW" => "ulaw",
            b"alaw" | b"ALAW" => "alaw",
            other => {
                return Err(Error::unsupported_variant(format!(
                    "aiff: compression type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(name)
    }

    /// Bytes per frame of stored data.
    fn frame_len(&self) -> u64 {
        let stored_bits = match &self.compression {
            b"ulaw" | b"ULAW" | b"alaw" | b"ALAW" => 8,
            b"fl64" | b"FL64" => 64,
            _ => self.bits_per_sample,
        };
        u64::from(self.channels) * u64::from(stored_bits) / 8
    }
}

/// AIFF / AIFF-C demuxer.
pub struct AiffDemuxer {
    core: DemuxerCore,
    comm: Option<CommChunk>,
    info: Option<StreamInfo>,
    tag: StandardTag,
    /// Byte extent of the sound data inside `SSND`.
    data_start: u64,
    data_len: u64,
    consumed: u64,
}

impl AiffDemuxer {
    /// Creates a demuxer over `src`. Call `parse_container` next.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            comm: None,
            info: None,
            tag: StandardTag::default(),
            data_start: 0,
            data_len: 0,
            consumed: 0,
        }
    }

    fn comm(&self) -> Result<&CommChunk> {
        self.comm
            .as_ref()
            .ok_or_else(|| Error::invalid_state("aiff: read before parse_container"))
    }

    fn read_text_chunk(&self, len: u64) -> Result<String> {
        let body = self.core.read_bytes(len as usize)?;
        Ok(String::from_utf8_lossy(&body)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }
}

impl Demuxer for AiffDemuxer {
    fn name(&self) -> &'static str {
        "aiff"
    }

    fn parse_container(&mut self) -> Result<()> {
        let form = self.core.read_fourcc().map_err(|err| {
            self.core
                .record_error(Error::bad_magic(format!("aiff: {err}")))
        })?;
        let _form_len = self.core.read_u32_be()?;
        let kind = self.core.read_fourcc()?;
        let is_aifc = &kind == b"AIFC";
        if &form != b"FORM" || (&kind != b"AIFF" && !is_aifc) {
            return Err(self
                .core
                .record_error(Error::bad_magic("aiff: missing FORM/AIFF signature")));
        }

        loop {
            let id = match self.core.read_fourcc() {
                Ok(id) => id,
                Err(_) => break,
            };
            let len = u64::from(self.core.read_u32_be()?);

            match &id {
                b"COMM" => {
                    let body = self.core.read_bytes(len as usize)?;
                    if body.len() < 18 {
                        return Err(self
                            .core
                            .record_error(Error::truncated_header("aiff: COMM too short")));
                    }
                    let mut rate = [0u8; 10];
                    rate.copy_from_slice(&body[8..18]);
                    let compression = if is_aifc && body.len() >= 22 {
                        [body[18], body[19], body[20], body[21]]
                    } else {
                        *b"NONE"
                    };
                    let comm = CommChunk {
                        channels: u16::from_be_bytes([body[0], body[1]]),
                        num_frames: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
                        bits_per_sample: u16::from_be_bytes([body[6], body[7]]),
                        sample_rate: extended_to_u32(rate),
                        compression,
                    };
                    if comm.channels == 0 || comm.sample_rate == 0 {
                        return Err(self.core.record_error(Error::corrupt_frame(
                            "aiff: zero channels or sample rate in COMM",
                        )));
                    }
                    self.comm = Some(comm);
                }
                b"SSND" => {
                    let offset = u64::from(self.core.read_u32_be()?);
                    let _block_size = self.core.read_u32_be()?;
                    self.data_start = self.core.src().tell() + offset;
                    self.data_len = len.saturating_sub(8 + offset);
                    self.core.skip_bytes(len - 8)?;
                }
                b"NAME" => self.tag.title = Some(self.read_text_chunk(len)?),
                b"AUTH" => self.tag.artist = Some(self.read_text_chunk(len)?),
                b"ANNO" => self.tag.comment = Some(self.read_text_chunk(len)?),
                // Markers and instrument data carry nothing we surface.
                _ => self.core.skip_bytes(len)?,
            }

            if len % 2 == 1 {
                let _ = self.core.skip_bytes(1);
            }
        }

        let comm = self
            .comm
            .clone()
            .ok_or_else(|| self.core.record_error(Error::truncated_header("aiff: no COMM chunk")))?;
        if self.data_len == 0 {
            return Err(self
                .core
                .record_error(Error::truncated_header("aiff: no SSND chunk")));
        }

        let codec_name = comm.codec_name().map_err(|err| self.core.record_error(err))?;
        let frame_len = comm.frame_len().max(1);
        let frames_by_len = self.data_len / frame_len;
        let duration_samples = if comm.num_frames > 0 {
            u64::from(comm.num_frames).min(frames_by_len)
        } else {
            frames_by_len
        };
        let duration_ms = duration_samples.saturating_mul(1000) / u64::from(comm.sample_rate);

        let mut info = StreamInfo::audio(0, codec_name);
        info.sample_rate = comm.sample_rate;
        info.channels = comm.channels;
        info.bits_per_sample = comm.bits_per_sample;
        info.duration_samples = duration_samples;
        info.duration_ms = duration_ms;
        info.bitrate = u32::try_from(
            u64::from(comm.sample_rate).saturating_mul(frame_len).saturating_mul(8),
        )
        .unwrap_or(0);
        info.tags = self.tag.clone();

        self.core.set_duration_ms(duration_ms);
        self.core.src().seek(SeekFrom::Start(self.data_start))?;
        self.consumed = 0;
        self.info = Some(info);
        self.core.set_parsed();

        debug!(
            "aiff: {codec_name}, {} Hz, {} ch, {duration_samples} frames",
            comm.sample_rate, comm.channels
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
                "aiff: unknown stream id {stream_id}"
            )));
        }
        let frame_len = self.comm()?.frame_len().max(1);
        let sample_rate = self.comm()?.sample_rate;

        let remaining = self.data_len.saturating_sub(self.consumed);
        if remaining == 0 {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        }

        let frames_per_slab = (SLAB_LEN as u64 / frame_len).max(1);
        let want = (frames_per_slab * frame_len).min(remaining);
        let mut data = vec![0u8; want as usize];
        let mut filled = 0usize;
        while filled < data.len() {
            let n = self.core.src().read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        if data.is_empty() {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        }

        let timestamp = self.consumed / frame_len;
        self.consumed += data.len() as u64;
        let end_timestamp = self.consumed / frame_len;
        self.core
            .set_position_ms(timestamp.saturating_mul(1000) / u64::from(sample_rate));

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
        let comm = self.comm()?.clone();
        let frame_len = comm.frame_len().max(1);

        let target_frame = timestamp_ms.saturating_mul(u64::from(comm.sample_rate)) / 1000;
        let offset = (target_frame * frame_len).min(self.data_len);

        self.core
            .src()
            .seek(SeekFrom::Start(self.data_start + offset))?;
        self.consumed = offset;
        self.core.set_eof(false);
        self.core.set_position_ms(
            (offset / frame_len).saturating_mul(1000) / u64::from(comm.sample_rate),
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
        &self.tag
    }
}
