//! Native FLAC demuxer.
//!
//! Parses the `fLaC` marker and metadata blocks (STREAMINFO mandatory;
//! SEEKTABLE, VORBIS_COMMENT and PICTURE when present), then frames located
//! by the 14-bit sync code. Frame headers are parsed bit-exactly and
//! validated with their CRC-8 so sync scanning does not bite on payload
//! bytes that merely look like a sync.
//!
//! Seeking binary-searches the SEEKTABLE when the encoder wrote one and
//! falls back to byte bisection with in-file sync scanning otherwise.

use std::io::SeekFrom;

use crate::{
    config::OpenOptions,
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{Error, Result},
    source::ByteSource,
    tag::{parse_flac_picture, parse_vorbis_comments, StandardTag, Tag},
};

/// Stream marker.
const MARKER: [u8; 4] = *b"fLaC";

/// Metadata block types this demuxer interprets.
const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_SEEKTABLE: u8 = 3;
const BLOCK_VORBIS_COMMENT: u8 = 4;
const BLOCK_PICTURE: u8 = 6;

/// Placeholder seek point sample number.
const SEEKPOINT_PLACEHOLDER: u64 = u64::MAX;

/// Read-ahead granule for the frame scanner.
const SCAN_CHUNK: usize = 64 * 1024;

/// Longest legal frame header: sync + descriptors + 7-byte coded number +
/// 2 + 2 optional size/rate bytes + CRC-8.
const MAX_FRAME_HEADER_LEN: usize = 16;

/// Bit-exact STREAMINFO fields.
///
/// Shared with the Ogg demuxer for FLAC-in-Ogg mapping headers.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfoBlock {
    /// Minimum block size in samples.
    pub min_block_size: u16,
    /// Maximum block size in samples; equal to the minimum for
    /// fixed-blocksize streams.
    pub max_block_size: u16,
    /// Sample rate in Hz (20 bits).
    pub sample_rate: u32,
    /// Channel count (3 bits, stored minus one).
    pub channels: u16,
    /// Bits per sample (5 bits, stored minus one).
    pub bits_per_sample: u16,
    /// Total samples per channel (36 bits); 0 means unknown.
    pub total_samples: u64,
    /// MD5 of the unencoded audio.
    pub md5: [u8; 16],
}

impl StreamInfoBlock {
    /// Parses the 34-byte STREAMINFO block body.
    ///
    /// # Errors
    ///
    /// `TruncatedHeader` when fewer than 34 bytes are supplied.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 34 {
            return Err(Error::truncated_header("flac: STREAMINFO too short"));
        }

        let min_block_size = u16::from_be_bytes([data[0], data[1]]);
        let max_block_size = u16::from_be_bytes([data[2], data[3]]);
        // Skip min/max frame size (2 × 24 bits), then the packed fields:
        // 20-bit sample rate, 3-bit channels, 5-bit bps, 36-bit total.
        let packed = u64::from_be_bytes([
            data[10], data[11], data[12], data[13], data[14], data[15], data[16], data[17],
        ]);
        let sample_rate = (packed >> 44) as u32;
        let channels = ((packed >> 41) & 0x7) as u16 + 1;
        let bits_per_sample = ((packed >> 36) & 0x1F) as u16 + 1;
        let total_samples = packed & 0xF_FFFF_FFFF;

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&data[18..34]);

        Ok(Self {
            min_block_size,
            max_block_size,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            md5,
        })
    }

    /// Whether every frame carries the same block size.
    #[must_use]
    pub fn is_fixed_blocksize(&self) -> bool {
        self.min_block_size == self.max_block_size && self.min_block_size != 0
    }
}

/// One SEEKTABLE entry.
#[derive(Clone, Copy, Debug)]
struct SeekPoint {
    sample: u64,
    /// Byte offset from the first frame.
    offset: u64,
}

/// A parsed frame header.
#[derive(Clone, Copy, Debug)]
struct FrameHeader {
    /// Sample index (variable blocksize) or frame index (fixed).
    coded_number: u64,
    variable_blocksize: bool,
    block_size: u32,
    header_len: usize,
}

/// CRC-8 with polynomial 0x07 over FLAC frame headers.
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decodes the UTF-8-style coded frame/sample number (up to 36 bits).
fn decode_coded_number(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    let extra = match first {
        0x00..=0x7F => return Some((u64::from(first), 1)),
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        0xF8..=0xFB => 4,
        0xFC..=0xFD => 5,
        0xFE => 6,
        _ => return None,
    };
    let mut value = u64::from(first & (0x7F >> (extra + 1)));
    for index in 1..=extra {
        let byte = *data.get(index)?;
        if byte & 0xC0 != 0x80 {
            return None;
        }
        value = (value << 6) | u64::from(byte & 0x3F);
    }
    Some((value, extra + 1))
}

/// Attempts to parse a frame header at the start of `data`.
///
/// Returns `None` when the bytes are not a plausible, CRC-clean header.
fn parse_frame_header(data: &[u8], streaminfo: &StreamInfoBlock) -> Option<FrameHeader> {
    if data.len() < 5 || data[0] != 0xFF || data[1] & 0xFC != 0xF8 {
        return None;
    }
    let variable_blocksize = data[1] & 0x01 != 0;

    let block_size_bits = data[2] >> 4;
    let sample_rate_bits = data[2] & 0x0F;
    if block_size_bits == 0 || sample_rate_bits == 0x0F {
        return None;
    }
    let channel_bits = data[3] >> 4;
    if channel_bits >= 0x0B {
        return None;
    }
    let sample_size_bits = (data[3] >> 1) & 0x7;
    if sample_size_bits == 0b011 || data[3] & 0x01 != 0 {
        return None;
    }

    let mut cursor = 4usize;
    let (coded_number, coded_len) = decode_coded_number(&data[cursor..])?;
    cursor += coded_len;

    let block_size = match block_size_bits {
        0b0001 => 192,
        bits @ 0b0010..=0b0101 => 576 << (bits - 2),
        0b0110 => {
            let byte = *data.get(cursor)?;
            cursor += 1;
            u32::from(byte) + 1
        }
        0b0111 => {
            let high = *data.get(cursor)?;
            let low = *data.get(cursor + 1)?;
            cursor += 2;
            u32::from(u16::from_be_bytes([high, low])) + 1
        }
        bits => 256 << (bits - 8),
    };

    // Sample rate is validated for length only; the value comes from
    // STREAMINFO for decode purposes.
    match sample_rate_bits {
        0b1100 => cursor += 1,
        0b1101 | 0b1110 => cursor += 2,
        _ => {}
    }

    let crc_byte = *data.get(cursor)?;
    if crc8(&data[..cursor]) != crc_byte {
        return None;
    }
    cursor += 1;

    // A fixed-blocksize stream must not claim variable numbering midway.
    if streaminfo.is_fixed_blocksize() && variable_blocksize {
        return None;
    }

    Some(FrameHeader {
        coded_number,
        variable_blocksize,
        block_size,
        header_len: cursor,
    })
}

/// Native FLAC demuxer.
pub struct FlacDemuxer {
    core: DemuxerCore,
    streaminfo: Option<StreamInfoBlock>,
    seektable: Vec<SeekPoint>,
    tag: StandardTag,
    info: Option<StreamInfo>,
    /// Byte offset of the first audio frame.
    frames_start: u64,
    /// Scan buffer over the frame region.
    buffer: Vec<u8>,
    /// Absolute offset of `buffer[0]`.
    buffer_start: u64,
    /// Read cursor within `buffer`.
    buffer_pos: usize,
    /// Cap on scan buffer growth.
    buffer_limit: usize,
}

impl FlacDemuxer {
    /// Creates a demuxer over `src`. Call `parse_container` next.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            streaminfo: None,
            seektable: Vec::new(),
            tag: StandardTag::default(),
            info: None,
            frames_start: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_pos: 0,
            buffer_limit: options.max_memory_bytes_or_default(),
        }
    }

    fn streaminfo(&self) -> Result<&StreamInfoBlock> {
        self.streaminfo
            .as_ref()
            .ok_or_else(|| Error::invalid_state("flac: read before parse_container"))
    }

    /// Repositions the scan buffer at an absolute file offset.
    fn rebuffer_at(&mut self, offset: u64) -> Result<()> {
        self.core.src().seek(SeekFrom::Start(offset))?;
        self.buffer.clear();
        self.buffer_start = offset;
        self.buffer_pos = 0;
        Ok(())
    }

    /// Ensures at least `len` bytes are buffered past the cursor, stopping
    /// early at end of stream.
    fn fill(&mut self, len: usize) -> Result<()> {
        while self.buffer.len() - self.buffer_pos < len {
            if self.buffer.len() >= self.buffer_limit {
                debug!("flac: scan buffer hit the memory cap, treating as stream end");
                break;
            }
            let mut chunk = vec![0u8; SCAN_CHUNK];
            let n = self.core.src().read(&mut chunk)?;
            if n == 0 {
                break;
            }
            chunk.truncate(n);
            self.buffer.extend_from_slice(&chunk);
        }
        Ok(())
    }

    /// Drops consumed bytes so the scan buffer stays bounded. Must only be
    /// called between frames, never while scan indices are live.
    fn compact(&mut self) {
        if self.buffer_pos > SCAN_CHUNK * 4 {
            self.buffer.drain(..self.buffer_pos);
            self.buffer_start += self.buffer_pos as u64;
            self.buffer_pos = 0;
        }
    }

    /// Finds the next CRC-clean frame header at or after the cursor.
    ///
    /// Returns the buffer-relative offset and parsed header.
    fn next_frame_at_cursor(&mut self, skip: usize) -> Result<Option<(usize, FrameHeader)>> {
        let streaminfo = *self.streaminfo()?;
        let mut search = self.buffer_pos + skip;
        loop {
            self.fill(search - self.buffer_pos + MAX_FRAME_HEADER_LEN)?;
            if search + 2 > self.buffer.len() {
                return Ok(None);
            }

            match self.buffer[search..]
                .windows(2)
                .position(|pair| pair[0] == 0xFF && pair[1] & 0xFC == 0xF8)
            {
                Some(relative) => {
                    search += relative;
                    self.fill(search - self.buffer_pos + MAX_FRAME_HEADER_LEN)?;
                    if let Some(header) =
                        parse_frame_header(&self.buffer[search..], &streaminfo)
                    {
                        return Ok(Some((search, header)));
                    }
                    search += 1;
                }
                None => {
                    // Tail may hold a split sync pair; keep the final byte.
                    search = self.buffer.len().saturating_sub(1);
                    let before = self.buffer.len();
                    self.fill(before - self.buffer_pos + SCAN_CHUNK)?;
                    if self.buffer.len() == before {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// First sample index of a frame, from its header.
    fn frame_first_sample(header: &FrameHeader, streaminfo: &StreamInfoBlock) -> u64 {
        if header.variable_blocksize {
            header.coded_number
        } else {
            header.coded_number * u64::from(streaminfo.min_block_size)
        }
    }

    /// Reads SEEKTABLE entries.
    fn parse_seektable(&mut self, length: usize) -> Result<()> {
        let entries = length / 18;
        for _ in 0..entries {
            let sample = self.core.read_u64_be()?;
            let offset = self.core.read_u64_be()?;
            let _frame_samples = self.core.read_u16_be()?;
            if sample != SEEKPOINT_PLACEHOLDER {
                self.seektable.push(SeekPoint { sample, offset });
            }
        }
        // Trailing bytes of a malformed table.
        let remainder = (length % 18) as u64;
        if remainder > 0 {
            self.core.skip_bytes(remainder)?;
        }
        Ok(())
    }

    fn samples_to_ms(samples: u64, sample_rate: u32) -> u64 {
        samples.saturating_mul(1000) / u64::from(sample_rate.max(1))
    }

    /// Bisection seek for streams without a usable SEEKTABLE: narrow the
    /// byte range on the first frame number found after each probe point.
    fn bisect_frames(&mut self, target_sample: u64) -> Result<u64> {
        let streaminfo = *self.streaminfo()?;
        let size = self
            .core
            .src()
            .size()
            .ok_or_else(|| Error::invalid_argument("flac: cannot seek an unsized stream"))?;

        let mut lo = self.frames_start;
        let mut hi = size;
        let mut best = self.frames_start;

        while hi.saturating_sub(lo) > SCAN_CHUNK as u64 {
            let mid = lo + (hi - lo) / 2;
            self.rebuffer_at(mid)?;
            match self.next_frame_at_cursor(0)? {
                Some((offset, header)) => {
                    let sample = Self::frame_first_sample(&header, &streaminfo);
                    let absolute = self.buffer_start + offset as u64;
                    if sample <= target_sample {
                        best = absolute;
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                None => hi = mid,
            }
        }

        Ok(best)
    }
}

impl Demuxer for FlacDemuxer {
    fn name(&self) -> &'static str {
        "flac"
    }

    fn parse_container(&mut self) -> Result<()> {
        let marker = self.core.read_fourcc().map_err(|err| {
            self.core
                .record_error(Error::bad_magic(format!("flac: {err}")))
        })?;
        if marker != MARKER {
            return Err(self
                .core
                .record_error(Error::bad_magic("flac: missing fLaC stream marker")));
        }

        // Metadata block walk. STREAMINFO must come first per the format,
        // but parsing tolerates any order and only requires its presence.
        loop {
            let header = self.core.read_u8()?;
            let is_last = header & 0x80 != 0;
            let block_type = header & 0x7F;
            let length = self.core.read_u24_be()? as usize;

            match block_type {
                BLOCK_STREAMINFO => {
                    let body = self.core.read_bytes(length)?;
                    let parsed = StreamInfoBlock::parse(&body)?;
                    if parsed.sample_rate == 0 {
                        return Err(self.core.record_error(Error::unsupported_variant(
                            "flac: zero sample rate in STREAMINFO",
                        )));
                    }
                    self.streaminfo = Some(parsed);
                }
                BLOCK_SEEKTABLE => self.parse_seektable(length)?,
                BLOCK_VORBIS_COMMENT => {
                    let body = self.core.read_bytes(length)?;
                    match parse_vorbis_comments(&body) {
                        Ok((tag, _)) => self.tag = tag,
                        Err(err) => debug!("flac: unreadable vorbis comment: {err}"),
                    }
                }
                BLOCK_PICTURE => {
                    let body = self.core.read_bytes(length)?;
                    match parse_flac_picture(&body) {
                        Ok(picture) => self.tag.pictures.push(picture),
                        Err(err) => debug!("flac: unreadable picture block: {err}"),
                    }
                }
                _ => self.core.skip_bytes(length as u64)?,
            }

            if is_last {
                break;
            }
        }

        let streaminfo = *self.streaminfo.as_ref().ok_or_else(|| {
            self.core
                .record_error(Error::truncated_header("flac: no STREAMINFO block"))
        })?;

        self.frames_start = self.core.src().tell();
        self.buffer_start = self.frames_start;

        let mut info = StreamInfo::audio(0, "flac");
        info.sample_rate = streaminfo.sample_rate;
        info.channels = streaminfo.channels;
        info.bits_per_sample = streaminfo.bits_per_sample;
        info.duration_samples = streaminfo.total_samples;
        info.duration_ms = Self::samples_to_ms(streaminfo.total_samples, streaminfo.sample_rate);
        info.tags = self.tag.clone();
        // The codec initialises straight from the STREAMINFO image.
        info.codec_private = {
            let mut block = Vec::with_capacity(34);
            block.extend_from_slice(&streaminfo.min_block_size.to_be_bytes());
            block.extend_from_slice(&streaminfo.max_block_size.to_be_bytes());
            block.extend_from_slice(&[0u8; 6]); // frame size bounds unused
            let packed: u64 = (u64::from(streaminfo.sample_rate) << 44)
                | (u64::from(streaminfo.channels - 1) << 41)
                | (u64::from(streaminfo.bits_per_sample - 1) << 36)
                | streaminfo.total_samples;
            block.extend_from_slice(&packed.to_be_bytes());
            block.extend_from_slice(&streaminfo.md5);
            block
        };

        if let Some(size) = self.core.src().size() {
            let payload = size.saturating_sub(self.frames_start);
            if info.duration_ms > 0 {
                info.bitrate = u32::try_from(
                    payload.saturating_mul(8).saturating_mul(1000) / info.duration_ms.max(1),
                )
                .unwrap_or(0);
            }
        }

        self.core.set_duration_ms(info.duration_ms);
        self.info = Some(info);
        self.core.set_parsed();

        debug!(
            "flac: {} Hz, {} ch, {} bps, {} samples, {} seek points",
            streaminfo.sample_rate,
            streaminfo.channels,
            streaminfo.bits_per_sample,
            streaminfo.total_samples,
            self.seektable.len()
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
                "flac: unknown stream id {stream_id}"
            )));
        }
        let streaminfo = *self.streaminfo()?;
        self.compact();

        let Some((start, header)) = self.next_frame_at_cursor(0)? else {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        };

        // The frame ends where the next CRC-clean header begins (or at
        // end of stream).
        let skip_past = start - self.buffer_pos + header.header_len;
        let end = match self.next_frame_at_cursor(skip_past)? {
            Some((next_start, _)) => next_start,
            None => self.buffer.len(),
        };

        let data = self.buffer[start..end].to_vec();
        self.buffer_pos = end;

        let first_sample = Self::frame_first_sample(&header, &streaminfo);
        let position_ms = Self::samples_to_ms(first_sample, streaminfo.sample_rate);
        self.core.set_position_ms(position_ms);

        Ok(MediaChunk {
            stream_id,
            data,
            timestamp_samples: first_sample,
            end_timestamp_samples: Some(first_sample + u64::from(header.block_size)),
            is_keyframe: true,
        })
    }

    fn seek_to(&mut self, timestamp_ms: u64) -> Result<()> {
        self.core.ensure_parsed(self.name())?;
        let streaminfo = *self.streaminfo()?;
        let target_sample =
            timestamp_ms.saturating_mul(u64::from(streaminfo.sample_rate)) / 1000;

        let landing = if self.seektable.is_empty() {
            self.bisect_frames(target_sample)?
        } else {
            // Largest seek point at or below the target sample.
            let index = self
                .seektable
                .partition_point(|point| point.sample <= target_sample);
            let point = index
                .checked_sub(1)
                .map_or(SeekPoint { sample: 0, offset: 0 }, |i| self.seektable[i]);
            self.frames_start + point.offset
        };

        self.rebuffer_at(landing)?;

        // Forward-scan frame headers up to the target so the landing is
        // sample-accurate rather than seek-point-accurate.
        let streaminfo_copy = streaminfo;
        let mut landed_sample = 0;
        loop {
            let Some((start, header)) = self.next_frame_at_cursor(0)? else {
                break;
            };
            let first_sample = Self::frame_first_sample(&header, &streaminfo_copy);
            if first_sample + u64::from(header.block_size) > target_sample {
                self.buffer_pos = start;
                landed_sample = first_sample;
                break;
            }
            self.buffer_pos = start + header.header_len;
            landed_sample = first_sample;
        }

        self.core.set_eof(false);
        self.core
            .set_position_ms(Self::samples_to_ms(landed_sample, streaminfo.sample_rate));
        trace!("flac: seek to {timestamp_ms} ms landed at sample {landed_sample}");
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
mod tests {
    use super::*;
    use crate::config::CancelToken;
    use crate::source::FileByteSource;
    use std::io::Write;

    /// Encodes a STREAMINFO block body.
    fn streaminfo_bytes(
        block_size: u16,
        sample_rate: u32,
        channels: u16,
        bits: u16,
        total: u64,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&block_size.to_be_bytes());
        body.extend_from_slice(&block_size.to_be_bytes());
        body.extend_from_slice(&[0u8; 6]);
        let packed: u64 = (u64::from(sample_rate) << 44)
            | (u64::from(channels - 1) << 41)
            | (u64::from(bits - 1) << 36)
            | total;
        body.extend_from_slice(&packed.to_be_bytes());
        body.extend_from_slice(&[0u8; 16]);
        body
    }

    /// Builds a frame header (fixed blocksize, 4096) for frame `number`.
    fn frame_header(number: u64) -> Vec<u8> {
        let mut header = vec![0xFF, 0xF8];
        header.push(0xC0 | 0x09); // blocksize 4096, rate 44.1k
        header.push(0x10); // stereo, bps from streaminfo
        assert!(number < 0x80, "test helper supports single-byte numbers");
        header.push(number as u8);
        let crc = crc8(&header);
        header.push(crc);
        header
    }

    fn flac_file(frames: usize, with_comment: bool) -> tempfile::NamedTempFile {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MARKER);

        let streaminfo = streaminfo_bytes(4096, 44_100, 2, 16, frames as u64 * 4096);
        let comment_block = if with_comment {
            let vendor = b"phono";
            let comment = b"TITLE=Native";
            let mut body = Vec::new();
            body.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
            body.extend_from_slice(vendor);
            body.extend_from_slice(&1u32.to_le_bytes());
            body.extend_from_slice(&(comment.len() as u32).to_le_bytes());
            body.extend_from_slice(comment);
            Some(body)
        } else {
            None
        };

        let streaminfo_last = comment_block.is_none();
        bytes.push(if streaminfo_last { 0x80 } else { 0x00 });
        bytes.extend_from_slice(&(streaminfo.len() as u32).to_be_bytes()[1..]);
        bytes.extend_from_slice(&streaminfo);

        if let Some(body) = comment_block {
            bytes.push(0x80 | BLOCK_VORBIS_COMMENT);
            bytes.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
            bytes.extend_from_slice(&body);
        }

        for frame in 0..frames {
            bytes.extend_from_slice(&frame_header(frame as u64));
            // Payload bytes chosen to never contain a sync pattern.
            bytes.extend_from_slice(&[0x55; 32]);
        }
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&bytes).expect("write fixture");
        file
    }

    fn open_demuxer(file: &tempfile::NamedTempFile) -> FlacDemuxer {
        let src = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open source");
        FlacDemuxer::new(Box::new(src), &OpenOptions::default())
    }

    #[test]
    fn parses_streaminfo_exactly() {
        let file = flac_file(4, false);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        let streams = demuxer.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].sample_rate, 44_100);
        assert_eq!(streams[0].channels, 2);
        assert_eq!(streams[0].bits_per_sample, 16);
        assert_eq!(streams[0].duration_samples, 4 * 4096);
        assert_eq!(streams[0].codec_private.len(), 34);
    }

    #[test]
    fn vorbis_comment_surfaces_through_tag() {
        let file = flac_file(2, true);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");
        assert_eq!(demuxer.tag().title(), Some("Native"));
    }

    #[test]
    fn frames_carry_running_sample_counts() {
        let file = flac_file(3, false);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        for expected in 0..3u64 {
            let chunk = demuxer.read_chunk().expect("chunk");
            assert!(chunk.is_keyframe);
            assert_eq!(chunk.timestamp_samples, expected * 4096);
            assert_eq!(
                chunk.end_timestamp_samples,
                Some(expected * 4096 + 4096)
            );
        }
        let eof = demuxer.read_chunk().expect("eof chunk");
        assert!(eof.is_end_of_stream());
        assert!(demuxer.is_eof());
    }

    #[test]
    fn seek_lands_on_exact_frame() {
        let file = flac_file(8, false);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        // Frame 5 starts at sample 20480; ~464 ms into the stream.
        let target_ms = 20_480 * 1000 / 44_100;
        demuxer.seek_to(target_ms).expect("seek");
        let chunk = demuxer.read_chunk().expect("chunk");
        assert_eq!(chunk.timestamp_samples / 4096, 4);
    }

    #[test]
    fn corrupt_frame_header_is_skipped() {
        let file = flac_file(5, false);
        let mut bytes = std::fs::read(file.path()).expect("read fixture");
        // Flip a bit in the third frame's header so its CRC-8 fails.
        let frame_len = 6 + 32;
        let third_frame = bytes.len() - 3 * frame_len + 2;
        bytes[third_frame] ^= 0x10;
        let mut corrupted = tempfile::NamedTempFile::new().expect("temp file");
        corrupted.write_all(&bytes).expect("write");

        let mut demuxer = open_demuxer(&corrupted);
        demuxer.parse_container().expect("parse");

        let mut frames = 0;
        loop {
            let chunk = demuxer.read_chunk().expect("chunk");
            if chunk.is_end_of_stream() {
                break;
            }
            frames += 1;
        }
        // The damaged frame is folded into its predecessor, not fatal.
        assert_eq!(frames, 4);
    }

    #[test]
    fn missing_marker_is_bad_magic() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"not a flac stream").expect("write");
        let mut demuxer = open_demuxer(&file);
        let err = demuxer.parse_container().expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::BadMagic);
    }

    #[test]
    fn bad_streaminfo_crc_scan_does_not_panic() {
        // A file whose frame region is pure noise must yield EOF, not junk.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MARKER);
        let streaminfo = streaminfo_bytes(4096, 44_100, 2, 16, 0);
        bytes.push(0x80);
        bytes.extend_from_slice(&(streaminfo.len() as u32).to_be_bytes()[1..]);
        bytes.extend_from_slice(&streaminfo);
        bytes.extend_from_slice(&[0xAA; 256]);

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&bytes).expect("write");
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");
        let chunk = demuxer.read_chunk().expect("chunk");
        assert!(chunk.is_end_of_stream());
    }
}
