//! Ogg container demuxer (RFC 3533).
//!
//! Recognises Vorbis, Opus and FLAC-in-Ogg logical bitstreams. Pages are
//! CRC-checked and reassembled into packets that may span page boundaries;
//! the page granule position is the authoritative clock. Header packet
//! groups are collected during [`parse_container`](OggDemuxer::parse_container)
//! and emitted exactly once as the first chunks, with `timestamp_samples = 0`
//! and the keyframe flag set; they are not re-emitted after a seek.
//!
//! Seeking bisects the file by byte offset on page granules, then resets
//! the page-sync state so partial buffered bytes are discarded. A new BOS
//! page mid-file (chained stream) rebinds the primary stream and surfaces
//! fresh header chunks so the consumer reinitialises its codec.

use std::{collections::VecDeque, io::SeekFrom};

use crate::{
    config::OpenOptions,
    demux::{flac::StreamInfoBlock, Demuxer, DemuxerCore, MediaChunk, StreamInfo, TIMESTAMP_UNKNOWN},
    error::{Error, Result},
    source::ByteSource,
    tag::{parse_vorbis_comments, StandardTag, Tag},
};

/// Page capture pattern.
const CAPTURE: [u8; 4] = *b"OggS";

/// Largest legal page: 27-byte header, 255 lacing values, 255×255 body.
const MAX_PAGE_LEN: u64 = 65_307;

/// Bound on queued packets per logical stream.
const MAX_QUEUED_PACKETS: usize = 100;

/// Bytes scanned from the file tail when locating the final granule.
const TAIL_SCAN_LEN: u64 = 128 * 1024;

/// Page header flag bits.
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

/// CRC-32 with polynomial 0x04C11DB7, no reflection, zero init and xorout,
/// as required for Ogg page checksums.
const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut crc = (index as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[index] = crc;
        index += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

fn crc32_ogg(data: &[u8], mut crc: u32) -> u32 {
    for byte in data {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize];
    }
    crc
}

/// One parsed page.
struct Page {
    flags: u8,
    /// Granule position; `None` when the page carries the -1 sentinel.
    granule: Option<u64>,
    serial: u32,
    sequence: u32,
    lacing: Vec<u8>,
    body: Vec<u8>,
}

/// Codec carried by a logical bitstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OggCodec {
    Vorbis,
    Opus,
    Flac,
    Unknown,
}

impl OggCodec {
    fn identify(first_packet: &[u8]) -> Self {
        if first_packet.starts_with(b"\x01vorbis") {
            Self::Vorbis
        } else if first_packet.starts_with(b"OpusHead") {
            Self::Opus
        } else if first_packet.starts_with(b"\x7FFLAC") {
            Self::Flac
        } else {
            Self::Unknown
        }
    }

    fn token(self) -> &'static str {
        match self {
            Self::Vorbis => "vorbis",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Unknown => "unknown",
        }
    }
}

/// A fully reassembled packet with the granule of the page that ended it.
struct OggPacket {
    data: Vec<u8>,
    granule: Option<u64>,
}

/// Per-serial demultiplexing state.
struct LogicalStream {
    serial: u32,
    stream_id: u32,
    codec: OggCodec,
    info: StreamInfo,
    /// Header packet group collected at parse time.
    header_packets: Vec<Vec<u8>>,
    headers_needed: usize,
    headers_complete: bool,
    /// Packet under reassembly across pages.
    partial: Vec<u8>,
    /// Set after a hole; continued data is dropped until a packet boundary.
    drop_continued: bool,
    queue: VecDeque<OggPacket>,
    last_sequence: Option<u32>,
    ended: bool,
}

impl LogicalStream {
    fn new(serial: u32, stream_id: u32) -> Self {
        Self {
            serial,
            stream_id,
            codec: OggCodec::Unknown,
            info: StreamInfo::audio(stream_id, "unknown"),
            header_packets: Vec::new(),
            headers_needed: 1,
            headers_complete: false,
            partial: Vec::new(),
            drop_continued: false,
            queue: VecDeque::new(),
            last_sequence: None,
            ended: false,
        }
    }

    /// Discards reassembly and queued packets, keeping header state.
    fn reset_packet_state(&mut self) {
        self.partial.clear();
        self.drop_continued = false;
        self.queue.clear();
        self.ended = false;
        self.last_sequence = None;
    }

    /// Folds one page into the packet queue.
    fn ingest(&mut self, page: &Page) {
        if let Some(last) = self.last_sequence {
            if page.sequence != last.wrapping_add(1) {
                // Missing page: drop any packet under reassembly.
                debug!(
                    "ogg: hole in stream {:#x} (page {} after {})",
                    self.serial, page.sequence, last
                );
                self.partial.clear();
                self.drop_continued = page.flags & FLAG_CONTINUED != 0;
            }
        }
        self.last_sequence = Some(page.sequence);

        if page.flags & FLAG_CONTINUED == 0 {
            self.drop_continued = false;
        } else if self.partial.is_empty() && !self.drop_continued {
            // Continuation without a packet in progress (post-seek entry).
            self.drop_continued = true;
        }

        let mut offset = 0usize;
        let segment_count = page.lacing.len();
        for (index, &lacing) in page.lacing.iter().enumerate() {
            let end = (offset + lacing as usize).min(page.body.len());
            let segment = &page.body[offset..end];
            offset = end;

            if self.drop_continued {
                if lacing < 255 {
                    // The truncated packet ends here; resume normally.
                    self.drop_continued = false;
                    self.partial.clear();
                }
                continue;
            }

            self.partial.extend_from_slice(segment);
            if lacing < 255 {
                let data = std::mem::take(&mut self.partial);
                // The page granule clocks packets the page completes; only
                // the last completed packet is exact, which is all the seek
                // tolerance requires.
                let granule = if index == segment_count - 1 {
                    page.granule
                } else {
                    None
                };
                if self.queue.len() >= MAX_QUEUED_PACKETS {
                    debug!(
                        "ogg: stream {:#x} queue full, dropping oldest packet",
                        self.serial
                    );
                    self.queue.pop_front();
                }
                self.queue.push_back(OggPacket { data, granule });
            }
        }

        if page.flags & FLAG_EOS != 0 {
            self.ended = true;
        }
    }
}

/// Ogg bitstream demuxer.
pub struct OggDemuxer {
    core: DemuxerCore,
    streams: Vec<LogicalStream>,
    /// Index into `streams` of the primary audio stream.
    primary: usize,
    /// Next header packet to emit as a chunk; equals the header count once
    /// all have been handed out.
    header_emit_index: usize,
    /// Byte offset of the first data page, the lower seek bound.
    data_start: u64,
    tag: StandardTag,
    /// Set when a chained-stream BOS was seen and headers re-collect.
    chained_restart: bool,
}

impl OggDemuxer {
    /// Creates a demuxer over `src`. Call `parse_container` next.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            streams: Vec::new(),
            primary: 0,
            header_emit_index: 0,
            data_start: 0,
            tag: StandardTag::default(),
            chained_restart: false,
        }
    }

    /// Sample rate of the granule clock for the primary stream.
    fn granule_rate(&self) -> u32 {
        let stream = &self.streams[self.primary];
        match stream.codec {
            // Opus granules always tick at 48 kHz.
            OggCodec::Opus => 48_000,
            _ => stream.info.sample_rate.max(1),
        }
    }

    fn granule_to_ms(&self, granule: u64) -> u64 {
        granule.saturating_mul(1000) / u64::from(self.granule_rate())
    }

    /// Reads the next page, scanning forward for the capture pattern.
    ///
    /// Returns `Ok(None)` at end of stream. CRC mismatches are logged and
    /// skipped (a hole), or fatal in strict mode.
    fn read_page(&self) -> Result<Option<Page>> {
        loop {
            let mut header = [0u8; 27];
            let mut filled = 0usize;
            while filled < header.len() {
                let n = self.core.src().read(&mut header[filled..])?;
                if n == 0 {
                    return Ok(None);
                }
                filled += n;
            }

            if header[0..4] != CAPTURE {
                // Lost sync: slide one byte and retry.
                self.core
                    .src()
                    .seek(SeekFrom::Current(-(header.len() as i64) + 1))?;
                continue;
            }
            if header[4] != 0 {
                debug!("ogg: unsupported page version {}", header[4]);
                self.core
                    .src()
                    .seek(SeekFrom::Current(-(header.len() as i64) + 1))?;
                continue;
            }

            let flags = header[5];
            let granule_raw = u64::from_le_bytes([
                header[6], header[7], header[8], header[9], header[10], header[11], header[12],
                header[13],
            ]);
            let serial = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
            let sequence = u32::from_le_bytes([header[18], header[19], header[20], header[21]]);
            let crc_stored = u32::from_le_bytes([header[22], header[23], header[24], header[25]]);
            let segment_count = header[26] as usize;

            let lacing = self.core.read_bytes(segment_count)?;
            let body_len: usize = lacing.iter().map(|&lacing| lacing as usize).sum();
            let body = self.core.read_bytes(body_len)?;

            let mut check_header = header;
            check_header[22..26].fill(0);
            let mut crc = crc32_ogg(&check_header, 0);
            crc = crc32_ogg(&lacing, crc);
            crc = crc32_ogg(&body, crc);

            if crc != crc_stored {
                let err = Error::corrupt_frame(format!(
                    "ogg: page CRC mismatch on stream {serial:#x} page {sequence}"
                ));
                if self.core.strict() {
                    return Err(self.core.record_error(err));
                }
                debug!("{err}, skipping page");
                continue;
            }

            return Ok(Some(Page {
                flags,
                granule: (granule_raw != u64::MAX).then_some(granule_raw),
                serial,
                sequence,
                lacing,
                body,
            }));
        }
    }

    /// Routes a page to its logical stream, creating one on BOS.
    ///
    /// Returns `true` when the page belonged to a known (or new) stream.
    fn dispatch_page(&mut self, page: &Page) -> bool {
        if page.flags & FLAG_BOS != 0 {
            if self
                .streams
                .iter()
                .all(|stream| stream.serial != page.serial)
            {
                let stream_id = self.streams.len() as u32;
                self.streams.push(LogicalStream::new(page.serial, stream_id));
            }
        }

        let Some(stream) = self
            .streams
            .iter_mut()
            .find(|stream| stream.serial == page.serial)
        else {
            debug!("ogg: page for unknown stream {:#x}", page.serial);
            return false;
        };
        stream.ingest(page);
        true
    }

    /// Pulls header packets out of a stream's queue until its group is
    /// complete.
    fn collect_headers(stream: &mut LogicalStream) -> Result<()> {
        while !stream.headers_complete {
            let Some(packet) = stream.queue.pop_front() else {
                return Ok(());
            };

            if stream.header_packets.is_empty() {
                stream.codec = OggCodec::identify(&packet.data);
                stream.headers_needed = match stream.codec {
                    OggCodec::Vorbis => 3,
                    OggCodec::Opus => 2,
                    // Mapping header declares how many metadata packets
                    // follow; re-read below once parsed.
                    OggCodec::Flac => 1,
                    OggCodec::Unknown => 1,
                };
                if stream.codec == OggCodec::Flac && packet.data.len() >= 9 {
                    let declared =
                        u16::from_be_bytes([packet.data[7], packet.data[8]]) as usize;
                    stream.headers_needed = 1 + declared;
                }
            }

            stream.header_packets.push(packet.data);
            if stream.header_packets.len() >= stream.headers_needed {
                stream.headers_complete = true;
            }
        }
        Ok(())
    }

    /// Parses the collected header packets into `StreamInfo` and tags.
    fn apply_headers(stream: &mut LogicalStream, tag: &mut StandardTag) -> Result<()> {
        let mut info = StreamInfo::audio(stream.stream_id, stream.codec.token());

        match stream.codec {
            OggCodec::Vorbis => {
                let ident = stream
                    .header_packets
                    .first()
                    .ok_or_else(|| Error::truncated_header("ogg: missing vorbis ident"))?;
                if ident.len() < 30 {
                    return Err(Error::truncated_header("ogg: vorbis ident too short"));
                }
                let version = u32::from_le_bytes([ident[7], ident[8], ident[9], ident[10]]);
                if version != 0 {
                    return Err(Error::unsupported_variant(format!(
                        "ogg: vorbis version {version}"
                    )));
                }
                info.channels = u16::from(ident[11]);
                info.sample_rate =
                    u32::from_le_bytes([ident[12], ident[13], ident[14], ident[15]]);
                info.bitrate =
                    u32::from_le_bytes([ident[20], ident[21], ident[22], ident[23]]);
                info.codec_private = ident.clone();

                if let Some(comment) = stream.header_packets.get(1) {
                    if comment.starts_with(b"\x03vorbis") {
                        if let Ok((parsed, _)) = parse_vorbis_comments(&comment[7..]) {
                            info.tags = parsed.clone();
                            *tag = parsed;
                        }
                    }
                }
            }
            OggCodec::Opus => {
                let head = stream
                    .header_packets
                    .first()
                    .ok_or_else(|| Error::truncated_header("ogg: missing OpusHead"))?;
                if head.len() < 19 {
                    return Err(Error::truncated_header("ogg: OpusHead too short"));
                }
                let version = head[8];
                if version >> 4 != 0 {
                    return Err(Error::unsupported_variant(format!(
                        "ogg: opus encapsulation version {version}"
                    )));
                }
                info.channels = u16::from(head[9]);
                // The decoder always runs at 48 kHz; the input rate in the
                // header is informational only.
                info.sample_rate = 48_000;
                info.codec_private = head.clone();

                if let Some(tags_packet) = stream.header_packets.get(1) {
                    if tags_packet.starts_with(b"OpusTags") {
                        if let Ok((parsed, _)) = parse_vorbis_comments(&tags_packet[8..]) {
                            info.tags = parsed.clone();
                            *tag = parsed;
                        }
                    }
                }
            }
            OggCodec::Flac => {
                let mapping = stream
                    .header_packets
                    .first()
                    .ok_or_else(|| Error::truncated_header("ogg: missing FLAC mapping"))?;
                // 0x7F "FLAC" major minor nheaders, then fLaC + STREAMINFO.
                if mapping.len() < 13 + 4 + 34 || &mapping[9..13] != b"fLaC" {
                    return Err(Error::truncated_header("ogg: FLAC mapping too short"));
                }
                let streaminfo = StreamInfoBlock::parse(&mapping[17..17 + 34])?;
                info.sample_rate = streaminfo.sample_rate;
                info.channels = streaminfo.channels;
                info.bits_per_sample = streaminfo.bits_per_sample;
                info.duration_samples = streaminfo.total_samples;
                info.codec_private = mapping[17..17 + 34].to_vec();

                for packet in &stream.header_packets[1..] {
                    // Metadata packets reuse the native block framing.
                    if packet.first().is_some_and(|ty| ty & 0x7F == 4) && packet.len() > 4 {
                        if let Ok((parsed, _)) = parse_vorbis_comments(&packet[4..]) {
                            info.tags = parsed.clone();
                            *tag = parsed;
                        }
                    }
                }
            }
            OggCodec::Unknown => {
                return Err(Error::unsupported_variant(
                    "ogg: unrecognised logical bitstream",
                ));
            }
        }

        stream.info = info;
        Ok(())
    }

    /// Discards sync state after an error or seek; partial page bytes in
    /// every stream are dropped.
    fn sync_reset(&mut self) {
        for stream in &mut self.streams {
            stream.reset_packet_state();
        }
    }

    /// Scans the file tail for the last granule of the primary stream.
    fn find_last_granule(&self) -> Result<Option<u64>> {
        let Some(size) = self.core.src().size() else {
            return Ok(None);
        };
        let primary_serial = self.streams[self.primary].serial;
        let scan_from = size.saturating_sub(TAIL_SCAN_LEN);
        let restore = self.core.src().tell();

        self.core.src().seek(SeekFrom::Start(scan_from))?;
        let tail = {
            let len = (size - scan_from) as usize;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = self.core.src().read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            buf
        };

        let mut last = None;
        let mut offset = 0usize;
        while offset + 27 <= tail.len() {
            if tail[offset..offset + 4] != CAPTURE {
                offset += 1;
                continue;
            }
            let header = &tail[offset..offset + 27];
            let granule = u64::from_le_bytes([
                header[6], header[7], header[8], header[9], header[10], header[11], header[12],
                header[13],
            ]);
            let serial = u32::from_le_bytes([header[14], header[15], header[16], header[17]]);
            if serial == primary_serial && granule != u64::MAX {
                last = Some(granule);
            }
            let segment_count = header[26] as usize;
            if offset + 27 + segment_count > tail.len() {
                break;
            }
            let body_len: usize = tail[offset + 27..offset + 27 + segment_count]
                .iter()
                .map(|&lacing| lacing as usize)
                .sum();
            offset += 27 + segment_count + body_len;
        }

        self.core.src().seek(SeekFrom::Start(restore))?;
        Ok(last)
    }

    /// Granule of the first primary-stream page at or after `offset`.
    fn granule_after(&self, offset: u64, primary_serial: u32) -> Result<Option<(u64, u64)>> {
        self.core.src().seek(SeekFrom::Start(offset))?;
        // Bounded forward scan: a page boundary must appear within one
        // maximal page length.
        let mut scanned = 0u64;
        loop {
            let page_offset = self.core.src().tell();
            let Some(page) = self.read_page()? else {
                return Ok(None);
            };
            if page.serial == primary_serial {
                if let Some(granule) = page.granule {
                    return Ok(Some((granule, page_offset)));
                }
            }
            scanned += MAX_PAGE_LEN.min(page.body.len() as u64 + 27);
            if scanned > MAX_PAGE_LEN * 16 {
                return Ok(None);
            }
        }
    }

    /// Bisects the file for the last page whose granule is at or below
    /// `target`, returning its byte offset and granule.
    fn bisect_granule(&self, target: u64) -> Result<(u64, u64)> {
        let primary_serial = self.streams[self.primary].serial;
        let size = self
            .core
            .src()
            .size()
            .ok_or_else(|| Error::invalid_argument("ogg: cannot seek an unsized stream"))?;

        let mut lo = self.data_start;
        let mut hi = size;
        let mut best = (self.data_start, 0u64);

        // Byte bisection: narrow [lo, hi) until adjacent, tracking the best
        // page at or below the target granule.
        while hi.saturating_sub(lo) > MAX_PAGE_LEN {
            let mid = lo + (hi - lo) / 2;
            match self.granule_after(mid, primary_serial)? {
                Some((granule, page_offset)) if granule <= target => {
                    best = (page_offset, granule);
                    lo = mid + 1;
                }
                Some(_) => hi = mid,
                // No page beyond mid; everything interesting is below.
                None => hi = mid,
            }
        }

        Ok(best)
    }
}

impl Demuxer for OggDemuxer {
    fn name(&self) -> &'static str {
        "ogg"
    }

    fn parse_container(&mut self) -> Result<()> {
        let first = self
            .read_page()?
            .ok_or_else(|| self.core.record_error(Error::bad_magic("ogg: empty stream")))?;
        if first.flags & FLAG_BOS == 0 {
            return Err(self
                .core
                .record_error(Error::bad_magic("ogg: stream does not begin with BOS")));
        }
        self.dispatch_page(&first);

        // Ingest pages until every BOS stream has its full header group.
        // BOS pages of concurrently multiplexed streams all precede data,
        // so the loop converges quickly on well-formed files.
        let mut guard = 0;
        loop {
            for stream in &mut self.streams {
                Self::collect_headers(stream)?;
            }
            if self
                .streams
                .iter()
                .all(|stream| stream.headers_complete)
            {
                break;
            }

            let Some(page) = self.read_page()? else {
                return Err(self
                    .core
                    .record_error(Error::truncated_header("ogg: stream ends inside headers")));
            };
            self.dispatch_page(&page);

            guard += 1;
            if guard > 4096 {
                return Err(self.core.record_error(Error::truncated_header(
                    "ogg: header group never completes",
                )));
            }
        }

        self.data_start = self.core.src().tell();

        let mut tag = StandardTag::default();
        let mut first_ok = None;
        for (index, stream) in self.streams.iter_mut().enumerate() {
            match Self::apply_headers(stream, &mut tag) {
                Ok(()) => first_ok = first_ok.or(Some(index)),
                Err(err) => debug!("ogg: stream {:#x} skipped: {err}", stream.serial),
            }
        }
        let primary = first_ok.ok_or_else(|| {
            self.core.record_error(Error::unsupported_variant(
                "ogg: no decodable logical bitstream",
            ))
        })?;
        self.primary = primary;
        self.tag = tag;
        self.core.set_parsed();

        if let Some(last_granule) = self.find_last_granule()? {
            let duration_ms = self.granule_to_ms(last_granule);
            self.core.set_duration_ms(duration_ms);
            let stream = &mut self.streams[self.primary];
            stream.info.duration_samples = last_granule;
            stream.info.duration_ms = duration_ms;
        }

        debug!(
            "ogg: {} logical stream(s), primary {} ({})",
            self.streams.len(),
            self.streams[self.primary].serial,
            self.streams[self.primary].codec.token()
        );
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter(|stream| stream.headers_complete && stream.codec != OggCodec::Unknown)
            .map(|stream| stream.info.clone())
            .collect()
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.core.ensure_parsed(self.name())?;
        let primary_id = self.streams[self.primary].stream_id;
        self.read_chunk_of(primary_id)
    }

    fn read_chunk_of(&mut self, stream_id: u32) -> Result<MediaChunk> {
        self.core.ensure_parsed(self.name())?;

        let index = self
            .streams
            .iter()
            .position(|stream| stream.stream_id == stream_id)
            .ok_or_else(|| {
                Error::invalid_argument(format!("ogg: unknown stream id {stream_id}"))
            })?;

        // Header packets are emitted exactly once, before any audio.
        if index == self.primary || self.chained_restart {
            let stream = &self.streams[index];
            if self.header_emit_index < stream.header_packets.len() {
                let data = stream.header_packets[self.header_emit_index].clone();
                self.header_emit_index += 1;
                if self.header_emit_index == stream.header_packets.len() {
                    self.chained_restart = false;
                }
                return Ok(MediaChunk {
                    stream_id,
                    data,
                    timestamp_samples: 0,
                    end_timestamp_samples: None,
                    is_keyframe: true,
                });
            }
        }

        loop {
            if let Some(packet) = self.streams[index].queue.pop_front() {
                let timestamp = packet.granule.unwrap_or(TIMESTAMP_UNKNOWN);
                if timestamp != TIMESTAMP_UNKNOWN {
                    let position_ms = self.granule_to_ms(timestamp);
                    self.core.set_position_ms(position_ms);
                }
                return Ok(MediaChunk {
                    stream_id,
                    data: packet.data,
                    timestamp_samples: timestamp,
                    end_timestamp_samples: None,
                    is_keyframe: false,
                });
            }

            if self.streams[index].ended {
                self.core.set_eof(true);
                return Ok(MediaChunk::end_of_stream(stream_id));
            }

            let page = match self.read_page() {
                Ok(Some(page)) => page,
                Ok(None) => {
                    self.core.set_eof(true);
                    return Ok(MediaChunk::end_of_stream(stream_id));
                }
                Err(err) => {
                    // Abnormal exit from the fetch loop: discard partial
                    // sync state before surfacing.
                    self.sync_reset();
                    return Err(self.core.record_error(err));
                }
            };

            // A fresh BOS mid-file is a chained physical stream: rebind
            // the primary and surface its headers as keyframe chunks.
            if page.flags & FLAG_BOS != 0
                && self
                    .streams
                    .iter()
                    .all(|stream| stream.serial != page.serial)
            {
                info!("ogg: chained stream restart (serial {:#x})", page.serial);
                self.dispatch_page(&page);
                let new_index = self.streams.len() - 1;
                let mut pages = 0;
                while !self.streams[new_index].headers_complete {
                    Self::collect_headers(&mut self.streams[new_index])?;
                    if self.streams[new_index].headers_complete {
                        break;
                    }
                    let Some(next) = self.read_page()? else {
                        self.core.set_eof(true);
                        return Ok(MediaChunk::end_of_stream(stream_id));
                    };
                    self.dispatch_page(&next);
                    pages += 1;
                    if pages > 4096 {
                        return Err(self.core.record_error(Error::truncated_header(
                            "ogg: chained headers never complete",
                        )));
                    }
                }
                let mut tag = self.tag.clone();
                Self::apply_headers(&mut self.streams[new_index], &mut tag)?;
                self.tag = tag;
                self.primary = new_index;
                self.header_emit_index = 0;
                self.chained_restart = true;
                let stream = &self.streams[new_index];
                let data = stream.header_packets[0].clone();
                self.header_emit_index = 1;
                return Ok(MediaChunk {
                    stream_id: stream.stream_id,
                    data,
                    timestamp_samples: 0,
                    end_timestamp_samples: None,
                    is_keyframe: true,
                });
            }

            self.dispatch_page(&page);
        }
    }

    fn seek_to(&mut self, timestamp_ms: u64) -> Result<()> {
        self.core.ensure_parsed(self.name())?;

        let duration_ms = self.core.duration_ms();
        if duration_ms > 0 && timestamp_ms > duration_ms {
            return Err(Error::invalid_argument(format!(
                "ogg: seek to {timestamp_ms} ms beyond duration {duration_ms} ms"
            )));
        }

        let target_granule =
            timestamp_ms.saturating_mul(u64::from(self.granule_rate())) / 1000;
        let (mut offset, mut granule) = self.bisect_granule(target_granule)?;

        // Forward-scan from the bisection landing to the last page at or
        // below the target, page by page.
        let primary_serial = self.streams[self.primary].serial;
        self.core.src().seek(SeekFrom::Start(offset))?;
        loop {
            let page_offset = self.core.src().tell();
            let Some(page) = self.read_page()? else {
                break;
            };
            if page.serial == primary_serial {
                match page.granule {
                    Some(page_granule) if page_granule <= target_granule => {
                        offset = page_offset;
                        granule = page_granule;
                    }
                    Some(_) => break,
                    None => {}
                }
            }
        }

        self.core.src().seek(SeekFrom::Start(offset))?;
        self.sync_reset();
        self.core.set_eof(false);
        self.core.set_position_ms(self.granule_to_ms(granule));

        trace!(
            "ogg: seek to {timestamp_ms} ms landed at offset {offset} (granule {granule})"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CancelToken;
    use crate::source::FileByteSource;
    use std::io::Write;

    /// Builds one Ogg page with a correct CRC.
    pub(crate) fn build_page(
        serial: u32,
        sequence: u32,
        granule: u64,
        flags: u8,
        packets: &[&[u8]],
    ) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            loop {
                let this = remaining.min(255);
                lacing.push(this as u8);
                remaining -= this;
                if this < 255 {
                    break;
                }
                if remaining == 0 {
                    // Packet length is a multiple of 255: a zero lacing
                    // value terminates it.
                    lacing.push(0);
                    break;
                }
            }
            body.extend_from_slice(packet);
        }

        let mut page = Vec::new();
        page.extend_from_slice(&CAPTURE);
        page.push(0); // version
        page.push(flags);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&serial.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // crc placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(&body);

        let crc = crc32_ogg(&page, 0);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    /// A minimal Vorbis identification header.
    pub(crate) fn vorbis_ident(channels: u8, sample_rate: u32) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x01vorbis");
        packet.extend_from_slice(&0u32.to_le_bytes()); // version
        packet.push(channels);
        packet.extend_from_slice(&sample_rate.to_le_bytes());
        packet.extend_from_slice(&0u32.to_le_bytes()); // max bitrate
        packet.extend_from_slice(&128_000u32.to_le_bytes()); // nominal
        packet.extend_from_slice(&0u32.to_le_bytes()); // min
        packet.push(0x66); // blocksizes 64/1024 (log2: 6, 10)... packed
        packet.push(0x01); // framing bit
        packet
    }

    /// A Vorbis comment header with the given comments.
    pub(crate) fn vorbis_comment(comments: &[&str]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x03vorbis");
        let vendor = b"phono";
        packet.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        packet.extend_from_slice(vendor);
        packet.extend_from_slice(&(comments.len() as u32).to_le_bytes());
        for comment in comments {
            packet.extend_from_slice(&(comment.len() as u32).to_le_bytes());
            packet.extend_from_slice(comment.as_bytes());
        }
        packet.push(0x01); // framing bit
        packet
    }

    /// A placeholder Vorbis setup header (opaque to the demuxer).
    pub(crate) fn vorbis_setup() -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(b"\x05vorbis");
        packet.extend_from_slice(&[0u8; 32]);
        packet
    }

    pub(crate) fn write_fixture(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(bytes).expect("write fixture");
        file
    }

    fn open_demuxer(file: &tempfile::NamedTempFile) -> OggDemuxer {
        let src = FileByteSource::open(
            file.path().to_str().expect("utf8 path"),
            CancelToken::new(),
        )
        .expect("open source");
        OggDemuxer::new(Box::new(src), &OpenOptions::default())
    }

    /// A complete single-stream Vorbis file with `frames` audio packets.
    fn vorbis_file(comments: &[&str], frames: usize) -> tempfile::NamedTempFile {
        let serial = 0x1234_5678;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&build_page(
            serial,
            0,
            0,
            FLAG_BOS,
            &[&vorbis_ident(2, 44_100)],
        ));
        bytes.extend_from_slice(&build_page(
            serial,
            1,
            0,
            0,
            &[&vorbis_comment(comments), &vorbis_setup()],
        ));
        for frame in 0..frames {
            let payload = vec![frame as u8; 64];
            let granule = (frame as u64 + 1) * 1024;
            let flags = if frame == frames - 1 { FLAG_EOS } else { 0 };
            bytes.extend_from_slice(&build_page(
                serial,
                2 + frame as u32,
                granule,
                flags,
                &[&payload],
            ));
        }
        write_fixture(&bytes)
    }

    #[test]
    fn parses_vorbis_headers_and_tags() {
        let file = vorbis_file(&["TITLE=Hello", "ARTIST=World"], 4);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        let streams = demuxer.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].codec_name, "vorbis");
        assert_eq!(streams[0].channels, 2);
        assert_eq!(streams[0].sample_rate, 44_100);

        assert_eq!(demuxer.tag().title(), Some("Hello"));
        assert_eq!(demuxer.tag().artist(), Some("World"));
    }

    #[test]
    fn header_packets_emitted_once_then_audio() {
        let file = vorbis_file(&[], 3);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        // Three header chunks, timestamp zero, keyframes.
        for _ in 0..3 {
            let chunk = demuxer.read_chunk().expect("header chunk");
            assert!(chunk.is_keyframe);
            assert_eq!(chunk.timestamp_samples, 0);
        }

        let audio = demuxer.read_chunk().expect("audio chunk");
        assert!(!audio.is_keyframe);
        assert_eq!(audio.timestamp_samples, 1024);
    }

    #[test]
    fn headers_not_reemitted_after_seek() {
        let file = vorbis_file(&[], 16);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        for _ in 0..3 {
            demuxer.read_chunk().expect("header chunk");
        }
        demuxer.read_chunk().expect("audio chunk");

        demuxer.seek_to(0).expect("seek");
        let chunk = demuxer.read_chunk().expect("post-seek chunk");
        assert!(!chunk.is_keyframe, "headers must not repeat after seek");
    }

    #[test]
    fn eof_yields_empty_chunk_not_error() {
        let file = vorbis_file(&[], 2);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        loop {
            let chunk = demuxer.read_chunk().expect("chunk");
            if chunk.is_end_of_stream() {
                break;
            }
        }
        assert!(demuxer.is_eof());
        let again = demuxer.read_chunk().expect("chunk after eof");
        assert!(again.is_end_of_stream());
    }

    #[test]
    fn corrupt_page_is_skipped() {
        let file = vorbis_file(&[], 4);
        let mut bytes = std::fs::read(file.path()).expect("read fixture");
        // Flip one byte inside the third audio page's body.
        let len = bytes.len();
        bytes[len - 10] ^= 0xFF;
        let corrupted = write_fixture(&bytes);

        let mut demuxer = open_demuxer(&corrupted);
        demuxer.parse_container().expect("parse");
        let mut audio_chunks = 0;
        loop {
            let chunk = demuxer.read_chunk().expect("read");
            if chunk.is_end_of_stream() {
                break;
            }
            if !chunk.is_keyframe {
                audio_chunks += 1;
            }
        }
        // One page lost to corruption, the rest recovered.
        assert_eq!(audio_chunks, 3);
    }

    #[test]
    fn read_before_parse_is_invalid_state() {
        let file = vorbis_file(&[], 2);
        let mut demuxer = open_demuxer(&file);
        let err = demuxer.read_chunk().expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn lagging_stream_queue_stays_bounded() {
        // Two multiplexed Vorbis streams; the consumer only ever reads
        // stream A, so stream B's packets pile up in its queue. The queue
        // must stay at or below the bound regardless of how many pages
        // arrive.
        let serial_a = 0xA;
        let serial_b = 0xB;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&build_page(
            serial_a,
            0,
            0,
            FLAG_BOS,
            &[&vorbis_ident(2, 44_100)],
        ));
        bytes.extend_from_slice(&build_page(
            serial_b,
            0,
            0,
            FLAG_BOS,
            &[&vorbis_ident(2, 44_100)],
        ));
        bytes.extend_from_slice(&build_page(
            serial_a,
            1,
            0,
            0,
            &[&vorbis_comment(&[]), &vorbis_setup()],
        ));
        bytes.extend_from_slice(&build_page(
            serial_b,
            1,
            0,
            0,
            &[&vorbis_comment(&[]), &vorbis_setup()],
        ));
        for frame in 0..150u32 {
            bytes.extend_from_slice(&build_page(
                serial_b,
                2 + frame,
                u64::from(frame + 1) * 1024,
                0,
                &[&[0x42u8; 32]],
            ));
        }
        bytes.extend_from_slice(&build_page(serial_a, 2, 1024, FLAG_EOS, &[&[0x41u8; 32]]));

        let file = write_fixture(&bytes);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");

        let id_a = demuxer
            .streams
            .iter()
            .find(|stream| stream.serial == serial_a)
            .map(|stream| stream.stream_id)
            .expect("stream A");

        loop {
            let chunk = demuxer.read_chunk_of(id_a).expect("chunk");
            if chunk.is_end_of_stream() {
                break;
            }
        }

        let queue_b = demuxer
            .streams
            .iter()
            .find(|stream| stream.serial == serial_b)
            .map(|stream| stream.queue.len())
            .expect("stream B");
        assert!(queue_b <= MAX_QUEUED_PACKETS, "queue grew to {queue_b}");
    }

    #[test]
    fn duration_from_last_granule() {
        let file = vorbis_file(&[], 10);
        let mut demuxer = open_demuxer(&file);
        demuxer.parse_container().expect("parse");
        // 10 * 1024 samples at 44.1 kHz.
        assert_eq!(demuxer.duration_ms(), 10 * 1024 * 1000 / 44_100);
    }
}
