//! ISO-BMFF / MP4 demuxer (ISO/IEC 14496-12).
//!
//! Parses the box hierarchy for the audio-relevant set: `ftyp`, `moov`
//! (`mvhd`, `trak` → `mdhd`/`hdlr`/`stbl`), the compressed sample tables
//! (`stsd`, `stts`, `stsc`, `stsz`/`stz2`, `stco`/`co64`, `stss`), edit
//! lists, iTunes-style `ilst` tags, and the fragmented structures (`mvex`,
//! `moof` → `traf` → `tfhd`/`tfdt`/`trun`) which are integrated into one
//! logical sample timeline ordered by fragment sequence number.
//!
//! The flat sample index is validated while it is built: box and sample
//! extents must lie within the file, durations must be positive, the
//! timescale must be sane, and arithmetic overflow is surfaced as
//! corruption instead of silently truncated.

use std::io::SeekFrom;

use crate::{
    config::OpenOptions,
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{Error, Result},
    source::ByteSource,
    tag::{Picture, StandardTag, Tag},
};

/// Accepted timescale range (1 Hz – 10 MHz).
const TIMESCALE_MIN: u32 = 1;
const TIMESCALE_MAX: u32 = 10_000_000;

/// Upper bound on an in-memory `moov`/`moof` image.
const MAX_BOX_IMAGE: usize = 64 * 1024 * 1024;

/// Fragments whose predecessor is missing for longer than this many
/// sequence numbers are integrated anyway (the hole is logged).
const FRAGMENT_REORDER_WINDOW: u32 = 4;

/// In-memory box cursor.
struct Boxes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Boxes<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Next `(fourcc, body)` pair, or `None` at the end.
    fn next_box(&mut self) -> Result<Option<([u8; 4], &'a [u8])>> {
        if self.pos + 8 > self.data.len() {
            return Ok(None);
        }
        let size32 = u32::from_be_bytes(
            self.data[self.pos..self.pos + 4]
                .try_into()
                .map_err(|_| Error::corrupt_frame("mp4: short box header"))?,
        );
        let fourcc: [u8; 4] = self.data[self.pos + 4..self.pos + 8]
            .try_into()
            .map_err(|_| Error::corrupt_frame("mp4: short box header"))?;

        let (header_len, size) = match size32 {
            0 => (8usize, (self.data.len() - self.pos) as u64),
            1 => {
                if self.pos + 16 > self.data.len() {
                    return Err(Error::corrupt_frame("mp4: truncated largesize box"));
                }
                let large = u64::from_be_bytes(
                    self.data[self.pos + 8..self.pos + 16]
                        .try_into()
                        .map_err(|_| Error::corrupt_frame("mp4: short box header"))?,
                );
                (16usize, large)
            }
            size => (8usize, u64::from(size)),
        };

        if size < header_len as u64 {
            return Err(Error::corrupt_frame("mp4: box smaller than its header"));
        }
        let body_len = usize::try_from(size - header_len as u64)
            .map_err(|_| Error::corrupt_frame("mp4: box size overflows memory"))?;
        let body_start = self.pos + header_len;
        let body_end = body_start
            .checked_add(body_len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::corrupt_frame("mp4: box exceeds container size"))?;

        self.pos = body_end;
        Ok(Some((fourcc, &self.data[body_start..body_end])))
    }

    /// Finds the first box with the given type.
    fn find(data: &'a [u8], fourcc: &[u8; 4]) -> Result<Option<&'a [u8]>> {
        let mut boxes = Boxes::new(data);
        while let Some((id, body)) = boxes.next_box()? {
            if &id == fourcc {
                return Ok(Some(body));
            }
        }
        Ok(None)
    }
}

fn be_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or_else(|| Error::corrupt_frame("mp4: field beyond box end"))
}

fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or_else(|| Error::corrupt_frame("mp4: field beyond box end"))
}

fn be_u64(data: &[u8], offset: usize) -> Result<u64> {
    data.get(offset..offset + 8)
        .map(|bytes| {
            u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ])
        })
        .ok_or_else(|| Error::corrupt_frame("mp4: field beyond box end"))
}

/// One entry of the flat sample index.
#[derive(Clone, Copy, Debug)]
struct Sample {
    offset: u64,
    size: u32,
    /// Duration in media timescale units.
    duration: u32,
    /// Cumulative start time in media timescale units.
    start: u64,
    keyframe: bool,
}

/// Fragment run defaults from `trex`.
#[derive(Clone, Copy, Debug, Default)]
struct TrackDefaults {
    sample_duration: u32,
    sample_size: u32,
}

/// A parsed audio track.
struct Mp4Track {
    track_id: u32,
    timescale: u32,
    codec: String,
    codec_private: Vec<u8>,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    samples: Vec<Sample>,
    /// Initial media time offset from the edit list.
    media_time: u64,
    defaults: TrackDefaults,
}

/// A fragment pending integration, keyed by `mfhd` sequence number.
struct PendingFragment {
    sequence: u32,
    samples: Vec<Sample>,
}

/// ISO-BMFF / MP4 demuxer.
pub struct Mp4Demuxer {
    core: DemuxerCore,
    tracks: Vec<Mp4Track>,
    /// Index into `tracks` of the selected audio track.
    primary: usize,
    tag: StandardTag,
    fragmented: bool,
    cursor: usize,
    stream_info_cache: Option<StreamInfo>,
    /// Cap on any single in-memory box image.
    box_image_limit: usize,
}

impl Mp4Demuxer {
    /// Creates a demuxer over `src`. Call `parse_container` next.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, options: &OpenOptions) -> Self {
        Self {
            core: DemuxerCore::new(src, options.strict_mode),
            tracks: Vec::new(),
            primary: 0,
            tag: StandardTag::default(),
            fragmented: false,
            cursor: 0,
            stream_info_cache: None,
            box_image_limit: options.max_memory_bytes_or_default().min(MAX_BOX_IMAGE),
        }
    }

    fn primary_track(&self) -> Result<&Mp4Track> {
        self.tracks
            .get(self.primary)
            .ok_or_else(|| Error::invalid_state("mp4: read before parse_container"))
    }

    fn units_to_samples(track: &Mp4Track, units: u64) -> u64 {
        if track.timescale == track.sample_rate || track.sample_rate == 0 {
            units
        } else {
            units.saturating_mul(u64::from(track.sample_rate)) / u64::from(track.timescale)
        }
    }

    fn units_to_ms(track: &Mp4Track, units: u64) -> u64 {
        units.saturating_mul(1000) / u64::from(track.timescale.max(1))
    }

    /// Reads a whole box body into memory, bounded.
    fn read_box_image(&self, len: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.box_image_limit)
            .ok_or_else(|| Error::out_of_memory("mp4: box image exceeds limit"))?;
        self.core.read_bytes(len)
    }

    // --- moov parsing ---------------------------------------------------

    fn parse_moov(&mut self, moov: &[u8]) -> Result<()> {
        if let Some(mvhd) = Boxes::find(moov, b"mvhd")? {
            let timescale = be_u32(mvhd, if mvhd.first() == Some(&1) { 20 } else { 12 })?;
            if !(TIMESCALE_MIN..=TIMESCALE_MAX).contains(&timescale) {
                return Err(Error::corrupt_frame(format!(
                    "mp4: movie timescale {timescale} out of range"
                )));
            }
        }

        let mut defaults_by_track: Vec<(u32, TrackDefaults)> = Vec::new();
        if let Some(mvex) = Boxes::find(moov, b"mvex")? {
            self.fragmented = true;
            let mut boxes = Boxes::new(mvex);
            while let Some((id, body)) = boxes.next_box()? {
                if &id == b"trex" && body.len() >= 24 {
                    defaults_by_track.push((
                        be_u32(body, 4)?,
                        TrackDefaults {
                            sample_duration: be_u32(body, 12)?,
                            sample_size: be_u32(body, 16)?,
                        },
                    ));
                }
            }
        }

        let mut boxes = Boxes::new(moov);
        while let Some((id, body)) = boxes.next_box()? {
            match &id {
                b"trak" => {
                    if let Some(track) = self.parse_trak(body)? {
                        self.tracks.push(track);
                    }
                }
                b"udta" => self.parse_udta(body)?,
                _ => {}
            }
        }

        for (track_id, defaults) in defaults_by_track {
            if let Some(track) = self
                .tracks
                .iter_mut()
                .find(|track| track.track_id == track_id)
            {
                track.defaults = defaults;
            }
        }
        Ok(())
    }

    fn parse_trak(&self, trak: &[u8]) -> Result<Option<Mp4Track>> {
        let tkhd = Boxes::find(trak, b"tkhd")?
            .ok_or_else(|| Error::corrupt_frame("mp4: trak without tkhd"))?;
        let track_id = if tkhd.first() == Some(&1) {
            be_u32(tkhd, 20)?
        } else {
            be_u32(tkhd, 12)?
        };

        let mdia = Boxes::find(trak, b"mdia")?
            .ok_or_else(|| Error::corrupt_frame("mp4: trak without mdia"))?;
        let hdlr = Boxes::find(mdia, b"hdlr")?
            .ok_or_else(|| Error::corrupt_frame("mp4: mdia without hdlr"))?;
        if hdlr.get(8..12) != Some(b"soun") {
            // Video and subtitle tracks are recognised but not decoded.
            return Ok(None);
        }

        let mdhd = Boxes::find(mdia, b"mdhd")?
            .ok_or_else(|| Error::corrupt_frame("mp4: mdia without mdhd"))?;
        let (timescale, media_duration) = if mdhd.first() == Some(&1) {
            (be_u32(mdhd, 20)?, be_u64(mdhd, 24)?)
        } else {
            (be_u32(mdhd, 12)?, u64::from(be_u32(mdhd, 16)?))
        };
        if !(TIMESCALE_MIN..=TIMESCALE_MAX).contains(&timescale) {
            return Err(Error::corrupt_frame(format!(
                "mp4: track {track_id} timescale {timescale} out of range"
            )));
        }

        let minf = Boxes::find(mdia, b"minf")?
            .ok_or_else(|| Error::corrupt_frame("mp4: mdia without minf"))?;
        let stbl = Boxes::find(minf, b"stbl")?
            .ok_or_else(|| Error::corrupt_frame("mp4: minf without stbl"))?;

        let stsd = Boxes::find(stbl, b"stsd")?
            .ok_or_else(|| Error::corrupt_frame("mp4: stbl without stsd"))?;
        let Some((codec, codec_private, channels, sample_rate, bits)) =
            self.parse_stsd(stsd)?
        else {
            return Ok(None);
        };

        let media_time = Boxes::find(trak, b"edts")?
            .and_then(|edts| Boxes::find(edts, b"elst").ok().flatten())
            .and_then(|elst| {
                // First edit entry's media time, version 0 or 1.
                let version = *elst.first()?;
                let count = be_u32(elst, 4).ok()?;
                if count == 0 {
                    return None;
                }
                if version == 1 {
                    be_u64(elst, 16).ok()
                } else {
                    be_u32(elst, 12).ok().map(u64::from)
                }
            })
            .filter(|time| *time != u64::MAX && *time != u64::from(u32::MAX))
            .unwrap_or(0);

        let samples = self.build_sample_index(stbl)?;

        let mut track = Mp4Track {
            track_id,
            timescale,
            codec,
            codec_private,
            channels,
            sample_rate,
            bits_per_sample: bits,
            samples,
            media_time,
            defaults: TrackDefaults::default(),
        };
        if track.samples.is_empty() && !self.fragmented {
            debug!("mp4: track {track_id} has an empty sample table");
        }
        let _ = media_duration;
        if track.sample_rate == 0 {
            track.sample_rate = timescale;
        }
        Ok(Some(track))
    }

    /// Parses the first audio sample entry of `stsd`.
    #[allow(clippy::type_complexity)]
    fn parse_stsd(
        &self,
        stsd: &[u8],
    ) -> Result<Option<(String, Vec<u8>, u16, u32, u16)>> {
        let entry_count = be_u32(stsd, 4)?;
        if entry_count == 0 {
            return Ok(None);
        }
        let mut boxes = Boxes::new(&stsd[8..]);
        let Some((fourcc, body)) = boxes.next_box()? else {
            return Ok(None);
        };

        // AudioSampleEntry: 6 reserved + 2 data_ref, then version(2),
        // revision(2), vendor(4), channels(2), samplesize(2), compression
        // id(2), packet size(2), samplerate(4, 16.16 fixed).
        if body.len() < 28 {
            return Err(Error::corrupt_frame("mp4: audio sample entry too short"));
        }
        let version = be_u16(body, 8)?;
        let mut channels = be_u16(body, 16)?;
        let mut bits = be_u16(body, 18)?;
        let mut sample_rate = be_u32(body, 24)? >> 16;
        // Version 1 entries append 4 × u32; version 2 replaces the fields.
        let children_start = match version {
            1 => 44,
            2 => {
                if body.len() < 72 {
                    return Err(Error::corrupt_frame("mp4: v2 sample entry too short"));
                }
                sample_rate = f64::from_bits(be_u64(body, 28)?) as u32;
                channels = u16::try_from(be_u32(body, 36)?).unwrap_or(0);
                bits = u16::try_from(be_u32(body, 44)?).unwrap_or(0);
                72
            }
            _ => 28,
        };
        let children = body.get(children_start..).unwrap_or(&[]);

        let (codec, codec_private) = match &fourcc {
            b"mp4a" => {
                let esds = Boxes::find(children, b"esds")?
                    .ok_or_else(|| Error::corrupt_frame("mp4: mp4a without esds"))?;
                let (object_type, specific) = parse_esds(esds)?;
                match object_type {
                    0x40 | 0x66 | 0x67 | 0x68 => ("aac".to_string(), specific),
                    0x69 | 0x6B => ("mp3".to_string(), Vec::new()),
                    other => {
                        return Err(Error::unsupported_variant(format!(
                            "mp4: esds object type {other:#04x}"
                        )))
                    }
                }
            }
            b"alac" => {
                let cookie = Boxes::find(children, b"alac")?
                    .map(|inner| inner.get(4..).unwrap_or(&[]).to_vec())
                    .unwrap_or_default();
                ("alac".to_string(), cookie)
            }
            b"fLaC" => {
                let dfla = Boxes::find(children, b"dfLa")?
                    .ok_or_else(|| Error::corrupt_frame("mp4: fLaC without dfLa"))?;
                // Full box header, then the STREAMINFO metadata block.
                let streaminfo = dfla.get(4 + 4..4 + 4 + 34).unwrap_or(&[]).to_vec();
                ("flac".to_string(), streaminfo)
            }
            b".mp3" => ("mp3".to_string(), Vec::new()),
            b"twos" => ("pcm_s16be".to_string(), Vec::new()),
            b"sowt" => ("pcm_s16le".to_string(), Vec::new()),
            b"ulaw" => ("ulaw".to_string(), Vec::new()),
            b"alaw" => ("alaw".to_string(), Vec::new()),
            other => {
                return Err(Error::unsupported_variant(format!(
                    "mp4: sample entry {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Some((codec, codec_private, channels, sample_rate, bits)))
    }

    /// Builds the flat sample index from the compressed tables.
    fn build_sample_index(&self, stbl: &[u8]) -> Result<Vec<Sample>> {
        let file_size = self.core.src().size().unwrap_or(u64::MAX);

        // stts: (count, delta) run-length pairs.
        let stts = Boxes::find(stbl, b"stts")?
            .ok_or_else(|| Error::corrupt_frame("mp4: stbl without stts"))?;
        let mut durations: Vec<(u32, u32)> = Vec::new();
        let stts_count = be_u32(stts, 4)? as usize;
        for index in 0..stts_count {
            let count = be_u32(stts, 8 + index * 8)?;
            let delta = be_u32(stts, 12 + index * 8)?;
            if delta == 0 && count > 0 {
                return Err(Error::corrupt_frame("mp4: zero sample duration in stts"));
            }
            durations.push((count, delta));
        }

        // stsz / stz2: fixed or per-sample sizes.
        let mut fixed_size = 0u32;
        let mut sizes: Vec<u32> = Vec::new();
        if let Some(stsz) = Boxes::find(stbl, b"stsz")? {
            fixed_size = be_u32(stsz, 4)?;
            let count = be_u32(stsz, 8)? as usize;
            if fixed_size == 0 {
                sizes.reserve(count);
                for index in 0..count {
                    sizes.push(be_u32(stsz, 12 + index * 4)?);
                }
            } else {
                sizes = vec![fixed_size; count];
            }
        } else if let Some(stz2) = Boxes::find(stbl, b"stz2")? {
            let field_size = u32::from(*stz2.get(7).unwrap_or(&0));
            let count = be_u32(stz2, 8)? as usize;
            for index in 0..count {
                let size = match field_size {
                    16 => u32::from(be_u16(stz2, 12 + index * 2)?),
                    8 => u32::from(*stz2.get(12 + index).ok_or_else(|| {
                        Error::corrupt_frame("mp4: stz2 entry beyond box")
                    })?),
                    4 => {
                        let byte = *stz2.get(12 + index / 2).ok_or_else(|| {
                            Error::corrupt_frame("mp4: stz2 entry beyond box")
                        })?;
                        u32::from(if index % 2 == 0 { byte >> 4 } else { byte & 0xF })
                    }
                    other => {
                        return Err(Error::corrupt_frame(format!(
                            "mp4: stz2 field size {other}"
                        )))
                    }
                };
                sizes.push(size);
            }
        }

        // stco / co64: chunk offsets.
        let mut chunk_offsets: Vec<u64> = Vec::new();
        if let Some(stco) = Boxes::find(stbl, b"stco")? {
            let count = be_u32(stco, 4)? as usize;
            for index in 0..count {
                chunk_offsets.push(u64::from(be_u32(stco, 8 + index * 4)?));
            }
        } else if let Some(co64) = Boxes::find(stbl, b"co64")? {
            let count = be_u32(co64, 4)? as usize;
            for index in 0..count {
                chunk_offsets.push(be_u64(co64, 8 + index * 8)?);
            }
        }

        // stsc: (first_chunk, samples_per_chunk, description) entries; the
        // last entry repeats implicitly to chunk_count.
        let stsc = Boxes::find(stbl, b"stsc")?
            .ok_or_else(|| Error::corrupt_frame("mp4: stbl without stsc"))?;
        let stsc_count = be_u32(stsc, 4)? as usize;
        let mut stsc_entries: Vec<(u32, u32)> = Vec::new();
        for index in 0..stsc_count {
            stsc_entries.push((
                be_u32(stsc, 8 + index * 12)?,
                be_u32(stsc, 12 + index * 12)?,
            ));
        }

        // stss: keyframe sample numbers (1-based). Usually absent for
        // audio, in which case every sample is a sync sample.
        let mut keyframes: Vec<u32> = Vec::new();
        if let Some(stss) = Boxes::find(stbl, b"stss")? {
            let count = be_u32(stss, 4)? as usize;
            for index in 0..count {
                keyframes.push(be_u32(stss, 8 + index * 4)?);
            }
        }

        // Expand chunks into the flat index.
        let mut samples = Vec::with_capacity(sizes.len());
        let mut duration_iter = durations.iter().copied();
        let mut run = duration_iter.next().unwrap_or((0, 0));
        let mut run_left = run.0;
        let mut start: u64 = 0;
        let mut sample_index = 0usize;

        'chunks: for (chunk_number, chunk_offset) in chunk_offsets.iter().enumerate() {
            let chunk_number = chunk_number as u32 + 1;
            let samples_here = stsc_entries
                .iter()
                .rev()
                .find(|(first, _)| *first <= chunk_number)
                .map_or(0, |(_, samples)| *samples);

            let mut offset = *chunk_offset;
            for _ in 0..samples_here {
                let Some(&size) = sizes.get(sample_index) else {
                    break 'chunks;
                };

                let end = offset
                    .checked_add(u64::from(size))
                    .ok_or_else(|| Error::corrupt_frame("mp4: sample end overflows"))?;
                if end > file_size {
                    return Err(Error::corrupt_frame(format!(
                        "mp4: sample {sample_index} extends beyond file end"
                    )));
                }

                while run_left == 0 {
                    match duration_iter.next() {
                        Some(next) => {
                            run = next;
                            run_left = run.0;
                        }
                        None => break,
                    }
                    if run_left != 0 {
                        break;
                    }
                }
                let duration = run.1;
                run_left = run_left.saturating_sub(1);

                let keyframe = keyframes.is_empty()
                    || keyframes.binary_search(&(sample_index as u32 + 1)).is_ok();

                samples.push(Sample {
                    offset,
                    size,
                    duration,
                    start,
                    keyframe,
                });

                start = start
                    .checked_add(u64::from(duration))
                    .ok_or_else(|| Error::corrupt_frame("mp4: timeline overflows"))?;
                offset = end;
                sample_index += 1;
            }
        }

        Ok(samples)
    }

    // --- fragmented parsing ---------------------------------------------

    /// Parses one `moof` image into per-track sample runs.
    fn parse_moof(&self, moof: &[u8], moof_offset: u64) -> Result<Option<PendingFragment>> {
        let mfhd = Boxes::find(moof, b"mfhd")?
            .ok_or_else(|| Error::corrupt_frame("mp4: moof without mfhd"))?;
        let sequence = be_u32(mfhd, 4)?;

        let track = self.primary_track()?;
        let mut samples = Vec::new();

        let mut boxes = Boxes::new(moof);
        while let Some((id, traf)) = boxes.next_box()? {
            if &id != b"traf" {
                continue;
            }
            let tfhd = Boxes::find(traf, b"tfhd")?
                .ok_or_else(|| Error::corrupt_frame("mp4: traf without tfhd"))?;
            let tfhd_flags = be_u32(tfhd, 0)? & 0x00FF_FFFF;
            let track_id = be_u32(tfhd, 4)?;
            if track_id != track.track_id {
                continue;
            }

            let mut cursor = 8usize;
            let base_offset = if tfhd_flags & 0x1 != 0 {
                let offset = be_u64(tfhd, cursor)?;
                cursor += 8;
                offset
            } else {
                // default-base-is-moof or legacy: the moof start.
                moof_offset
            };
            if tfhd_flags & 0x2 != 0 {
                cursor += 4; // sample description index
            }
            let default_duration = if tfhd_flags & 0x8 != 0 {
                let value = be_u32(tfhd, cursor)?;
                cursor += 4;
                value
            } else {
                track.defaults.sample_duration
            };
            let default_size = if tfhd_flags & 0x10 != 0 {
                let value = be_u32(tfhd, cursor)?;
                value
            } else {
                track.defaults.sample_size
            };

            let base_time = Boxes::find(traf, b"tfdt")?
                .and_then(|tfdt| {
                    if tfdt.first() == Some(&1) {
                        be_u64(tfdt, 4).ok()
                    } else {
                        be_u32(tfdt, 4).ok().map(u64::from)
                    }
                })
                .unwrap_or(0);

            let mut traf_boxes = Boxes::new(traf);
            let mut start = base_time;
            while let Some((traf_id, trun)) = traf_boxes.next_box()? {
                if &traf_id != b"trun" {
                    continue;
                }
                let trun_flags = be_u32(trun, 0)? & 0x00FF_FFFF;
                let sample_count = be_u32(trun, 4)?;
                let mut cursor = 8usize;

                let mut offset = base_offset;
                if trun_flags & 0x1 != 0 {
                    let data_offset = i64::from(be_u32(trun, cursor)? as i32);
                    cursor += 4;
                    offset = base_offset
                        .checked_add_signed(data_offset)
                        .ok_or_else(|| Error::corrupt_frame("mp4: trun offset overflows"))?;
                }
                if trun_flags & 0x4 != 0 {
                    cursor += 4; // first sample flags
                }

                for _ in 0..sample_count {
                    let duration = if trun_flags & 0x100 != 0 {
                        let value = be_u32(trun, cursor)?;
                        cursor += 4;
                        value
                    } else {
                        default_duration
                    };
                    let size = if trun_flags & 0x200 != 0 {
                        let value = be_u32(trun, cursor)?;
                        cursor += 4;
                        value
                    } else {
                        default_size
                    };
                    if trun_flags & 0x400 != 0 {
                        cursor += 4; // per-sample flags
                    }
                    if trun_flags & 0x800 != 0 {
                        cursor += 4; // composition offset
                    }

                    samples.push(Sample {
                        offset,
                        size,
                        duration,
                        start,
                        keyframe: true,
                    });
                    offset = offset
                        .checked_add(u64::from(size))
                        .ok_or_else(|| Error::corrupt_frame("mp4: fragment run overflows"))?;
                    start = start
                        .checked_add(u64::from(duration))
                        .ok_or_else(|| Error::corrupt_frame("mp4: fragment timeline overflows"))?;
                }
            }
        }

        if samples.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PendingFragment { sequence, samples }))
        }
    }

    /// Integrates collected fragments in sequence order, logging holes.
    fn integrate_fragments(&mut self, mut fragments: Vec<PendingFragment>) {
        fragments.sort_by_key(|fragment| fragment.sequence);

        let mut expected = fragments.first().map_or(1, |fragment| fragment.sequence);
        for fragment in fragments {
            if fragment.sequence > expected {
                let gap = fragment.sequence - expected;
                if gap <= FRAGMENT_REORDER_WINDOW {
                    warn!(
                        "mp4: missing fragment(s) {expected}..{} — continuing past hole",
                        fragment.sequence - 1
                    );
                } else {
                    warn!(
                        "mp4: {gap} fragments missing before {}, integrating anyway",
                        fragment.sequence
                    );
                }
            }
            expected = fragment.sequence + 1;
            self.tracks[self.primary].samples.extend(fragment.samples);
        }
    }

    // --- tags -----------------------------------------------------------

    fn parse_udta(&mut self, udta: &[u8]) -> Result<()> {
        let Some(meta) = Boxes::find(udta, b"meta")? else {
            return Ok(());
        };
        // meta is a full box: skip version/flags.
        let Some(ilst) = Boxes::find(meta.get(4..).unwrap_or(&[]), b"ilst")? else {
            return Ok(());
        };

        let mut boxes = Boxes::new(ilst);
        while let Some((id, item)) = boxes.next_box()? {
            let Some(data) = Boxes::find(item, b"data")? else {
                continue;
            };
            if data.len() < 8 {
                continue;
            }
            let data_type = be_u32(data, 0)? & 0x00FF_FFFF;
            let payload = &data[8..];
            let text = || String::from_utf8_lossy(payload).trim().to_string();

            match &id {
                b"\xA9nam" => self.tag.title = Some(text()),
                b"\xA9ART" => self.tag.artist = Some(text()),
                b"\xA9alb" => self.tag.album = Some(text()),
                b"\xA9gen" => self.tag.genre = Some(text()),
                b"\xA9cmt" => self.tag.comment = Some(text()),
                b"\xA9day" => {
                    self.tag.year = text().chars().take(4).collect::<String>().parse().ok();
                }
                b"trkn" => {
                    if payload.len() >= 4 {
                        self.tag.track =
                            Some(u32::from(u16::from_be_bytes([payload[2], payload[3]])));
                    }
                }
                b"covr" => {
                    let mime = match data_type {
                        14 => "image/png",
                        _ => "image/jpeg",
                    };
                    self.tag.pictures.push(Picture {
                        mime: mime.to_string(),
                        picture_type: crate::tag::PICTURE_TYPE_FRONT_COVER,
                        description: String::new(),
                        data: payload.to_vec(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Walks the MPEG-4 descriptor framing inside `esds`, returning the
/// object type indication and the decoder-specific info bytes.
fn parse_esds(esds: &[u8]) -> Result<(u8, Vec<u8>)> {
    // Full box: version/flags first.
    let mut pos = 4usize;
    let mut object_type = 0u8;
    let mut specific = Vec::new();

    while pos < esds.len() {
        let tag = esds[pos];
        pos += 1;
        // Descriptor lengths are base-128 with a continuation bit.
        let mut len = 0usize;
        for _ in 0..4 {
            let byte = *esds
                .get(pos)
                .ok_or_else(|| Error::corrupt_frame("mp4: truncated esds descriptor"))?;
            pos += 1;
            len = (len << 7) | usize::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                break;
            }
        }
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= esds.len())
            .ok_or_else(|| Error::corrupt_frame("mp4: esds descriptor beyond box"))?;

        match tag {
            // ES_Descriptor: id(2) + flags(1), then nested descriptors.
            0x03 => pos += 3,
            // DecoderConfigDescriptor: objectType(1) + stream type/buffer
            // sizes/bitrates (12), then nested DecSpecificInfo.
            0x04 => {
                object_type = *esds
                    .get(pos)
                    .ok_or_else(|| Error::corrupt_frame("mp4: truncated decoder config"))?;
                pos += 13;
            }
            0x05 => {
                specific = esds
                    .get(pos..end)
                    .ok_or_else(|| Error::corrupt_frame("mp4: truncated specific info"))?
                    .to_vec();
                pos = end;
            }
            _ => pos = end,
        }
    }

    Ok((object_type, specific))
}

impl Demuxer for Mp4Demuxer {
    fn name(&self) -> &'static str {
        "mp4"
    }

    fn parse_container(&mut self) -> Result<()> {
        let size = self.core.src().size();
        let mut saw_ftyp = false;
        let mut moov_image: Option<Vec<u8>> = None;
        let mut moof_images: Vec<(u64, Vec<u8>)> = Vec::new();

        // Top-level box walk over the whole file.
        loop {
            let box_start = self.core.src().tell();
            let mut header = [0u8; 8];
            let mut filled = 0usize;
            let mut ended = false;
            while filled < header.len() {
                let n = self.core.src().read(&mut header[filled..])?;
                if n == 0 {
                    ended = true;
                    break;
                }
                filled += n;
            }
            if ended {
                break;
            }

            let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let fourcc = [header[4], header[5], header[6], header[7]];
            let (header_len, box_size) = match size32 {
                0 => (
                    8u64,
                    size.map_or(u64::MAX, |size| size - box_start),
                ),
                1 => (16, self.core.read_u64_be()?),
                other => (8, u64::from(other)),
            };
            if box_size < header_len {
                return Err(self
                    .core
                    .record_error(Error::corrupt_frame("mp4: box smaller than header")));
            }
            if let Some(size) = size {
                if box_start.saturating_add(box_size) > size {
                    return Err(self.core.record_error(Error::corrupt_frame(format!(
                        "mp4: box {:?} exceeds file size",
                        String::from_utf8_lossy(&fourcc)
                    ))));
                }
            }
            let body_len = box_size - header_len;

            match &fourcc {
                b"ftyp" => {
                    saw_ftyp = true;
                    self.core.skip_bytes(body_len)?;
                }
                b"moov" => moov_image = Some(self.read_box_image(body_len)?),
                b"moof" => {
                    let image = self.read_box_image(body_len)?;
                    moof_images.push((box_start, image));
                }
                _ => self.core.skip_bytes(body_len)?,
            }
        }

        if !saw_ftyp && moov_image.is_none() {
            return Err(self
                .core
                .record_error(Error::bad_magic("mp4: neither ftyp nor moov present")));
        }
        let moov = moov_image.ok_or_else(|| {
            self.core
                .record_error(Error::truncated_header("mp4: no moov box"))
        })?;
        self.parse_moov(&moov)?;

        let audio_index = {
            // First audio stream, preferring the highest bitrate proxy
            // (total payload) when several are present.
            let mut best: Option<(usize, u64)> = None;
            for (index, track) in self.tracks.iter().enumerate() {
                let payload: u64 = track
                    .samples
                    .iter()
                    .map(|sample| u64::from(sample.size))
                    .sum();
                if best.is_none_or(|(_, best_payload)| payload > best_payload) {
                    best = Some((index, payload));
                }
            }
            best.map(|(index, _)| index)
        };
        self.primary = audio_index.ok_or_else(|| {
            self.core
                .record_error(Error::unsupported_variant("mp4: no audio track"))
        })?;

        if !moof_images.is_empty() {
            let mut fragments = Vec::new();
            for (offset, image) in &moof_images {
                if let Some(fragment) = self.parse_moof(image, *offset)? {
                    fragments.push(fragment);
                }
            }
            self.integrate_fragments(fragments);
        }

        let track = &self.tracks[self.primary];
        let duration_units = track
            .samples
            .last()
            .map_or(0, |sample| sample.start + u64::from(sample.duration));
        let duration_ms = Self::units_to_ms(track, duration_units);
        let duration_samples = Self::units_to_samples(track, duration_units);

        let mut info = StreamInfo::audio(track.track_id, &track.codec);
        info.sample_rate = track.sample_rate;
        info.channels = track.channels;
        info.bits_per_sample = track.bits_per_sample;
        info.duration_ms = duration_ms;
        info.duration_samples = duration_samples;
        info.codec_private = track.codec_private.clone();
        if duration_ms > 0 {
            let payload: u64 = track
                .samples
                .iter()
                .map(|sample| u64::from(sample.size))
                .sum();
            info.bitrate =
                u32::try_from(payload.saturating_mul(8_000) / duration_ms).unwrap_or(0);
        }
        info.tags = self.tag.clone();

        self.core.set_duration_ms(duration_ms);
        self.cursor = 0;
        self.core.set_parsed();

        // Stream info is synthesised on demand from the track list; keep
        // one canonical copy for the accessor.
        self.tracks[self.primary].codec_private = info.codec_private.clone();
        self.stream_info_cache = Some(info);

        debug!(
            "mp4: {} track(s), primary {} ({}), {} samples, fragmented: {}",
            self.tracks.len(),
            self.tracks[self.primary].track_id,
            self.tracks[self.primary].codec,
            self.tracks[self.primary].samples.len(),
            self.fragmented
        );
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.stream_info_cache.iter().cloned().collect()
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.core.ensure_parsed(self.name())?;
        let stream_id = self.primary_track()?.track_id;
        self.read_chunk_of(stream_id)
    }

    fn read_chunk_of(&mut self, stream_id: u32) -> Result<MediaChunk> {
        self.core.ensure_parsed(self.name())?;
        let track = self.primary_track()?;
        if track.track_id != stream_id {
            return Err(Error::invalid_argument(format!(
                "mp4: unknown stream id {stream_id}"
            )));
        }

        let Some(&sample) = track.samples.get(self.cursor) else {
            self.core.set_eof(true);
            return Ok(MediaChunk::end_of_stream(stream_id));
        };
        let timestamp_units = sample.start.saturating_sub(track.media_time.min(sample.start));
        let timestamp = Self::units_to_samples(track, timestamp_units);
        let end_timestamp =
            Self::units_to_samples(track, timestamp_units + u64::from(sample.duration));
        let position_ms = Self::units_to_ms(track, timestamp_units);
        let keyframe = sample.keyframe;

        self.core.src().seek(SeekFrom::Start(sample.offset))?;
        let data = self.core.read_bytes(sample.size as usize).map_err(|err| {
            self.core
                .record_error(Error::new(err.kind, format!("mp4: sample read: {err}")))
        })?;

        self.cursor += 1;
        self.core.set_position_ms(position_ms);

        Ok(MediaChunk {
            stream_id,
            data,
            timestamp_samples: timestamp,
            end_timestamp_samples: Some(end_timestamp),
            is_keyframe: keyframe,
        })
    }

    fn seek_to(&mut self, timestamp_ms: u64) -> Result<()> {
        self.core.ensure_parsed(self.name())?;
        let track = self.primary_track()?;

        let target_units = timestamp_ms
            .saturating_mul(u64::from(track.timescale))
            .checked_div(1000)
            .unwrap_or(0)
            .saturating_add(track.media_time);

        // Largest sample whose cumulative start is at or below the target.
        let mut index = track
            .samples
            .partition_point(|sample| sample.start <= target_units)
            .saturating_sub(1);

        // Round down to the nearest keyframe when the track has them.
        while index > 0 && !track.samples[index].keyframe {
            index -= 1;
        }

        let landed_units = track
            .samples
            .get(index)
            .map_or(0, |sample| sample.start.saturating_sub(track.media_time.min(sample.start)));
        let landed_ms = Self::units_to_ms(track, landed_units);

        self.cursor = index;
        self.core.set_eof(false);
        self.core.set_position_ms(landed_ms);
        trace!("mp4: seek to {timestamp_ms} ms landed on sample {index} ({landed_ms} ms)");
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
