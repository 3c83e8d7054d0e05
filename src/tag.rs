//! Read-only metadata extracted by demuxers.
//!
//! Demuxers surface whatever tagging their container carries — Vorbis
//! comments (Ogg, FLAC), `LIST/INFO` and ID3v2 (RIFF), iTunes-style `ilst`
//! (MP4) — through one [`Tag`] trait. Tag objects are snapshots: they do
//! not borrow demuxer internals and stay valid after the demuxer advances.
//!
//! Parsers for the two formats shared between containers live here too:
//! Vorbis comment blocks and ID3v2 frames.

use std::collections::HashMap;

use base64::Engine;

use crate::error::{Error, Result};

/// Picture type codes shared by FLAC PICTURE blocks and ID3v2 APIC frames.
/// `3` is the front cover.
pub const PICTURE_TYPE_FRONT_COVER: u8 = 3;

/// An embedded picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    /// MIME type, e.g. `image/jpeg`.
    pub mime: String,
    /// Picture type code (APIC/FLAC table; 3 = front cover).
    pub picture_type: u8,
    /// Free-form description.
    pub description: String,
    /// Raw image bytes.
    pub data: Vec<u8>,
}

/// Read-only tag snapshot.
///
/// All accessors return `None`/empty when the container carried no such
/// field. Implementations are value types safe to hold beyond the life of
/// the demuxer that produced them.
pub trait Tag: Send + Sync {
    /// Track title.
    fn title(&self) -> Option<&str>;

    /// Performing artist.
    fn artist(&self) -> Option<&str>;

    /// Album name.
    fn album(&self) -> Option<&str>;

    /// Genre name.
    fn genre(&self) -> Option<&str>;

    /// Release year.
    fn year(&self) -> Option<u32>;

    /// Track number within the album.
    fn track(&self) -> Option<u32>;

    /// Free-form comment.
    fn comment(&self) -> Option<&str>;

    /// Number of embedded pictures.
    fn picture_count(&self) -> usize;

    /// Returns the picture at `index`.
    fn get_picture(&self, index: usize) -> Option<&Picture>;

    /// Returns the front cover: the first picture typed as front cover,
    /// falling back to the first picture of any type.
    fn get_front_cover(&self) -> Option<&Picture> {
        (0..self.picture_count())
            .filter_map(|index| self.get_picture(index))
            .find(|picture| picture.picture_type == PICTURE_TYPE_FRONT_COVER)
            .or_else(|| self.get_picture(0))
    }
}

/// The empty tag. Valid wherever a container carries no metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTag;

impl Tag for NullTag {
    fn title(&self) -> Option<&str> {
        None
    }
    fn artist(&self) -> Option<&str> {
        None
    }
    fn album(&self) -> Option<&str> {
        None
    }
    fn genre(&self) -> Option<&str> {
        None
    }
    fn year(&self) -> Option<u32> {
        None
    }
    fn track(&self) -> Option<u32> {
        None
    }
    fn comment(&self) -> Option<&str> {
        None
    }
    fn picture_count(&self) -> usize {
        0
    }
    fn get_picture(&self, _index: usize) -> Option<&Picture> {
        None
    }
}

/// Concrete tag value built up by demuxers.
#[derive(Clone, Debug, Default)]
pub struct StandardTag {
    /// Track title.
    pub title: Option<String>,
    /// Performing artist.
    pub artist: Option<String>,
    /// Album name.
    pub album: Option<String>,
    /// Genre name.
    pub genre: Option<String>,
    /// Release year.
    pub year: Option<u32>,
    /// Track number.
    pub track: Option<u32>,
    /// Free-form comment.
    pub comment: Option<String>,
    /// Embedded pictures in file order.
    pub pictures: Vec<Picture>,
}

impl StandardTag {
    /// Whether no field and no picture is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.genre.is_none()
            && self.year.is_none()
            && self.track.is_none()
            && self.comment.is_none()
            && self.pictures.is_empty()
    }

    /// Applies one `KEY=value` Vorbis comment to the matching field.
    fn apply_vorbis_comment(&mut self, key: &str, value: &str) {
        match key.to_ascii_uppercase().as_str() {
            "TITLE" => self.title = Some(value.to_string()),
            "ARTIST" => self.artist = Some(value.to_string()),
            "ALBUM" => self.album = Some(value.to_string()),
            "GENRE" => self.genre = Some(value.to_string()),
            "DATE" | "YEAR" => self.year = parse_year(value),
            "TRACKNUMBER" => self.track = parse_track(value),
            "COMMENT" | "DESCRIPTION" => self.comment = Some(value.to_string()),
            "METADATA_BLOCK_PICTURE" => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(value.trim())
                    .ok();
                if let Some(picture) = decoded.and_then(|bytes| parse_flac_picture(&bytes).ok()) {
                    self.pictures.push(picture);
                } else {
                    debug!("discarding undecodable METADATA_BLOCK_PICTURE comment");
                }
            }
            _ => {}
        }
    }
}

impl Tag for StandardTag {
    fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }
    fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }
    fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }
    fn genre(&self) -> Option<&str> {
        self.genre.as_deref()
    }
    fn year(&self) -> Option<u32> {
        self.year
    }
    fn track(&self) -> Option<u32> {
        self.track
    }
    fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
    fn picture_count(&self) -> usize {
        self.pictures.len()
    }
    fn get_picture(&self, index: usize) -> Option<&Picture> {
        self.pictures.get(index)
    }
}

/// `"2021-05-01"` or `"2021"` -> `2021`.
fn parse_year(value: &str) -> Option<u32> {
    let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() == 4 {
        digits.parse().ok()
    } else {
        None
    }
}

/// `"3"` or `"3/12"` -> `3`.
fn parse_track(value: &str) -> Option<u32> {
    value
        .split('/')
        .next()
        .and_then(|number| number.trim().parse().ok())
}

/// Parses a Vorbis comment block (RFC 7845 §5.2 framing, shared by Vorbis,
/// Opus and FLAC) starting at the vendor length field.
///
/// Unknown keys are returned in `extra` so callers can surface extended
/// metadata; recognised keys populate the [`StandardTag`].
///
/// # Errors
///
/// Returns `CorruptFrame` when a declared length exceeds the block.
pub fn parse_vorbis_comments(data: &[u8]) -> Result<(StandardTag, HashMap<String, String>)> {
    let mut tag = StandardTag::default();
    let mut extra = HashMap::new();
    let mut cursor = 0usize;

    let vendor_len = read_u32_le(data, &mut cursor)? as usize;
    cursor = cursor
        .checked_add(vendor_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::corrupt_frame("vendor string exceeds comment block"))?;

    let count = read_u32_le(data, &mut cursor)?;
    for _ in 0..count {
        let len = read_u32_le(data, &mut cursor)? as usize;
        let end = cursor
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::corrupt_frame("comment exceeds comment block"))?;
        let comment = String::from_utf8_lossy(&data[cursor..end]);
        cursor = end;

        if let Some((key, value)) = comment.split_once('=') {
            tag.apply_vorbis_comment(key, value);
            extra.insert(key.to_ascii_uppercase(), value.to_string());
        }
    }

    Ok((tag, extra))
}

/// Parses a FLAC PICTURE block body (also the payload of Vorbis
/// `METADATA_BLOCK_PICTURE` comments).
///
/// # Errors
///
/// Returns `CorruptFrame` when a declared length exceeds the block.
pub fn parse_flac_picture(data: &[u8]) -> Result<Picture> {
    let mut cursor = 0usize;
    let picture_type = read_u32_be(data, &mut cursor)?;

    let mime_len = read_u32_be(data, &mut cursor)? as usize;
    let mime = take(data, &mut cursor, mime_len)?;
    let mime = String::from_utf8_lossy(mime).into_owned();

    let desc_len = read_u32_be(data, &mut cursor)? as usize;
    let description = take(data, &mut cursor, desc_len)?;
    let description = String::from_utf8_lossy(description).into_owned();

    // Width, height, depth, palette size.
    cursor = cursor
        .checked_add(16)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::corrupt_frame("picture block truncated"))?;

    let data_len = read_u32_be(data, &mut cursor)? as usize;
    let bytes = take(data, &mut cursor, data_len)?;

    Ok(Picture {
        mime,
        picture_type: u8::try_from(picture_type.min(255)).unwrap_or(0),
        description,
        data: bytes.to_vec(),
    })
}

/// Parses an ID3v2.3/2.4 tag (as embedded in RIFF `id3 ` chunks).
///
/// Handles the common text frames (TIT2, TPE1, TALB, TCON, TRCK,
/// TYER/TDRC), COMM and APIC. Unsynchronisation and extended headers are
/// not supported; tags using them yield whatever frames parse cleanly.
///
/// # Errors
///
/// Returns `CorruptFrame` when the header is absent or truncated.
pub fn parse_id3v2(data: &[u8]) -> Result<StandardTag> {
    if data.len() < 10 || &data[0..3] != b"ID3" {
        return Err(Error::corrupt_frame("missing ID3v2 header"));
    }
    let version = data[3];
    let size = syncsafe_u32(&data[6..10]) as usize;
    let end = (10 + size).min(data.len());

    let mut tag = StandardTag::default();
    let mut cursor = 10usize;
    while cursor + 10 <= end {
        let id = &data[cursor..cursor + 4];
        if id.iter().all(|byte| *byte == 0) {
            break; // padding
        }
        let frame_size = if version >= 4 {
            syncsafe_u32(&data[cursor + 4..cursor + 8]) as usize
        } else {
            u32::from_be_bytes([
                data[cursor + 4],
                data[cursor + 5],
                data[cursor + 6],
                data[cursor + 7],
            ]) as usize
        };
        cursor += 10;
        let Some(frame_end) = cursor.checked_add(frame_size).filter(|e| *e <= end) else {
            break;
        };
        let body = &data[cursor..frame_end];
        cursor = frame_end;

        match id {
            b"TIT2" => tag.title = decode_text_frame(body),
            b"TPE1" => tag.artist = decode_text_frame(body),
            b"TALB" => tag.album = decode_text_frame(body),
            b"TCON" => tag.genre = decode_text_frame(body),
            b"TRCK" => tag.track = decode_text_frame(body).as_deref().and_then(parse_track),
            b"TYER" | b"TDRC" => {
                tag.year = decode_text_frame(body).as_deref().and_then(parse_year);
            }
            b"COMM" => tag.comment = decode_comment_frame(body),
            b"APIC" => {
                if let Some(picture) = decode_apic_frame(body) {
                    tag.pictures.push(picture);
                }
            }
            _ => {}
        }
    }

    Ok(tag)
}

/// Text frame: encoding byte then text.
fn decode_text_frame(body: &[u8]) -> Option<String> {
    let (encoding, text) = body.split_first()?;
    let decoded = decode_id3_text(*encoding, text)?;
    let trimmed = decoded.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// COMM frame: encoding, 3-byte language, short description, text.
fn decode_comment_frame(body: &[u8]) -> Option<String> {
    let (encoding, rest) = body.split_first()?;
    let rest = rest.get(3..)?;
    let text_start = match encoding {
        1 | 2 => rest
            .chunks_exact(2)
            .position(|pair| pair == [0, 0])
            .map(|pairs| pairs * 2 + 2)?,
        _ => rest.iter().position(|byte| *byte == 0)? + 1,
    };
    let decoded = decode_id3_text(*encoding, rest.get(text_start..)?)?;
    let trimmed = decoded.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// APIC frame: encoding, MIME (latin-1, NUL), type byte, description, data.
fn decode_apic_frame(body: &[u8]) -> Option<Picture> {
    let (encoding, rest) = body.split_first()?;
    let mime_end = rest.iter().position(|byte| *byte == 0)?;
    let mime = String::from_utf8_lossy(&rest[..mime_end]).into_owned();
    let rest = rest.get(mime_end + 1..)?;

    let (picture_type, rest) = rest.split_first()?;
    let desc_len = match encoding {
        1 | 2 => rest
            .chunks_exact(2)
            .position(|pair| pair == [0, 0])
            .map(|pairs| pairs * 2 + 2)?,
        _ => rest.iter().position(|byte| *byte == 0)? + 1,
    };
    let description =
        decode_id3_text(*encoding, rest.get(..desc_len)?).unwrap_or_default();
    let data = rest.get(desc_len..)?.to_vec();

    Some(Picture {
        mime,
        picture_type: *picture_type,
        description: description.trim_end_matches('\0').to_string(),
        data,
    })
}

/// Decodes ID3 text per the encoding byte: 0 latin-1, 1/2 UTF-16, 3 UTF-8.
fn decode_id3_text(encoding: u8, bytes: &[u8]) -> Option<String> {
    match encoding {
        0 => Some(bytes.iter().map(|byte| char::from(*byte)).collect()),
        1 | 2 => {
            let (start, big_endian) = match bytes {
                [0xFF, 0xFE, ..] => (2, false),
                [0xFE, 0xFF, ..] => (2, true),
                _ => (0, encoding == 2),
            };
            let units: Vec<u16> = bytes[start..]
                .chunks_exact(2)
                .map(|pair| {
                    if big_endian {
                        u16::from_be_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_le_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            Some(
                char::decode_utf16(units)
                    .map(|result| result.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
            )
        }
        3 => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

/// Four 7-bit bytes, big-endian.
fn syncsafe_u32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0, |acc, byte| (acc << 7) | u32::from(byte & 0x7F))
}

fn read_u32_le(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = take(data, cursor, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u32_be(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = take(data, cursor, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::corrupt_frame("field exceeds enclosing block"))?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}
