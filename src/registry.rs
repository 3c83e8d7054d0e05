//! Format detection and factory registry.
//!
//! The process-wide [`FormatRegistry`] maps magic-byte signatures to
//! demuxer factories and codec tokens to codec factories. Probing walks
//! signatures in descending priority and only falls back to extension
//! hints when no magic matches — a file whose bytes say RIFF is RIFF no
//! matter what its name claims. Additional demuxers and codecs can be
//! registered at runtime; registration takes the write lock, probing the
//! read lock.

use std::{
    collections::HashMap,
    io::SeekFrom,
    sync::{OnceLock, RwLock},
};

use crate::{
    codec::{
        adapter::SymphoniaCodec, flac::FlacCodec, opus::OpusCodec, pcm::AdpcmCodec,
        pcm::PcmCodec, vorbis::VorbisCodec, Codec,
    },
    config::OpenOptions,
    demux::{
        aiff::AiffDemuxer, flac::FlacDemuxer, mp4::Mp4Demuxer, ogg::OggDemuxer, raw::RawDemuxer,
        riff::RiffDemuxer, Demuxer, StreamInfo,
    },
    error::{Error, Result},
    source::ByteSource,
};

/// Bytes examined during a probe.
pub const PROBE_LEN: usize = 64;

/// A magic-byte record.
///
/// `pattern` is compared at `offset` in the probe window; `mask` (when
/// present) selects which bits must match. Records are held in descending
/// priority order and the tuple `(format_id, offset, pattern)` is unique.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatSignature {
    /// Format this signature selects.
    pub format_id: String,
    /// Expected bytes.
    pub pattern: Vec<u8>,
    /// Offset of the pattern within the stream.
    pub offset: u32,
    /// Higher priority wins ties.
    pub priority: i32,
    /// Optional bitmask, same length as `pattern`.
    pub mask: Option<Vec<u8>>,
}

impl FormatSignature {
    fn matches(&self, window: &[u8]) -> bool {
        let start = self.offset as usize;
        let Some(candidate) = window.get(start..start + self.pattern.len()) else {
            return false;
        };
        match &self.mask {
            Some(mask) => candidate
                .iter()
                .zip(&self.pattern)
                .zip(mask)
                .all(|((byte, pattern), mask)| byte & mask == pattern & mask),
            None => candidate == self.pattern,
        }
    }
}

/// Human-facing description of a supported format.
#[derive(Clone, Debug)]
pub struct MediaFormat {
    /// Stable identifier, e.g. `"ogg"`.
    pub format_id: String,
    /// Display name for UIs.
    pub display_name: String,
    /// Extensions (lowercase, no dot) associated with the format.
    pub extensions: Vec<String>,
    /// MIME types associated with the format.
    pub mime_types: Vec<String>,
    /// Selection priority.
    pub priority: i32,
    /// Whether the format can play from an unseekable stream.
    pub supports_streaming: bool,
    /// Whether the demuxer implements seeking.
    pub supports_seeking: bool,
    /// Free-form description.
    pub description: String,
}

type DemuxerFactory =
    Box<dyn Fn(Box<dyn ByteSource>, &OpenOptions) -> Result<Box<dyn Demuxer>> + Send + Sync>;
type CodecFactory = Box<dyn Fn(&StreamInfo, &OpenOptions) -> Result<Box<dyn Codec>> + Send + Sync>;

/// Process-wide registry of formats, demuxers and codecs.
pub struct FormatRegistry {
    signatures: RwLock<Vec<FormatSignature>>,
    formats: RwLock<HashMap<String, MediaFormat>>,
    demuxers: RwLock<HashMap<String, DemuxerFactory>>,
    codecs: RwLock<HashMap<String, CodecFactory>>,
}

static REGISTRY: OnceLock<FormatRegistry> = OnceLock::new();

impl FormatRegistry {
    /// Returns the process-wide registry, with built-ins installed.
    #[must_use]
    pub fn global() -> &'static Self {
        REGISTRY.get_or_init(|| {
            let registry = Self {
                signatures: RwLock::new(Vec::new()),
                formats: RwLock::new(HashMap::new()),
                demuxers: RwLock::new(HashMap::new()),
                codecs: RwLock::new(HashMap::new()),
            };
            registry.install_builtins();
            registry
        })
    }

    /// Registers a signature, keeping descending priority order. A record
    /// with the same `(format_id, offset, pattern)` replaces the old one.
    pub fn register_signature(&self, signature: FormatSignature) {
        if let Ok(mut signatures) = self.signatures.write() {
            signatures.retain(|existing| {
                !(existing.format_id == signature.format_id
                    && existing.offset == signature.offset
                    && existing.pattern == signature.pattern)
            });
            let position = signatures
                .partition_point(|existing| existing.priority >= signature.priority);
            signatures.insert(position, signature);
        }
    }

    /// Registers (or replaces) a format description.
    pub fn register_format(&self, format: MediaFormat) {
        if let Ok(mut formats) = self.formats.write() {
            formats.insert(format.format_id.clone(), format);
        }
    }

    /// Registers (or replaces) a demuxer factory for a format id.
    pub fn register_demuxer<F>(&self, format_id: &str, factory: F)
    where
        F: Fn(Box<dyn ByteSource>, &OpenOptions) -> Result<Box<dyn Demuxer>>
            + Send
            + Sync
            + 'static,
    {
        if let Ok(mut demuxers) = self.demuxers.write() {
            demuxers.insert(format_id.to_string(), Box::new(factory));
        }
    }

    /// Registers (or replaces) a codec factory for a codec token.
    pub fn register_codec<F>(&self, codec_name: &str, factory: F)
    where
        F: Fn(&StreamInfo, &OpenOptions) -> Result<Box<dyn Codec>> + Send + Sync + 'static,
    {
        if let Ok(mut codecs) = self.codecs.write() {
            codecs.insert(codec_name.to_string(), Box::new(factory));
        }
    }

    /// All known signatures, highest priority first.
    #[must_use]
    pub fn signatures(&self) -> Vec<FormatSignature> {
        self.signatures
            .read()
            .map(|signatures| signatures.clone())
            .unwrap_or_default()
    }

    /// All known format descriptions.
    #[must_use]
    pub fn formats(&self) -> Vec<MediaFormat> {
        self.formats
            .read()
            .map(|formats| formats.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The format claiming a MIME type, if any.
    #[must_use]
    pub fn format_for_mime(&self, mime: &str) -> Option<String> {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or(mime)
            .trim()
            .to_ascii_lowercase();
        self.formats.read().ok().and_then(|formats| {
            formats
                .values()
                .find(|format| format.mime_types.iter().any(|known| *known == mime))
                .map(|format| format.format_id.clone())
        })
    }

    /// The format claiming a path's extension, if any.
    #[must_use]
    pub fn format_for_extension(&self, path: &str) -> Option<String> {
        let extension = path.rsplit('.').next()?.to_ascii_lowercase();
        self.formats.read().ok().and_then(|formats| {
            let mut candidates: Vec<&MediaFormat> = formats
                .values()
                .filter(|format| format.extensions.iter().any(|known| *known == extension))
                .collect();
            candidates.sort_by_key(|format| -format.priority);
            candidates.first().map(|format| format.format_id.clone())
        })
    }

    /// Identifies the container in `src`.
    ///
    /// Reads the probe window, restores the stream position, walks
    /// signatures in descending priority, and only then consults the path
    /// hint for extension-only formats (magic beats extension).
    ///
    /// # Errors
    ///
    /// Transport errors from reading or rewinding the source.
    pub fn probe(
        &self,
        src: &dyn ByteSource,
        path_hint: Option<&str>,
    ) -> Result<Option<String>> {
        let mut window = [0u8; PROBE_LEN];
        src.seek(SeekFrom::Start(0))?;
        let mut filled = 0usize;
        while filled < window.len() {
            let n = src.read(&mut window[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        src.seek(SeekFrom::Start(0))?;

        if let Ok(signatures) = self.signatures.read() {
            for signature in signatures.iter() {
                if signature.matches(&window[..filled]) {
                    trace!(
                        "probe matched {} at offset {}",
                        signature.format_id,
                        signature.offset
                    );
                    return Ok(Some(signature.format_id.clone()));
                }
            }
        }

        if let Some(path) = path_hint {
            if let Some(format_id) = self.format_for_extension(path) {
                debug!("probe fell back to extension for {format_id}");
                return Ok(Some(format_id));
            }
        }

        Ok(None)
    }

    /// Constructs the demuxer registered for a format id.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` for unknown ids; factory errors pass through.
    pub fn make_demuxer(
        &self,
        format_id: &str,
        src: Box<dyn ByteSource>,
        options: &OpenOptions,
    ) -> Result<Box<dyn Demuxer>> {
        let demuxers = self.demuxers.read()?;
        let factory = demuxers.get(format_id).ok_or_else(|| {
            Error::unsupported_format(format!("no demuxer registered for {format_id}"))
        })?;
        factory(src, options)
    }

    /// Constructs the codec registered for a stream's codec token.
    ///
    /// # Errors
    ///
    /// `UnsupportedVariant` for unknown tokens; factory errors pass
    /// through.
    pub fn make_codec(
        &self,
        info: &StreamInfo,
        options: &OpenOptions,
    ) -> Result<Box<dyn Codec>> {
        let codecs = self.codecs.read()?;
        let factory = codecs.get(info.codec_name.as_str()).ok_or_else(|| {
            Error::unsupported_variant(format!(
                "no codec registered for {}",
                info.codec_name
            ))
        })?;
        factory(info, options)
    }

    fn install_builtins(&self) {
        // Container magic. RIFF/WAVE and FORM/AIFF pair a leading fourcc
        // with a discriminator at offset 8, expressed as one masked
        // pattern so a lone "RIFF" (e.g. AVI, WEBP) does not match.
        self.register_signature(FormatSignature {
            format_id: "ogg".into(),
            pattern: b"OggS".to_vec(),
            offset: 0,
            priority: 100,
            mask: None,
        });
        self.register_signature(FormatSignature {
            format_id: "flac".into(),
            pattern: b"fLaC".to_vec(),
            offset: 0,
            priority: 100,
            mask: None,
        });
        self.register_signature(FormatSignature {
            format_id: "riff".into(),
            pattern: b"RIFF\0\0\0\0WAVE".to_vec(),
            offset: 0,
            priority: 100,
            mask: Some(vec![
                0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF,
            ]),
        });
        self.register_signature(FormatSignature {
            format_id: "aiff".into(),
            pattern: b"FORM\0\0\0\0AIF".to_vec(),
            offset: 0,
            priority: 100,
            mask: Some(vec![
                0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF,
            ]),
        });
        self.register_signature(FormatSignature {
            format_id: "mp4".into(),
            pattern: b"ftyp".to_vec(),
            offset: 4,
            priority: 90,
            mask: None,
        });

        self.register_format(MediaFormat {
            format_id: "ogg".into(),
            display_name: "Ogg".into(),
            extensions: vec!["ogg".into(), "oga".into(), "opus".into(), "spx".into()],
            mime_types: vec!["audio/ogg".into(), "application/ogg".into()],
            priority: 100,
            supports_streaming: true,
            supports_seeking: true,
            description: "Ogg container with Vorbis, Opus or FLAC streams".into(),
        });
        self.register_format(MediaFormat {
            format_id: "flac".into(),
            display_name: "FLAC".into(),
            extensions: vec!["flac".into()],
            mime_types: vec!["audio/flac".into(), "audio/x-flac".into()],
            priority: 100,
            supports_streaming: true,
            supports_seeking: true,
            description: "Native FLAC stream".into(),
        });
        self.register_format(MediaFormat {
            format_id: "riff".into(),
            display_name: "WAVE".into(),
            extensions: vec!["wav".into(), "wave".into()],
            mime_types: vec!["audio/wav".into(), "audio/x-wav".into(), "audio/wave".into()],
            priority: 100,
            supports_streaming: true,
            supports_seeking: true,
            description: "RIFF/WAVE with PCM, float, G.711 or ADPCM audio".into(),
        });
        self.register_format(MediaFormat {
            format_id: "aiff".into(),
            display_name: "AIFF".into(),
            extensions: vec!["aiff".into(), "aif".into(), "aifc".into()],
            mime_types: vec!["audio/aiff".into(), "audio/x-aiff".into()],
            priority: 100,
            supports_streaming: true,
            supports_seeking: true,
            description: "AIFF / AIFF-C".into(),
        });
        self.register_format(MediaFormat {
            format_id: "mp4".into(),
            display_name: "MP4".into(),
            extensions: vec!["mp4".into(), "m4a".into(), "m4b".into(), "mov".into()],
            mime_types: vec!["audio/mp4".into(), "video/mp4".into(), "audio/x-m4a".into()],
            priority: 90,
            supports_streaming: false,
            supports_seeking: true,
            description: "ISO-BMFF with AAC, ALAC, MP3, FLAC or PCM audio".into(),
        });
        // Extension-only: no magic to probe.
        self.register_format(MediaFormat {
            format_id: "raw".into(),
            display_name: "Raw audio".into(),
            extensions: vec![
                "pcm".into(),
                "raw".into(),
                "ulaw".into(),
                "alaw".into(),
                "au".into(),
            ],
            mime_types: vec!["audio/basic".into(), "audio/l16".into()],
            priority: 10,
            supports_streaming: true,
            supports_seeking: true,
            description: "Headerless PCM or G.711 telephony audio".into(),
        });

        self.register_demuxer("ogg", |src, options| {
            Ok(Box::new(OggDemuxer::new(src, options)) as Box<dyn Demuxer>)
        });
        self.register_demuxer("flac", |src, options| {
            Ok(Box::new(FlacDemuxer::new(src, options)) as Box<dyn Demuxer>)
        });
        self.register_demuxer("riff", |src, options| {
            Ok(Box::new(RiffDemuxer::new(src, options)) as Box<dyn Demuxer>)
        });
        self.register_demuxer("aiff", |src, options| {
            Ok(Box::new(AiffDemuxer::new(src, options)) as Box<dyn Demuxer>)
        });
        self.register_demuxer("mp4", |src, options| {
            Ok(Box::new(Mp4Demuxer::new(src, options)) as Box<dyn Demuxer>)
        });
        self.register_demuxer("raw", |src, options| {
            Ok(Box::new(RawDemuxer::from_options(src, options)?) as Box<dyn Demuxer>)
        });

        self.register_codec("vorbis", |_, _| {
            Ok(Box::new(VorbisCodec::new()) as Box<dyn Codec>)
        });
        self.register_codec("opus", |_, _| {
            Ok(Box::new(OpusCodec::new()) as Box<dyn Codec>)
        });
        self.register_codec("flac", |info, options| {
            Ok(Box::new(FlacCodec::new(info, options.enable_md5_check)) as Box<dyn Codec>)
        });
        self.register_codec("aac", |info, _| {
            Ok(Box::new(SymphoniaCodec::aac(info)) as Box<dyn Codec>)
        });
        self.register_codec("alac", |info, _| {
            Ok(Box::new(SymphoniaCodec::alac(info)) as Box<dyn Codec>)
        });
        self.register_codec("mp3", |info, _| {
            Ok(Box::new(SymphoniaCodec::mp3(info)) as Box<dyn Codec>)
        });
        for token in [
            "pcm_u8", "pcm_s8", "pcm_s16le", "pcm_s16be", "pcm_s24le", "pcm_s24be", "pcm_s32le",
            "pcm_s32be", "pcm_f32le", "pcm_f32be", "pcm_f64le", "pcm_f64be", "ulaw", "alaw",
        ] {
            self.register_codec(token, |info, _| {
                Ok(Box::new(PcmCodec::new(info)?) as Box<dyn Codec>)
            });
        }
        for token in ["adpcm_ima", "adpcm_ms"] {
            self.register_codec(token, |info, _| {
                Ok(Box::new(AdpcmCodec::new(info)?) as Box<dyn Codec>)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CancelToken;
    use crate::source::FileByteSource;
    use std::io::Write;

    fn source_for(bytes: &[u8], suffix: &str) -> (FileByteSource, tempfile::NamedTempFile) {
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
        (src, file)
    }

    #[test]
    fn magic_beats_extension() {
        // RIFF/WAVE bytes in a file claiming to be .ogg.
        let mut bytes = b"RIFF\x24\x00\x00\x00WAVE".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let (src, file) = source_for(&bytes, ".ogg");

        let detected = FormatRegistry::global()
            .probe(&src, file.path().to_str())
            .expect("probe");
        assert_eq!(detected.as_deref(), Some("riff"));
    }

    #[test]
    fn lone_riff_does_not_match_wave() {
        let mut bytes = b"RIFF\x24\x00\x00\x00AVI ".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let (src, _file) = source_for(&bytes, ".wav");

        let detected = FormatRegistry::global().probe(&src, None).expect("probe");
        assert_eq!(detected, None);
    }

    #[test]
    fn extension_only_formats_need_the_hint() {
        let bytes = vec![0x42u8; 64];
        let (src, file) = source_for(&bytes, ".ulaw");

        let registry = FormatRegistry::global();
        assert_eq!(registry.probe(&src, None).expect("probe"), None);
        assert_eq!(
            registry
                .probe(&src, file.path().to_str())
                .expect("probe")
                .as_deref(),
            Some("raw")
        );
    }

    #[test]
    fn probe_restores_position() {
        let mut bytes = b"OggS".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let (src, _file) = source_for(&bytes, ".ogg");

        src.seek(SeekFrom::Start(2)).expect("seek");
        FormatRegistry::global().probe(&src, None).expect("probe");
        assert_eq!(src.tell(), 0);
    }

    #[test]
    fn mp4_magic_sits_at_offset_four() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&24u32.to_be_bytes());
        bytes.extend_from_slice(b"ftypisom");
        bytes.extend_from_slice(&[0u8; 64]);
        let (src, _file) = source_for(&bytes, ".m4a");

        let detected = FormatRegistry::global().probe(&src, None).expect("probe");
        assert_eq!(detected.as_deref(), Some("mp4"));
    }

    #[test]
    fn mime_lookup_ignores_parameters() {
        let registry = FormatRegistry::global();
        assert_eq!(
            registry.format_for_mime("audio/ogg; codecs=vorbis").as_deref(),
            Some("ogg")
        );
        assert_eq!(registry.format_for_mime("text/html"), None);
    }

    #[test]
    fn runtime_registration_is_visible() {
        let registry = FormatRegistry::global();
        registry.register_signature(FormatSignature {
            format_id: "test-fmt".into(),
            pattern: b"TEST".to_vec(),
            offset: 0,
            priority: 120,
            mask: None,
        });

        let mut bytes = b"TEST".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let (src, _file) = source_for(&bytes, ".bin");
        assert_eq!(
            registry.probe(&src, None).expect("probe").as_deref(),
            Some("test-fmt")
        );
    }

    #[test]
    fn unknown_codec_token_is_unsupported_variant() {
        let info = StreamInfo::audio(0, "theora");
        let err = FormatRegistry::global()
            .make_codec(&info, &OpenOptions::default())
            .expect_err("must fail");
        assert_eq!(err.kind, crate::error::ErrorKind::UnsupportedVariant);
    }
}
