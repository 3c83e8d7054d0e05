//! Top-level entry: URI in, ready-to-play PCM stream out.
//!
//! [`MediaFactory::open`] resolves a URI to a byte source (local file or
//! HTTP), probes the format registry for candidates (magic bytes, MIME
//! hint, extension), and tries each candidate demuxer in turn — a
//! `BadMagic` rejection moves on to the next, anything else is final.
//! When no candidate accepts the stream the open fails
//! `UnsupportedFormat`.
//!
//! URI semantics: `file:///path`, `file:/path`, bare absolute and relative
//! paths all name local files; `http://` and `https://` name remote
//! resources.

use url::Url;

use crate::{
    config::OpenOptions,
    error::{Error, ErrorKind, Result},
    registry::FormatRegistry,
    source::{ByteSource, FileByteSource, HttpByteSource},
    stream::DemuxedStream,
};

/// How a URI resolves to bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Resolved {
    File(String),
    Http(Url),
}

/// Factory turning URIs into [`DemuxedStream`]s.
pub struct MediaFactory;

impl MediaFactory {
    /// Opens a URI as a ready-to-pull PCM stream.
    ///
    /// # Errors
    ///
    /// `NotFound`/`PermissionDenied` from source resolution,
    /// `UnsupportedFormat` when no registered demuxer accepts the bytes,
    /// and parse or codec errors from the winning candidate.
    pub fn open(uri: &str, options: &OpenOptions) -> Result<DemuxedStream> {
        let resolved = Self::resolve(uri)?;

        // Probe once for the ordered candidate list, then re-open the
        // source per attempt; a demuxer consumes its source even when it
        // rejects the stream.
        let probe_src = Self::open_resolved(&resolved, options)?;
        let registry = FormatRegistry::global();

        let mut candidates: Vec<String> = Vec::new();
        if let Some(preferred) = &options.prefer_format_id {
            candidates.push(preferred.clone());
        } else {
            if let Some(by_magic) = registry.probe(probe_src.as_ref(), None)? {
                candidates.push(by_magic);
            }
            let mime = options
                .mime_hint
                .clone()
                .or_else(|| probe_src.content_type());
            if let Some(by_mime) = mime.as_deref().and_then(|mime| registry.format_for_mime(mime))
            {
                if !candidates.contains(&by_mime) {
                    candidates.push(by_mime);
                }
            }
            if let Some(by_extension) = probe_src
                .path_hint()
                .as_deref()
                .and_then(|path| registry.format_for_extension(path))
            {
                if !candidates.contains(&by_extension) {
                    candidates.push(by_extension);
                }
            }
        }
        probe_src.close()?;

        if candidates.is_empty() {
            return Err(Error::unsupported_format(format!(
                "{uri}: no magic, MIME or extension match"
            )));
        }

        let mut last_rejection = None;
        for format_id in candidates {
            let src = Self::open_resolved(&resolved, options)?;
            match DemuxedStream::open_with_format(src, &format_id, options) {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind == ErrorKind::BadMagic => {
                    debug!("{uri}: {format_id} demuxer rejected the stream: {err}");
                    last_rejection = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::unsupported_format(format!(
            "{uri}: every candidate demuxer rejected the stream{}",
            last_rejection.map_or(String::new(), |err| format!(" (last: {err})"))
        )))
    }

    /// Opens just the byte source for a URI, without probing.
    ///
    /// # Errors
    ///
    /// As the underlying source constructors.
    pub fn open_source(uri: &str, options: &OpenOptions) -> Result<Box<dyn ByteSource>> {
        let resolved = Self::resolve(uri)?;
        Self::open_resolved(&resolved, options)
    }

    fn open_resolved(resolved: &Resolved, options: &OpenOptions) -> Result<Box<dyn ByteSource>> {
        match resolved {
            Resolved::File(path) => {
                let cancel = options.cancel.clone().unwrap_or_default();
                Ok(Box::new(FileByteSource::open(path, cancel)?))
            }
            Resolved::Http(url) => Ok(Box::new(HttpByteSource::open(url.clone(), options)?)),
        }
    }

    /// Maps a URI to its transport.
    ///
    /// Bare and relative paths are files; a single-letter scheme is a
    /// Windows drive, not a scheme.
    fn resolve(uri: &str) -> Result<Resolved> {
        let scheme_len = uri.find(':').unwrap_or(0);
        let has_scheme = scheme_len > 1
            && uri[..scheme_len]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');

        if !has_scheme {
            return Ok(Resolved::File(uri.to_string()));
        }

        let scheme = uri[..scheme_len].to_ascii_lowercase();
        match scheme.as_str() {
            "file" => {
                let url = Url::parse(uri)?;
                let path = url
                    .to_file_path()
                    .map_err(|()| Error::invalid_argument(format!("{uri}: not a file path")))?;
                Ok(Resolved::File(path.to_string_lossy().into_owned()))
            }
            "http" | "https" => Ok(Resolved::Http(Url::parse(uri)?)),
            other => Err(Error::unsupported_format(format!(
                "{uri}: unsupported scheme {other}"
            ))),
        }
    }
}
