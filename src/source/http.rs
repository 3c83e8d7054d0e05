//! HTTP byte source with range-request seeking.
//!
//! Presents the [`ByteSource`] contract over an HTTP(S) resource. Seeking is
//! emulated with `Range: bytes=...` requests when the server advertises
//! support; a small ring buffer absorbs forward re-reads so that demuxer
//! probe-then-rewind patterns do not re-fetch. Servers without range support
//! still stream sequentially, and seeks beyond the read frontier fail.
//!
//! # Requests
//!
//! * Lazy initialisation: the first read issues a `GET` with
//!   `Range: bytes=0-` and inspects the response (status 206, or
//!   `Accept-Ranges: bytes`) for range capability, `Content-Range`/
//!   `Content-Length` for the total size, and `Content-Type` plus the
//!   Icecast `icy-*` headers for metadata.
//! * Each positioned read fetches a bounded range so the per-request
//!   timeout stays meaningful; timed-out requests are retried with
//!   exponential backoff before surfacing `NetworkTimeout`.
//! * Redirects are followed up to a fixed bound. Authentication and
//!   cookies are out of scope.

use std::{
    io::{Read, SeekFrom},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use exponential_backoff::Backoff;
use reqwest::{
    blocking::{Client, Response},
    header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
    StatusCode, Url,
};

use crate::{
    config::{CancelToken, OpenOptions},
    error::{Error, ErrorKind, Result},
    pool::{MemoryGovernor, PooledBuffer},
    source::ByteSource,
};

/// Maximum redirects followed before failing `NetworkProtocol`.
const MAX_REDIRECTS: usize = 10;

/// Ring buffer capacity; also the minimum bounded-range request size.
const WINDOW_LEN: usize = 64 * 1024;

/// Retry schedule for timed-out range requests.
const RETRIES: u32 = 4;
const RETRY_MIN: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Sentinel for "size unknown" in the atomic size mirror.
const SIZE_UNKNOWN: u64 = u64::MAX;

/// Mutable transport state, serialised behind one lock.
struct HttpState {
    initialised: bool,
    closed: bool,
    accepts_ranges: bool,
    /// Long-lived sequential body for servers without range support.
    body: Option<Response>,
    /// Absolute offset of the next byte the sequential body will yield.
    body_offset: u64,
    /// Furthest byte ever read sequentially; the seek limit without ranges.
    frontier: u64,
    /// Recent-bytes window: `window[..window_len]` holds the stream bytes
    /// at `[window_start, window_start + window_len)`.
    window: Option<PooledBuffer>,
    window_start: u64,
    window_len: usize,
}

/// Header metadata captured at initialisation, behind its own lock so the
/// accessors never wait on transport I/O.
#[derive(Default)]
struct HttpMeta {
    content_type: Option<String>,
    icy_name: Option<String>,
    icy_genre: Option<String>,
    icy_metaint: Option<u32>,
}

/// Seekable byte source over an HTTP(S) resource.
pub struct HttpByteSource {
    client: Client,
    url: Url,
    timeout: Duration,
    state: Mutex<HttpState>,
    meta: Mutex<HttpMeta>,
    position: AtomicU64,
    size: AtomicU64,
    eof: AtomicBool,
    last_error: Mutex<Option<ErrorKind>>,
    cancel: CancelToken,
}

impl HttpByteSource {
    /// Creates a source for `url`. No network I/O happens until the first
    /// read.
    ///
    /// # Errors
    ///
    /// Returns `NetworkProtocol` if the HTTP client cannot be constructed.
    pub fn open(url: Url, options: &OpenOptions) -> Result<Self> {
        let timeout = Duration::from_millis(options.network_timeout_ms_or_default());
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(timeout)
            .build()
            .map_err(Error::network_protocol)?;

        Ok(Self {
            client,
            url,
            timeout,
            state: Mutex::new(HttpState {
                initialised: false,
                closed: false,
                accepts_ranges: false,
                body: None,
                body_offset: 0,
                frontier: 0,
                window: None,
                window_start: 0,
                window_len: 0,
            }),
            meta: Mutex::new(HttpMeta::default()),
            position: AtomicU64::new(0),
            size: AtomicU64::new(SIZE_UNKNOWN),
            eof: AtomicBool::new(false),
            last_error: Mutex::new(None),
            cancel: options.cancel.clone().unwrap_or_default(),
        })
    }

    /// Icecast stream name from the `icy-name` header, if present.
    #[must_use]
    pub fn icy_name(&self) -> Option<String> {
        self.meta.lock().ok().and_then(|meta| meta.icy_name.clone())
    }

    /// Icecast genre from the `icy-genre` header, if present.
    #[must_use]
    pub fn icy_genre(&self) -> Option<String> {
        self.meta.lock().ok().and_then(|meta| meta.icy_genre.clone())
    }

    /// Icecast metadata interval from the `icy-metaint` header, if present.
    #[must_use]
    pub fn icy_metaint(&self) -> Option<u32> {
        self.meta.lock().ok().and_then(|meta| meta.icy_metaint)
    }

    fn set_error(&self, kind: ErrorKind) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(kind);
        }
    }

    /// Sends one GET with the given range start, retrying timeouts.
    fn send_ranged(&self, start: u64, end_inclusive: Option<u64>) -> Result<Response> {
        let range_value = match end_inclusive {
            Some(end) => format!("bytes={start}-{end}"),
            None => format!("bytes={start}-"),
        };

        let backoff = Backoff::new(RETRIES, RETRY_MIN, RETRY_MAX);
        let mut last_err = Error::network_timeout("request retries exhausted");
        for pause in &backoff {
            if self.cancel.is_cancelled() {
                self.set_error(ErrorKind::Cancelled);
                return Err(Error::cancelled("cancelled during HTTP request"));
            }

            let attempt = self
                .client
                .get(self.url.clone())
                .header(RANGE, &range_value)
                .timeout(self.timeout)
                .send();

            match attempt {
                Ok(response) => return Ok(response),
                Err(err) if err.is_timeout() => {
                    debug!("range request timed out, backing off: {err}");
                    last_err = Error::network_timeout(err);
                    match pause {
                        Some(duration) => std::thread::sleep(duration),
                        None => break,
                    }
                }
                Err(err) => {
                    let err = Error::from(err);
                    self.set_error(err.kind);
                    return Err(err);
                }
            }
        }

        self.set_error(last_err.kind);
        Err(last_err)
    }

    /// First-use handshake: learn size, range capability and metadata.
    fn initialise(&self, state: &mut HttpState) -> Result<()> {
        if state.initialised {
            return Ok(());
        }

        let response = self.send_ranged(0, None)?;
        let status = response.status();
        if !status.is_success() {
            self.set_error(ErrorKind::NetworkProtocol);
            return Err(Error::network_protocol(format!(
                "{}: unexpected status {status}",
                self.url
            )));
        }

        let headers = response.headers();
        state.accepts_ranges = status == StatusCode::PARTIAL_CONTENT
            || header_str(headers, ACCEPT_RANGES.as_str())
                .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));

        let size = if status == StatusCode::PARTIAL_CONTENT {
            header_str(headers, CONTENT_RANGE.as_str())
                .and_then(|value| value.rsplit('/').next().map(str::to_string))
                .and_then(|total| total.parse::<u64>().ok())
        } else {
            header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|value| value.parse::<u64>().ok())
        };
        if let Some(size) = size {
            self.size.store(size, Ordering::Release);
        }

        if let Ok(mut meta) = self.meta.lock() {
            meta.content_type =
                header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string);
            meta.icy_name = header_str(headers, "icy-name").map(str::to_string);
            meta.icy_genre = header_str(headers, "icy-genre").map(str::to_string);
            meta.icy_metaint =
                header_str(headers, "icy-metaint").and_then(|value| value.parse().ok());
        }

        state.window = Some(
            MemoryGovernor::global()
                .acquire(WINDOW_LEN, "http")
                .map_err(|err| {
                    self.set_error(err.kind);
                    err
                })?,
        );
        state.body = Some(response);
        state.body_offset = 0;
        state.initialised = true;

        debug!(
            "http source ready: {} (size {:?}, ranges {})",
            self.url,
            size,
            state.accepts_ranges
        );
        Ok(())
    }

    /// Appends freshly fetched bytes to the recency window.
    fn window_append(state: &mut HttpState, offset: u64, bytes: &[u8]) {
        let Some(window) = state.window.as_mut() else {
            return;
        };
        let capacity = window.len();

        // Only a window contiguous with the fetch is useful.
        if state.window_len == 0 || state.window_start + state.window_len as u64 != offset {
            state.window_start = offset;
            state.window_len = 0;
        }

        let keep = bytes.len().min(capacity);
        let tail = &bytes[bytes.len() - keep..];

        if state.window_len + keep > capacity {
            let shift = state.window_len + keep - capacity;
            window.copy_within(shift..state.window_len, 0);
            state.window_len -= shift;
            state.window_start += shift as u64;
        }
        window[state.window_len..state.window_len + keep].copy_from_slice(tail);
        state.window_len += keep;
        if keep < bytes.len() {
            // The fetch was larger than the window; only the tail is kept.
            state.window_start = offset + (bytes.len() - keep) as u64;
        }
    }

    /// Serves a read from the window if the position falls inside it.
    fn window_read(state: &HttpState, position: u64, buf: &mut [u8]) -> Option<usize> {
        let window = state.window.as_ref()?;
        if position < state.window_start {
            return None;
        }
        let start = (position - state.window_start) as usize;
        if start >= state.window_len {
            return None;
        }
        let n = (state.window_len - start).min(buf.len());
        buf[..n].copy_from_slice(&window[start..start + n]);
        Some(n)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

impl ByteSource for HttpByteSource {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cancel.is_cancelled() {
            self.set_error(ErrorKind::Cancelled);
            return Ok(0);
        }

        let mut state = self.state.lock()?;
        if state.closed {
            self.set_error(ErrorKind::Closed);
            return Ok(0);
        }
        self.initialise(&mut state)?;

        let position = self.position.load(Ordering::Acquire);
        let size = self.size.load(Ordering::Acquire);
        if size != SIZE_UNKNOWN && position >= size {
            self.eof.store(true, Ordering::Release);
            return Ok(0);
        }

        // Recent bytes can be re-read without touching the network.
        if let Some(n) = Self::window_read(&state, position, buf) {
            self.position.store(position + n as u64, Ordering::Release);
            return Ok(n);
        }

        // Sequential continuation of the open body.
        let body_is_current = state.body_offset == position && state.body.is_some();
        if body_is_current {
            let mut n = 0usize;
            if let Some(body) = state.body.as_mut() {
                n = body.read(buf).map_err(|err| {
                    let err = Error::from(err);
                    self.set_error(err.kind);
                    err
                })?;
            }
            if n == 0 {
                self.eof.store(true, Ordering::Release);
                state.body = None;
                return Ok(0);
            }
            Self::window_append(&mut state, position, &buf[..n]);
            state.body_offset += n as u64;
            state.frontier = state.frontier.max(state.body_offset);
            self.position.store(position + n as u64, Ordering::Release);
            return Ok(n);
        }

        // Repositioned read: fetch a bounded range.
        if !state.accepts_ranges {
            self.set_error(ErrorKind::RangeNotSatisfiable);
            return Err(Error::range_not_satisfiable(format!(
                "server for {} does not accept ranges",
                self.url
            )));
        }

        state.body = None;
        let want = buf.len().max(WINDOW_LEN) as u64;
        let end = position + want - 1;
        let response = self.send_ranged(position, Some(end))?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Past the end of the resource.
            self.eof.store(true, Ordering::Release);
            return Ok(0);
        }
        if !response.status().is_success() {
            self.set_error(ErrorKind::NetworkProtocol);
            return Err(Error::network_protocol(format!(
                "{}: unexpected status {}",
                self.url,
                response.status()
            )));
        }

        let bytes = response.bytes().map_err(|err| {
            let err = Error::from(err);
            self.set_error(err.kind);
            err
        })?;
        if bytes.is_empty() {
            self.eof.store(true, Ordering::Release);
            return Ok(0);
        }

        Self::window_append(&mut state, position, &bytes);
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.position.store(position + n as u64, Ordering::Release);
        Ok(n)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let state = self.state.lock()?;
        if state.closed {
            self.set_error(ErrorKind::Closed);
            return Err(Error::closed("seek on closed HTTP source"));
        }

        let size = self.size.load(Ordering::Acquire);
        let current = self.position.load(Ordering::Acquire);
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => current
                .checked_add_signed(delta)
                .ok_or_else(|| Error::invalid_argument("seek before start of stream"))?,
            SeekFrom::End(delta) => {
                if size == SIZE_UNKNOWN {
                    return Err(Error::invalid_argument(
                        "seek from end with unknown stream size",
                    ));
                }
                size.checked_add_signed(delta)
                    .ok_or_else(|| Error::invalid_argument("seek before start of stream"))?
            }
        };

        // Without range support only positions already fetched (window) or
        // not yet reached cannot be honoured; the frontier is the limit.
        if state.initialised && !state.accepts_ranges {
            let window_ok = target >= state.window_start
                && target <= state.window_start + state.window_len as u64;
            if target > state.frontier || (target < state.window_start && !window_ok) {
                self.set_error(ErrorKind::RangeNotSatisfiable);
                return Err(Error::range_not_satisfiable(format!(
                    "seek to {target} outside the reachable window of {}",
                    self.url
                )));
            }
        }

        self.position.store(target, Ordering::Release);
        self.eof.store(false, Ordering::Release);
        Ok(target)
    }

    #[inline]
    fn tell(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn size(&self) -> Option<u64> {
        match self.size.load(Ordering::Acquire) {
            SIZE_UNKNOWN => None,
            size => Some(size),
        }
    }

    #[inline]
    fn is_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.closed = true;
        state.body = None;
        if let Some(window) = state.window.take() {
            MemoryGovernor::global().release(window);
        }
        state.window_len = 0;
        Ok(())
    }

    fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.lock().ok().and_then(|last| *last)
    }

    fn content_type(&self) -> Option<String> {
        self.meta
            .lock()
            .ok()
            .and_then(|meta| meta.content_type.clone())
    }

    fn path_hint(&self) -> Option<String> {
        Some(self.url.path().to_string())
    }
}
