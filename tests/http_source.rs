//! HTTP byte source against an in-process range-capable server.
//!
//! A minimal HTTP/1.1 server on a loopback socket serves a WAV image with
//! byte-range support and Icecast headers, which exercises the source's
//! lazy initialisation, range-emulated seeking, window re-reads and the
//! full factory path over HTTP.

mod common;

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use common::{sine_i16, wav_s16le};
use phono::{
    config::OpenOptions,
    source::{ByteSource, HttpByteSource},
    MediaFactory,
};

/// Serves `body` with range support until the listener is dropped.
fn spawn_server(body: Vec<u8>) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr");
    let body = Arc::new(body);

    let handle = thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let body = Arc::clone(&body);
            // One request per connection keeps the server trivial.
            if serve_one(stream, &body).is_none() {
                break;
            }
        }
    });

    (format!("http://{address}/test.wav"), handle)
}

fn serve_one(stream: TcpStream, body: &[u8]) -> Option<()> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    if request_line.trim() == "SHUTDOWN" {
        return None;
    }

    let mut range: Option<(u64, Option<u64>)> = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("range: bytes=")
            .map(str::to_string)
        {
            let mut parts = value.splitn(2, '-');
            let start = parts.next()?.parse().ok()?;
            let end = parts.next().and_then(|end| end.parse().ok());
            range = Some((start, end));
        }
    }

    let mut out = stream;
    match range {
        Some((start, end)) if start as usize <= body.len() => {
            let end = end
                .map_or(body.len() - 1, |end| end as usize)
                .min(body.len() - 1);
            let slice = &body[start as usize..=end];
            write!(
                out,
                "HTTP/1.1 206 Partial Content\r\n\
                 Content-Type: audio/wav\r\n\
                 Content-Length: {}\r\n\
                 Content-Range: bytes {}-{}/{}\r\n\
                 Accept-Ranges: bytes\r\n\
                 icy-name: phono test stream\r\n\
                 icy-genre: test tones\r\n\
                 Connection: close\r\n\r\n",
                slice.len(),
                start,
                end,
                body.len()
            )
            .ok()?;
            out.write_all(slice).ok()?;
        }
        Some(_) => {
            write!(
                out,
                "HTTP/1.1 416 Range Not Satisfiable\r\n\
                 Content-Range: bytes */{}\r\n\
                 Connection: close\r\n\r\n",
                body.len()
            )
            .ok()?;
        }
        None => {
            write!(
                out,
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: audio/wav\r\n\
                 Content-Length: {}\r\n\
                 Accept-Ranges: bytes\r\n\
                 Connection: close\r\n\r\n",
                body.len()
            )
            .ok()?;
            out.write_all(body).ok()?;
        }
    }
    out.flush().ok()?;
    Some(())
}

fn wav_body() -> Vec<u8> {
    let input = sine_i16(440.0, 8_000, 0.5, 0.5);
    wav_s16le(1, 8_000, &input)
}

#[test]
fn http_source_reads_and_reports_metadata() {
    let body = wav_body();
    let (uri, _handle) = spawn_server(body.clone());

    let url = url::Url::parse(&uri).expect("url");
    let source = HttpByteSource::open(url, &OpenOptions::default()).expect("open");

    let mut header = [0u8; 12];
    source.read_exact(&mut header).expect("read header");
    assert_eq!(&header[0..4], b"RIFF");
    assert_eq!(&header[8..12], b"WAVE");
    assert_eq!(source.size(), Some(body.len() as u64));
    assert_eq!(source.content_type().as_deref(), Some("audio/wav"));
    assert_eq!(source.icy_name().as_deref(), Some("phono test stream"));
    assert_eq!(source.icy_genre().as_deref(), Some("test tones"));
}

#[test]
fn http_source_seeks_with_ranges() {
    let body = wav_body();
    let (uri, _handle) = spawn_server(body.clone());

    let url = url::Url::parse(&uri).expect("url");
    let source = HttpByteSource::open(url, &OpenOptions::default()).expect("open");

    // Prime the connection, then seek far beyond the window.
    let mut prefix = [0u8; 16];
    source.read_exact(&mut prefix).expect("read prefix");

    let offset = body.len() as u64 - 32;
    source
        .seek(std::io::SeekFrom::Start(offset))
        .expect("seek");
    assert_eq!(source.tell(), offset);

    let mut tail = [0u8; 32];
    source.read_exact(&mut tail).expect("read tail");
    assert_eq!(&tail[..], &body[body.len() - 32..]);

    // Back to the start: the re-read must match the original bytes.
    source.seek(std::io::SeekFrom::Start(0)).expect("rewind");
    let mut again = [0u8; 16];
    source.read_exact(&mut again).expect("re-read");
    assert_eq!(again, prefix);
}

#[test]
fn http_read_past_end_is_graceful_eof() {
    let body = wav_body();
    let (uri, _handle) = spawn_server(body.clone());

    let url = url::Url::parse(&uri).expect("url");
    let source = HttpByteSource::open(url, &OpenOptions::default()).expect("open");

    source
        .seek(std::io::SeekFrom::Start(body.len() as u64))
        .expect("seek to end");
    let mut buf = [0u8; 16];
    assert_eq!(source.read(&mut buf).expect("read"), 0);
    assert!(source.is_eof());
}

#[test]
fn full_pipeline_decodes_over_http() {
    let input = sine_i16(440.0, 8_000, 0.5, 0.5);
    let (uri, _handle) = spawn_server(wav_s16le(1, 8_000, &input));

    let mut stream = MediaFactory::open(&uri, &OpenOptions::default()).expect("open");
    assert_eq!(stream.stream_info().codec_name, "pcm_s16le");

    let mut output = Vec::new();
    loop {
        let frame = stream.next_frame().expect("frame");
        if stream.is_eof() {
            break;
        }
        output.extend_from_slice(&frame.samples);
    }
    assert_eq!(output, input);
}
