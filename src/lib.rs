//! Media demuxing and decoding pipeline for audio playback.
//!
//! **phono** turns bytes on disk or on a socket into timestamped, decoded
//! PCM frames ready for mixing. It provides:
//!
//! # Core Features
//!
//! * **Byte sources**: seekable streams over local files and HTTP
//!   (byte-range seeking, Icecast metadata headers), memory-accounted and
//!   cooperatively cancellable
//! * **Demuxers**: Ogg (Vorbis/Opus/FLAC), native FLAC, RIFF/WAVE, AIFF,
//!   ISO-BMFF/MP4 (including fragmented), and raw PCM/G.711 streams
//! * **Codecs**: Vorbis, Opus, FLAC (optional MD5 verification), AAC,
//!   ALAC, MP3, linear PCM, µ-law/A-law and IMA/MS ADPCM
//! * **Runtime registry**: additional demuxers and codecs register at
//!   runtime and are selected by magic bytes, MIME type or extension
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! * **I/O**
//!   - [`source`]: the `ByteSource` contract and its file/HTTP backends
//!   - [`pool`]: process-wide buffer pools and memory pressure callbacks
//!
//! * **Format handling**
//!   - [`registry`]: magic-byte signatures, demuxer and codec factories
//!   - [`demux`]: the `Demuxer` trait and container implementations
//!   - [`codec`]: the `Codec` trait and decoder implementations
//!
//! * **Playback surface**
//!   - [`stream`]: `DemuxedStream`, one demuxer + one codec as a PCM pull
//!   - [`factory`]: `MediaFactory`, URI to ready-to-play stream
//!   - [`tag`]: read-only metadata snapshots
//!
//! * **Support**
//!   - [`config`]: per-stream options and cancellation tokens
//!   - [`error`]: error types and handling
//!
//! # Example
//!
//! ```rust,no_run
//! use phono::{config::OpenOptions, factory::MediaFactory};
//!
//! fn play() -> phono::error::Result<()> {
//!     let mut stream = MediaFactory::open("music/song.ogg", &OpenOptions::default())?;
//!
//!     loop {
//!         let frame = stream.next_frame()?;
//!         if stream.is_eof() {
//!             break;
//!         }
//!         // Hand `frame.samples` to the audio sink...
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! The pipeline is strictly blocking and pull-driven: one thread per
//! playing stream calls the mutating methods, while read-only accessors
//! (`duration_ms`, `position_ms`, `is_eof`, `tag`, `stats`) are safe from
//! any thread. The [`pool::MemoryGovernor`] and [`registry::FormatRegistry`]
//! singletons are shared process-wide; neither ever runs a user callback
//! with an internal lock held.
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`error`] module, with
//! most functions returning [`Result`](error::Result). Recoverable
//! corruption (a bad page or frame) is skipped and counted; `strict_mode`
//! turns it fatal.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod codec;
pub mod config;
pub mod demux;
pub mod error;
pub mod factory;
pub mod pool;
pub mod registry;
pub mod source;
pub mod stream;
pub mod tag;

pub use config::OpenOptions;
pub use factory::MediaFactory;
pub use stream::DemuxedStream;
