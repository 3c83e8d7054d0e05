//! DemuxedStream behaviour: probing precedence, runtime plugin
//! registration, and stall detection.

mod common;

use common::{fixture, path_of, sine_i16, wav_s16le};
use phono::{
    codec::{AudioFrame, Codec, CodecStats},
    config::OpenOptions,
    demux::{Demuxer, DemuxerCore, MediaChunk, StreamInfo},
    error::{ErrorKind, Result},
    registry::{FormatRegistry, FormatSignature},
    source::ByteSource,
    MediaFactory,
};

#[test]
fn magic_beats_extension_end_to_end() {
    // WAVE bytes in a file named .ogg must open as WAVE (property:
    // signature disambiguation).
    let input = sine_i16(440.0, 8_000, 0.5, 0.1);
    let file = fixture(&wav_s16le(1, 8_000, &input), ".ogg");

    let stream = MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");
    assert_eq!(stream.stream_info().codec_name, "pcm_s16le");
}

#[test]
fn prefer_format_id_overrides_probing() {
    let input = sine_i16(440.0, 8_000, 0.5, 0.1);
    let file = fixture(&wav_s16le(1, 8_000, &input), ".wav");

    // Forcing a demuxer that rejects the bytes fails rather than falling
    // back to auto-detection.
    let options = OpenOptions {
        prefer_format_id: Some("flac".to_string()),
        ..OpenOptions::default()
    };
    let err = MediaFactory::open(path_of(&file), &options).expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
}

#[test]
fn unrecognised_bytes_fail_unsupported_format() {
    let file = fixture(&[0x13u8; 256], ".dat");
    let err =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect_err("must fail");
    assert_eq!(err.kind, ErrorKind::UnsupportedFormat);
}

// --- stall detection via a runtime-registered format --------------------

/// A demuxer that produces chunks no codec can make progress on.
struct StallDemuxer {
    core: DemuxerCore,
}

impl Demuxer for StallDemuxer {
    fn name(&self) -> &'static str {
        "stall-test"
    }

    fn parse_container(&mut self) -> Result<()> {
        self.core.set_parsed();
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        let mut info = StreamInfo::audio(0, "stall-test-codec");
        info.sample_rate = 44_100;
        info.channels = 2;
        vec![info]
    }

    fn read_chunk(&mut self) -> Result<MediaChunk> {
        self.read_chunk_of(0)
    }

    fn read_chunk_of(&mut self, stream_id: u32) -> Result<MediaChunk> {
        Ok(MediaChunk {
            stream_id,
            data: vec![0u8; 16],
            timestamp_samples: 0,
            end_timestamp_samples: None,
            is_keyframe: true,
        })
    }

    fn seek_to(&mut self, _timestamp_ms: u64) -> Result<()> {
        Ok(())
    }

    fn duration_ms(&self) -> u64 {
        0
    }

    fn position_ms(&self) -> u64 {
        0
    }

    fn is_eof(&self) -> bool {
        false
    }
}

/// A codec that never produces audio.
struct StallCodec;

impl Codec for StallCodec {
    fn codec_name(&self) -> &str {
        "stall-test-codec"
    }

    fn initialise(&mut self) -> Result<()> {
        Ok(())
    }

    fn can_decode(&self, info: &StreamInfo) -> bool {
        info.codec_name == "stall-test-codec"
    }

    fn decode(&mut self, _chunk: &MediaChunk) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn flush(&mut self) -> Result<AudioFrame> {
        Ok(AudioFrame::empty())
    }

    fn reset(&mut self) {}

    fn current_sample(&self) -> u64 {
        0
    }

    fn stats(&self) -> CodecStats {
        CodecStats::default()
    }
}

#[test]
fn codec_without_progress_surfaces_stall_detected() {
    let registry = FormatRegistry::global();
    registry.register_signature(FormatSignature {
        format_id: "stall-test".into(),
        pattern: b"STALLTST".to_vec(),
        offset: 0,
        priority: 110,
        mask: None,
    });
    registry.register_demuxer("stall-test", |src, options| {
        Ok(Box::new(StallDemuxer {
            core: DemuxerCore::new(src, options.strict_mode),
        }) as Box<dyn Demuxer>)
    });
    registry.register_codec("stall-test-codec", |_, _| {
        Ok(Box::new(StallCodec) as Box<dyn Codec>)
    });

    let mut bytes = b"STALLTST".to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    let file = fixture(&bytes, ".bin");

    let mut stream =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");
    let err = stream.next_frame().expect_err("must stall");
    assert_eq!(err.kind, ErrorKind::StallDetected);
}

#[test]
fn stream_stats_aggregate_codec_and_clock() {
    let input = sine_i16(440.0, 8_000, 0.5, 0.5);
    let file = fixture(&wav_s16le(1, 8_000, &input), ".wav");
    let mut stream =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");

    stream.next_frame().expect("frame");
    let stats = stream.stats();
    assert!(stats.codec.frames_decoded >= 1);
    assert_eq!(stats.duration_ms, 500);
}

#[test]
fn byte_source_contract_survives_trait_object() {
    // A source behind `Box<dyn ByteSource>` keeps position semantics.
    let input = sine_i16(440.0, 8_000, 0.5, 0.1);
    let file = fixture(&wav_s16le(1, 8_000, &input), ".wav");

    let src = MediaFactory::open_source(path_of(&file), &OpenOptions::default()).expect("open");
    let mut buf = [0u8; 4];
    src.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"RIFF");
    assert_eq!(src.tell(), 4);
    src.seek(std::io::SeekFrom::Start(8)).expect("seek");
    src.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"WAVE");
}
