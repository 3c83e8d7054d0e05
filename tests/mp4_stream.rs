//! MP4 end-to-end: sample-table-driven reads and seeking through the
//! full factory pipeline, using a PCM (`twos`) track so decoded output
//! can be checked bit-exactly.

mod common;

use common::{fixture, path_of, sine_i16};
use phono::{config::OpenOptions, MediaFactory};

fn boxed(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 8);
    bytes.extend_from_slice(&(body.len() as u32 + 8).to_be_bytes());
    bytes.extend_from_slice(fourcc);
    bytes.extend_from_slice(body);
    bytes
}

fn full_box(version: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = vec![version, 0, 0, 0];
    bytes.extend_from_slice(body);
    bytes
}

/// Builds an MP4 with one `twos` (PCM s16be) mono track. Every "sample"
/// holds `frames_per_sample` audio frames.
fn mp4_twos(samples: &[i16], sample_rate: u32, frames_per_sample: u32) -> Vec<u8> {
    let frame_bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_be_bytes()).collect();
    let sample_size = frames_per_sample * 2;
    let sample_count = (samples.len() as u32).div_ceil(frames_per_sample);

    let ftyp = boxed(b"ftyp", b"isomiso2");
    let payload_start = ftyp.len() as u32 + 8;
    let mdat = boxed(b"mdat", &frame_bytes);

    // twos audio sample entry.
    let mut entry = Vec::new();
    entry.extend_from_slice(&[0u8; 6]);
    entry.extend_from_slice(&1u16.to_be_bytes());
    entry.extend_from_slice(&[0u8; 8]); // version/revision/vendor
    entry.extend_from_slice(&1u16.to_be_bytes()); // channels
    entry.extend_from_slice(&16u16.to_be_bytes());
    entry.extend_from_slice(&[0u8; 4]); // compression/packet size
    entry.extend_from_slice(&(sample_rate << 16).to_be_bytes());
    let entry = boxed(b"twos", &entry);

    let mut stsd = full_box(0, &1u32.to_be_bytes());
    stsd.extend_from_slice(&entry);

    let mut stts = full_box(0, &1u32.to_be_bytes());
    stts.extend_from_slice(&sample_count.to_be_bytes());
    stts.extend_from_slice(&frames_per_sample.to_be_bytes());

    let mut stsc = full_box(0, &1u32.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());
    stsc.extend_from_slice(&sample_count.to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes());

    let mut stsz = full_box(0, &sample_size.to_be_bytes());
    stsz.extend_from_slice(&sample_count.to_be_bytes());

    let mut stco = full_box(0, &1u32.to_be_bytes());
    stco.extend_from_slice(&payload_start.to_be_bytes());

    let mut stbl = Vec::new();
    stbl.extend_from_slice(&boxed(b"stsd", &stsd));
    stbl.extend_from_slice(&boxed(b"stts", &stts));
    stbl.extend_from_slice(&boxed(b"stsc", &stsc));
    stbl.extend_from_slice(&boxed(b"stsz", &stsz));
    stbl.extend_from_slice(&boxed(b"stco", &stco));

    let mut tkhd = full_box(0, &[0u8; 8]);
    tkhd.extend_from_slice(&1u32.to_be_bytes());
    tkhd.extend_from_slice(&[0u8; 60]);

    let mut mdhd = full_box(0, &[0u8; 8]);
    mdhd.extend_from_slice(&sample_rate.to_be_bytes());
    mdhd.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    mdhd.extend_from_slice(&[0u8; 4]);

    let mut hdlr = full_box(0, &[0u8; 4]);
    hdlr.extend_from_slice(b"soun");
    hdlr.extend_from_slice(&[0u8; 13]);

    let minf = boxed(b"stbl", &stbl);
    let mut mdia = Vec::new();
    mdia.extend_from_slice(&boxed(b"mdhd", &mdhd));
    mdia.extend_from_slice(&boxed(b"hdlr", &hdlr));
    mdia.extend_from_slice(&boxed(b"minf", &minf));

    let mut trak = Vec::new();
    trak.extend_from_slice(&boxed(b"tkhd", &tkhd));
    trak.extend_from_slice(&boxed(b"mdia", &mdia));

    let mut mvhd_body = full_box(0, &[0u8; 8]);
    mvhd_body.extend_from_slice(&sample_rate.to_be_bytes());
    mvhd_body.extend_from_slice(&0u32.to_be_bytes());
    mvhd_body.extend_from_slice(&[0u8; 80]);

    let mut moov = boxed(b"mvhd", &mvhd_body);
    moov.extend_from_slice(&boxed(b"trak", &trak));
    let moov = boxed(b"moov", &moov);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&ftyp);
    bytes.extend_from_slice(&mdat);
    bytes.extend_from_slice(&moov);
    bytes
}

#[test]
fn mp4_pcm_roundtrip_is_bit_exact() {
    let input = sine_i16(440.0, 44_100, 0.5, 1.0);
    let file = fixture(&mp4_twos(&input, 44_100, 441), ".m4a");

    let mut stream =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");
    let info = stream.stream_info();
    assert_eq!(info.codec_name, "pcm_s16be");
    assert_eq!(info.sample_rate, 44_100);

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

#[test]
fn mp4_seek_lands_within_a_sample_block() {
    // 4 seconds of audio in 441-frame samples; seek to the middle.
    let input = sine_i16(220.0, 44_100, 0.5, 4.0);
    let file = fixture(&mp4_twos(&input, 44_100, 441), ".m4a");

    let mut stream =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");
    assert_eq!(stream.duration_ms(), 4_000);

    stream.seek_to_ms(2_000).expect("seek");
    assert!(!stream.is_eof());

    let frame = stream.next_frame().expect("frame");
    // Landed on a sample boundary at or below the target, within one
    // 441-frame block (10 ms at 44.1 kHz).
    let target_sample = 2_000 * 44_100 / 1_000;
    assert_eq!(frame.pts % 441, 0);
    assert!(frame.pts <= target_sample);
    assert!(target_sample - frame.pts < 441);

    // Subsequent reads stay monotonic and contiguous.
    let mut expected = frame.pts + frame.sample_count as u64;
    for _ in 0..10 {
        let frame = stream.next_frame().expect("frame");
        assert_eq!(frame.pts, expected);
        expected += frame.sample_count as u64;
    }
}

#[test]
fn mp4_eof_after_last_sample() {
    let input = sine_i16(440.0, 8_000, 0.5, 0.25);
    let file = fixture(&mp4_twos(&input, 8_000, 250), ".m4a");

    let mut stream =
        MediaFactory::open(path_of(&file), &OpenOptions::default()).expect("open");
    let mut frames = 0;
    loop {
        let frame = stream.next_frame().expect("frame");
        if stream.is_eof() {
            assert!(frame.is_empty());
            break;
        }
        frames += 1;
    }
    assert!(frames > 0);
}
