//! Shared fixture builders for the integration suites.

#![allow(dead_code)]

use std::io::Write;

/// One second of a sine wave as exact i16 samples.
///
/// `peak` is a linear fraction of full scale (0.5 -> 16384).
pub fn sine_i16(frequency: f64, sample_rate: u32, peak: f64, seconds: f64) -> Vec<i16> {
    let count = (f64::from(sample_rate) * seconds) as usize;
    let amplitude = peak * 32_768.0;
    (0..count)
        .map(|n| {
            let phase = 2.0 * std::f64::consts::PI * frequency * n as f64 / f64::from(sample_rate);
            (amplitude * phase.sin()).round() as i16
        })
        .collect()
}

/// Encodes interleaved samples into a minimal RIFF/WAVE file.
pub fn wav_s16le(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let block_align = channels * 2;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&byte_rate.to_le_bytes());
    bytes.extend_from_slice(&block_align.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

/// Encodes interleaved samples into a minimal AIFF file (PCM s16be).
pub fn aiff_s16be(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_be_bytes()).collect();
    let frames = samples.len() as u32 / u32::from(channels);

    // 80-bit extended float sample rate.
    let mut mantissa = u64::from(sample_rate);
    let mut exponent: u16 = 16_383 + 63;
    while mantissa & 0x8000_0000_0000_0000 == 0 {
        mantissa <<= 1;
        exponent -= 1;
    }

    let mut comm = Vec::new();
    comm.extend_from_slice(&channels.to_be_bytes());
    comm.extend_from_slice(&frames.to_be_bytes());
    comm.extend_from_slice(&16u16.to_be_bytes());
    comm.extend_from_slice(&exponent.to_be_bytes());
    comm.extend_from_slice(&mantissa.to_be_bytes());

    let mut ssnd = Vec::new();
    ssnd.extend_from_slice(&0u32.to_be_bytes());
    ssnd.extend_from_slice(&0u32.to_be_bytes());
    ssnd.extend_from_slice(&payload);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"FORM");
    bytes.extend_from_slice(&(4 + 8 + comm.len() as u32 + 8 + ssnd.len() as u32).to_be_bytes());
    bytes.extend_from_slice(b"AIFF");
    bytes.extend_from_slice(b"COMM");
    bytes.extend_from_slice(&(comm.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&comm);
    bytes.extend_from_slice(b"SSND");
    bytes.extend_from_slice(&(ssnd.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&ssnd);
    bytes
}

/// Writes bytes to a temp file with the given suffix.
pub fn fixture(bytes: &[u8], suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp file");
    file.write_all(bytes).expect("write fixture");
    file
}

/// Path of a temp file as &str.
pub fn path_of(file: &tempfile::NamedTempFile) -> &str {
    file.path().to_str().expect("utf8 path")
}
