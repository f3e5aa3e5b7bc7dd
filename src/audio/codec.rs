// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! ITU-T G.711 mu-law codec and PCM helpers for narrowband telephony audio.
//!
//! Provides encoding and decoding between 16-bit linear PCM and 8-bit mu-law
//! (PCMU) as defined in ITU-T G.711, plus the byte/sample packing and
//! linear-interpolation resampling used when rendering sources to a channel's
//! target format. The pipeline core treats codecs as opaque; these helpers
//! back the provided transcoder and decoders and are available to external
//! collaborators.

/// Bias added before mu-law compression (ITU-T G.711).
const MULAW_BIAS: i32 = 0x84; // 132
/// Maximum linear magnitude before clipping.
const MULAW_CLIP: i32 = 32635;

/// Encode a single 16-bit linear PCM sample to mu-law.
///
/// Implements the ITU-T G.711 mu-law companding algorithm.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign: i32 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        -(sample as i32)
    } else {
        sample as i32
    };

    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Find the segment (exponent)
    let mut exponent: i32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    let mulaw_byte = sign | (exponent << 4) | mantissa;
    !(mulaw_byte as u8)
}

/// Decode a single mu-law byte to a 16-bit linear PCM sample.
///
/// Implements the ITU-T G.711 mu-law decoding algorithm.
pub fn mulaw_to_linear(mulaw_byte: u8) -> i16 {
    let complement = !mulaw_byte as i32;
    let sign = complement & 0x80;
    let exponent = (complement >> 4) & 0x07;
    let mantissa = complement & 0x0F;

    let mut magnitude = ((mantissa << 1) | 0x21) << (exponent + 2);
    magnitude -= MULAW_BIAS;

    if sign == 0x80 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decode a buffer of mu-law bytes to 16-bit linear PCM samples.
pub fn mulaw_to_samples(mulaw_data: &[u8]) -> Vec<i16> {
    mulaw_data.iter().map(|&b| mulaw_to_linear(b)).collect()
}

/// Decode a buffer of mu-law bytes to 16-bit linear PCM bytes (little-endian).
pub fn mulaw_to_pcm(mulaw_data: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw_data.len().saturating_mul(2));
    for &byte in mulaw_data {
        let sample = mulaw_to_linear(byte);
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm
}

/// Encode 16-bit linear PCM bytes (little-endian) to mu-law bytes.
///
/// If `pcm_data` has an odd length, the trailing byte is ignored.
pub fn pcm_to_mulaw(pcm_data: &[u8]) -> Vec<u8> {
    if !pcm_data.len().is_multiple_of(2) {
        tracing::warn!(
            "pcm_to_mulaw: odd-length input ({} bytes), trailing byte ignored",
            pcm_data.len()
        );
    }
    let mut mulaw = Vec::with_capacity(pcm_data.len() / 2);
    for chunk in pcm_data.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        mulaw.push(linear_to_mulaw(sample));
    }
    mulaw
}

/// Unpack little-endian 16-bit PCM bytes into samples.
///
/// A trailing odd byte is ignored.
pub fn pcm_bytes_to_samples(pcm_data: &[u8]) -> Vec<i16> {
    pcm_data
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Pack 16-bit PCM samples into little-endian bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len().saturating_mul(2));
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Resample 16-bit PCM audio (as bytes) from one sample rate to another
/// using linear interpolation.
///
/// Input and output are little-endian i16 PCM byte buffers. Returns a copy
/// of the input if the rates are the same or the input is too short. Linear
/// interpolation is adequate for narrowband speech; collaborators needing
/// wideband fidelity should resample before handing audio to the pipeline.
pub fn resample_linear(pcm_data: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || pcm_data.len() < 2 {
        return pcm_data.to_vec();
    }

    let input_samples = pcm_bytes_to_samples(pcm_data);

    let input_len = input_samples.len();
    if input_len == 0 {
        return Vec::new();
    }
    if input_len == 1 {
        return pcm_data.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len_f = ((input_len as f64) / ratio).ceil();
    let output_len = if output_len_f.is_finite() && output_len_f >= 0.0 {
        output_len_f as usize
    } else {
        return pcm_data.to_vec();
    };

    let mut output = Vec::with_capacity(output_len.saturating_mul(2));
    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < input_len {
            let s0 = input_samples[src_idx] as f64;
            let s1 = input_samples[src_idx + 1] as f64;
            (s0 + frac * (s1 - s0)) as i16
        } else {
            input_samples[input_len - 1]
        };

        output.extend_from_slice(&sample.to_le_bytes());
    }

    output
}

/// Standard WAV file header size (44 bytes).
pub const WAV_HEADER_SIZE: usize = 44;

/// Strip a standard 44-byte WAV header from audio data.
///
/// Validates the RIFF/WAVE magic bytes before stripping. Returns the
/// original data unchanged if it doesn't look like a WAV file.
pub fn strip_wav_header(data: &[u8]) -> &[u8] {
    if data.len() >= WAV_HEADER_SIZE
        && data.len() >= 12
        && &data[0..4] == b"RIFF"
        && &data[8..12] == b"WAVE"
    {
        &data[WAV_HEADER_SIZE..]
    } else {
        data
    }
}
