// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Frame decoders for the codecs carried on telephony legs.

use crate::audio::codec;
use crate::frames::{AudioFrame, CodecKind};
use crate::transcode::{PcmDecoder, TranscodeError};

/// Decodes G.711 mu-law frames to linear samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct MulawDecoder;

impl PcmDecoder for MulawDecoder {
    fn decode(&self, frame: &AudioFrame) -> Result<Vec<i16>, TranscodeError> {
        if frame.format().codec != CodecKind::Mulaw {
            return Err(TranscodeError::Unsupported(format!(
                "expected pcmu payload, got {}",
                frame.format().codec
            )));
        }
        Ok(codec::mulaw_to_samples(frame.data()))
    }
}

/// Unpacks 16-bit little-endian linear PCM frames to samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearDecoder;

impl PcmDecoder for LinearDecoder {
    fn decode(&self, frame: &AudioFrame) -> Result<Vec<i16>, TranscodeError> {
        if frame.format().codec != CodecKind::LinearPcm {
            return Err(TranscodeError::Unsupported(format!(
                "expected pcm16 payload, got {}",
                frame.format().codec
            )));
        }
        if !frame.len().is_multiple_of(2) {
            return Err(TranscodeError::MalformedPayload(format!(
                "odd pcm16 payload length {}",
                frame.len()
            )));
        }
        Ok(codec::pcm_bytes_to_samples(frame.data()))
    }
}
