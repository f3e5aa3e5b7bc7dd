// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Core frame definitions for the telemix pipeline.
//!
//! All audio moves through the pipeline as [`AudioFrame`] values: one codec
//! frame's worth of payload plus the metadata needed to sequence, mix, and
//! terminate streams. Frames are value-like: once a frame enters a queue or
//! a stream, nobody mutates it in place; consumers receive clones.
//!
//! An [`AudioFormat`] tags every frame and every stream with the codec,
//! sample rate, and packetization size, so mismatched wiring is observable
//! instead of silently producing garbage audio.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// Codec identity and format tag
// ---------------------------------------------------------------------------

/// Codec identity of a frame payload.
///
/// The pipeline treats codecs as opaque transforms; this enum only names the
/// payload encoding so caches can be keyed and decoders can reject input they
/// don't understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecKind {
    /// 16-bit signed linear PCM, little-endian.
    LinearPcm,
    /// ITU-T G.711 mu-law (PCMU), 8 bits per sample.
    Mulaw,
}

impl CodecKind {
    /// Payload bytes per audio sample for this codec.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            CodecKind::LinearPcm => 2,
            CodecKind::Mulaw => 1,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::LinearPcm => write!(f, "pcm16"),
            CodecKind::Mulaw => write!(f, "pcmu"),
        }
    }
}

/// Audio format tag: codec, sample rate, and samples per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Payload encoding.
    pub codec: CodecKind,
    /// Sample rate in Hz (e.g. 8000 for narrowband telephony).
    pub sample_rate: u32,
    /// Samples per frame (RTP packetization size, e.g. 160 for 20ms at 8kHz).
    pub frame_size: usize,
}

impl AudioFormat {
    /// Create a new format tag.
    pub fn new(codec: CodecKind, sample_rate: u32, frame_size: usize) -> Self {
        Self {
            codec,
            sample_rate,
            frame_size,
        }
    }

    /// Wall-clock duration of one frame at this format.
    pub fn frame_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = (self.frame_size as u64).saturating_mul(1_000_000_000) / self.sample_rate as u64;
        Duration::from_nanos(nanos)
    }

    /// Wall-clock duration of one frame, in whole milliseconds.
    pub fn frame_duration_ms(&self) -> u64 {
        self.frame_duration().as_millis() as u64
    }

    /// Payload bytes in one full frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.frame_size.saturating_mul(self.codec.bytes_per_sample())
    }
}

impl Default for AudioFormat {
    /// Narrowband telephony default: 16-bit PCM, 8kHz, 20ms frames.
    fn default() -> Self {
        Self::new(CodecKind::LinearPcm, 8000, 160)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}Hz/{}",
            self.codec, self.sample_rate, self.frame_size
        )
    }
}

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// One discrete unit of audio moving through the pipeline.
///
/// A frame carries its encoded payload, the [`AudioFormat`] describing that
/// payload, an optional presentation timestamp (nanoseconds), and two flags:
///
/// - `end_of_stream`: this is the final frame of its stream; consumers can
///   tear down deterministically when they see it.
/// - `discard`: the frame holds no usable payload. Set by `read()`-style
///   consumers when nothing has been delivered yet.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    id: u64,
    data: Vec<u8>,
    format: AudioFormat,
    pts: Option<u64>,
    end_of_stream: bool,
    discard: bool,
}

impl AudioFrame {
    /// Create a frame from encoded payload bytes.
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            id: obj_id(),
            data,
            format,
            pts: None,
            end_of_stream: false,
            discard: false,
        }
    }

    /// Create an empty end-of-stream marker frame.
    ///
    /// End markers carry no payload; they exist so downstream consumers can
    /// detect the end of a stream deterministically rather than by silence.
    pub fn end_marker(format: AudioFormat) -> Self {
        Self {
            id: obj_id(),
            data: Vec::new(),
            format,
            pts: None,
            end_of_stream: true,
            discard: false,
        }
    }

    /// Set the presentation timestamp (builder style).
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Unique numeric identifier for this frame instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Encoded payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Format of the payload.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Presentation timestamp in nanoseconds, or `None`.
    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    /// Set the presentation timestamp.
    pub fn set_pts(&mut self, pts: Option<u64>) {
        self.pts = pts;
    }

    /// Returns `true` if this frame is the final frame of its stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Returns `true` if this frame carries no usable payload.
    pub fn is_discard(&self) -> bool {
        self.discard
    }

    /// Mark or unmark this frame as holding no usable payload.
    pub fn set_discard(&mut self, discard: bool) {
        self.discard = discard;
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AudioFrame#{}({}, {} bytes{})",
            self.id,
            self.format,
            self.data.len(),
            if self.end_of_stream { ", eos" } else { "" }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
