// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Transcoding seams: rendering sources into frames and decoding frames
//! back into samples.
//!
//! A [`Transcoder`] turns some source of audio into paced-ready frames on a
//! [`PushFrameStream`], with a connect/start/stop/disconnect lifecycle so
//! sessions can drive implementations backed by memory, files, or live
//! network feeds the same way. [`ContainerParser`] strips file-container
//! framing before transcoding, and [`PcmDecoder`] is the synchronous
//! decode-to-samples seam the mixer uses on its input taps.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::frames::AudioFrame;
use crate::streams::PushFrameStream;

pub mod decoders;
pub mod memory;

pub use decoders::{LinearDecoder, MulawDecoder};
pub use memory::{MemoryTranscoder, WavParser};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from transcoders, parsers, and decoders.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Lifecycle misuse: `start` before `connect`.
    #[error("transcoder is not connected")]
    NotConnected,
    /// The input's codec or format is not handled by this component.
    #[error("unsupported input: {0}")]
    Unsupported(String),
    /// The payload bytes do not match their declared format.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// Decoding failed partway through.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source-to-frames renderer with an explicit lifecycle.
///
/// `connect` acquires whatever the implementation needs, `start` begins
/// pushing frames onto [`Transcoder::output`], and the stream carries an
/// end-of-stream marker once the source is exhausted. `stop` and
/// `disconnect` default to no-ops for implementations without teardown.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Stream the rendered frames are pushed to.
    fn output(&self) -> Arc<PushFrameStream>;

    /// Override the rendered frame size in samples. Only honored before
    /// `start`; implementations that cannot repacketize may ignore it.
    fn set_output_frame_size(&self, _samples: usize) {}

    async fn connect(&self) -> Result<(), TranscodeError>;

    async fn start(&self) -> Result<(), TranscodeError>;

    async fn stop(&self) -> Result<(), TranscodeError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TranscodeError> {
        Ok(())
    }
}

/// Strips container framing (e.g. a WAV header) from source bytes, returning
/// the raw codec payload.
pub trait ContainerParser: Send + Sync {
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>, TranscodeError>;
}

/// Synchronous frame-to-samples decoder used on the mixer's input taps.
pub trait PcmDecoder: Send + Sync {
    /// Decode a frame's payload to 16-bit linear samples.
    fn decode(&self, frame: &AudioFrame) -> Result<Vec<i16>, TranscodeError>;
}
