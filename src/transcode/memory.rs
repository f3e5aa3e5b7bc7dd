// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! In-memory transcoder for prompt and announcement playback.
//!
//! [`MemoryTranscoder`] holds an entire source in memory (typical telephony
//! prompts are a few seconds of narrowband audio), renders it to the target
//! format in one pass, and plays the resulting frames onto its output stream
//! at the frame period when started, like a live decoder would. Rendering decodes to linear samples, resamples if
//! the rates differ, re-encodes to the target codec, and packetizes to the
//! target frame size, padding the final partial frame with encoded silence.
//! Frames carry a presentation timestamp counted in nanoseconds from the
//! start of the source.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::codec;
use crate::frames::{AudioFormat, AudioFrame, CodecKind};
use crate::streams::PushFrameStream;
use crate::transcode::{ContainerParser, Transcoder, TranscodeError};
use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// WavParser
// ---------------------------------------------------------------------------

/// Container parser for standard 44-byte-header WAV files.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavParser;

impl ContainerParser for WavParser {
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        if data.len() < codec::WAV_HEADER_SIZE
            || &data[0..4] != b"RIFF"
            || &data[8..12] != b"WAVE"
        {
            return Err(TranscodeError::MalformedPayload(
                "missing RIFF/WAVE header".to_string(),
            ));
        }
        Ok(codec::strip_wav_header(data).to_vec())
    }
}

// ---------------------------------------------------------------------------
// MemoryTranscoder
// ---------------------------------------------------------------------------

/// Renders an in-memory source to frames and plays them once.
///
/// Playback is single-shot: after `stop` the transcoder stays stopped, and a
/// replay needs a fresh instance. The output stream's format reflects the
/// target as configured; each frame carries its exact format, including any
/// frame-size override applied before `start`.
pub struct MemoryTranscoder {
    id: u64,
    source: Vec<u8>,
    source_codec: CodecKind,
    source_rate: u32,
    target: AudioFormat,
    output: Arc<PushFrameStream>,
    // 0 means no override.
    frame_size_override: AtomicUsize,
    connected: AtomicBool,
    cancel: CancellationToken,
    pusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTranscoder {
    /// Create a transcoder over raw codec payload bytes.
    pub fn new(
        source: Vec<u8>,
        source_codec: CodecKind,
        source_rate: u32,
        target: AudioFormat,
    ) -> Self {
        Self {
            id: obj_id(),
            source,
            source_codec,
            source_rate,
            target,
            output: Arc::new(PushFrameStream::new(target)),
            frame_size_override: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            pusher: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a transcoder from container-framed bytes, stripping the
    /// container first.
    pub fn with_container(
        data: &[u8],
        parser: &dyn ContainerParser,
        source_codec: CodecKind,
        source_rate: u32,
        target: AudioFormat,
    ) -> Result<Self, TranscodeError> {
        Ok(Self::new(
            parser.unwrap(data)?,
            source_codec,
            source_rate,
            target,
        ))
    }

    /// Create a transcoder from 16-bit linear samples.
    pub fn from_pcm_samples(samples: &[i16], source_rate: u32, target: AudioFormat) -> Self {
        Self::new(
            codec::samples_to_pcm_bytes(samples),
            CodecKind::LinearPcm,
            source_rate,
            target,
        )
    }

    /// Unique id of this transcoder, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn effective_format(&self) -> AudioFormat {
        let overridden = self.frame_size_override.load(Ordering::Acquire);
        let frame_size = if overridden == 0 {
            self.target.frame_size
        } else {
            overridden
        };
        AudioFormat::new(self.target.codec, self.target.sample_rate, frame_size)
    }

    fn render(&self) -> Vec<AudioFrame> {
        let samples = match self.source_codec {
            CodecKind::Mulaw => codec::mulaw_to_samples(&self.source),
            CodecKind::LinearPcm => codec::pcm_bytes_to_samples(&self.source),
        };

        let samples = if self.source_rate != self.target.sample_rate {
            let resampled = codec::resample_linear(
                &codec::samples_to_pcm_bytes(&samples),
                self.source_rate,
                self.target.sample_rate,
            );
            codec::pcm_bytes_to_samples(&resampled)
        } else {
            samples
        };

        let format = self.effective_format();
        let encoded: Vec<u8> = match format.codec {
            CodecKind::Mulaw => samples.iter().map(|&s| codec::linear_to_mulaw(s)).collect(),
            CodecKind::LinearPcm => codec::samples_to_pcm_bytes(&samples),
        };

        let bytes_per_frame = format.bytes_per_frame();
        if bytes_per_frame == 0 || encoded.is_empty() {
            return Vec::new();
        }

        let silence = match format.codec {
            CodecKind::Mulaw => codec::linear_to_mulaw(0),
            CodecKind::LinearPcm => 0u8,
        };
        let frame_ns = format.frame_duration().as_nanos() as u64;

        encoded
            .chunks(bytes_per_frame)
            .enumerate()
            .map(|(idx, chunk)| {
                let mut data = chunk.to_vec();
                data.resize(bytes_per_frame, silence);
                AudioFrame::new(data, format).with_pts(idx as u64 * frame_ns)
            })
            .collect()
    }
}

#[async_trait]
impl Transcoder for MemoryTranscoder {
    fn output(&self) -> Arc<PushFrameStream> {
        self.output.clone()
    }

    fn set_output_frame_size(&self, samples: usize) {
        self.frame_size_override.store(samples, Ordering::Release);
    }

    async fn connect(&self) -> Result<(), TranscodeError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn start(&self) -> Result<(), TranscodeError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TranscodeError::NotConnected);
        }
        let mut pusher = self.pusher.lock().await;
        if pusher.is_some() {
            tracing::warn!(
                transcoder_id = self.id,
                "MemoryTranscoder: start called while already playing"
            );
            return Ok(());
        }

        let frames = self.render();
        tracing::debug!(
            transcoder_id = self.id,
            frames = frames.len(),
            "MemoryTranscoder: starting playback"
        );

        let output = self.output.clone();
        let cancel = self.cancel.clone();
        // Realtime pacing: one frame per frame period, like a live decoder.
        let period = self
            .effective_format()
            .frame_duration()
            .max(std::time::Duration::from_millis(1));
        *pusher = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            for frame in frames {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => output.push(frame),
                }
            }
            // Consumers see the end marker even on a cancelled playback.
            output.stop();
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), TranscodeError> {
        self.cancel.cancel();
        if let Some(handle) = self.pusher.lock().await.take() {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        transcoder_id = self.id,
                        "MemoryTranscoder: pusher task panicked: {}",
                        e
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        transcoder_id = self.id,
                        "MemoryTranscoder: pusher did not stop in time, aborting"
                    );
                    abort_handle.abort();
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TranscodeError> {
        self.stop().await?;
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTranscoder")
            .field("id", &self.id)
            .field("source_bytes", &self.source.len())
            .field("source_codec", &self.source_codec)
            .field("source_rate", &self.source_rate)
            .field("target", &self.target)
            .finish()
    }
}
