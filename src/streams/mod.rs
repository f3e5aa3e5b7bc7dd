// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Push-model frame streams.
//!
//! A [`PushFrameStream`] is the hand-off point between a producer (transcoder,
//! relay pump, mixer) and whoever consumes its frames. Producers call
//! [`PushFrameStream::push`]; the stream stores the frame as "latest" and
//! synchronously notifies the registered [`FrameSink`], which is expected to
//! call [`PushFrameStream::read`] to collect it. A read with nothing new
//! marks the caller's frame as discard instead of blocking. Once a frame
//! flagged end-of-stream passes through, the stream is ended and later pushes
//! are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::frames::{AudioFormat, AudioFrame};
use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// FrameSink
// ---------------------------------------------------------------------------

/// Receiver side of a [`PushFrameStream`].
///
/// Implementations are invoked synchronously from [`PushFrameStream::push`],
/// so they must be quick and must never block; long work belongs behind a
/// queue (see [`crate::buffers::AsyncRelay`]).
pub trait FrameSink: Send + Sync {
    /// A new frame is available on `stream`; collect it with
    /// [`PushFrameStream::read`].
    fn frame_available(&self, stream: &PushFrameStream);
}

// ---------------------------------------------------------------------------
// PushFrameStream
// ---------------------------------------------------------------------------

/// Single-slot frame hand-off with synchronous sink notification.
pub struct PushFrameStream {
    id: u64,
    format: AudioFormat,
    latest: Mutex<Option<AudioFrame>>,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    ended: AtomicBool,
}

impl PushFrameStream {
    /// Create a stream carrying frames of the given format.
    pub fn new(format: AudioFormat) -> Self {
        Self {
            id: obj_id(),
            format,
            latest: Mutex::new(None),
            sink: Mutex::new(None),
            ended: AtomicBool::new(false),
        }
    }

    /// Unique id of this stream, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Format of the frames this stream carries.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Register (or clear) the sink notified on each push.
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        *self.sink.lock().expect("stream sink lock poisoned") = sink;
    }

    /// Whether an end-of-stream frame has passed through.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Publish a frame as the stream's latest and notify the sink.
    ///
    /// An unread previous frame is overwritten; the stream is a rendezvous,
    /// not a buffer. Frames pushed after the stream has ended are dropped.
    pub fn push(&self, frame: AudioFrame) {
        if self.is_ended() {
            tracing::trace!(
                stream_id = self.id,
                frame_id = frame.id(),
                "PushFrameStream: dropping frame pushed after end of stream"
            );
            return;
        }
        if frame.is_end_of_stream() {
            self.ended.store(true, Ordering::Release);
        }

        *self.latest.lock().expect("stream latest lock poisoned") = Some(frame);

        // Never hold either lock while running the sink callback.
        let sink = self
            .sink
            .lock()
            .expect("stream sink lock poisoned")
            .clone();
        if let Some(sink) = sink {
            sink.frame_available(self);
        }
    }

    /// Collect the latest frame into `out`.
    ///
    /// If a fresh frame is available it replaces `out` and is consumed;
    /// otherwise `out` is marked discard and its data left untouched.
    pub fn read(&self, out: &mut AudioFrame) {
        let taken = self
            .latest
            .lock()
            .expect("stream latest lock poisoned")
            .take();
        match taken {
            Some(frame) => *out = frame,
            None => out.set_discard(true),
        }
    }

    /// End the stream by pushing an end-of-stream marker, if not ended yet.
    pub fn stop(&self) {
        if !self.is_ended() {
            self.push(AudioFrame::end_marker(self.format));
        }
    }
}

impl std::fmt::Debug for PushFrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushFrameStream")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("ended", &self.is_ended())
            .finish()
    }
}
