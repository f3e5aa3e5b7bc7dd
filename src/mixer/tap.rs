// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::frames::{AudioFormat, AudioFrame};
use crate::streams::PushFrameStream;
use crate::transcode::PcmDecoder;
use crate::utils::obj_id;

/// One conference participant's attachment to a [`RealtimeMixer`].
///
/// Inbound audio is pushed through [`MixTap::push_input`], decoded to PCM and
/// held as the tap's contribution until the next mixer tick consumes it. The
/// tick pushes the personalized mix (everyone minus this tap) onto the tap's
/// personal output stream. Muting drops input before the decode path while the
/// participant keeps receiving the mix; stopping is terminal and ends the
/// output stream with an end-of-stream marker.
///
/// [`RealtimeMixer`]: super::RealtimeMixer
pub struct MixTap {
    id: u64,
    label: String,
    decoder: Box<dyn PcmDecoder>,
    contribution: Mutex<Option<Vec<i16>>>,
    muted: AtomicBool,
    stopped: AtomicBool,
    output: Arc<PushFrameStream>,
    decode_errors: AtomicU64,
    muted_dropped: AtomicU64,
}

impl MixTap {
    pub(crate) fn new(
        label: String,
        decoder: Box<dyn PcmDecoder>,
        output_format: AudioFormat,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: obj_id(),
            label,
            decoder,
            contribution: Mutex::new(None),
            muted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            output: Arc::new(PushFrameStream::new(output_format)),
            decode_errors: AtomicU64::new(0),
            muted_dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Feed one inbound frame. The decoded samples become this tap's
    /// contribution for the next tick; pushes between ticks overwrite each
    /// other, latest wins. Muted and stopped taps drop input before decoding.
    pub fn push_input(&self, frame: &AudioFrame) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if frame.is_discard() || frame.is_end_of_stream() {
            return;
        }
        if self.muted.load(Ordering::Acquire) {
            self.muted_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.decoder.decode(frame) {
            Ok(samples) => {
                *self.contribution.lock().expect("tap contribution lock poisoned") = Some(samples);
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                *self.contribution.lock().expect("tap contribution lock poisoned") = None;
                tracing::warn!(
                    tap_id = self.id,
                    label = %self.label,
                    frame_id = frame.id(),
                    "MixTap: dropping undecodable frame: {}",
                    e
                );
            }
        }
    }

    /// Consume the contribution buffered since the last tick.
    pub(crate) fn take_contribution(&self) -> Option<Vec<i16>> {
        self.contribution
            .lock()
            .expect("tap contribution lock poisoned")
            .take()
    }

    /// Deliver a personalized mix frame onto the tap's output stream.
    pub(crate) fn deliver(&self, frame: AudioFrame) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.output.push(frame);
    }

    /// Mute the tap: inbound audio is dropped and any pending contribution is
    /// discarded. The participant keeps receiving the mix.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::Release);
        *self.contribution.lock().expect("tap contribution lock poisoned") = None;
        tracing::debug!(tap_id = self.id, label = %self.label, "MixTap: muted");
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::Release);
        tracing::debug!(tap_id = self.id, label = %self.label, "MixTap: unmuted");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Stop the tap. Terminal and idempotent; the first stop ends the output
    /// stream so consumers observe end-of-participation deterministically.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.contribution.lock().expect("tap contribution lock poisoned") = None;
        self.output.stop();
        tracing::debug!(tap_id = self.id, label = %self.label, "MixTap: stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Personal output stream carrying this tap's mix.
    pub fn output(&self) -> &Arc<PushFrameStream> {
        &self.output
    }

    /// Frames rejected by the decoder so far.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Frames dropped while muted so far.
    pub fn muted_dropped(&self) -> u64 {
        self.muted_dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MixTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixTap")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("muted", &self.is_muted())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
