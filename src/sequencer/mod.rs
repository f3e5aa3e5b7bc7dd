// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Channel sequencer: one continuous, paced frame stream per channel.
//!
//! [`ChannelSequencer`] owns the channel's frame queue and a pacing task
//! that emits at most one frame per frame period onto the channel's output
//! stream. Whichever [`SourceSession`] is current feeds the queue;
//! [`ChannelSequencer::set_source`] hot-swaps sessions without audible
//! corruption by advancing the queue generation and clearing it in one
//! step, so frames from the old session can neither linger nor trickle in
//! afterwards. The old session is told to stop immediately and closed on a
//! separate task, keeping slow transcoder teardown off the audio clock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffers::queue::BoundedFrameQueue;
use crate::cache::FrameCache;
use crate::events::ChannelEvents;
use crate::frames::{AudioFormat, AudioFrame};
use crate::sources::{SessionContext, SourceSession};
use crate::streams::PushFrameStream;
use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// Params and errors
// ---------------------------------------------------------------------------

/// Configuration for a [`ChannelSequencer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerParams {
    /// Output format of the channel; also the render target for sessions.
    pub format: AudioFormat,
    /// Capacity of the channel queue in frames. Sized to cover the burst a
    /// one-shot render produces ahead of the paced drain; at 20 ms frames
    /// the default of 512 holds roughly 10 s of audio.
    pub queue_capacity: usize,
    /// Bound on waiting for the pacing task to exit during close.
    pub close_timeout_ms: u64,
}

impl Default for SequencerParams {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            queue_capacity: 512,
            close_timeout_ms: 5000,
        }
    }
}

impl SequencerParams {
    pub fn validate(&self) -> Result<(), SequencerError> {
        if self.queue_capacity == 0 {
            return Err(SequencerError::InvalidConfig(
                "queue capacity must be greater than zero",
            ));
        }
        if self.close_timeout_ms == 0 {
            return Err(SequencerError::InvalidConfig(
                "close timeout must be greater than zero",
            ));
        }
        if self.format.frame_size == 0 || self.format.sample_rate == 0 {
            return Err(SequencerError::InvalidConfig(
                "output format must have a non-zero frame size and sample rate",
            ));
        }
        Ok(())
    }
}

/// Errors from sequencer construction and source swaps.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("invalid sequencer configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("sequencer is closed")]
    Closed,
}

/// Counter snapshot for a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerStats {
    /// Source swaps performed.
    pub swaps: u64,
    /// Frames emitted on the output stream.
    pub emitted: u64,
    /// Frames currently queued.
    pub queued: usize,
    /// Current queue generation.
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// ChannelSequencer
// ---------------------------------------------------------------------------

struct PacingHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Hot-swappable source sequencing for one channel.
pub struct ChannelSequencer {
    id: u64,
    params: SequencerParams,
    queue: Arc<BoundedFrameQueue>,
    output: Arc<PushFrameStream>,
    cache: Arc<FrameCache>,
    events: Arc<dyn ChannelEvents>,
    current: tokio::sync::Mutex<Option<Arc<SourceSession>>>,
    pacing: tokio::sync::Mutex<Option<PacingHandle>>,
    closed: AtomicBool,
    swaps: AtomicU64,
    emitted: Arc<AtomicU64>,
}

impl ChannelSequencer {
    pub fn new(
        params: SequencerParams,
        cache: Arc<FrameCache>,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Self, SequencerError> {
        params.validate()?;
        Ok(Self {
            id: obj_id(),
            queue: Arc::new(BoundedFrameQueue::new(params.queue_capacity)),
            output: Arc::new(PushFrameStream::new(params.format)),
            params,
            cache,
            events,
            current: tokio::sync::Mutex::new(None),
            pacing: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            swaps: AtomicU64::new(0),
            emitted: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Unique id of this sequencer, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start the pacing task emitting one frame per frame period.
    pub async fn start(&self) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(sequencer_id = self.id, "ChannelSequencer: start after close");
            return;
        }
        let mut pacing = self.pacing.lock().await;
        if pacing.is_some() {
            tracing::warn!(
                sequencer_id = self.id,
                "ChannelSequencer: start called while already running"
            );
            return;
        }

        let cancel = CancellationToken::new();
        let handle = {
            let queue = self.queue.clone();
            let output = self.output.clone();
            let emitted = self.emitted.clone();
            let period = self.params.format.frame_duration();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Some(frame) = queue.try_poll() {
                                emitted.fetch_add(1, Ordering::Relaxed);
                                output.push(frame);
                            }
                        }
                    }
                }
            })
        };
        *pacing = Some(PacingHandle { cancel, handle });
        tracing::debug!(
            sequencer_id = self.id,
            period_ms = self.params.format.frame_duration_ms(),
            "ChannelSequencer: pacing started"
        );
    }

    /// Make `session` the channel's current source.
    ///
    /// The queue moves to a new generation and is cleared in the same step,
    /// so nothing the old session still produces can reach the output. The
    /// old session is stopped immediately and closed on a separate task.
    pub async fn set_source(
        &self,
        session: SourceSession,
    ) -> Result<Arc<SourceSession>, SequencerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SequencerError::Closed);
        }
        let session = Arc::new(session);

        let mut current = self.current.lock().await;
        let old = current.replace(session.clone());
        let (generation, cleared) = self.queue.advance_generation();
        if let Some(old) = old {
            old.stop();
            tokio::spawn(async move { old.close().await });
        }
        self.swaps.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            sequencer_id = self.id,
            session_id = session.id(),
            kind = session.kind_name(),
            generation,
            cleared,
            "ChannelSequencer: source swapped"
        );

        let ctx = SessionContext::new(
            self.queue.clone(),
            generation,
            self.cache.clone(),
            self.events.clone(),
            self.params.format,
        );
        session.start(ctx).await;
        Ok(session)
    }

    /// The session currently feeding this channel, if any.
    pub async fn current_session(&self) -> Option<Arc<SourceSession>> {
        self.current.lock().await.clone()
    }

    /// Close the channel: stop the current session, stop pacing, discard
    /// queued frames, and emit the final end-of-stream marker. Waits are
    /// bounded; once this returns no further frame is emitted. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(sequencer_id = self.id, "ChannelSequencer: closing");

        // Stop the source first so nothing refills the queue.
        let current = self.current.lock().await.take();
        if let Some(session) = current {
            session.close().await;
        }

        if let Some(PacingHandle { cancel, handle }) = self.pacing.lock().await.take() {
            cancel.cancel();
            let abort_handle = handle.abort_handle();
            let timeout = Duration::from_millis(self.params.close_timeout_ms);
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        sequencer_id = self.id,
                        "ChannelSequencer: pacing task panicked: {}",
                        e
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        sequencer_id = self.id,
                        "ChannelSequencer: pacing task did not stop in time, aborting"
                    );
                    abort_handle.abort();
                }
            }
        }

        let cleared = self.queue.clear();
        if cleared > 0 {
            tracing::debug!(
                sequencer_id = self.id,
                cleared,
                "ChannelSequencer: discarded queued frames at close"
            );
        }
        self.output.stop();
    }

    /// Whether the sequencer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Output stream carrying the paced channel audio.
    pub fn output(&self) -> &Arc<PushFrameStream> {
        &self.output
    }

    /// Read the latest emitted frame; marks `out` discard if nothing new.
    pub fn read(&self, out: &mut AudioFrame) {
        self.output.read(out);
    }

    /// Snapshot of the sequencer counters.
    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            swaps: self.swaps.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            queued: self.queue.len(),
            generation: self.queue.generation(),
        }
    }
}

impl std::fmt::Debug for ChannelSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSequencer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("queued", &self.queue.len())
            .finish()
    }
}
