// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Source sessions: the unit of playback a channel sequences.
//!
//! A [`SourceSession`] owns one source of audio and a worker task that feeds
//! the channel's frame queue. Three kinds exist:
//!
//! - **one-shot**: renders a single source end to end, optionally through
//!   the [`crate::cache::FrameCache`], and finishes when the source ends;
//! - **continuous playlist**: plays an ordered list of items back to back
//!   with no gap, trimming trailing silence between items (see
//!   [`playlist`]);
//! - **live realtime**: forwards a live feed, rewriting each frame's
//!   timestamp to wall-clock receipt time; never cached.
//!
//! The worker tags every enqueue with the generation it was started under,
//! so a session that has been hot-swapped out can never bleed frames into
//! its successor's audio. End-of-stream markers from transcoders are
//! completion signals consumed by the session; they are not forwarded into
//! the channel queue.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffers::queue::{BoundedFrameQueue, OfferOutcome};
use crate::cache::{CacheKey, FrameCache};
use crate::events::ChannelEvents;
use crate::frames::{AudioFormat, AudioFrame};
use crate::streams::{FrameSink, PushFrameStream};
use crate::transcode::{TranscodeError, Transcoder};
use crate::utils::{obj_id, unix_now_ns};

pub mod playlist;

pub use playlist::PlaylistItem;

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Lifecycle of a session. `Done` means the source played to completion;
/// `Stopped` means it was cancelled or failed. Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Done = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::Done,
            _ => SessionState::Stopped,
        }
    }
}

/// Errors raised while creating or starting a session's source.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("playlist must contain at least one item")]
    EmptyPlaylist,
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// Wiring a session worker needs to feed a channel: the frame queue and the
/// generation it must tag offers with, plus the shared cache, the events
/// sink, and the channel's output format.
#[derive(Clone)]
pub struct SessionContext {
    pub(crate) queue: Arc<BoundedFrameQueue>,
    pub(crate) generation: u64,
    pub(crate) cache: Arc<FrameCache>,
    pub(crate) events: Arc<dyn ChannelEvents>,
    pub(crate) format: AudioFormat,
}

impl SessionContext {
    pub fn new(
        queue: Arc<BoundedFrameQueue>,
        generation: u64,
        cache: Arc<FrameCache>,
        events: Arc<dyn ChannelEvents>,
        format: AudioFormat,
    ) -> Self {
        Self {
            queue,
            generation,
            cache,
            events,
            format,
        }
    }

    /// Channel output format sessions render to.
    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("generation", &self.generation)
            .field("format", &self.format)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SourceSession
// ---------------------------------------------------------------------------

enum SourceKind {
    OneShot {
        transcoder: Arc<dyn Transcoder>,
        cache_key: Option<CacheKey>,
    },
    ContinuousPlaylist {
        items: Vec<PlaylistItem>,
        trim_ms: u64,
    },
    LiveRealtime {
        transcoder: Arc<dyn Transcoder>,
    },
}

impl SourceKind {
    fn name(&self) -> &'static str {
        match self {
            SourceKind::OneShot { .. } => "one_shot",
            SourceKind::ContinuousPlaylist { .. } => "playlist",
            SourceKind::LiveRealtime { .. } => "live",
        }
    }
}

/// One playable source bound to a channel generation.
pub struct SourceSession {
    id: u64,
    kind_name: &'static str,
    kind: std::sync::Mutex<Option<SourceKind>>,
    state: AtomicU8,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SourceSession {
    fn with_kind(kind: SourceKind) -> Self {
        Self {
            id: obj_id(),
            kind_name: kind.name(),
            kind: std::sync::Mutex::new(Some(kind)),
            state: AtomicU8::new(SessionState::Created as u8),
            cancel: CancellationToken::new(),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Session playing a single source once, optionally cached under
    /// `cache_key` for replay.
    pub fn one_shot(transcoder: Arc<dyn Transcoder>, cache_key: Option<CacheKey>) -> Self {
        Self::with_kind(SourceKind::OneShot {
            transcoder,
            cache_key,
        })
    }

    /// Session playing `items` back to back with no gap. `trim_ms` of
    /// trailing audio is removed from every item except the last.
    pub fn playlist(items: Vec<PlaylistItem>, trim_ms: u64) -> Result<Self, SessionError> {
        if items.is_empty() {
            return Err(SessionError::EmptyPlaylist);
        }
        Ok(Self::with_kind(SourceKind::ContinuousPlaylist {
            items,
            trim_ms,
        }))
    }

    /// Session forwarding a live feed until stopped or the feed ends.
    pub fn live(transcoder: Arc<dyn Transcoder>) -> Self {
        Self::with_kind(SourceKind::LiveRealtime { transcoder })
    }

    /// Unique id of this session, for logging and event correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kind label, for logging.
    pub fn kind_name(&self) -> &'static str {
        self.kind_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start the worker feeding `ctx`. A session starts at most once;
    /// further calls are logged and ignored.
    pub async fn start(self: &Arc<Self>, ctx: SessionContext) {
        if self
            .state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::warn!(
                session_id = self.id,
                state = ?self.state(),
                "SourceSession: start called in non-created state"
            );
            return;
        }

        let kind = self
            .kind
            .lock()
            .expect("session kind lock poisoned")
            .take();
        let Some(kind) = kind else {
            tracing::warn!(session_id = self.id, "SourceSession: source already consumed");
            return;
        };

        tracing::debug!(
            session_id = self.id,
            kind = self.kind_name,
            generation = ctx.generation,
            "SourceSession: starting"
        );
        ctx.events.session_created(self.id);

        let session = self.clone();
        let handle = tokio::spawn(async move {
            match kind {
                SourceKind::OneShot {
                    transcoder,
                    cache_key,
                } => run_one_shot(&session, transcoder, cache_key, &ctx).await,
                SourceKind::ContinuousPlaylist { items, trim_ms } => {
                    playlist::run_playlist(&session, items, trim_ms, &ctx).await
                }
                SourceKind::LiveRealtime { transcoder } => {
                    run_live(&session, transcoder, &ctx).await
                }
            }
            let _ = session.state.compare_exchange(
                SessionState::Running as u8,
                SessionState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            tracing::debug!(
                session_id = session.id,
                state = ?session.state(),
                "SourceSession: worker finished"
            );
        });
        *self.worker.lock().await = Some(handle);
    }

    /// Signal the worker to stop between units of work. Idempotent and
    /// returns immediately; use [`SourceSession::close`] to wait.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(session_id = self.id, "SourceSession: stop requested");
            self.cancel.cancel();
        }
        let _ = self.state.compare_exchange(
            SessionState::Created as u8,
            SessionState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            SessionState::Running as u8,
            SessionState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stop and wait for the worker to exit, bounded by a watchdog so a
    /// wedged transcoder cannot hang the caller.
    pub async fn close(&self) {
        self.stop();
        if let Some(handle) = self.worker.lock().await.take() {
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = self.id, "SourceSession: worker panicked: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = self.id,
                        "SourceSession: worker did not exit in time, aborting"
                    );
                    abort_handle.abort();
                }
            }
        }
    }

    /// Mark the session failed.
    fn fail(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Running as u8,
            SessionState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl std::fmt::Debug for SourceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSession")
            .field("id", &self.id)
            .field("kind", &self.kind_name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn connect_and_start(transcoder: &Arc<dyn Transcoder>) -> Result<(), TranscodeError> {
    transcoder.connect().await?;
    transcoder.start().await
}

async fn teardown(session_id: u64, transcoder: &Arc<dyn Transcoder>) {
    transcoder.output().set_sink(None);
    if let Err(e) = transcoder.stop().await {
        tracing::warn!(session_id, error = %e, "SourceSession: transcoder stop failed");
    }
    if let Err(e) = transcoder.disconnect().await {
        tracing::warn!(session_id, error = %e, "SourceSession: transcoder disconnect failed");
    }
}

async fn run_one_shot(
    session: &Arc<SourceSession>,
    transcoder: Arc<dyn Transcoder>,
    cache_key: Option<CacheKey>,
    ctx: &SessionContext,
) {
    if let Some(key) = &cache_key {
        if let Some(frames) = ctx.cache.get(key) {
            tracing::debug!(
                session_id = session.id,
                frames = frames.len(),
                "SourceSession: one-shot replay from cache"
            );
            enqueue_paced(session, &frames, ctx).await;
            return;
        }
    }

    let sink = Arc::new(StreamSink::new(
        session.id,
        ctx,
        cache_key.is_some(),
        false,
    ));
    transcoder.output().set_sink(Some(sink.clone()));
    transcoder.set_output_frame_size(ctx.format.frame_size);

    if let Err(e) = connect_and_start(&transcoder).await {
        teardown(session.id, &transcoder).await;
        let error = SessionError::Transcode(e);
        tracing::warn!(
            session_id = session.id,
            error = %error,
            "SourceSession: one-shot transcoder failed to start"
        );
        ctx.events.session_creation_error(session.id, &error);
        session.fail();
        return;
    }

    tokio::select! {
        biased;
        _ = session.cancel.cancelled() => {}
        _ = sink.wait_done() => {}
    }

    teardown(session.id, &transcoder).await;

    if let Some(key) = &cache_key {
        if sink.completed() {
            let frames = sink.take_collected();
            if !frames.is_empty() {
                ctx.cache.put(key, frames);
            }
        }
    }
}

async fn run_live(
    session: &Arc<SourceSession>,
    transcoder: Arc<dyn Transcoder>,
    ctx: &SessionContext,
) {
    let sink = Arc::new(StreamSink::new(session.id, ctx, false, true));
    transcoder.output().set_sink(Some(sink.clone()));
    transcoder.set_output_frame_size(ctx.format.frame_size);

    if let Err(e) = connect_and_start(&transcoder).await {
        teardown(session.id, &transcoder).await;
        let error = SessionError::Transcode(e);
        tracing::warn!(
            session_id = session.id,
            error = %error,
            "SourceSession: live transcoder failed to start"
        );
        ctx.events.session_creation_error(session.id, &error);
        session.fail();
        return;
    }

    tokio::select! {
        biased;
        _ = session.cancel.cancelled() => {}
        _ = sink.wait_done() => {}
    }

    teardown(session.id, &transcoder).await;
}

/// Enqueue already-rendered frames, waiting one frame period whenever the
/// queue is full. Exits on cancellation or when the generation goes stale.
pub(crate) async fn enqueue_paced(
    session: &Arc<SourceSession>,
    frames: &[AudioFrame],
    ctx: &SessionContext,
) {
    let frame_wait = ctx.format.frame_duration().max(Duration::from_millis(1));
    for frame in frames {
        loop {
            if session.cancel.is_cancelled() {
                return;
            }
            match ctx.queue.offer_at(ctx.generation, frame.clone()) {
                OfferOutcome::Queued => break,
                OfferOutcome::Full => tokio::time::sleep(frame_wait).await,
                OfferOutcome::Stale => {
                    tracing::debug!(
                        session_id = session.id,
                        "SourceSession: generation superseded during enqueue"
                    );
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StreamSink
// ---------------------------------------------------------------------------

/// Sink on a transcoder output that forwards frames straight into the
/// channel queue. Runs on the producer's call stack, so offers never block:
/// a full queue drops the frame with a counted warning.
struct StreamSink {
    session_id: u64,
    queue: Arc<BoundedFrameQueue>,
    generation: u64,
    events: Arc<dyn ChannelEvents>,
    rewrite_pts: bool,
    collect: Option<std::sync::Mutex<Vec<AudioFrame>>>,
    dropped: AtomicU64,
    stale: AtomicBool,
    ended: AtomicBool,
    done: Notify,
}

impl StreamSink {
    fn new(session_id: u64, ctx: &SessionContext, collect: bool, rewrite_pts: bool) -> Self {
        Self {
            session_id,
            queue: ctx.queue.clone(),
            generation: ctx.generation,
            events: ctx.events.clone(),
            rewrite_pts,
            collect: collect.then(|| std::sync::Mutex::new(Vec::new())),
            dropped: AtomicU64::new(0),
            stale: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    fn completed(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    async fn wait_done(&self) {
        loop {
            let notified = self.done.notified();
            if self.completed() {
                return;
            }
            notified.await;
        }
    }

    fn take_collected(&self) -> Vec<AudioFrame> {
        self.collect
            .as_ref()
            .map(|collected| std::mem::take(&mut *collected.lock().expect("collect lock poisoned")))
            .unwrap_or_default()
    }
}

impl FrameSink for StreamSink {
    fn frame_available(&self, stream: &PushFrameStream) {
        let mut frame = AudioFrame::new(Vec::new(), stream.format());
        stream.read(&mut frame);
        if frame.is_discard() {
            return;
        }
        if frame.is_end_of_stream() {
            // Completion signal for the session; never enters the queue.
            self.ended.store(true, Ordering::Release);
            self.done.notify_waiters();
            return;
        }
        if self.rewrite_pts {
            frame.set_pts(Some(unix_now_ns()));
        }
        if let Some(collected) = &self.collect {
            collected
                .lock()
                .expect("collect lock poisoned")
                .push(frame.clone());
        }
        if self.stale.load(Ordering::Acquire) {
            return;
        }
        match self.queue.offer_at(self.generation, frame) {
            OfferOutcome::Queued => {}
            OfferOutcome::Full => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    session_id = self.session_id,
                    dropped_total = dropped,
                    "SourceSession: channel queue full, dropping frame"
                );
                self.events.buffer_queue_full(dropped);
            }
            OfferOutcome::Stale => {
                self.stale.store(true, Ordering::Release);
                tracing::debug!(
                    session_id = self.session_id,
                    "SourceSession: generation superseded, no longer enqueueing"
                );
            }
        }
    }
}
