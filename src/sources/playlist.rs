// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Continuous playlist playback.
//!
//! Plays an ordered list of items back to back with no gap. Items are
//! prepared (cache lookup, else render and cache) on look-ahead tasks so the
//! next item is usually ready the moment the current one finishes
//! enqueueing. Every item except the last has `trim_ms` of trailing audio
//! removed before caching, so per-file trailing silence does not open gaps
//! at item boundaries. A failed item is logged and skipped; the playlist
//! carries on with the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheKey;
use crate::frames::AudioFrame;
use crate::streams::{FrameSink, PushFrameStream};
use crate::transcode::Transcoder;

use super::{enqueue_paced, SessionContext, SessionError, SourceSession};

// ---------------------------------------------------------------------------
// PlaylistItem
// ---------------------------------------------------------------------------

/// One entry in a continuous playlist.
#[derive(Clone)]
pub struct PlaylistItem {
    pub(crate) transcoder: Arc<dyn Transcoder>,
    pub(crate) cache_key: Option<CacheKey>,
}

impl PlaylistItem {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            transcoder,
            cache_key: None,
        }
    }

    /// Cache rendered frames under `key`. The trim period is folded into the
    /// key automatically when this item ends up trimmed.
    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }
}

impl std::fmt::Debug for PlaylistItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistItem")
            .field("cached", &self.cache_key.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trim math
// ---------------------------------------------------------------------------

/// Whole frames covered by `trim_ms` at the given frame duration.
pub(crate) fn trim_frame_count(trim_ms: u64, frame_duration_ms: u64) -> usize {
    if frame_duration_ms == 0 {
        return 0;
    }
    (trim_ms / frame_duration_ms) as usize
}

/// Remove the trailing trim window from a rendered item.
pub(crate) fn trim_tail(frames: &mut Vec<AudioFrame>, trim_ms: u64, frame_duration_ms: u64) {
    let remove = trim_frame_count(trim_ms, frame_duration_ms);
    let keep = frames.len().saturating_sub(remove);
    frames.truncate(keep);
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub(crate) async fn run_playlist(
    session: &Arc<SourceSession>,
    items: Vec<PlaylistItem>,
    trim_ms: u64,
    ctx: &SessionContext,
) {
    let total = items.len();
    let mut enqueued_any = false;
    let mut pending = Some(spawn_prepare(
        session,
        items[0].clone(),
        trim_ms,
        total == 1,
        ctx,
    ));

    for idx in 0..total {
        let Some(handle) = pending.take() else { break };
        let prepared = handle.await;

        // Kick off the next item's render while this one enqueues.
        if idx + 1 < total {
            pending = Some(spawn_prepare(
                session,
                items[idx + 1].clone(),
                trim_ms,
                idx + 2 == total,
                ctx,
            ));
        }

        if session.cancel.is_cancelled() {
            break;
        }

        match prepared {
            Ok(Ok(frames)) if frames.is_empty() => {}
            Ok(Ok(frames)) => {
                tracing::debug!(
                    session_id = session.id,
                    item = idx,
                    frames = frames.len(),
                    "SourceSession: enqueueing playlist item"
                );
                enqueue_paced(session, &frames, ctx).await;
                enqueued_any = true;
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    session_id = session.id,
                    item = idx,
                    error = %error,
                    "SourceSession: playlist item failed, skipping"
                );
                if !enqueued_any {
                    ctx.events.session_creation_error(session.id, &error);
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = session.id,
                    item = idx,
                    "SourceSession: playlist prepare task panicked: {}",
                    e
                );
            }
        }
    }

    if let Some(handle) = pending.take() {
        // Stopping mid-playlist; the prepare task observes the cancel token.
        let _ = handle.await;
    }
}

fn spawn_prepare(
    session: &Arc<SourceSession>,
    item: PlaylistItem,
    trim_ms: u64,
    is_last: bool,
    ctx: &SessionContext,
) -> JoinHandle<Result<Arc<Vec<AudioFrame>>, SessionError>> {
    let cancel = session.cancel.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move { prepare_item(item, trim_ms, is_last, &ctx, &cancel).await })
}

/// Produce the item's frames: cache lookup first, else render through the
/// item's transcoder, trim, and cache. Returns an empty sequence when
/// interrupted before the render completed.
async fn prepare_item(
    item: PlaylistItem,
    trim_ms: u64,
    is_last: bool,
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<Arc<Vec<AudioFrame>>, SessionError> {
    let effective_trim = (!is_last && trim_ms > 0).then_some(trim_ms);
    let key = item.cache_key.clone().map(|key| match effective_trim {
        Some(trim) => key.with_trim_ms(trim),
        None => key,
    });

    if let Some(key) = &key {
        if let Some(frames) = ctx.cache.get(key) {
            tracing::debug!(
                frames = frames.len(),
                "SourceSession: playlist item served from cache"
            );
            return Ok(frames);
        }
    }

    let collector = Arc::new(CollectorSink::new());
    let output = item.transcoder.output();
    output.set_sink(Some(collector.clone()));
    item.transcoder.set_output_frame_size(ctx.format.frame_size);

    let started = async {
        item.transcoder.connect().await?;
        item.transcoder.start().await
    }
    .await;
    if let Err(e) = started {
        output.set_sink(None);
        return Err(SessionError::Transcode(e));
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = collector.wait_done() => {}
    }

    output.set_sink(None);
    if let Err(e) = item.transcoder.stop().await {
        tracing::warn!(error = %e, "SourceSession: playlist transcoder stop failed");
    }
    if let Err(e) = item.transcoder.disconnect().await {
        tracing::warn!(error = %e, "SourceSession: playlist transcoder disconnect failed");
    }

    if !collector.completed() {
        return Ok(Arc::new(Vec::new()));
    }

    let mut frames = collector.take();
    if let Some(trim) = effective_trim {
        trim_tail(&mut frames, trim, ctx.format.frame_duration_ms());
    }
    Ok(match &key {
        Some(key) => ctx.cache.put(key, frames),
        None => Arc::new(frames),
    })
}

// ---------------------------------------------------------------------------
// CollectorSink
// ---------------------------------------------------------------------------

/// Sink that gathers a full render off-queue, signalling on end of stream.
struct CollectorSink {
    frames: std::sync::Mutex<Vec<AudioFrame>>,
    ended: AtomicBool,
    done: Notify,
}

impl CollectorSink {
    fn new() -> Self {
        Self {
            frames: std::sync::Mutex::new(Vec::new()),
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

    fn take(&self) -> Vec<AudioFrame> {
        std::mem::take(&mut *self.frames.lock().expect("collector lock poisoned"))
    }
}

impl FrameSink for CollectorSink {
    fn frame_available(&self, stream: &PushFrameStream) {
        let mut frame = AudioFrame::new(Vec::new(), stream.format());
        stream.read(&mut frame);
        if frame.is_discard() {
            return;
        }
        if frame.is_end_of_stream() {
            self.ended.store(true, Ordering::Release);
            self.done.notify_waiters();
            return;
        }
        self.frames
            .lock()
            .expect("collector lock poisoned")
            .push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::buffers::queue::BoundedFrameQueue;
    use crate::cache::FrameCache;
    use crate::events::{ChannelEvents, NoopEvents};
    use crate::frames::{AudioFormat, CodecKind};
    use crate::sources::SessionState;
    use crate::transcode::{MemoryTranscoder, TranscodeError};
    use async_trait::async_trait;
    use std::time::Duration;

    fn make_ctx(capacity: usize, events: Arc<dyn ChannelEvents>) -> SessionContext {
        SessionContext::new(
            Arc::new(BoundedFrameQueue::new(capacity)),
            0,
            Arc::new(FrameCache::new()),
            events,
            AudioFormat::default(),
        )
    }

    fn item_with_level(level: i16, samples: usize) -> PlaylistItem {
        PlaylistItem::new(Arc::new(MemoryTranscoder::from_pcm_samples(
            &vec![level; samples],
            8000,
            AudioFormat::default(),
        )))
    }

    async fn wait_done(session: &Arc<SourceSession>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.state() != SessionState::Done {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("playlist session did not finish");
    }

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame::new(
            codec::samples_to_pcm_bytes(&[tag; 160]),
            AudioFormat::default(),
        )
    }

    struct FailingTranscoder {
        output: Arc<PushFrameStream>,
    }

    impl FailingTranscoder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                output: Arc::new(PushFrameStream::new(AudioFormat::default())),
            })
        }
    }

    #[async_trait]
    impl Transcoder for FailingTranscoder {
        fn output(&self) -> Arc<PushFrameStream> {
            self.output.clone()
        }

        async fn connect(&self) -> Result<(), TranscodeError> {
            Err(TranscodeError::Unsupported("always fails".to_string()))
        }

        async fn start(&self) -> Result<(), TranscodeError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        errored: std::sync::Mutex<Vec<u64>>,
    }

    impl ChannelEvents for RecordingEvents {
        fn session_creation_error(&self, session_id: u64, _error: &SessionError) {
            self.errored.lock().unwrap().push(session_id);
        }
    }

    #[test]
    fn test_trim_frame_count_floors() {
        assert_eq!(trim_frame_count(50, 20), 2);
        assert_eq!(trim_frame_count(40, 20), 2);
        assert_eq!(trim_frame_count(39, 20), 1);
        assert_eq!(trim_frame_count(19, 20), 0);
        assert_eq!(trim_frame_count(0, 20), 0);
        assert_eq!(trim_frame_count(50, 0), 0);
    }

    #[test]
    fn test_trim_tail_removes_trailing_frames() {
        let mut frames: Vec<AudioFrame> = (0..5).map(|i| frame(i as i16)).collect();
        trim_tail(&mut frames, 40, 20);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            codec::pcm_bytes_to_samples(frames[2].data())[0],
            2,
            "the kept frames must be the leading ones"
        );
    }

    #[test]
    fn test_trim_tail_clamps_to_empty() {
        let mut frames = vec![frame(1), frame(2)];
        trim_tail(&mut frames, 1000, 20);
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_playlist_plays_back_to_back_with_trim() {
        let ctx = make_ctx(64, Arc::new(NoopEvents));
        // Two items of 3 frames each; 20 ms trim removes one frame from the
        // first item only.
        let items = vec![item_with_level(10, 480), item_with_level(20, 480)];
        let session = Arc::new(SourceSession::playlist(items, 20).unwrap());

        session.start(ctx.clone()).await;
        wait_done(&session).await;

        let mut levels = Vec::new();
        while let Some(frame) = ctx.queue.try_poll() {
            levels.push(codec::pcm_bytes_to_samples(frame.data())[0]);
        }
        assert_eq!(levels, vec![10, 10, 20, 20, 20]);
    }

    #[tokio::test]
    async fn test_playlist_caches_items_with_trim_in_key() {
        let ctx = make_ctx(64, Arc::new(NoopEvents));
        let key_a = CacheKey::new("sum-a", CodecKind::LinearPcm, 160);
        let key_b = CacheKey::new("sum-b", CodecKind::LinearPcm, 160);
        let key_c = CacheKey::new("sum-c", CodecKind::LinearPcm, 160);
        let items = vec![
            item_with_level(10, 480).with_cache_key(key_a.clone()),
            item_with_level(20, 480).with_cache_key(key_b.clone()),
            item_with_level(30, 480).with_cache_key(key_c.clone()),
        ];
        let session = Arc::new(SourceSession::playlist(items, 20).unwrap());

        session.start(ctx.clone()).await;
        wait_done(&session).await;

        assert_eq!(ctx.cache.len(), 3);
        // Every non-last item is stored trimmed, under a trim-qualified key.
        let first = ctx.cache.get(&key_a.with_trim_ms(20)).unwrap();
        assert_eq!(first.len(), 2);
        let middle = ctx.cache.get(&key_b.with_trim_ms(20)).unwrap();
        assert_eq!(middle.len(), 2);
        let last = ctx.cache.get(&key_c).unwrap();
        assert_eq!(last.len(), 3);
    }

    #[tokio::test]
    async fn test_playlist_skips_failing_item() {
        let events = Arc::new(RecordingEvents::default());
        let ctx = make_ctx(64, events.clone());
        let items = vec![
            PlaylistItem::new(FailingTranscoder::new()),
            item_with_level(20, 480),
        ];
        let session = Arc::new(SourceSession::playlist(items, 0).unwrap());

        session.start(ctx.clone()).await;
        wait_done(&session).await;

        // The failure is reported, the remaining item still plays.
        assert_eq!(events.errored.lock().unwrap().as_slice(), &[session.id()]);
        let mut count = 0;
        while ctx.queue.try_poll().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_playlist_requires_items() {
        assert!(matches!(
            SourceSession::playlist(Vec::new(), 0),
            Err(SessionError::EmptyPlaylist)
        ));
    }
}
