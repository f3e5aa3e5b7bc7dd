// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Queue-backed relay between a push stream and a downstream consumer.
//!
//! [`AsyncRelay`] absorbs the synchronous push cadence of an upstream
//! [`PushFrameStream`] into a [`BoundedFrameQueue`] and re-delivers frames
//! from a background pump task onto its own output stream. The upstream
//! producer is never blocked: when the queue is full the frame is dropped,
//! counted, and reported through [`ChannelEvents::buffer_queue_full`]. When
//! the upstream signals end of stream the relay forwards the marker and
//! detaches itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffers::queue::BoundedFrameQueue;
use crate::events::ChannelEvents;
use crate::frames::AudioFrame;
use crate::streams::{FrameSink, PushFrameStream};
use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// Params and errors
// ---------------------------------------------------------------------------

/// Configuration for an [`AsyncRelay`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayParams {
    /// Maximum frames buffered between producer and pump. At 20 ms frames
    /// the default of 64 holds roughly 1.3 s of audio.
    pub queue_capacity: usize,
    /// How long the pump waits for a frame before re-checking for shutdown.
    pub poll_timeout_ms: u64,
}

impl Default for RelayParams {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            poll_timeout_ms: 5,
        }
    }
}

impl RelayParams {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.queue_capacity == 0 {
            return Err(RelayError::ZeroQueueCapacity);
        }
        if self.poll_timeout_ms == 0 {
            return Err(RelayError::ZeroPollTimeout);
        }
        Ok(())
    }
}

/// Errors building an [`AsyncRelay`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay queue capacity must be greater than zero")]
    ZeroQueueCapacity,
    #[error("relay poll timeout must be greater than zero")]
    ZeroPollTimeout,
}

/// Counter snapshot for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Frames the producer attempted to enqueue.
    pub offered: u64,
    /// Frames the pump delivered downstream.
    pub delivered: u64,
    /// Frames rejected because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct RelayCounters {
    offered: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

// ---------------------------------------------------------------------------
// Producer sink
// ---------------------------------------------------------------------------

/// Sink registered on the upstream stream; runs on the producer's call stack
/// so it only reads, offers, and returns.
struct RelayProducer {
    relay_id: u64,
    queue: Arc<BoundedFrameQueue>,
    counters: Arc<RelayCounters>,
    events: Arc<dyn ChannelEvents>,
}

impl FrameSink for RelayProducer {
    fn frame_available(&self, stream: &PushFrameStream) {
        let mut frame = AudioFrame::new(Vec::new(), stream.format());
        stream.read(&mut frame);
        if frame.is_discard() {
            return;
        }
        self.counters.offered.fetch_add(1, Ordering::Relaxed);
        if !self.queue.offer(frame) {
            let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                relay_id = self.relay_id,
                dropped_total = dropped,
                "AsyncRelay: queue full, dropping frame"
            );
            self.events.buffer_queue_full(dropped);
        }
    }
}

// ---------------------------------------------------------------------------
// AsyncRelay
// ---------------------------------------------------------------------------

struct PumpHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Lossy buffered bridge from a push stream to an output stream.
pub struct AsyncRelay {
    id: u64,
    upstream: Arc<PushFrameStream>,
    output: Arc<PushFrameStream>,
    queue: Arc<BoundedFrameQueue>,
    poll_timeout: Duration,
    counters: Arc<RelayCounters>,
    events: Arc<dyn ChannelEvents>,
    connected: Arc<AtomicBool>,
    pump: tokio::sync::Mutex<Option<PumpHandle>>,
}

impl AsyncRelay {
    /// Create a relay reading from `upstream`. The output stream carries the
    /// same format as the upstream.
    pub fn new(
        upstream: Arc<PushFrameStream>,
        params: RelayParams,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Self, RelayError> {
        params.validate()?;
        let output = Arc::new(PushFrameStream::new(upstream.format()));
        Ok(Self {
            id: obj_id(),
            upstream,
            output,
            queue: Arc::new(BoundedFrameQueue::new(params.queue_capacity)),
            poll_timeout: Duration::from_millis(params.poll_timeout_ms),
            counters: Arc::new(RelayCounters::default()),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            pump: tokio::sync::Mutex::new(None),
        })
    }

    /// Unique id of this relay, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attach to the upstream and start the pump task.
    pub async fn connect(&self) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            tracing::warn!(
                relay_id = self.id,
                "AsyncRelay: connect called while already connected"
            );
            return;
        }

        self.upstream.set_sink(Some(Arc::new(RelayProducer {
            relay_id: self.id,
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            events: self.events.clone(),
        })));

        let cancel = CancellationToken::new();
        let handle = {
            let relay_id = self.id;
            let queue = self.queue.clone();
            let output = self.output.clone();
            let upstream = self.upstream.clone();
            let counters = self.counters.clone();
            let connected = self.connected.clone();
            let poll_timeout = self.poll_timeout;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        polled = queue.poll(poll_timeout) => {
                            let Some(frame) = polled else { continue };
                            counters.delivered.fetch_add(1, Ordering::Relaxed);
                            let ended = frame.is_end_of_stream();
                            output.push(frame);
                            if ended {
                                // Upstream is done; detach without touching the
                                // pump slot (disconnect may be holding it).
                                upstream.set_sink(None);
                                connected.store(false, Ordering::Release);
                                tracing::debug!(
                                    relay_id,
                                    "AsyncRelay: end of stream, pump stopping"
                                );
                                break;
                            }
                        }
                    }
                }
            })
        };

        self.connected.store(true, Ordering::Release);
        *pump = Some(PumpHandle { cancel, handle });
        tracing::debug!(relay_id = self.id, "AsyncRelay: connected");
    }

    /// Detach from the upstream and stop the pump. Queued frames are left
    /// behind; call again is a no-op.
    pub async fn disconnect(&self) {
        self.upstream.set_sink(None);
        let taken = self.pump.lock().await.take();
        self.connected.store(false, Ordering::Release);

        if let Some(PumpHandle { cancel, handle }) = taken {
            cancel.cancel();
            let abort_handle = handle.abort_handle();
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(relay_id = self.id, "AsyncRelay: pump finished cleanly");
                }
                Ok(Err(e)) => {
                    tracing::warn!(relay_id = self.id, "AsyncRelay: pump task panicked: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        relay_id = self.id,
                        "AsyncRelay: pump did not stop in time, aborting"
                    );
                    abort_handle.abort();
                }
            }
        }
        tracing::debug!(relay_id = self.id, "AsyncRelay: disconnected");
    }

    /// Whether the pump is attached and running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Output stream fed by the pump.
    pub fn output(&self) -> &Arc<PushFrameStream> {
        &self.output
    }

    /// Read the latest pumped frame; marks `out` discard if nothing new.
    pub fn read(&self, out: &mut AudioFrame) {
        self.output.read(out);
    }

    /// Snapshot of the relay counters.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            offered: self.counters.offered.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AsyncRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRelay")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;
    use crate::frames::AudioFormat;
    use tokio::sync::Notify;

    struct CollectingSink {
        frames: std::sync::Mutex<Vec<AudioFrame>>,
        notify: Notify,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: std::sync::Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        fn len(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        async fn wait_for(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let notified = self.notify.notified();
                    if self.len() >= n {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .expect("timed out waiting for frames");
        }
    }

    impl FrameSink for CollectingSink {
        fn frame_available(&self, stream: &PushFrameStream) {
            let mut frame = AudioFrame::new(Vec::new(), stream.format());
            stream.read(&mut frame);
            if frame.is_discard() {
                return;
            }
            self.frames.lock().unwrap().push(frame);
            self.notify.notify_waiters();
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        full: std::sync::Mutex<Vec<u64>>,
    }

    impl ChannelEvents for RecordingEvents {
        fn buffer_queue_full(&self, dropped_total: u64) {
            self.full.lock().unwrap().push(dropped_total);
        }
    }

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(vec![tag], AudioFormat::default())
    }

    #[test]
    fn test_rejects_invalid_params() {
        let upstream = Arc::new(PushFrameStream::new(AudioFormat::default()));
        let params = RelayParams {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            AsyncRelay::new(upstream.clone(), params, Arc::new(NoopEvents)),
            Err(RelayError::ZeroQueueCapacity)
        ));

        let params = RelayParams {
            poll_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            AsyncRelay::new(upstream, params, Arc::new(NoopEvents)),
            Err(RelayError::ZeroPollTimeout)
        ));
    }

    #[tokio::test]
    async fn test_pumps_frames_in_order() {
        let upstream = Arc::new(PushFrameStream::new(AudioFormat::default()));
        let relay =
            AsyncRelay::new(upstream.clone(), RelayParams::default(), Arc::new(NoopEvents))
                .unwrap();

        let collector = CollectingSink::new();
        relay.output().set_sink(Some(collector.clone()));

        relay.connect().await;
        upstream.push(frame(1));
        upstream.push(frame(2));
        upstream.push(frame(3));

        collector.wait_for(3).await;
        {
            let frames = collector.frames.lock().unwrap();
            assert_eq!(frames[0].data(), &[1]);
            assert_eq!(frames[1].data(), &[2]);
            assert_eq!(frames[2].data(), &[3]);
        }
        assert_eq!(relay.stats().delivered, 3);

        relay.disconnect().await;
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_drops_when_queue_full() {
        let upstream = Arc::new(PushFrameStream::new(AudioFormat::default()));
        let events = Arc::new(RecordingEvents::default());
        let params = RelayParams {
            queue_capacity: 2,
            poll_timeout_ms: 20,
        };
        let relay = AsyncRelay::new(upstream.clone(), params, events.clone()).unwrap();

        let collector = CollectingSink::new();
        relay.output().set_sink(Some(collector.clone()));

        relay.connect().await;
        // Single-threaded test runtime: the pump cannot drain between these
        // synchronous pushes, so capacity 2 forces three drops.
        for tag in 1..=5 {
            upstream.push(frame(tag));
        }

        let stats = relay.stats();
        assert_eq!(stats.offered, 5);
        assert_eq!(stats.dropped, 3);
        assert_eq!(*events.full.lock().unwrap(), vec![1, 2, 3]);

        collector.wait_for(2).await;
        relay.disconnect().await;
        assert_eq!(relay.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_end_of_stream_detaches_pump() {
        let upstream = Arc::new(PushFrameStream::new(AudioFormat::default()));
        let relay =
            AsyncRelay::new(upstream.clone(), RelayParams::default(), Arc::new(NoopEvents))
                .unwrap();

        let collector = CollectingSink::new();
        relay.output().set_sink(Some(collector.clone()));

        relay.connect().await;
        upstream.push(frame(1));
        upstream.stop();

        collector.wait_for(2).await;
        {
            let frames = collector.frames.lock().unwrap();
            assert!(frames[1].is_end_of_stream());
        }
        assert!(relay.output().is_ended());

        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.is_connected() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("pump should detach after end of stream");

        relay.disconnect().await;
    }
}
