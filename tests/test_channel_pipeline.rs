// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end channel tests: source sessions feeding a sequencer, paced
//! output relayed to a pull-model consumer, hot-swap isolation, playlist
//! continuity, and cached replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use telemix::audio::codec;
use telemix::buffers::{AsyncRelay, RelayParams};
use telemix::cache::{CacheKey, FrameCache};
use telemix::events::NoopEvents;
use telemix::frames::{AudioFormat, AudioFrame, CodecKind};
use telemix::sequencer::{ChannelSequencer, SequencerParams};
use telemix::sources::{PlaylistItem, SourceSession};
use telemix::streams::{FrameSink, PushFrameStream};
use telemix::transcode::{MemoryTranscoder, TranscodeError, Transcoder};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// 5 ms frames keep the paced tests fast.
fn fast_format() -> AudioFormat {
    AudioFormat::new(CodecKind::LinearPcm, 8000, 40)
}

fn fast_params() -> SequencerParams {
    SequencerParams {
        format: fast_format(),
        queue_capacity: 64,
        close_timeout_ms: 1000,
    }
}

fn source_with_level(level: i16, frames: usize) -> Arc<MemoryTranscoder> {
    let samples = vec![level; frames * 40];
    Arc::new(MemoryTranscoder::from_pcm_samples(&samples, 8000, fast_format()))
}

struct Collector {
    frames: std::sync::Mutex<Vec<AudioFrame>>,
    notify: Notify,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: std::sync::Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn levels(&self) -> Vec<i16> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| !f.is_end_of_stream())
            .map(|f| codec::pcm_bytes_to_samples(f.data())[0])
            .collect()
    }

    fn ended(&self) -> bool {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .any(|f| f.is_end_of_stream())
    }

    async fn wait_for<F: Fn(&Collector) -> bool>(&self, pred: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if pred(self) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for channel output");
    }
}

impl FrameSink for Collector {
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

/// Transcoder that refuses to connect; replays must come from the cache.
struct NeverConnects {
    output: Arc<PushFrameStream>,
}

impl NeverConnects {
    fn new() -> Self {
        Self {
            output: Arc::new(PushFrameStream::new(fast_format())),
        }
    }
}

#[async_trait]
impl Transcoder for NeverConnects {
    fn output(&self) -> Arc<PushFrameStream> {
        self.output.clone()
    }

    async fn connect(&self) -> Result<(), TranscodeError> {
        Err(TranscodeError::DecodeFailed(
            "transcoder should not be reached on a cache hit".into(),
        ))
    }

    async fn start(&self) -> Result<(), TranscodeError> {
        Err(TranscodeError::NotConnected)
    }
}

#[tokio::test]
async fn test_one_shot_through_sequencer_and_relay() {
    init_logging();
    // A one-shot source paced by the sequencer reaches a relayed consumer
    // in order, and closing the channel propagates the end marker.
    let sequencer =
        ChannelSequencer::new(fast_params(), Arc::new(FrameCache::new()), Arc::new(NoopEvents))
            .unwrap();
    let relay = AsyncRelay::new(
        sequencer.output().clone(),
        RelayParams::default(),
        Arc::new(NoopEvents),
    )
    .unwrap();
    let collector = Collector::new();
    relay.output().set_sink(Some(collector.clone()));

    relay.connect().await;
    sequencer.start().await;
    sequencer
        .set_source(SourceSession::one_shot(source_with_level(7, 3), None))
        .await
        .unwrap();

    collector.wait_for(|c| c.levels().len() >= 3).await;
    assert_eq!(collector.levels(), vec![7, 7, 7]);

    sequencer.close().await;
    collector.wait_for(|c| c.ended()).await;
    // The relay detaches itself once the end marker passes through.
    assert!(!relay.is_connected());
    relay.disconnect().await;
}

#[tokio::test]
async fn test_hot_swap_never_leaks_old_source() {
    init_logging();
    // After set_source, no frame from the replaced session may reach the
    // consumer once the new session's audio starts.
    let sequencer =
        ChannelSequencer::new(fast_params(), Arc::new(FrameCache::new()), Arc::new(NoopEvents))
            .unwrap();
    let relay = AsyncRelay::new(
        sequencer.output().clone(),
        RelayParams::default(),
        Arc::new(NoopEvents),
    )
    .unwrap();
    let collector = Collector::new();
    relay.output().set_sink(Some(collector.clone()));

    relay.connect().await;
    sequencer.start().await;
    sequencer
        .set_source(SourceSession::one_shot(source_with_level(10, 40), None))
        .await
        .unwrap();
    collector.wait_for(|c| !c.levels().is_empty()).await;

    sequencer
        .set_source(SourceSession::one_shot(source_with_level(20, 5), None))
        .await
        .unwrap();
    collector
        .wait_for(|c| c.levels().iter().filter(|&&l| l == 20).count() >= 5)
        .await;

    let levels = collector.levels();
    let first_new = levels.iter().position(|&l| l == 20).unwrap();
    assert!(
        levels[first_new..].iter().all(|&l| l == 20),
        "old-session frame delivered after swap: {levels:?}"
    );

    sequencer.close().await;
    relay.disconnect().await;
}

#[tokio::test]
async fn test_playlist_plays_items_back_to_back() {
    init_logging();
    // Playlist items arrive in order with no frame from a later item
    // preceding an earlier one.
    let sequencer =
        ChannelSequencer::new(fast_params(), Arc::new(FrameCache::new()), Arc::new(NoopEvents))
            .unwrap();
    let collector = Collector::new();
    sequencer.output().set_sink(Some(collector.clone()));

    sequencer.start().await;
    let items = vec![
        PlaylistItem::new(source_with_level(1, 3)),
        PlaylistItem::new(source_with_level(2, 3)),
    ];
    sequencer
        .set_source(SourceSession::playlist(items, 0).unwrap())
        .await
        .unwrap();

    collector.wait_for(|c| c.levels().len() >= 6).await;
    assert_eq!(collector.levels(), vec![1, 1, 1, 2, 2, 2]);

    sequencer.close().await;
}

#[tokio::test]
async fn test_cached_replay_matches_first_play() {
    init_logging();
    // Second play of the same keyed content is served from the cache and
    // never touches the transcoder.
    let cache = Arc::new(FrameCache::new());
    let sequencer =
        ChannelSequencer::new(fast_params(), cache.clone(), Arc::new(NoopEvents)).unwrap();
    let collector = Collector::new();
    sequencer.output().set_sink(Some(collector.clone()));
    sequencer.start().await;

    let key = CacheKey::new("sum-greeting-1", CodecKind::LinearPcm, 40);
    sequencer
        .set_source(SourceSession::one_shot(source_with_level(9, 3), Some(key.clone())))
        .await
        .unwrap();
    collector.wait_for(|c| c.levels().len() >= 3).await;
    assert_eq!(cache.stats().entries, 1);

    sequencer
        .set_source(SourceSession::one_shot(Arc::new(NeverConnects::new()), Some(key)))
        .await
        .unwrap();
    collector.wait_for(|c| c.levels().len() >= 6).await;

    assert_eq!(collector.levels(), vec![9, 9, 9, 9, 9, 9]);
    assert_eq!(cache.stats().hits, 1);

    sequencer.close().await;
}

#[tokio::test]
async fn test_live_source_carries_wall_clock_timestamps() {
    init_logging();
    // Live sessions rewrite frame timestamps to receipt time.
    let sequencer =
        ChannelSequencer::new(fast_params(), Arc::new(FrameCache::new()), Arc::new(NoopEvents))
            .unwrap();
    let collector = Collector::new();
    sequencer.output().set_sink(Some(collector.clone()));
    sequencer.start().await;

    sequencer
        .set_source(SourceSession::live(source_with_level(4, 2)))
        .await
        .unwrap();
    collector.wait_for(|c| !c.levels().is_empty()).await;

    let frames = collector.frames.lock().unwrap();
    let pts = frames[0].pts().unwrap();
    drop(frames);
    // Wall-clock nanoseconds, well past 2020-01-01.
    assert!(pts > 1_577_836_800_000_000_000);

    sequencer.close().await;
}

#[tokio::test]
async fn test_channel_params_parse_from_json_config() {
    init_logging();
    // Channel settings arrive as one JSON document from the call-control
    // layer; both param structs deserialize and validate from it.
    let config: serde_json::Value = serde_json::from_str(
        r#"{
            "sequencer": {
                "format": { "codec": "LinearPcm", "sample_rate": 8000, "frame_size": 40 },
                "queue_capacity": 32,
                "close_timeout_ms": 1000
            },
            "relay": { "queue_capacity": 16, "poll_timeout_ms": 5 }
        }"#,
    )
    .unwrap();
    let seq_params: SequencerParams = serde_json::from_value(config["sequencer"].clone()).unwrap();
    let relay_params: RelayParams = serde_json::from_value(config["relay"].clone()).unwrap();
    seq_params.validate().unwrap();
    relay_params.validate().unwrap();

    let sequencer =
        ChannelSequencer::new(seq_params, Arc::new(FrameCache::new()), Arc::new(NoopEvents))
            .unwrap();
    let relay = AsyncRelay::new(sequencer.output().clone(), relay_params, Arc::new(NoopEvents))
        .unwrap();
    let collector = Collector::new();
    relay.output().set_sink(Some(collector.clone()));
    relay.connect().await;
    sequencer.start().await;

    sequencer
        .set_source(SourceSession::one_shot(source_with_level(3, 2), None))
        .await
        .unwrap();
    collector.wait_for(|c| c.levels().len() >= 2).await;
    assert_eq!(collector.levels(), vec![3, 3]);

    sequencer.close().await;
    relay.disconnect().await;
}
