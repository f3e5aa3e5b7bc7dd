// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! N-way realtime audio mixing for conference and line-mix scenarios.
//!
//! A [`RealtimeMixer`] owns a collection of [`MixTap`]s, one per
//! participant, and runs a fixed-cadence tick. Each tick sums every tap's
//! buffered PCM contribution into a shared accumulator, then delivers to
//! each tap the accumulator minus that tap's own contribution, so nobody
//! hears their own echo. Samples are summed as `i32` and clamped back to
//! the `i16` range after gain is applied, with the configured gain capped
//! at `max_gain`.

pub mod tap;

pub use tap::MixTap;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::codec;
use crate::frames::{AudioFormat, AudioFrame, CodecKind};
use crate::transcode::PcmDecoder;
use crate::utils::obj_id;

// ---------------------------------------------------------------------------
// Params and errors
// ---------------------------------------------------------------------------

/// Configuration for a [`RealtimeMixer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerParams {
    /// Sample rate of the mix, in Hz.
    pub sample_rate: u32,
    /// Samples per tick and per delivered frame.
    pub frame_size: usize,
    /// Gain applied to each personalized mix.
    pub gain: f32,
    /// Upper bound on the applied gain.
    pub max_gain: f32,
    /// Absolute sample amplitude a contribution must exceed to count as
    /// audible in the contributing-taps statistic.
    pub noise_floor: u16,
    /// Bound on waiting for the tick task to exit during stop.
    pub close_timeout_ms: u64,
}

impl Default for MixerParams {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            frame_size: 160,
            gain: 1.0,
            max_gain: 1.0,
            noise_floor: 0,
            close_timeout_ms: 5000,
        }
    }
}

impl MixerParams {
    pub fn validate(&self) -> Result<(), MixerError> {
        if self.sample_rate == 0 {
            return Err(MixerError::InvalidConfig(
                "sample rate must be greater than zero",
            ));
        }
        if self.frame_size == 0 {
            return Err(MixerError::InvalidConfig(
                "frame size must be greater than zero",
            ));
        }
        if !self.gain.is_finite() || self.gain <= 0.0 {
            return Err(MixerError::InvalidConfig("gain must be finite and positive"));
        }
        if !self.max_gain.is_finite() || self.max_gain <= 0.0 {
            return Err(MixerError::InvalidConfig(
                "max gain must be finite and positive",
            ));
        }
        if self.close_timeout_ms == 0 {
            return Err(MixerError::InvalidConfig(
                "close timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Errors from mixer construction.
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("invalid mixer configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Counter snapshot for a mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerStats {
    /// Ticks executed.
    pub ticks: u64,
    /// Taps currently attached.
    pub taps: usize,
    /// Taps that contributed audible samples on the most recent tick.
    pub contributing_last_tick: usize,
}

// ---------------------------------------------------------------------------
// RealtimeMixer
// ---------------------------------------------------------------------------

struct TickHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-cadence N-way mixer with per-tap echo subtraction.
pub struct RealtimeMixer {
    id: u64,
    params: MixerParams,
    format: AudioFormat,
    taps: Mutex<Vec<Arc<MixTap>>>,
    ticking: tokio::sync::Mutex<Option<TickHandle>>,
    ticks: AtomicU64,
    contributing_last: AtomicUsize,
}

impl RealtimeMixer {
    pub fn new(params: MixerParams) -> Result<Self, MixerError> {
        params.validate()?;
        let format = AudioFormat::new(CodecKind::LinearPcm, params.sample_rate, params.frame_size);
        Ok(Self {
            id: obj_id(),
            params,
            format,
            taps: Mutex::new(Vec::new()),
            ticking: tokio::sync::Mutex::new(None),
            ticks: AtomicU64::new(0),
            contributing_last: AtomicUsize::new(0),
        })
    }

    /// Unique id of this mixer, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// PCM format of the personalized mix streams.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Attach a participant. The returned tap accepts inbound frames via
    /// [`MixTap::push_input`] and exposes its personalized mix on
    /// [`MixTap::output`].
    pub fn add_tap(&self, label: impl Into<String>, decoder: Box<dyn PcmDecoder>) -> Arc<MixTap> {
        let tap = MixTap::new(label.into(), decoder, self.format);
        self.taps
            .lock()
            .expect("mixer taps lock poisoned")
            .push(tap.clone());
        tracing::debug!(
            mixer_id = self.id,
            tap_id = tap.id(),
            label = tap.label(),
            "RealtimeMixer: tap added"
        );
        tap
    }

    /// Stop and detach a participant. Idempotent; unknown taps are ignored.
    pub fn remove_tap(&self, tap: &MixTap) {
        tap.stop();
        self.taps
            .lock()
            .expect("mixer taps lock poisoned")
            .retain(|t| t.id() != tap.id());
        tracing::debug!(
            mixer_id = self.id,
            tap_id = tap.id(),
            label = tap.label(),
            "RealtimeMixer: tap removed"
        );
    }

    /// Execute one mix cycle.
    ///
    /// Pass one consumes every tap's pending contribution into a shared
    /// `i32` accumulator. Pass two delivers `accumulator - own` to each
    /// tap, scaled by the capped gain and clamped to the `i16` range. Taps
    /// without a contribution this tick still receive the mix; stopped taps
    /// are swept from the collection.
    pub fn tick(&self) {
        let taps: Vec<Arc<MixTap>> = {
            let mut guard = self.taps.lock().expect("mixer taps lock poisoned");
            guard.retain(|t| !t.is_stopped());
            guard.clone()
        };

        let frame_size = self.params.frame_size;
        let mut accumulator = vec![0i32; frame_size];
        let mut contributions: Vec<Option<Vec<i16>>> = Vec::with_capacity(taps.len());
        let mut contributing = 0usize;
        for tap in &taps {
            let contribution = tap.take_contribution();
            if let Some(samples) = &contribution {
                let window = &samples[..samples.len().min(frame_size)];
                if window
                    .iter()
                    .any(|s| s.unsigned_abs() > self.params.noise_floor)
                {
                    contributing += 1;
                }
                for (slot, sample) in accumulator.iter_mut().zip(window) {
                    *slot += i32::from(*sample);
                }
            }
            contributions.push(contribution);
        }
        self.contributing_last.store(contributing, Ordering::Relaxed);

        let gain = self.params.gain.min(self.params.max_gain);
        let tick_index = self.ticks.fetch_add(1, Ordering::Relaxed);
        let pts = tick_index * self.format.frame_duration().as_nanos() as u64;

        for (tap, own) in taps.iter().zip(&contributions) {
            let mut samples = vec![0i16; frame_size];
            for (i, slot) in samples.iter_mut().enumerate() {
                let mut value = accumulator[i];
                if let Some(own) = own {
                    if i < own.len() {
                        value -= i32::from(own[i]);
                    }
                }
                let scaled = (value as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32);
                *slot = scaled as i16;
            }
            let frame =
                AudioFrame::new(codec::samples_to_pcm_bytes(&samples), self.format).with_pts(pts);
            tap.deliver(frame);
        }
    }

    /// Start the tick task running [`RealtimeMixer::tick`] once per frame
    /// period.
    pub async fn start(self: &Arc<Self>) {
        let mut ticking = self.ticking.lock().await;
        if ticking.is_some() {
            tracing::warn!(
                mixer_id = self.id,
                "RealtimeMixer: start called while already running"
            );
            return;
        }

        let cancel = CancellationToken::new();
        let handle = {
            let mixer = self.clone();
            let cancel = cancel.clone();
            let period = self.format.frame_duration();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => mixer.tick(),
                    }
                }
            })
        };
        *ticking = Some(TickHandle { cancel, handle });
        tracing::debug!(
            mixer_id = self.id,
            period_ms = self.format.frame_duration_ms(),
            "RealtimeMixer: tick task started"
        );
    }

    /// Stop the tick task and every attached tap. Idempotent; the wait for
    /// the tick task is bounded.
    pub async fn stop(&self) {
        if let Some(TickHandle { cancel, handle }) = self.ticking.lock().await.take() {
            cancel.cancel();
            let abort_handle = handle.abort_handle();
            let timeout = Duration::from_millis(self.params.close_timeout_ms);
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(mixer_id = self.id, "RealtimeMixer: tick task panicked: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        mixer_id = self.id,
                        "RealtimeMixer: tick task did not stop in time, aborting"
                    );
                    abort_handle.abort();
                }
            }
        }

        let taps: Vec<Arc<MixTap>> = {
            let mut guard = self.taps.lock().expect("mixer taps lock poisoned");
            guard.drain(..).collect()
        };
        for tap in &taps {
            tap.stop();
        }
        if !taps.is_empty() {
            tracing::debug!(
                mixer_id = self.id,
                taps = taps.len(),
                "RealtimeMixer: stopped remaining taps"
            );
        }
    }

    /// Snapshot of the mixer counters.
    pub fn stats(&self) -> MixerStats {
        MixerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            taps: self.taps.lock().expect("mixer taps lock poisoned").len(),
            contributing_last_tick: self.contributing_last.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RealtimeMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeMixer")
            .field("id", &self.id)
            .field("taps", &self.stats().taps)
            .field("ticks", &self.stats().ticks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{FrameSink, PushFrameStream};
    use crate::transcode::LinearDecoder;
    use tokio::sync::Notify;

    fn mixer_with(params: MixerParams) -> RealtimeMixer {
        RealtimeMixer::new(params).unwrap()
    }

    fn mixer() -> RealtimeMixer {
        mixer_with(MixerParams::default())
    }

    fn pcm_frame(level: i16, format: AudioFormat) -> AudioFrame {
        AudioFrame::new(
            codec::samples_to_pcm_bytes(&vec![level; format.frame_size]),
            format,
        )
    }

    fn read_level(tap: &MixTap) -> i16 {
        let mut out = AudioFrame::new(Vec::new(), tap.output().format());
        tap.output().read(&mut out);
        assert!(!out.is_discard(), "no mix delivered to tap");
        codec::pcm_bytes_to_samples(out.data())[0]
    }

    #[test]
    fn test_rejects_invalid_config() {
        let params = MixerParams {
            frame_size: 0,
            ..MixerParams::default()
        };
        assert!(matches!(
            RealtimeMixer::new(params),
            Err(MixerError::InvalidConfig(_))
        ));

        let params = MixerParams {
            gain: f32::NAN,
            ..MixerParams::default()
        };
        assert!(matches!(
            RealtimeMixer::new(params),
            Err(MixerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tick_subtracts_own_voice() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));
        let c = mixer.add_tap("c", Box::new(LinearDecoder));

        a.push_input(&pcm_frame(10, mixer.format()));
        b.push_input(&pcm_frame(20, mixer.format()));
        c.push_input(&pcm_frame(30, mixer.format()));
        mixer.tick();

        assert_eq!(read_level(&a), 50);
        assert_eq!(read_level(&b), 40);
        assert_eq!(read_level(&c), 30);
        let stats = mixer.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.contributing_last_tick, 3);
    }

    #[test]
    fn test_silent_tick_still_delivers() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        mixer.tick();

        assert_eq!(read_level(&a), 0);
        assert_eq!(mixer.stats().contributing_last_tick, 0);
    }

    #[test]
    fn test_muted_tap_receives_mix_without_contributing() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));

        a.mute();
        a.push_input(&pcm_frame(10, mixer.format()));
        b.push_input(&pcm_frame(20, mixer.format()));
        mixer.tick();

        assert_eq!(read_level(&a), 20);
        assert_eq!(read_level(&b), 0);
        assert_eq!(mixer.stats().contributing_last_tick, 1);
    }

    #[test]
    fn test_noise_floor_gates_contributing_count_only() {
        let mixer = mixer_with(MixerParams {
            noise_floor: 5,
            ..MixerParams::default()
        });
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));

        a.push_input(&pcm_frame(3, mixer.format()));
        b.push_input(&pcm_frame(10, mixer.format()));
        mixer.tick();

        // Below-floor audio still mixes; only the statistic is gated.
        assert_eq!(read_level(&a), 10);
        assert_eq!(read_level(&b), 3);
        assert_eq!(mixer.stats().contributing_last_tick, 1);
    }

    #[test]
    fn test_gain_capped_at_max_gain() {
        let mixer = mixer_with(MixerParams {
            gain: 4.0,
            max_gain: 2.0,
            ..MixerParams::default()
        });
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));

        b.push_input(&pcm_frame(100, mixer.format()));
        mixer.tick();

        assert_eq!(read_level(&a), 200);
        assert_eq!(read_level(&b), 0);
    }

    #[test]
    fn test_accumulator_clamps_to_sample_range() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));
        let c = mixer.add_tap("c", Box::new(LinearDecoder));

        a.push_input(&pcm_frame(30000, mixer.format()));
        b.push_input(&pcm_frame(30000, mixer.format()));
        mixer.tick();

        assert_eq!(read_level(&c), i16::MAX);
    }

    #[test]
    fn test_stopped_tap_is_swept() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let b = mixer.add_tap("b", Box::new(LinearDecoder));

        a.stop();
        b.push_input(&pcm_frame(20, mixer.format()));
        mixer.tick();

        assert!(a.output().is_ended());
        assert_eq!(read_level(&b), 0);
        assert_eq!(mixer.stats().taps, 1);
    }

    #[test]
    fn test_tick_pts_follows_frame_clock() {
        let mixer = mixer();
        let a = mixer.add_tap("a", Box::new(LinearDecoder));

        mixer.tick();
        let mut out = AudioFrame::new(Vec::new(), mixer.format());
        a.output().read(&mut out);
        assert_eq!(out.pts(), Some(0));

        mixer.tick();
        a.output().read(&mut out);
        // 160 samples at 8 kHz is a 20 ms tick.
        assert_eq!(out.pts(), Some(20_000_000));
    }

    struct CountingSink {
        frames: std::sync::Mutex<usize>,
        notify: Notify,
    }

    impl FrameSink for CountingSink {
        fn frame_available(&self, stream: &PushFrameStream) {
            let mut out = AudioFrame::new(Vec::new(), stream.format());
            stream.read(&mut out);
            if out.is_discard() {
                return;
            }
            *self.frames.lock().unwrap() += 1;
            self.notify.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_tick_task_runs_on_interval() {
        let mixer = Arc::new(mixer_with(MixerParams {
            frame_size: 40,
            ..MixerParams::default()
        }));
        let a = mixer.add_tap("a", Box::new(LinearDecoder));
        let sink = Arc::new(CountingSink {
            frames: std::sync::Mutex::new(0),
            notify: Notify::new(),
        });
        a.output().set_sink(Some(sink.clone()));

        mixer.start().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = sink.notify.notified();
                if *sink.frames.lock().unwrap() >= 3 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("tick task produced no frames");

        mixer.stop().await;
        assert!(a.output().is_ended());
        assert_eq!(mixer.stats().taps, 0);

        // Stop is idempotent.
        mixer.stop().await;
    }
}
