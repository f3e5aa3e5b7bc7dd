// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Lossy bounded frame queue with generation tagging.
//!
//! [`BoundedFrameQueue`] decouples a synchronous producer from an async
//! consumer. [`BoundedFrameQueue::offer`] never blocks: when the queue is at
//! capacity the frame is rejected and the caller decides what to log or
//! count. Generations support hot-swapping producers: a swap advances the
//! generation and clears the queue in one step, and producers tagging their
//! offers with a stale generation are rejected before they can interleave
//! old audio with new.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::frames::AudioFrame;

/// Result of a generation-tagged offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Frame accepted.
    Queued,
    /// Queue at capacity, frame rejected.
    Full,
    /// Producer's generation is no longer current, frame rejected.
    Stale,
}

#[derive(Debug)]
struct QueueInner {
    frames: VecDeque<AudioFrame>,
    generation: u64,
}

/// Bounded FIFO of audio frames for a single async consumer.
#[derive(Debug)]
pub struct BoundedFrameQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl BoundedFrameQueue {
    /// Create a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                generation: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Offer a frame under the current generation. Returns `false` if the
    /// queue is full; never blocks.
    pub fn offer(&self, frame: AudioFrame) -> bool {
        let generation = self.generation();
        self.offer_at(generation, frame) == OfferOutcome::Queued
    }

    /// Offer a frame tagged with the generation the producer was started
    /// under. Stale offers are rejected so a swapped-out producer can detect
    /// that it should stop.
    pub fn offer_at(&self, generation: u64, frame: AudioFrame) -> OfferOutcome {
        {
            let mut inner = self.inner.lock().expect("frame queue lock poisoned");
            if generation != inner.generation {
                return OfferOutcome::Stale;
            }
            if inner.frames.len() >= self.capacity {
                return OfferOutcome::Full;
            }
            inner.frames.push_back(frame);
        }
        self.notify.notify_one();
        OfferOutcome::Queued
    }

    /// Pop the oldest frame without waiting.
    pub fn try_poll(&self) -> Option<AudioFrame> {
        self.inner
            .lock()
            .expect("frame queue lock poisoned")
            .frames
            .pop_front()
    }

    /// Wait for the next frame. Single-consumer: with multiple concurrent
    /// callers, wakeups may go to a caller that loses the race.
    pub async fn recv(&self) -> AudioFrame {
        loop {
            // Register for notification before checking so an offer landing
            // in between cannot be missed.
            let notified = self.notify.notified();
            if let Some(frame) = self.try_poll() {
                return frame;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for the next frame.
    pub async fn poll(&self, timeout: Duration) -> Option<AudioFrame> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Advance to a new generation, clearing any queued frames. Returns the
    /// new generation and how many frames were discarded.
    pub fn advance_generation(&self) -> (u64, usize) {
        let mut inner = self.inner.lock().expect("frame queue lock poisoned");
        inner.generation += 1;
        let cleared = inner.frames.len();
        inner.frames.clear();
        (inner.generation, cleared)
    }

    /// Discard all queued frames without changing the generation. Returns how
    /// many frames were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().expect("frame queue lock poisoned");
        let cleared = inner.frames.len();
        inner.frames.clear();
        cleared
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.inner
            .lock()
            .expect("frame queue lock poisoned")
            .generation
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("frame queue lock poisoned")
            .frames
            .len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of frames the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
