// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Rendered-frame cache keyed by source identity.
//!
//! Rendering a source (decode, resample, re-encode, packetize) is the
//! expensive part of starting playback; [`FrameCache`] lets a channel replay
//! a source it has rendered before. Entries are shared as `Arc<Vec<_>>` so a
//! hit costs one clone per frame at enqueue time, never a re-render.
//!
//! Lookups are validated against the caller-supplied content checksum: if a
//! source was re-uploaded under the same id with different bytes, the stale
//! entry is evicted and the lookup reported as a miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::frames::{AudioFrame, CodecKind};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Lookup key for rendered frames.
///
/// Identity is the logical source (`source_id` when the caller has one,
/// otherwise the checksum itself) plus the render parameters that change the
/// output: target codec, frame size, and tail trim. The checksum is carried
/// separately and used for validation, not identity, so a re-uploaded source
/// invalidates its old entry instead of living alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Stable caller-side id of the source, e.g. a file path or asset id.
    pub source_id: Option<String>,
    /// Content checksum of the source bytes, supplied by the caller.
    pub checksum: String,
    /// Codec the frames were rendered to.
    pub codec: CodecKind,
    /// Samples per rendered frame.
    pub frame_size: usize,
    /// Tail trim applied during rendering, if any.
    pub trim_ms: Option<u64>,
}

impl CacheKey {
    pub fn new(checksum: impl Into<String>, codec: CodecKind, frame_size: usize) -> Self {
        Self {
            source_id: None,
            checksum: checksum.into(),
            codec,
            frame_size,
            trim_ms: None,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_trim_ms(mut self, trim_ms: u64) -> Self {
        self.trim_ms = Some(trim_ms);
        self
    }
}

/// Map key: logical identity without the validation checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IdentityKey {
    source: String,
    codec: CodecKind,
    frame_size: usize,
    trim_ms: Option<u64>,
}

impl IdentityKey {
    fn of(key: &CacheKey) -> Self {
        Self {
            source: key
                .source_id
                .clone()
                .unwrap_or_else(|| key.checksum.clone()),
            codec: key.codec,
            frame_size: key.frame_size,
            trim_ms: key.trim_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// FrameCache
// ---------------------------------------------------------------------------

/// Counter snapshot for a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry {
    checksum: String,
    frames: Arc<Vec<AudioFrame>>,
}

/// Shared cache of rendered frame sequences.
#[derive(Default)]
pub struct FrameCache {
    entries: Mutex<HashMap<IdentityKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up rendered frames, validating the checksum. A mismatch evicts
    /// the stale entry and counts as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<AudioFrame>>> {
        let identity = IdentityKey::of(key);
        let mut entries = self.entries.lock().expect("frame cache lock poisoned");
        match entries.get(&identity) {
            Some(entry) if entry.checksum == key.checksum => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.frames.clone())
            }
            Some(entry) => {
                tracing::warn!(
                    source = %identity.source,
                    cached = %entry.checksum,
                    requested = %key.checksum,
                    "FrameCache: checksum mismatch, evicting stale entry"
                );
                entries.remove(&identity);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store rendered frames, replacing any previous entry for the same
    /// identity. Returns the shared handle for immediate use.
    pub fn put(&self, key: &CacheKey, frames: Vec<AudioFrame>) -> Arc<Vec<AudioFrame>> {
        let frames = Arc::new(frames);
        let entry = CacheEntry {
            checksum: key.checksum.clone(),
            frames: frames.clone(),
        };
        self.entries
            .lock()
            .expect("frame cache lock poisoned")
            .insert(IdentityKey::of(key), entry);
        frames
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("frame cache lock poisoned")
            .clear();
    }

    /// Number of cached sequences.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("frame cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl std::fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("FrameCache")
            .field("entries", &stats.entries)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}
