// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Channel lifecycle event callbacks.
//!
//! Collaborators implement [`ChannelEvents`] to observe session lifecycle and
//! backpressure without being wired into the data path. Callbacks fire from
//! pipeline internals (including the synchronous frame path), so they must
//! return quickly and never block.

use std::sync::Arc;

use crate::sources::SessionError;

/// Observer hooks for channel-level events. All methods default to no-ops so
/// implementations only override what they care about.
pub trait ChannelEvents: Send + Sync {
    /// A source session was created and started.
    fn session_created(&self, _session_id: u64) {}

    /// A source session failed before producing any audio.
    fn session_creation_error(&self, _session_id: u64, _error: &SessionError) {}

    /// A frame was dropped because a relay queue was full; `dropped_total` is
    /// the running drop count for that queue.
    fn buffer_queue_full(&self, _dropped_total: u64) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ChannelEvents for NoopEvents {}

/// Convenience for components that take an optional events sink.
pub fn noop_events() -> Arc<dyn ChannelEvents> {
    Arc::new(NoopEvents)
}
