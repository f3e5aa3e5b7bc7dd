// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Common re-exports for convenient use of the telemix crate.
//!
//! ```
//! use telemix::prelude::*;
//! ```

pub use std::sync::Arc;

pub use crate::buffers::{AsyncRelay, BoundedFrameQueue, OfferOutcome, RelayParams, RelayStats};
pub use crate::cache::{CacheKey, CacheStats, FrameCache};
pub use crate::events::{ChannelEvents, NoopEvents};
pub use crate::frames::{AudioFormat, AudioFrame, CodecKind};
pub use crate::mixer::{MixTap, MixerParams, MixerStats, RealtimeMixer};
pub use crate::sequencer::{ChannelSequencer, SequencerParams, SequencerStats};
pub use crate::sources::{PlaylistItem, SessionState, SourceSession};
pub use crate::streams::{FrameSink, PushFrameStream};
pub use crate::transcode::{
    ContainerParser, LinearDecoder, MemoryTranscoder, MulawDecoder, PcmDecoder, Transcoder,
    WavParser,
};
