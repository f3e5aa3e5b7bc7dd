// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Telemix - Real-time audio sourcing, buffering, and mixing for telephony.
//!
//! Telemix provides the media-side building blocks of a telephony endpoint:
//! push-model frame streams, lossy bounded buffering between producer and
//! consumer clocks, hot-swappable audio sources with transparent caching of
//! transcoded content, paced per-channel sequencing, and N-way conference
//! mixing with per-participant echo subtraction.

pub mod audio;
pub mod buffers;
pub mod cache;
pub mod events;
pub mod frames;
pub mod mixer;
pub mod prelude;
pub mod sequencer;
pub mod sources;
pub mod streams;
pub mod transcode;
pub mod utils;
