// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Frame buffering between producers and consumers.

pub mod queue;
pub mod relay;

pub use queue::{BoundedFrameQueue, OfferOutcome};
pub use relay::{AsyncRelay, RelayError, RelayParams, RelayStats};
