// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Audio utilities: G.711 codec, PCM packing, resampling.

pub mod codec;
