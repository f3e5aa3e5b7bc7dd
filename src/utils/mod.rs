//! Small shared utilities.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global monotonically-increasing object ID counter.
static OBJECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a globally unique object identifier.
///
/// Used to correlate frames, streams, sessions, and taps in logs. Each call
/// returns a value one greater than the previous call, starting from 0.
pub fn obj_id() -> u64 {
    OBJECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
///
/// Returns 0 if the system clock reads before the epoch.
pub fn unix_now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
