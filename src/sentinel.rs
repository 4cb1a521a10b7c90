// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pseudo-symbol detection for the process entry points.
//!
//! Resolved once, at image-tracking activation, by locating the `start`
//! and `thread_start` symbols and scanning forward until the address
//! resolves to a different symbol (or the cap is hit). `step` consults
//! these ranges before trying any engine: a frame inside either range is a
//! clean end-of-stack, not a frame to unwind further.

use portable_atomic::{AtomicU64, Ordering};

const START_SCAN_CAP: u64 = 512;
const THREAD_START_SCAN_CAP: u64 = 256;

struct SentinelRange {
    start: AtomicU64,
    end: AtomicU64,
}

impl SentinelRange {
    const fn unset() -> Self {
        SentinelRange {
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
        }
    }

    fn set(&self, start: u64, end: u64) {
        self.start.store(start, Ordering::Release);
        self.end.store(end, Ordering::Release);
    }

    fn contains(&self, addr: u64) -> bool {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        start != 0 && addr >= start && addr < end
    }
}

static START_RANGE: SentinelRange = SentinelRange::unset();
static THREAD_START_RANGE: SentinelRange = SentinelRange::unset();

/// Given the resolved start address of a symbol and a function that reports
/// the address of the *next* symbol boundary at or after a given address
/// (however the caller's symbolication works), computes the scan-capped
/// range for that pseudo-symbol.
fn scan_range(symbol_start: u64, next_symbol_start: Option<u64>, cap: u64) -> (u64, u64) {
    let bound = next_symbol_start.unwrap_or(u64::MAX);
    let end = bound.min(symbol_start.saturating_add(cap));
    (symbol_start, end)
}

/// Called once during `set_image_tracking(true)`: records the resolved
/// `start` pseudo-symbol range, capped at 512 bytes.
pub fn set_start_symbol(symbol_start: u64, next_symbol_start: Option<u64>) {
    let (start, end) = scan_range(symbol_start, next_symbol_start, START_SCAN_CAP);
    START_RANGE.set(start, end);
}

/// Called once during `set_image_tracking(true)`: records the resolved
/// `thread_start` pseudo-symbol range, capped at 256 bytes.
pub fn set_thread_start_symbol(symbol_start: u64, next_symbol_start: Option<u64>) {
    let (start, end) = scan_range(symbol_start, next_symbol_start, THREAD_START_SCAN_CAP);
    THREAD_START_RANGE.set(start, end);
}

/// Async-safe: true if `rip` falls inside either resolved sentinel range.
pub fn is_sentinel(rip: u64) -> bool {
    START_RANGE.contains(rip) || THREAD_START_RANGE.contains(rip)
}

/// `START_RANGE`/`THREAD_START_RANGE` are process-wide statics; any test
/// (in this module or elsewhere, e.g. `step.rs`, `image_tracking.rs`) that
/// calls `set_start_symbol`/`set_thread_start_symbol` must hold this lock
/// for the duration of the test, matching the pattern the originating crash
/// handler uses for its own environment-variable tests
/// (`crash_info/errors_intake.rs`'s `ENV_TEST_LOCK`) to keep the default
/// harness's concurrent test threads from racing on the same statics.
#[cfg(test)]
pub(crate) static SENTINEL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_range_caps_at_next_symbol_or_byte_cap() {
        assert_eq!(scan_range(0x1000, Some(0x1010), 512), (0x1000, 0x1010));
        assert_eq!(scan_range(0x1000, Some(0x2000), 512), (0x1000, 0x1200));
        assert_eq!(scan_range(0x1000, None, 512), (0x1000, 0x1200));
    }

    #[test]
    fn is_sentinel_reflects_last_set_range() {
        let _lock = SENTINEL_TEST_LOCK.lock().unwrap();
        set_start_symbol(0x4000, Some(0x4040));
        assert!(is_sentinel(0x4000));
        assert!(is_sentinel(0x403f));
        assert!(!is_sentinel(0x4040));
        assert!(!is_sentinel(0x3fff));
    }
}
