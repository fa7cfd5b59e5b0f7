#![forbid(unsafe_code)]
//! Shared numeric helpers for remapfs.
//!
//! Block numbers, byte offsets and lengths are plain `u64` throughout the
//! workspace; this crate provides the checked arithmetic, alignment and
//! formatting helpers everything else leans on, plus the cooperative
//! [`CancelToken`] observed between phases and relocation batches.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NarrowError {
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, NarrowError> {
    usize::try_from(value).map_err(|_| NarrowError::IntegerConversion { field })
}

/// Widen a `usize` to `u64` (infallible on supported platforms).
#[must_use]
pub fn usize_to_u64(value: usize) -> u64 {
    value as u64
}

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Division rounding up.
#[must_use]
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    value / divisor + u64::from(value % divisor != 0)
}

/// Largest power of two dividing `value` (`u64::MAX` bit count for zero).
///
/// Used to accumulate the effective-block-size bitmask: OR-ing every extent
/// boundary together and taking the lowest set bit of the result yields the
/// largest power of two dividing all of them.
#[must_use]
pub fn lowest_set_bit(value: u64) -> u32 {
    value.trailing_zeros()
}

// ── Pretty sizes ────────────────────────────────────────────────────────────

/// Human-readable byte count: `(scaled, unit_prefix)`.
///
/// `pretty_size(1536 * 1024)` returns `(1.5, "mega")`, rendered by callers
/// as "1.50 megabytes".
#[must_use]
pub fn pretty_size(bytes: u64) -> (f64, &'static str) {
    const UNITS: [&str; 7] = ["", "kilo", "mega", "giga", "tera", "peta", "exa"];
    let mut scaled = bytes as f64;
    let mut unit = 0;
    while scaled >= 1024.0 && unit + 1 < UNITS.len() {
        scaled /= 1024.0;
        unit += 1;
    }
    (scaled, UNITS[unit])
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// Returned by [`CancelToken::checkpoint`] once the token has been cancelled.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cooperative cancellation flag.
///
/// The engine is single-threaded and synchronous; cancellation is observed
/// only at `checkpoint()` call sites (between phases and between relocation
/// batches). Clones share the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; safe from signal-handler threads.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Job-clear policy: what to remove from the job directory on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClear {
    /// Remove scratch data, keep logs (the default).
    #[default]
    Auto,
    /// Remove the whole job directory.
    All,
    /// Remove only the scratch file.
    Minimal,
    /// Keep everything.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(4096, 4096), Some(4096));
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_down(8191, 4096), Some(4096));
        assert_eq!(align_down(0, 4096), Some(0));
        assert_eq!(align_down(12345, 1), Some(12345));
        assert_eq!(align_down(u64::MAX, 4096), Some(u64::MAX - 4095));
        assert_eq!(align_down(100, 0), None);
        assert_eq!(align_down(100, 3), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(1, 4096), Some(4096));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(12345, 1), Some(12345));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_up(u64::MAX - 4095, 4096), Some(u64::MAX - 4095));
        assert_eq!(align_up(100, 0), None);
        assert_eq!(align_up(100, 6), None);
    }

    #[test]
    fn test_align_power_of_two_boundaries() {
        for shift in 0..16 {
            let alignment = 1_u64 << shift;
            assert_eq!(align_down(0, alignment), Some(0));
            assert_eq!(align_up(0, alignment), Some(0));
            assert_eq!(align_down(alignment, alignment), Some(alignment));
            assert_eq!(align_up(alignment, alignment), Some(alignment));
            if alignment > 1 {
                assert_eq!(align_down(alignment - 1, alignment), Some(0));
                assert_eq!(align_up(alignment - 1, alignment), Some(alignment));
            }
        }
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(0, 10), 0);
        assert_eq!(ceil_div(10, 10), 1);
        assert_eq!(ceil_div(11, 10), 2);
        assert_eq!(ceil_div(19, 10), 2);
        assert_eq!(ceil_div(5, 0), 0);
    }

    #[test]
    fn test_u64_to_usize() {
        assert_eq!(u64_to_usize(42, "test"), Ok(42));
        assert_eq!(u64_to_usize(0, "test"), Ok(0));
        #[cfg(target_pointer_width = "64")]
        assert!(u64_to_usize(u64::MAX, "test").is_ok());
    }

    #[test]
    fn test_pretty_size() {
        assert_eq!(pretty_size(512), (512.0, ""));
        assert_eq!(pretty_size(2048), (2.0, "kilo"));
        let (n, unit) = pretty_size(3 * 1024 * 1024 / 2);
        assert!((n - 1.5).abs() < 1e-9);
        assert_eq!(unit, "mega");
        let (_, unit) = pretty_size(u64::MAX);
        assert_eq!(unit, "exa");
    }

    #[test]
    fn cancel_token_trips_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(Cancelled));
    }
}
