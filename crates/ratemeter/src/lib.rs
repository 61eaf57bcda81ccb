//! Transfer speed metering.
//!
//! [`SpeedMeter`] keeps a bounded history of `(tick, bytes)` samples and
//! reports the byte rate over a trailing window, plus a lifetime total.
//! Ticks are plain millisecond counters supplied by the caller (the
//! scheduler's event loop), which keeps the meter deterministic under test.

use std::collections::VecDeque;

mod parse;

pub use parse::{parse_rate, RateParseError};

/// Default history kept by a meter, in milliseconds.
pub const DEFAULT_HISTORY_MS: u64 = 10_000;

/// Sliding-window byte/sec meter.
///
/// Samples older than the configured history are dropped on every update, so
/// memory use is bounded by the event rate within one history window.
#[derive(Clone, Debug)]
pub struct SpeedMeter {
    history_ms: u64,
    samples: VecDeque<(u64, u64)>,
    total: u64,
}

impl SpeedMeter {
    /// Creates a meter that remembers `history_ms` worth of samples.
    #[must_use]
    pub fn new(history_ms: u64) -> Self {
        Self {
            history_ms: history_ms.max(1),
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Records `bytes` transferred at `tick_ms`.
    pub fn add(&mut self, tick_ms: u64, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
        if bytes > 0 {
            self.samples.push_back((tick_ms, bytes));
        }
        self.expire(tick_ms);
    }

    /// Bytes per second over the trailing `window_ms`, evaluated at
    /// `now_ms`. A window of zero returns 0.
    #[must_use]
    pub fn speed(&self, now_ms: u64, window_ms: u64) -> u64 {
        if window_ms == 0 {
            return 0;
        }
        let cutoff = now_ms.saturating_sub(window_ms);
        let sum: u64 = self
            .samples
            .iter()
            .rev()
            .take_while(|(t, _)| *t >= cutoff)
            .map(|(_, b)| b)
            .sum();
        sum * 1000 / window_ms
    }

    /// Lifetime byte total.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    fn expire(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.history_ms);
        while matches!(self.samples.front(), Some((t, _)) if *t < cutoff) {
            self.samples.pop_front();
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_meter_reports_zero() {
        let m = SpeedMeter::default();
        assert_eq!(m.speed(1000, 1000), 0);
        assert_eq!(m.total(), 0);
    }

    #[test]
    fn speed_averages_over_window() {
        let mut m = SpeedMeter::default();
        m.add(0, 500);
        m.add(500, 500);
        // 1000 bytes in the last second
        assert_eq!(m.speed(1000, 1000), 1000);
        // same bytes over a 2-second window halve the rate
        assert_eq!(m.speed(1000, 2000), 500);
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let mut m = SpeedMeter::default();
        m.add(0, 1000);
        m.add(5000, 200);
        assert_eq!(m.speed(5000, 1000), 200);
    }

    #[test]
    fn total_survives_expiry() {
        let mut m = SpeedMeter::new(100);
        m.add(0, 700);
        m.add(10_000, 300);
        assert_eq!(m.total(), 1000);
        assert_eq!(m.speed(10_000, 100), 3000);
    }

    #[test]
    fn zero_window_is_zero() {
        let mut m = SpeedMeter::default();
        m.add(0, 100);
        assert_eq!(m.speed(0, 0), 0);
    }

    #[test]
    fn total_saturates() {
        let mut m = SpeedMeter::default();
        m.add(0, u64::MAX);
        m.add(1, u64::MAX);
        assert_eq!(m.total(), u64::MAX);
    }
}
