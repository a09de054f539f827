// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Intra-day timetag to absolute wall-clock mapping (§4.4), grounded
//! directly on `original_source/dsm/class/SampleStreamDater.cc`'s
//! `computeTime()`: seed from a clock sample, compose
//! `floor(clock_time, day) + timetag`, and correct for a midnight rollover
//! when the composed time misses the clock by nearly a full day.

use std::time::Duration;

const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// Outcome of [`SampleDater::compute_time`] (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaterStatus {
    /// Composed time agrees with the clock within `max_clock_diff`.
    Ok,
    /// A clock sample has been seen but the composed time is implausible
    /// even after the rollover correction.
    OutOfSpec,
    /// No clock sample has been seen yet; `time` is the raw timetag,
    /// best-effort only.
    NoClock,
}

/// Single-threaded per-DSM time assignment: mutated only by the DSM's own
/// sensor read loop (§4.4 contract — no internal locking).
pub struct SampleDater {
    /// Start-of-day (µs since epoch) of the last accepted clock sample.
    day_start: Option<i64>,
    /// µs-since-epoch of the last clock sample.
    clock_time: Option<i64>,
    max_clock_diff_micros: i64,
    rollover_window_micros: i64,
}

impl SampleDater {
    pub fn new(max_clock_diff: Duration, rollover_window: Duration) -> Self {
        Self {
            day_start: None,
            clock_time: None,
            max_clock_diff_micros: max_clock_diff.as_micros() as i64,
            rollover_window_micros: rollover_window.as_micros() as i64,
        }
    }

    pub fn from_config(cfg: &crate::config::RuntimeConfig) -> Self {
        Self::new(cfg.dater_max_clock_diff, cfg.dater_rollover_window)
    }

    /// Seeds or re-seeds the dater from a distinguished clock sample
    /// carrying absolute time, µs since epoch.
    pub fn set_clock_sample(&mut self, clock_time_micros: i64) {
        self.clock_time = Some(clock_time_micros);
        self.day_start = Some(clock_time_micros - clock_time_micros.rem_euclid(MICROS_PER_DAY));
    }

    pub fn has_clock(&self) -> bool {
        self.clock_time.is_some()
    }

    /// Composes `timetag_micros` (µs since local midnight) into absolute
    /// time using the last clock sample, correcting for a single midnight
    /// rollover when needed.
    pub fn compute_time(&mut self, timetag_micros: i64) -> (i64, DaterStatus) {
        let (Some(day_start), Some(clock_time)) = (self.day_start, self.clock_time) else {
            return (timetag_micros, DaterStatus::NoClock);
        };

        let composed = day_start + timetag_micros;
        let diff = composed - clock_time;
        if diff.abs() <= self.max_clock_diff_micros {
            return (composed, DaterStatus::Ok);
        }

        // Nearly a full day off in the opposite direction: the timetag
        // belongs to the day before or after the one the clock sample
        // anchored. Apply the correction and recheck once.
        if (MICROS_PER_DAY - diff.abs()).abs() <= self.rollover_window_micros {
            let corrected_day_start = if diff > 0 {
                day_start - MICROS_PER_DAY
            } else {
                day_start + MICROS_PER_DAY
            };
            let recomposed = corrected_day_start + timetag_micros;
            if (recomposed - clock_time).abs() <= self.max_clock_diff_micros {
                self.day_start = Some(corrected_day_start);
                return (recomposed, DaterStatus::Ok);
            }
        }

        (composed, DaterStatus::OutOfSpec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dater() -> SampleDater {
        SampleDater::new(Duration::from_secs(180), Duration::from_secs(86_400 - 180))
    }

    #[test]
    fn no_clock_seen_yet_returns_raw_timetag() {
        let mut d = dater();
        let (time, status) = d.compute_time(12_345);
        assert_eq!(time, 12_345);
        assert_eq!(status, DaterStatus::NoClock);
    }

    #[test]
    fn plausible_timetag_composes_ok() {
        let mut d = dater();
        let midnight = 1_700_000_000_000_000i64 - 1_700_000_000_000_000i64 % MICROS_PER_DAY;
        d.set_clock_sample(midnight + 3_600_000_000); // 1h into the day
        let (time, status) = d.compute_time(3_600_500_000); // 0.5s later in timetag space
        assert_eq!(status, DaterStatus::Ok);
        assert_eq!(time, midnight + 3_600_500_000);
    }

    #[test]
    fn rollover_forward_is_corrected() {
        let mut d = dater();
        let midnight = 0i64;
        // Clock sample arrives just before local midnight.
        d.set_clock_sample(midnight - 30_000_000); // 30s before midnight (prev day)
        // A sensor's timetag for just after midnight (new day) arrives.
        let (time, status) = d.compute_time(10_000_000); // 10s after midnight
        assert_eq!(status, DaterStatus::Ok);
        assert_eq!(time, midnight + 10_000_000);
    }

    #[test]
    fn implausible_timetag_is_out_of_spec() {
        let mut d = dater();
        d.set_clock_sample(1_000_000_000);
        let (_, status) = d.compute_time(1_000_000_000 + MICROS_PER_DAY / 2);
        assert_eq!(status, DaterStatus::OutOfSpec);
    }
}
