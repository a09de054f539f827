// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Single source of truth for wire-format constants and per-process runtime
//! knobs, the way `hdds::config` centralizes RTPS port numbers and QoS
//! defaults. XML configuration is out of scope (see spec Non-goals), so
//! there is no file loader here — just a typed struct instead of constants
//! scattered across modules.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Magic word that opens every on-wire frame (§6).
pub const FRAME_MAGIC: u32 = 0x5A5A_5A5A;

/// Byte that terminates a stream header's key/value text block (§6).
pub const HEADER_SENTINEL: u8 = 0x04;

/// Multicast group used for McSocket rendezvous (§6).
pub const RENDEZVOUS_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 10);

/// Multicast port used for McSocket rendezvous (§6).
pub const RENDEZVOUS_PORT: u16 = 50000;

/// Default maximum payload, in bytes, for the small Sample variant (§3).
pub const MAX_SMALL_PAYLOAD_BYTES: usize = 64 * 1024;

/// Default `maxClockDiffMsec` for [`crate::dater::SampleDater`] (§4.4),
/// carried over unchanged from `original_source/dsm/class/SampleDater.h`.
pub const DEFAULT_MAX_CLOCK_DIFF: Duration = Duration::from_secs(180);

/// Mutable, per-process runtime configuration.
///
/// One instance is shared (by reference) across the daemon's components;
/// there is no process-wide singleton beyond the `Default` impl used by
/// tests, per the "process-wide singletons" redesign note.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Dwell time before the sorter forwards a sample downstream (§4.3).
    pub sorter_lag: Duration,
    /// Wall-clock memory budget that forces an early sorter drain (§4.3).
    pub sorter_memory_budget_bytes: usize,
    /// `maxClockDiffMsec` equivalent for the dater (§4.4).
    pub dater_max_clock_diff: Duration,
    /// How close to a full day a rollover candidate must be to be accepted
    /// (open question in §9: made configurable instead of a hardcoded
    /// 23h55m constant).
    pub dater_rollover_window: Duration,
    /// Bounded buffer size while an output stream is RECONNECTING (§4.5).
    pub reconnect_buffer_bytes: usize,
    /// Initial backoff before a failed `open()` is retried (§4.6).
    pub open_retry_initial_backoff: Duration,
    /// Backoff ceiling for sensor reopen retries (§4.6).
    pub open_retry_max_backoff: Duration,
}

impl RuntimeConfig {
    /// `original_source` computes the rollover acceptance window as "nearly
    /// a day" relative to `maxClockDiffMsec`; this keeps that relationship
    /// while leaving `dater_max_clock_diff` independently configurable.
    pub fn with_dater_max_clock_diff(mut self, max_clock_diff: Duration) -> Self {
        self.dater_max_clock_diff = max_clock_diff;
        self.dater_rollover_window = Duration::from_secs(86_400).saturating_sub(max_clock_diff);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sorter_lag: Duration::from_millis(500),
            sorter_memory_budget_bytes: 16 * 1024 * 1024,
            dater_max_clock_diff: DEFAULT_MAX_CLOCK_DIFF,
            dater_rollover_window: Duration::from_secs(86_400) - DEFAULT_MAX_CLOCK_DIFF,
            reconnect_buffer_bytes: 4 * 1024 * 1024,
            open_retry_initial_backoff: Duration::from_millis(500),
            open_retry_max_backoff: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rollover_window_matches_original_relationship() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            cfg.dater_rollover_window,
            Duration::from_secs(86_400) - DEFAULT_MAX_CLOCK_DIFF
        );
    }

    #[test]
    fn with_dater_max_clock_diff_recomputes_window() {
        let cfg = RuntimeConfig::default().with_dater_max_clock_diff(Duration::from_secs(60));
        assert_eq!(cfg.dater_max_clock_diff, Duration::from_secs(60));
        assert_eq!(cfg.dater_rollover_window, Duration::from_secs(86_340));
    }
}
