// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Monotonic time source.
//!
//! The scheduler must not be confused by wall-clock adjustments, and it
//! wants suspend time included where the platform can provide it. The clock
//! is therefore chosen once at startup: `CLOCK_BOOTTIME` if available,
//! falling back to `CLOCK_MONOTONIC_RAW`, then `CLOCK_MONOTONIC`. If none
//! of the three works the process cannot do its job at all.

use crate::HostError;

/// A point in time on the selected clock. Opaque except for differencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    sec: i64,
    nsec: i64,
}

impl Stamp {
    /// `self − earlier`, in milliseconds. Negative when `earlier` is later.
    pub fn diff_ms(&self, earlier: Stamp) -> i64 {
        (self.sec - earlier.sec) * 1000 + (self.nsec - earlier.nsec) / 1_000_000
    }
}

/// The process-wide monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    clock_id: libc::clockid_t,
}

impl MonotonicClock {
    /// Selects the best available monotonic clock.
    ///
    /// Selection happens exactly once; a host without any monotonic clock
    /// cannot run the daemon.
    pub fn select() -> Result<MonotonicClock, HostError> {
        const CANDIDATES: &[(libc::clockid_t, &str)] = &[
            (libc::CLOCK_BOOTTIME, "CLOCK_BOOTTIME"),
            (libc::CLOCK_MONOTONIC_RAW, "CLOCK_MONOTONIC_RAW"),
            (libc::CLOCK_MONOTONIC, "CLOCK_MONOTONIC"),
        ];

        for &(clock_id, name) in CANDIDATES {
            if read_clock(clock_id).is_some() {
                tracing::debug!(clock = name, "selected monotonic clock");
                return Ok(MonotonicClock { clock_id });
            }
        }

        Err(HostError::NoMonotonicClock)
    }

    /// The current time on the selected clock.
    pub fn now(&self) -> Stamp {
        // The clock was verified readable at selection time.
        read_clock(self.clock_id).unwrap_or(Stamp { sec: 0, nsec: 0 })
    }

    /// Blocks the calling thread for `ms` milliseconds.
    pub fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

fn read_clock(clock_id: libc::clockid_t) -> Option<Stamp> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc == 0 {
        Some(Stamp {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_succeeds_on_linux() {
        let clock = MonotonicClock::select().unwrap();
        let a = clock.now();
        let b = clock.now();
        assert!(b.diff_ms(a) >= 0);
    }

    #[test]
    fn test_diff_ms() {
        let a = Stamp { sec: 10, nsec: 0 };
        let b = Stamp {
            sec: 11,
            nsec: 500_000_000,
        };
        assert_eq!(b.diff_ms(a), 1500);
        assert_eq!(a.diff_ms(b), -1500);
    }

    #[test]
    fn test_monotonic_across_sleep() {
        let clock = MonotonicClock::select().unwrap();
        let a = clock.now();
        clock.sleep_ms(10);
        let b = clock.now();
        assert!(b.diff_ms(a) >= 10);
    }
}
