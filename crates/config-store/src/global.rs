// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The global membalance parameter set.

use crate::ConfigField;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hardwired tuning constants.
///
/// These were once configuration items; they are compile-time constants now
/// but are kept in one place so the scheduler and event loop share a single
/// source of truth.
pub mod consts {
    /// Time points closer than this to a deadline count as "due".
    pub const TOLERANCE_MS: i64 = 200;

    /// Scheduler interval clamp, in seconds.
    pub const MIN_INTERVAL: u32 = 2;
    pub const MAX_INTERVAL: u32 = 30;

    /// Sanity bounds for per-tick expansion/contraction fractions.
    pub const MIN_DMEM_INCR: f64 = 0.005;
    pub const MAX_DMEM_INCR: f64 = 0.30;
    pub const MIN_DMEM_DECR: f64 = 0.005;
    pub const MAX_DMEM_DECR: f64 = 0.10;

    /// A domain expanded no more than this many ticks ago is protected from
    /// soft-reserve and rebalancing shrinks.
    pub const SHRINK_PROTECTION_TICKS: u64 = 1;

    /// Expansion-wait budget: min(frac · interval, max), aborted after
    /// `ABORT` consecutive no-progress cycles.
    pub const DOMAIN_EXPANSION_TIMEOUT_FRAC: f64 = 0.3;
    pub const DOMAIN_EXPANSION_TIMEOUT_MAX_SECS: u32 = 5;
    pub const DOMAIN_EXPANSION_TIMEOUT_ABORT: u32 = 4;

    /// How long the free-memory command waits for shrinkers to deliver.
    pub const DOMAIN_FREEMEM_TIMEOUT_MS: i64 = 700;

    /// Consecutive stable samples required to accept a hypervisor
    /// private-data size reading.
    pub const PRIVATE_DATA_SIZE_SAMPLES: u32 = 3;
}

/// Domain control modes, as a small bitset.
///
/// AUTO: the daemon adjusts the domain from its reported paging rate.
/// DIRECT: the guest computes its own target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ControlModes(u8);

impl ControlModes {
    pub const AUTO: ControlModes = ControlModes(1 << 0);
    pub const DIRECT: ControlModes = ControlModes(1 << 1);

    pub fn empty() -> Self {
        ControlModes(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: ControlModes) -> bool {
        self.0 & other.0 == other.0
    }

    /// Compact code used by status displays: "A", "D", "AD" or "".
    pub fn code(&self) -> String {
        let mut s = String::new();
        if self.contains(Self::AUTO) {
            s.push('A');
        }
        if self.contains(Self::DIRECT) {
            s.push('D');
        }
        s
    }
}

impl BitOr for ControlModes {
    type Output = ControlModes;
    fn bitor(self, rhs: ControlModes) -> ControlModes {
        ControlModes(self.0 | rhs.0)
    }
}

impl BitOrAssign for ControlModes {
    fn bitor_assign(&mut self, rhs: ControlModes) {
        self.0 |= rhs.0;
    }
}

static SEQ: AtomicU64 = AtomicU64::new(0);

/// The full global parameter set.
///
/// Memory amounts are KB, rates KB/s, times seconds, step sizes fractions.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Snapshot sequence number. Two configs with equal `seq` are the same
    /// snapshot; dependants cache the `seq` they last resolved against.
    pub seq: u64,

    /// Scheduler tick period.
    pub interval: ConfigField<u32>,
    /// Retry budget for transactional store operations.
    pub max_xs_retries: ConfigField<u32>,
    /// Startup wait budget for the host interface, and when to log about it.
    pub max_xen_init_retries: ConfigField<u32>,
    pub xen_init_retry_msg: ConfigField<u32>,
    /// How long a domain may stay Pending before being declared Unmanaged.
    pub domain_pending_timeout: ConfigField<u32>,
    /// Free memory that must remain above the built-in slack.
    pub host_reserved_hard: ConfigField<u64>,
    /// Soft free-memory buffer for domains in substantial need.
    pub host_reserved_soft: ConfigField<u64>,
    /// Rate thresholds (defaults for per-domain values).
    pub rate_high: ConfigField<u64>,
    pub rate_low: ConfigField<u64>,
    pub rate_zero: ConfigField<u64>,
    /// Per-tick expansion/contraction step caps.
    pub dmem_incr: ConfigField<f64>,
    pub dmem_decr: ConfigField<f64>,
    /// Guest free-memory fraction above which the rate is treated as zero.
    pub guest_free_threshold: ConfigField<f64>,
    /// Grace period for freshly booted guests.
    pub startup_time: ConfigField<u32>,
    /// Silence period after which an over-quota domain is trimmed.
    pub trim_unresponsive: ConfigField<u32>,
    /// Trim to quota on the Managed → Unmanaged transition.
    pub trim_unmanaged: ConfigField<bool>,
    /// Whether (and how) the privileged domain is managed.
    pub dom0_mode: ConfigField<ControlModes>,
}

impl GlobalConfig {
    /// An entirely unset parameter set with a fresh sequence number.
    pub fn unset() -> Self {
        Self {
            seq: SEQ.fetch_add(1, Ordering::Relaxed) + 1,
            interval: ConfigField::unset(),
            max_xs_retries: ConfigField::unset(),
            max_xen_init_retries: ConfigField::unset(),
            xen_init_retry_msg: ConfigField::unset(),
            domain_pending_timeout: ConfigField::unset(),
            host_reserved_hard: ConfigField::unset(),
            host_reserved_soft: ConfigField::unset(),
            rate_high: ConfigField::unset(),
            rate_low: ConfigField::unset(),
            rate_zero: ConfigField::unset(),
            dmem_incr: ConfigField::unset(),
            dmem_decr: ConfigField::unset(),
            guest_free_threshold: ConfigField::unset(),
            startup_time: ConfigField::unset(),
            trim_unresponsive: ConfigField::unset(),
            trim_unmanaged: ConfigField::unset(),
            dom0_mode: ConfigField::unset(),
        }
    }

    /// The built-in defaults, all fields in the Defaulted state.
    pub fn defaults() -> Self {
        let mut c = Self::unset();
        c.interval.default_to(5);
        c.max_xs_retries.default_to(20);
        c.max_xen_init_retries.default_to(300);
        c.xen_init_retry_msg.default_to(15);
        c.domain_pending_timeout.default_to(300);
        c.host_reserved_hard.default_to(0);
        // host_reserved_soft is derived from host figures, see
        // `derive_reserved_soft`; it starts at hard + 0.
        c.host_reserved_soft.default_to(0);
        c.rate_high.default_to(200);
        c.rate_low.default_to(0);
        c.rate_zero.default_to(30);
        c.dmem_incr.default_to(0.06);
        c.dmem_decr.default_to(0.04);
        c.guest_free_threshold.default_to(0.15);
        c.startup_time.default_to(300);
        c.trim_unresponsive.default_to(200);
        c.trim_unmanaged.default_to(true);
        c.dom0_mode.default_to(ControlModes::empty());
        c
    }

    /// Fills fields that are unset-or-defaulted here with values that are
    /// set-explicitly (or at least present) in `other`.
    pub fn merge(&mut self, other: &GlobalConfig) {
        self.interval.merge(&other.interval);
        self.max_xs_retries.merge(&other.max_xs_retries);
        self.max_xen_init_retries.merge(&other.max_xen_init_retries);
        self.xen_init_retry_msg.merge(&other.xen_init_retry_msg);
        self.domain_pending_timeout
            .merge(&other.domain_pending_timeout);
        self.host_reserved_hard.merge(&other.host_reserved_hard);
        self.host_reserved_soft.merge(&other.host_reserved_soft);
        self.rate_high.merge(&other.rate_high);
        self.rate_low.merge(&other.rate_low);
        self.rate_zero.merge(&other.rate_zero);
        self.dmem_incr.merge(&other.dmem_incr);
        self.dmem_decr.merge(&other.dmem_decr);
        self.guest_free_threshold.merge(&other.guest_free_threshold);
        self.startup_time.merge(&other.startup_time);
        self.trim_unresponsive.merge(&other.trim_unresponsive);
        self.trim_unmanaged.merge(&other.trim_unmanaged);
        self.dom0_mode.merge(&other.dom0_mode);
    }

    /// Derives the active soft reserve from host figures when the operator
    /// did not set one: `hard + 10% of (physical − slack − privileged-min)`,
    /// rounded up to the allocation quantum. Clamps soft up to hard with a
    /// warning when the operator set both inconsistently.
    pub fn derive_reserved_soft(
        &mut self,
        physical_kb: u64,
        slack_kb: u64,
        privileged_min_kb: u64,
        quantum_kb: u64,
    ) {
        if !self.host_reserved_soft.is_set() {
            let headroom = physical_kb
                .saturating_sub(slack_kb)
                .saturating_sub(privileged_min_kb);
            let soft = self.host_reserved_hard.value() + headroom / 10;
            let soft = soft.div_ceil(quantum_kb) * quantum_kb;
            self.host_reserved_soft.default_to(soft);
        }

        let hard = self.host_reserved_hard.value();
        if self.host_reserved_soft.value() < hard {
            tracing::warn!(
                soft_kb = self.host_reserved_soft.value(),
                hard_kb = hard,
                "host_reserved_soft below host_reserved_hard, raising soft to hard"
            );
            self.host_reserved_soft.set(hard);
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = GlobalConfig::defaults();
        assert_eq!(c.interval.value(), 5);
        assert_eq!(c.rate_high.value(), 200);
        assert_eq!(c.rate_zero.value(), 30);
        assert!((c.dmem_incr.value() - 0.06).abs() < 1e-9);
        assert!(c.trim_unmanaged.value());
        assert!(c.dom0_mode.value().is_empty());
        assert!(c.interval.is_defaulted());
    }

    #[test]
    fn test_seq_increases() {
        let a = GlobalConfig::defaults();
        let b = GlobalConfig::defaults();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_merge_keeps_explicit() {
        let mut a = GlobalConfig::unset();
        a.rate_high.set(400);
        a.merge(&GlobalConfig::defaults());
        assert_eq!(a.rate_high.value(), 400);
        assert!(a.rate_high.is_set());
        assert_eq!(a.rate_low.value(), 0);
        assert!(a.rate_low.is_defaulted());
    }

    #[test]
    fn test_derive_reserved_soft() {
        let mut c = GlobalConfig::defaults();
        c.host_reserved_hard.set(1024);
        // physical 10 GB, slack 128 MB, dom0 min 1 GB
        c.derive_reserved_soft(10 * 1024 * 1024, 128 * 1024, 1024 * 1024, 4);
        let headroom: u64 = 10 * 1024 * 1024 - 128 * 1024 - 1024 * 1024;
        let expected = (1024 + headroom / 10).div_ceil(4) * 4;
        assert_eq!(c.host_reserved_soft.value(), expected);
    }

    #[test]
    fn test_derive_reserved_soft_clamps_to_hard() {
        let mut c = GlobalConfig::defaults();
        c.host_reserved_hard.set(2048);
        c.host_reserved_soft.set(1024);
        c.derive_reserved_soft(1024 * 1024, 0, 0, 4);
        assert_eq!(c.host_reserved_soft.value(), 2048);
    }

    #[test]
    fn test_control_modes_code() {
        assert_eq!(ControlModes::AUTO.code(), "A");
        assert_eq!((ControlModes::AUTO | ControlModes::DIRECT).code(), "AD");
        assert_eq!(ControlModes::empty().code(), "");
    }
}
