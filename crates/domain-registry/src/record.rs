// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The per-domain record.
//!
//! One [`DomainRecord`] exists per Pending or Managed domain. It carries
//! the domain's identity, the data collected while Pending, the resolved
//! active settings, rate history, and the scratch fields the scheduler
//! fills in on every tick.
//!
//! # Size scales
//!
//! The hypervisor accounts domain memory on two disconnected scales: the
//! published target (guest + videoram) and the possessed-pages count
//! (guest + videoram + hypervisor private data). The private-data size is
//! not queryable; the daemon captures it as `xen_data_size` while the
//! domain is size-stable and treats it as a slowly varying constant.
//! `memsize`, `memsize0`, `memgoal0` and the per-tick caps all live on the
//! guest + videoram scale.

use config_store::ControlModes;
use host_gate::{DomainFlags, DomainId, HostInfo};
use probe_channel::GuestReport;
use std::collections::VecDeque;

/// Sentinel for "videoram key not read yet". Distinct from −1, which the
/// host publishes for domains with no videoram.
pub const VIDEORAM_UNSET: i64 = -11;

/// Samples kept for the slow rate average.
const RATE_HISTORY_LEN: usize = 5;

/// Weights for the slow moving average, most recent sample first.
const SLOW_WEIGHTS: [f64; RATE_HISTORY_LEN] = [10.0, 3.0, 2.0, 2.0, 1.0];

/// What a domain is doing in the current rebalancing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceSide {
    #[default]
    Neutral,
    Expanding,
    Shrinking,
}

/// Whether the build-config blob has been fetched and parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildStatus {
    /// Not retrieved yet; retry on the next pending pass.
    #[default]
    NotFetched,
    /// Retrieved and parsed.
    Parsed,
    /// Permanently unusable; the domain will not be managed.
    Failed,
}

/// Raw per-domain settings from the build-config blob. −1 (or `None`)
/// means the key was absent.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// "memory" in KB (the blob records MB).
    pub memory: i64,
    /// "maxmem" in KB.
    pub maxmem: i64,
    pub dmem_max: i64,
    pub dmem_quota: i64,
    pub dmem_min: i64,
    pub dmem_incr: f64,
    pub dmem_decr: f64,
    pub rate_high: i64,
    pub rate_low: i64,
    pub rate_zero: i64,
    pub guest_free_threshold: f64,
    pub startup_time: i64,
    pub trim_unresponsive: i64,
    pub trim_unmanaged: Option<bool>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            memory: -1,
            maxmem: -1,
            dmem_max: -1,
            dmem_quota: -1,
            dmem_min: -1,
            dmem_incr: -1.0,
            dmem_decr: -1.0,
            rate_high: -1,
            rate_low: -1,
            rate_zero: -1,
            guest_free_threshold: -1.0,
            startup_time: -1,
            trim_unresponsive: -1,
            trim_unmanaged: None,
        }
    }
}

/// Everything the daemon knows about one domain.
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub domain_id: DomainId,
    /// Links the domain to its report slot in the shared namespace.
    pub qid: Option<String>,

    // Collected while Pending.
    pub name: Option<String>,
    pub uuid: Option<String>,
    /// Opaque start-time marker; presence signals the end of guest bring-up.
    pub start_time: Option<String>,
    pub xs_mem_max: i64,
    pub xs_mem_target: i64,
    pub xs_mem_videoram: i64,

    // Pending-phase scratch.
    /// Milliseconds-scale stamp of entry into Pending, on the daemon clock.
    pub pending_entered_ms: i64,
    pub pending_cycle: u64,
    pub skip_counter: u32,
    pub xen_data_size_phase: u32,
    pub resolved_config_seq: u64,

    // Build config.
    pub build_status: BuildStatus,
    pub build: BuildSettings,
    /// Control modes the build config permits.
    pub ctrl_modes_allowed: ControlModes,
    /// The currently active mode, empty until determined.
    pub ctrl_mode: ControlModes,

    // Resolved active settings, KB / KB/s / fractions / seconds.
    pub dmem_max: i64,
    pub dmem_quota: i64,
    pub dmem_min: i64,
    pub dmem_incr: f64,
    pub dmem_decr: f64,
    pub rate_high: i64,
    pub rate_low: i64,
    pub rate_zero: i64,
    pub guest_free_threshold: f64,
    pub startup_time: i64,
    pub trim_unresponsive: i64,
    pub trim_unmanaged: bool,

    /// Captured hypervisor private-data size, KB.
    pub xen_data_size: i64,
    // Private-size re-capture tracking across ticks.
    xds_phase: u32,
    xds_totsize0: i64,
    xds_memgoal0: i64,

    // History with life scope across ticks.
    pub last_report_tick: u64,
    /// Seconds the domain has been runnable without reporting.
    pub no_report_time: i64,
    /// (tick, rate) pairs, most recent first, at most five.
    pub rate_history: VecDeque<(u64, i64)>,
    pub time_rate_below_low: i64,
    pub time_rate_below_high: i64,
    pub last_expand_tick: u64,

    // Operator free-memory shrinkage within the current tick.
    pub preshrink: i64,
    pub preshrink_tick: u64,

    // Per-tick scratch.
    pub flags: DomainFlags,
    pub report_raw: Option<String>,
    pub valid_data: bool,
    pub valid_memory_data: bool,
    pub trimming_to_quota: bool,
    pub balside: BalanceSide,
    pub rate: i64,
    pub freepct: f64,
    pub fast_rate: i64,
    pub slow_rate: i64,
    pub memgoal0: i64,
    pub memsize0: i64,
    pub memsize: i64,
    pub memsize_incr: i64,
    pub memsize_decr: i64,
    pub expand_force: f64,
    pub resist_force: f64,
    pub expand_force0: f64,
}

impl DomainRecord {
    pub fn new(domain_id: DomainId) -> Self {
        Self {
            domain_id,
            qid: None,
            name: None,
            uuid: None,
            start_time: None,
            xs_mem_max: -1,
            xs_mem_target: -1,
            xs_mem_videoram: VIDEORAM_UNSET,
            pending_entered_ms: 0,
            pending_cycle: 0,
            skip_counter: 0,
            xen_data_size_phase: 0,
            resolved_config_seq: 0,
            build_status: BuildStatus::NotFetched,
            build: BuildSettings::default(),
            ctrl_modes_allowed: ControlModes::empty(),
            ctrl_mode: ControlModes::empty(),
            dmem_max: -1,
            dmem_quota: -1,
            dmem_min: -1,
            dmem_incr: -1.0,
            dmem_decr: -1.0,
            rate_high: -1,
            rate_low: -1,
            rate_zero: -1,
            guest_free_threshold: -1.0,
            startup_time: -1,
            trim_unresponsive: -1,
            trim_unmanaged: true,
            xen_data_size: 0,
            xds_phase: 0,
            xds_totsize0: -1,
            xds_memgoal0: -1,
            last_report_tick: 0,
            no_report_time: 0,
            rate_history: VecDeque::new(),
            time_rate_below_low: 0,
            time_rate_below_high: 0,
            last_expand_tick: 0,
            preshrink: 0,
            preshrink_tick: 0,
            flags: DomainFlags::default(),
            report_raw: None,
            valid_data: false,
            valid_memory_data: false,
            trimming_to_quota: false,
            balside: BalanceSide::Neutral,
            rate: 0,
            freepct: 0.0,
            fast_rate: 0,
            slow_rate: 0,
            memgoal0: 0,
            memsize0: 0,
            memsize: 0,
            memsize_incr: 0,
            memsize_decr: 0,
            expand_force: 0.0,
            resist_force: 0.0,
            expand_force0: 0.0,
        }
    }

    /// Human-readable identity for log messages.
    pub fn printable_name(&self) -> String {
        match (&self.name, &self.uuid) {
            (Some(n), Some(u)) => format!("{} (name: {n}, uuid: {u})", self.domain_id),
            (Some(n), None) => format!("{} (name: {n})", self.domain_id),
            (None, Some(u)) => format!("{} (uuid: {u})", self.domain_id),
            (None, None) => format!("{}", self.domain_id),
        }
    }

    /// Resets the pending-phase scratch on entry to Pending.
    pub fn on_enter_pending(&mut self, now_ms: i64) {
        self.pending_entered_ms = now_ms;
        self.pending_cycle = 0;
        self.skip_counter = 0;
        self.resolved_config_seq = 0;
        self.xen_data_size_phase = 0;
    }

    /// Resets scheduling state on entry to Managed.
    ///
    /// Tick numbers are not used here: the scheduler's tick counter can
    /// jump by the slept-through amount between this call and the next
    /// tick, so everything starts from the "never seen" value.
    pub fn on_enter_managed(&mut self) {
        self.last_report_tick = 0;
        self.no_report_time = 0;
        self.time_rate_below_low = 0;
        self.time_rate_below_high = 0;
        self.valid_data = false;
        self.valid_memory_data = false;
        self.last_expand_tick = 0;
        self.preshrink = 0;
        self.preshrink_tick = 0;
        self.rate_history.clear();
        self.xds_phase = 0;
        self.xds_totsize0 = -1;
        self.xds_memgoal0 = -1;
    }

    /// Clears the per-tick scratch at the start of a scheduling tick.
    pub fn begin_sched_tick(&mut self) {
        self.trimming_to_quota = false;
        self.valid_data = false;
        self.valid_memory_data = false;
        self.balside = BalanceSide::Neutral;
        self.expand_force0 = 0.0;
    }

    /// `true` once every host-published key needed for promotion is in.
    /// The root domain has no uuid, videoram or start-time key.
    pub fn is_published_data_complete(&self) -> bool {
        let root = self.domain_id == 0;
        self.name.is_some()
            && (self.uuid.is_some() || root)
            && self.xs_mem_max >= 0
            && self.xs_mem_target >= 0
            && self.xs_mem_videoram != VIDEORAM_UNSET
            && (self.start_time.is_some() || root)
    }

    /// Comma-separated list of the data still missing, for the pending
    /// timeout message. Empty means nothing is missing.
    pub fn missing_data(&self, private_size_samples: u32) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.name.is_none() {
            parts.push("name");
        }
        if self.uuid.is_none() && self.domain_id != 0 {
            parts.push("uuid");
        }
        if self.xs_mem_max == -1 {
            parts.push("xs mem max");
        }
        if self.xs_mem_target == -1 {
            parts.push("xs mem target");
        }
        if self.xs_mem_videoram == VIDEORAM_UNSET {
            parts.push("xs mem videoram");
        }
        if self.start_time.is_none() && self.domain_id != 0 {
            parts.push("xs start time");
        }
        if parts.is_empty() && self.xen_data_size_phase != private_size_samples {
            parts.push("xen private data size");
        }
        if parts.is_empty() && self.build_status != BuildStatus::Parsed {
            parts.push("xen domain config file");
        }
        parts.join(", ")
    }

    // ── Per-tick memory accounting ─────────────────────────────

    /// Records the host accounting snapshot and derives the tick's size
    /// base line and per-tick resize caps.
    pub fn record_memory_info(
        &mut self,
        info: &HostInfo,
        page_kb: u64,
        quantum_kb: u64,
        tick: u64,
    ) {
        self.flags = info.flags;

        // Claimed-but-unallocated pages are excluded: the measured rate is
        // a function of physically possessed memory.
        let tot_kb = info.tot_kb(page_kb) as i64;
        self.memsize = tot_kb - self.xen_data_size;
        if self.memsize < 0 {
            tracing::error!(
                domain = %self.printable_name(),
                tot_kb,
                xen_data_size = self.xen_data_size,
                "possessed size below captured private size"
            );
            self.memsize = 0;
        }
        self.memsize0 = self.memsize;

        self.memgoal0 = round_up(self.xs_mem_target + self.xs_mem_videoram, page_kb as i64);

        self.memsize_incr = self.eval_incr(quantum_kb as i64);
        self.memsize_decr = self.eval_decr(quantum_kb as i64, tick);

        self.valid_memory_data = true;
    }

    /// Expansion cap for this tick: up to `dmem_incr` above the base line.
    fn eval_incr(&self, quantum: i64) -> i64 {
        let mut m = (self.memsize0 as f64 * (1.0 + self.dmem_incr)) as i64;
        m = round_up(m, quantum);
        m = m.max(self.dmem_min);
        m.min(self.dmem_max)
    }

    /// Contraction floor for this tick: down to `dmem_decr` below the base
    /// line, reduced by any shrinking the free-memory command already did.
    fn eval_decr(&self, quantum: i64, tick: u64) -> i64 {
        let m0 = self.memsize0;
        let mut m = (m0 as f64 * (1.0 - self.dmem_decr)) as i64;
        m = round_up(m, quantum);
        m = m.max(self.dmem_min);
        m = m.min(self.dmem_max);

        if self.preshrink != 0 && tick.saturating_sub(self.preshrink_tick) <= 1 {
            let decr = (m0 - m - self.preshrink).max(0);
            m = m0 - decr;
            m = round_up(m, quantum);
            m = m.max(self.dmem_min);
            m = m.min(self.dmem_max);
        }

        m
    }

    // ── Report intake and rate smoothing ───────────────────────

    /// Folds a freshly drained report into the record.
    pub fn intake_report(&mut self, report: &GuestReport, tick: u64, interval_secs: u32) {
        self.no_report_time = 0;
        self.last_report_tick = tick;

        self.rate = report.kbsec as i64;
        self.freepct = report.freepct;

        // A guest with plenty of free memory is not short on memory no
        // matter what rate it reports.
        if self.freepct > self.guest_free_threshold * 100.0 {
            self.rate = 0;
        }
        if self.rate <= self.rate_zero {
            self.rate = 0;
        }

        self.calc_rates(tick);

        if self.slow_rate <= self.rate_low {
            self.time_rate_below_low += interval_secs as i64;
        } else {
            self.time_rate_below_low = 0;
        }
        if self.fast_rate < self.rate_high {
            self.time_rate_below_high += interval_secs as i64;
        } else {
            self.time_rate_below_high = 0;
        }
    }

    /// Fast and slow moving averages of the rate.
    ///
    /// The fast rate drives expansion pressure and is just the latest
    /// sample. The slow rate drives contraction resistance and never drops
    /// below the latest sample, so a burst registers immediately while the
    /// decay is gradual.
    fn calc_rates(&mut self, tick: u64) {
        self.rate_history.push_front((tick, self.rate));
        while self.rate_history.len() > RATE_HISTORY_LEN {
            self.rate_history.pop_back();
        }

        self.fast_rate = self.rate;

        let weighted = self.weight_samples(&SLOW_WEIGHTS) as i64;
        self.slow_rate = self.rate.max(weighted);
    }

    /// Weighted average over the recent history.
    ///
    /// Only a contiguous run of samples counts: a single missing tick
    /// shifts the weighting, a longer breach ends the accumulation there.
    /// The history is most-recent-first with strictly decreasing ticks;
    /// anything else is a bug in the sample bookkeeping.
    fn weight_samples(&self, weights: &[f64]) -> f64 {
        let nel = weights.len().min(self.rate_history.len());
        let mut sum_rate = 0.0;
        let mut sum_weight = 0.0;
        let mut prev_tick = 0u64;
        let mut k = 0usize;

        while k < nel {
            let (sample_tick, sample_rate) = self.rate_history[k];
            if k != 0 {
                if sample_tick >= prev_tick {
                    fatal("bug: weight_samples bad gap");
                }
                let gap = prev_tick - sample_tick - 1;
                if gap > 1 {
                    break;
                }
                k += gap as usize;
            }
            prev_tick = sample_tick;
            if k >= nel {
                break;
            }
            sum_weight += weights[k];
            sum_rate += sample_rate as f64 * weights[k];
            k += 1;
        }

        if sum_weight == 0.0 {
            0.0
        } else {
            sum_rate / sum_weight
        }
    }

    // ── Private-size re-capture ────────────────────────────────

    /// Opportunistically re-captures `xen_data_size` once the domain has
    /// been size-stable (both total size and goal) for the required number
    /// of consecutive ticks.
    pub fn reeval_xen_data_size(&mut self, xen_free_kb: i64, page_kb: u64, samples: u32) {
        if !self.flags.runnable() {
            return;
        }

        // With free memory depleted, allocation can lag the target for a
        // long time; that gap must not be mistaken for private size.
        if xen_free_kb < page_kb as i64 * 100 {
            return;
        }

        let totsize0 = self.memsize0 + self.xen_data_size;

        if self.xds_phase == 0
            || self.xds_totsize0 != totsize0
            || self.xds_memgoal0 != self.memgoal0
            || totsize0 < self.memgoal0
        {
            self.xds_totsize0 = totsize0;
            self.xds_memgoal0 = self.memgoal0;
            self.xds_phase = 1;
            return;
        }

        self.xds_phase += 1;
        if self.xds_phase >= samples {
            self.xen_data_size = totsize0 - self.memgoal0;
            self.xds_phase -= 1;
        }
    }

    /// Clears the free-memory-command shrink record once it has been
    /// charged against a tick's contraction cap.
    pub fn reset_preshrink(&mut self) {
        self.preshrink = 0;
        self.preshrink_tick = 0;
    }
}

/// Logs a programmer-error diagnosis and terminates.
///
/// Invariant breaches inside the rate calculus have no recoverable typed
/// form; a wrapped or clamped value here would silently corrupt every
/// later balancing decision.
fn fatal(msg: &str) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1);
}

/// Rounds `n` upward to the next multiple of `quantum`.
pub fn round_up(n: i64, quantum: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    (n + quantum - 1) / quantum * quantum
}

/// Rounds `n` downward to a multiple of `quantum`.
pub fn round_down(n: i64, quantum: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    n / quantum * quantum
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_gate::DomainFlags;

    fn managed_record() -> DomainRecord {
        let mut r = DomainRecord::new(5);
        r.name = Some("web".into());
        r.dmem_min = 1024 * 1024;
        r.dmem_quota = 4 * 1024 * 1024;
        r.dmem_max = 32 * 1024 * 1024;
        r.dmem_incr = 0.06;
        r.dmem_decr = 0.04;
        r.rate_high = 200;
        r.rate_low = 0;
        r.rate_zero = 30;
        r.guest_free_threshold = 0.15;
        r.flags = DomainFlags {
            running: true,
            ..Default::default()
        };
        r
    }

    fn report(kbsec: u64, freepct: f64) -> GuestReport {
        GuestReport {
            progname: None,
            progversion: None,
            seq: None,
            kb: None,
            kbsec,
            freepct,
        }
    }

    #[test]
    fn test_printable_name() {
        let mut r = DomainRecord::new(5);
        assert_eq!(r.printable_name(), "5");
        r.name = Some("web".into());
        assert_eq!(r.printable_name(), "5 (name: web)");
        r.uuid = Some("u-1".into());
        assert_eq!(r.printable_name(), "5 (name: web, uuid: u-1)");
    }

    #[test]
    fn test_round_helpers() {
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(4, 4), 4);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_down(7, 4), 4);
        assert_eq!(round_down(8, 4), 8);
        assert_eq!(round_up(0, 4), 0);
    }

    #[test]
    fn test_zero_report_with_full_free_zeroes_rates() {
        let mut r = managed_record();
        // some prior busy history
        for t in 1..=3u64 {
            r.intake_report(&report(5000, 5.0), t, 5);
        }
        assert!(r.slow_rate > 0);

        r.intake_report(&report(0, 100.0), 4, 5);
        assert_eq!(r.fast_rate, 0);
        // slow rate still carries history; a fresh record must not
        let mut fresh = managed_record();
        fresh.intake_report(&report(0, 100.0), 1, 5);
        assert_eq!(fresh.fast_rate, 0);
        assert_eq!(fresh.slow_rate, 0);
    }

    #[test]
    fn test_guest_free_threshold_overrides_rate() {
        let mut r = managed_record();
        r.intake_report(&report(5000, 50.0), 1, 5);
        assert_eq!(r.rate, 0);
        // below the threshold the rate stands
        r.intake_report(&report(5000, 5.0), 2, 5);
        assert_eq!(r.rate, 5000);
    }

    #[test]
    fn test_rate_zero_floor() {
        let mut r = managed_record();
        r.intake_report(&report(25, 5.0), 1, 5);
        assert_eq!(r.rate, 0);
        r.intake_report(&report(31, 5.0), 2, 5);
        assert_eq!(r.rate, 31);
    }

    #[test]
    fn test_slow_rate_constant_run_equals_rate() {
        let mut r = managed_record();
        for t in 1..=5u64 {
            r.intake_report(&report(400, 5.0), t, 5);
        }
        assert_eq!(r.slow_rate, 400);
        assert_eq!(r.fast_rate, 400);
    }

    #[test]
    fn test_slow_rate_never_below_current() {
        let mut r = managed_record();
        for t in 1..=4u64 {
            r.intake_report(&report(50, 5.0), t, 5);
        }
        r.intake_report(&report(9000, 5.0), 5, 5);
        assert_eq!(r.slow_rate, 9000);
    }

    #[test]
    fn test_slow_rate_decays_gradually() {
        let mut r = managed_record();
        for t in 1..=5u64 {
            r.intake_report(&report(1000, 5.0), t, 5);
        }
        r.intake_report(&report(100, 5.0), 6, 5);
        assert!(r.slow_rate > 100, "history must hold the slow rate up");
        assert!(r.slow_rate < 1000);
    }

    #[test]
    fn test_history_gap_stops_accumulation() {
        let mut r = managed_record();
        r.intake_report(&report(1000, 5.0), 1, 5);
        r.intake_report(&report(1000, 5.0), 2, 5);
        // ticks 3..6 silent; history gap > 1
        r.intake_report(&report(100, 5.0), 7, 5);
        // only the current sample counts
        assert_eq!(r.slow_rate, 100);
    }

    #[test]
    fn test_history_bounded() {
        let mut r = managed_record();
        for t in 1..=20u64 {
            r.intake_report(&report(100, 5.0), t, 5);
        }
        assert_eq!(r.rate_history.len(), 5);
        assert_eq!(r.rate_history[0].0, 20);
    }

    #[test]
    fn test_below_low_accumulator() {
        let mut r = managed_record();
        r.rate_low = 100;
        r.intake_report(&report(0, 5.0), 1, 5);
        r.intake_report(&report(0, 5.0), 2, 5);
        assert_eq!(r.time_rate_below_low, 10);
        // a burst resets the accumulator
        r.intake_report(&report(50_000, 5.0), 3, 5);
        assert_eq!(r.time_rate_below_low, 0);
    }

    #[test]
    fn test_memory_info_and_caps() {
        let mut r = managed_record();
        r.xs_mem_target = 2 * 1024 * 1024;
        r.xs_mem_videoram = 0;
        r.xen_data_size = 1024;
        let info = HostInfo {
            domain_id: 5,
            tot_pages: (2 * 1024 * 1024 + 1024) / 4,
            outstanding_pages: 0,
            flags: DomainFlags {
                running: true,
                ..Default::default()
            },
        };
        r.record_memory_info(&info, 4, 4, 100);
        assert!(r.valid_memory_data);
        assert_eq!(r.memsize0, 2 * 1024 * 1024);
        assert_eq!(r.memgoal0, 2 * 1024 * 1024);
        let expected_incr = round_up((2_097_152f64 * 1.06) as i64, 4);
        assert_eq!(r.memsize_incr, expected_incr);
        let expected_decr = round_up((2_097_152f64 * 0.96) as i64, 4);
        assert_eq!(r.memsize_decr, expected_decr.max(r.dmem_min));
    }

    #[test]
    fn test_preshrink_charges_against_decr() {
        let mut r = managed_record();
        r.xs_mem_target = 2 * 1024 * 1024;
        r.xs_mem_videoram = 0;
        let info = HostInfo {
            domain_id: 5,
            tot_pages: 2 * 1024 * 1024 / 4,
            outstanding_pages: 0,
            flags: DomainFlags {
                running: true,
                ..Default::default()
            },
        };

        r.record_memory_info(&info, 4, 4, 100);
        let unshrunk_floor = r.memsize_decr;

        // the free-memory command already took the whole 4% at tick 99
        r.preshrink = r.memsize0 - unshrunk_floor;
        r.preshrink_tick = 99;
        r.record_memory_info(&info, 4, 4, 100);
        assert_eq!(r.memsize_decr, r.memsize0);

        // two ticks later the charge no longer applies
        r.preshrink_tick = 90;
        r.record_memory_info(&info, 4, 4, 100);
        assert_eq!(r.memsize_decr, unshrunk_floor);
    }

    #[test]
    fn test_xds_capture_after_stable_ticks() {
        let mut r = managed_record();
        r.xs_mem_target = 1024 * 1024;
        r.xs_mem_videoram = 0;
        r.memsize0 = 1024 * 1024 + 512; // private part of 512 KB, not yet known
        r.memgoal0 = 1024 * 1024;
        r.xen_data_size = 0;

        let free = 8 * 1024 * 1024;
        r.reeval_xen_data_size(free, 4, 3);
        assert_eq!(r.xen_data_size, 0); // phase 1
        r.reeval_xen_data_size(free, 4, 3);
        assert_eq!(r.xen_data_size, 0); // phase 2
        r.reeval_xen_data_size(free, 4, 3);
        assert_eq!(r.xen_data_size, 512); // captured

        // a size change restarts the capture
        r.memsize0 += 4096;
        r.xen_data_size = 0;
        r.reeval_xen_data_size(free, 4, 3);
        r.memsize0 += 4096;
        r.reeval_xen_data_size(free, 4, 3);
        assert_eq!(r.xen_data_size, 0);
    }

    #[test]
    fn test_xds_skipped_when_free_depleted() {
        let mut r = managed_record();
        r.memsize0 = 1024 * 1024 + 512;
        r.memgoal0 = 1024 * 1024;
        for _ in 0..5 {
            r.reeval_xen_data_size(100, 4, 3);
        }
        assert_eq!(r.xen_data_size, 0);
    }

    #[test]
    fn test_missing_data_progression() {
        let mut r = DomainRecord::new(5);
        assert!(r.missing_data(3).contains("name"));
        assert!(r.missing_data(3).contains("xs start time"));

        r.name = Some("web".into());
        r.uuid = Some("u".into());
        r.xs_mem_max = 1;
        r.xs_mem_target = 1;
        r.xs_mem_videoram = -1;
        r.start_time = Some("123".into());
        assert_eq!(r.missing_data(3), "xen private data size");

        r.xen_data_size_phase = 3;
        assert_eq!(r.missing_data(3), "xen domain config file");

        r.build_status = BuildStatus::Parsed;
        assert_eq!(r.missing_data(3), "");
    }

    #[test]
    fn test_root_domain_needs_less_published_data() {
        let mut r = DomainRecord::new(0);
        r.name = Some("Domain-0".into());
        r.xs_mem_max = 1;
        r.xs_mem_target = 1;
        r.xs_mem_videoram = 0;
        assert!(r.is_published_data_complete());
    }
}
