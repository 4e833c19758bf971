// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The hypervisor control-surface trait.
//!
//! Everything the balancing engine knows about the host flows through
//! [`HostGate`]. Implementations exist for the real control surface and for
//! the in-memory [`crate::SimHost`]; the engine cannot tell them apart.

use crate::HostError;
use std::collections::HashMap;

/// Host-assigned domain identifier. 0 is the privileged/root domain.
pub type DomainId = i64;

/// The privileged/root domain.
pub const PRIVILEGED_DOMAIN: DomainId = 0;

/// Scheduling-state flags for one domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainFlags {
    pub running: bool,
    pub blocked: bool,
    pub paused: bool,
    pub dying: bool,
    pub shutdown: bool,
}

impl DomainFlags {
    /// A domain is runnable when it is not on its way out and not paused.
    ///
    /// Snapshots occasionally show a domain neither running nor blocked;
    /// that is a transition state and still counts as runnable.
    pub fn runnable(&self) -> bool {
        !(self.dying || self.shutdown || self.paused)
    }
}

/// One domain's memory accounting as reported by the host.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub domain_id: DomainId,
    /// Pages physically possessed by the domain.
    pub tot_pages: u64,
    /// Pages claimed but not yet physically allocated.
    pub outstanding_pages: u64,
    pub flags: DomainFlags,
}

impl HostInfo {
    /// Possessed memory in KB at the given page size.
    pub fn tot_kb(&self, page_size_kb: u64) -> u64 {
        self.tot_pages * page_size_kb
    }
}

/// Liveness triad: the control surface cannot always answer yes-or-no.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alive {
    Yes,
    No,
    Unknown,
}

/// The hypervisor control surface.
///
/// All memory amounts are KB. Setting a target is asynchronous: the balloon
/// mechanism moves the domain toward the target over time and may silently
/// clamp it, so callers re-read the published target after setting it.
pub trait HostGate {
    /// The allocation quantum: host page size in KB.
    fn page_size_kb(&self) -> u64;

    /// All currently known domain ids.
    fn enumerate_domains(&self) -> Result<Vec<DomainId>, HostError>;

    /// Bulk snapshot of per-domain accounting.
    fn collect_info(&self) -> Result<HashMap<DomainId, HostInfo>, HostError>;

    /// One domain's accounting, `None` when the domain is gone.
    fn domain_info(&self, id: DomainId) -> Result<Option<HostInfo>, HostError>;

    /// Whether the domain currently exists.
    fn domain_alive(&self, id: DomainId) -> Alive;

    /// Seconds since the start of the domain's current incarnation, or −1
    /// when unknown. Restores and migrations reset the incarnation; the
    /// privileged domain always reports −1.
    fn domain_uptime(&self, id: DomainId) -> i64;

    /// The opaque build-config blob recorded when the domain was created.
    fn fetch_build_config(&self, id: DomainId) -> Result<Option<String>, HostError>;

    /// Initiates a resize toward `kb` (guest + videoram scale).
    fn set_memory_target(&self, id: DomainId, kb: u64) -> Result<(), HostError>;

    /// The published memory target in KB, or −1 when the record is gone.
    fn get_target(&self, id: DomainId) -> i64;

    /// Free host memory, not accounting for slack.
    fn free_memory(&self) -> Result<u64, HostError>;

    /// The host-maintained free-memory slack the daemon leaves alone.
    fn free_slack(&self) -> Result<u64, HostError>;

    /// Total physical memory.
    fn physical_memory(&self) -> Result<u64, HostError>;

    /// Minimum configured size of the privileged domain.
    ///
    /// Derived from the hypervisor boot command line where available; the
    /// fallback is the privileged domain's current target, which may drift
    /// from the boot-time value as the domain is resized.
    fn privileged_minsize(&self) -> Result<u64, HostError>;

    /// Polls free memory in 100 ms steps until it reaches `target_kb` or
    /// `timeout_ms` expires. Returns the attained amount.
    fn wait_free_memory(&self, target_kb: u64, timeout_ms: i64) -> Result<u64, HostError>;

    /// Polls free memory in 100 ms steps until five consecutive readings
    /// agree or `timeout_ms` expires. Returns the last reading.
    fn wait_free_memory_stable(&self, timeout_ms: i64) -> Result<u64, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runnable_flags() {
        let mut f = DomainFlags {
            running: true,
            ..Default::default()
        };
        assert!(f.runnable());

        f.paused = true;
        assert!(!f.runnable());

        let f = DomainFlags {
            dying: true,
            ..Default::default()
        };
        assert!(!f.runnable());

        // neither running nor blocked: transition state, still runnable
        let f = DomainFlags::default();
        assert!(f.runnable());
    }

    #[test]
    fn test_tot_kb() {
        let info = HostInfo {
            domain_id: 3,
            tot_pages: 1024,
            outstanding_pages: 0,
            flags: DomainFlags::default(),
        };
        assert_eq!(info.tot_kb(4), 4096);
    }
}
