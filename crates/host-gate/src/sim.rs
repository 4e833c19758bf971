// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! An in-memory host for tests and development mode.
//!
//! [`SimHost`] models the one property of the real mechanism that the
//! engine's enact phase depends on: resizes are asynchronous. A domain's
//! physical allocation moves toward its target in steps, one step per
//! accounting poll, so `wait_free_memory` and the expansion loop see free
//! memory trickle in rather than jump.
//!
//! Simulated time advances 100 ms per wait-poll; the wait methods never
//! sleep for real, keeping tests fast.

use crate::{Alive, DomainFlags, DomainId, HostError, HostGate, HostInfo};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// One simulated domain.
#[derive(Debug, Clone)]
pub struct SimDomain {
    pub id: DomainId,
    /// Physical allocation right now, guest + videoram + private scale (KB).
    pub cur_kb: u64,
    /// Resize target on the guest + videoram scale (KB).
    pub target_kb: u64,
    /// Videoram portion of the target (KB).
    pub videoram_kb: u64,
    /// Hypervisor private data charged to the domain (KB).
    pub xen_data_kb: u64,
    pub flags: DomainFlags,
    /// Seconds since the current incarnation started; −1 when unknown.
    pub uptime_secs: i64,
    /// Build-config blob, if one was recorded.
    pub build_config: Option<String>,
}

impl SimDomain {
    pub fn new(id: DomainId, cur_kb: u64) -> Self {
        Self {
            id,
            cur_kb,
            target_kb: cur_kb,
            videoram_kb: 0,
            xen_data_kb: 0,
            flags: DomainFlags {
                running: true,
                ..Default::default()
            },
            uptime_secs: 3600,
            build_config: None,
        }
    }

    fn goal_total_kb(&self) -> u64 {
        self.target_kb + self.xen_data_kb
    }
}

#[derive(Debug)]
struct SimState {
    physical_kb: u64,
    slack_kb: u64,
    /// Memory used by anything the daemon does not manage.
    other_used_kb: u64,
    privileged_min_kb: u64,
    /// Per balloon step, how much one domain can move toward its target.
    balloon_step_kb: u64,
    domains: BTreeMap<DomainId, SimDomain>,
    sim_time_ms: i64,
}

impl SimState {
    fn free_kb(&self) -> u64 {
        let used: u64 = self.domains.values().map(|d| d.cur_kb).sum();
        self.physical_kb
            .saturating_sub(used)
            .saturating_sub(self.other_used_kb)
    }

    /// Moves every domain one balloon step toward its goal. Expansion only
    /// proceeds while free memory remains.
    fn step_balloons(&mut self) {
        let mut free = self.free_kb();
        let step = self.balloon_step_kb;
        for dom in self.domains.values_mut() {
            let goal = dom.goal_total_kb();
            if dom.cur_kb > goal {
                let delta = (dom.cur_kb - goal).min(step);
                dom.cur_kb -= delta;
                free += delta;
            } else if dom.cur_kb < goal {
                let delta = (goal - dom.cur_kb).min(step).min(free);
                dom.cur_kb += delta;
                free -= delta;
            }
        }
    }
}

/// The simulated host. Interior mutability keeps the [`HostGate`] methods
/// `&self`; the daemon is single-threaded.
#[derive(Debug)]
pub struct SimHost {
    state: RefCell<SimState>,
}

impl SimHost {
    pub fn new(physical_kb: u64, slack_kb: u64) -> Self {
        Self {
            state: RefCell::new(SimState {
                physical_kb,
                slack_kb,
                other_used_kb: 0,
                privileged_min_kb: 512 * 1024,
                balloon_step_kb: 256 * 1024,
                domains: BTreeMap::new(),
                sim_time_ms: 0,
            }),
        }
    }

    pub fn add_domain(&self, dom: SimDomain) {
        self.state.borrow_mut().domains.insert(dom.id, dom);
    }

    pub fn remove_domain(&self, id: DomainId) {
        self.state.borrow_mut().domains.remove(&id);
    }

    /// Claims memory outside the daemon's control (a freshly launched VM,
    /// a manual resize). Shrinks the free pool immediately.
    pub fn claim_external(&self, kb: u64) {
        self.state.borrow_mut().other_used_kb += kb;
    }

    pub fn release_external(&self, kb: u64) {
        let mut s = self.state.borrow_mut();
        s.other_used_kb = s.other_used_kb.saturating_sub(kb);
    }

    pub fn set_privileged_min(&self, kb: u64) {
        self.state.borrow_mut().privileged_min_kb = kb;
    }

    pub fn set_balloon_step(&self, kb: u64) {
        self.state.borrow_mut().balloon_step_kb = kb;
    }

    /// Runs balloon movement to completion.
    pub fn settle(&self) {
        let mut s = self.state.borrow_mut();
        loop {
            let before: Vec<u64> = s.domains.values().map(|d| d.cur_kb).collect();
            s.step_balloons();
            let after: Vec<u64> = s.domains.values().map(|d| d.cur_kb).collect();
            if before == after {
                break;
            }
        }
    }

    /// Reads one domain back, for test assertions.
    pub fn domain(&self, id: DomainId) -> Option<SimDomain> {
        self.state.borrow().domains.get(&id).cloned()
    }

    pub fn set_flags(&self, id: DomainId, flags: DomainFlags) {
        if let Some(d) = self.state.borrow_mut().domains.get_mut(&id) {
            d.flags = flags;
        }
    }

    pub fn set_uptime(&self, id: DomainId, secs: i64) {
        if let Some(d) = self.state.borrow_mut().domains.get_mut(&id) {
            d.uptime_secs = secs;
        }
    }
}

impl HostGate for SimHost {
    fn page_size_kb(&self) -> u64 {
        4
    }

    fn enumerate_domains(&self) -> Result<Vec<DomainId>, HostError> {
        Ok(self.state.borrow().domains.keys().copied().collect())
    }

    fn collect_info(&self) -> Result<HashMap<DomainId, HostInfo>, HostError> {
        let mut s = self.state.borrow_mut();
        s.step_balloons();
        let page = 4;
        Ok(s.domains
            .values()
            .map(|d| {
                (
                    d.id,
                    HostInfo {
                        domain_id: d.id,
                        tot_pages: d.cur_kb / page,
                        outstanding_pages: 0,
                        flags: d.flags,
                    },
                )
            })
            .collect())
    }

    fn domain_info(&self, id: DomainId) -> Result<Option<HostInfo>, HostError> {
        Ok(self.collect_info()?.remove(&id))
    }

    fn domain_alive(&self, id: DomainId) -> Alive {
        if self.state.borrow().domains.contains_key(&id) {
            Alive::Yes
        } else {
            Alive::No
        }
    }

    fn domain_uptime(&self, id: DomainId) -> i64 {
        if id == crate::gate::PRIVILEGED_DOMAIN {
            return -1;
        }
        self.state
            .borrow()
            .domains
            .get(&id)
            .map(|d| d.uptime_secs)
            .unwrap_or(-1)
    }

    fn fetch_build_config(&self, id: DomainId) -> Result<Option<String>, HostError> {
        Ok(self
            .state
            .borrow()
            .domains
            .get(&id)
            .and_then(|d| d.build_config.clone()))
    }

    fn set_memory_target(&self, id: DomainId, kb: u64) -> Result<(), HostError> {
        let mut s = self.state.borrow_mut();
        match s.domains.get_mut(&id) {
            Some(d) => {
                d.target_kb = kb;
                Ok(())
            }
            None => Err(HostError::DomainGone(id)),
        }
    }

    fn get_target(&self, id: DomainId) -> i64 {
        match self.state.borrow().domains.get(&id) {
            Some(d) => (d.target_kb - d.videoram_kb) as i64,
            None => -1,
        }
    }

    fn free_memory(&self) -> Result<u64, HostError> {
        Ok(self.state.borrow().free_kb())
    }

    fn free_slack(&self) -> Result<u64, HostError> {
        Ok(self.state.borrow().slack_kb)
    }

    fn physical_memory(&self) -> Result<u64, HostError> {
        Ok(self.state.borrow().physical_kb)
    }

    fn privileged_minsize(&self) -> Result<u64, HostError> {
        Ok(self.state.borrow().privileged_min_kb)
    }

    fn wait_free_memory(&self, target_kb: u64, timeout_ms: i64) -> Result<u64, HostError> {
        let deadline = self.state.borrow().sim_time_ms + timeout_ms;
        loop {
            let free = {
                let mut s = self.state.borrow_mut();
                s.step_balloons();
                s.sim_time_ms += 100;
                s.free_kb()
            };
            if free >= target_kb {
                return Ok(free);
            }
            if self.state.borrow().sim_time_ms >= deadline {
                return Ok(free);
            }
        }
    }

    fn wait_free_memory_stable(&self, timeout_ms: i64) -> Result<u64, HostError> {
        let deadline = self.state.borrow().sim_time_ms + timeout_ms;
        let mut prev = None;
        let mut matches = 0;
        loop {
            let free = {
                let mut s = self.state.borrow_mut();
                s.step_balloons();
                s.sim_time_ms += 100;
                s.free_kb()
            };
            if prev == Some(free) {
                matches += 1;
            } else {
                matches = 1;
            }
            prev = Some(free);
            if matches >= 5 {
                return Ok(free);
            }
            if self.state.borrow().sim_time_ms >= deadline {
                tracing::error!(timeout_ms, "domain memory movement did not stabilise");
                return Ok(free);
            }
        }
    }
}
