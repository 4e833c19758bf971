// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The engine context and domain lifecycle orchestration.
//!
//! [`Engine`] packages all mutable daemon state behind one value owned by
//! the event loop. Registry transitions with side effects (report slots,
//! interval ACL, trim-to-quota) are driven from here so the registry
//! itself stays free of collaborator handles.

use crate::EngineError;
use config_store::{consts, GlobalConfig};
use domain_registry::pending::{process_pending_domain, PendingVerdict};
use domain_registry::{resolve, DomainRecord, Registry};
use host_gate::{DomainId, HostGate, HostInfo, MonotonicClock, Stamp};
use probe_channel::{channel, paths, KvStore, RetryPolicy};
use std::collections::HashMap;
use std::rc::Rc;

/// Outcome of a `manage-domain` operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageStatus {
    /// Already (or still) managed.
    Managed,
    /// Currently unmanaged.
    Unmanaged,
    /// Being rescanned; classification pending.
    Pending,
    /// The request cannot be honoured (unknown domain, dom0 disabled).
    Rejected,
}

impl ManageStatus {
    /// The single-character wire code.
    pub fn code(&self) -> char {
        match self {
            ManageStatus::Managed => 'M',
            ManageStatus::Unmanaged => 'U',
            ManageStatus::Pending => 'P',
            ManageStatus::Rejected => 'X',
        }
    }
}

/// The balancing engine: all daemon state in one place.
pub struct Engine {
    pub config: GlobalConfig,
    pub registry: Registry,
    pub clock: MonotonicClock,
    host: Rc<dyn HostGate>,
    store: Rc<dyn KvStore>,

    /// Suspends stages 2–4 while non-zero.
    pub pause_level: u32,

    /// Algorithm tick counter. Starts non-zero so 0 can mean "never" and
    /// no "n ticks back" arithmetic wraps past the origin.
    pub(crate) tick: u64,

    /// Set when the published interval value needs (re)writing.
    pub update_interval_in_store: bool,

    /// First managed domain appeared while the scheduler slept.
    resuming: bool,

    start: Stamp,

    // Tick-scope host figures, kept for the freemem engine and status
    // displays.
    pub(crate) host_free: i64,
    pub(crate) xen_free0: i64,
    pub(crate) host_lien0: i64,
    pub(crate) free_slack: i64,
    pub(crate) infos: HashMap<DomainId, HostInfo>,
}

impl Engine {
    pub fn new(
        config: GlobalConfig,
        host: Rc<dyn HostGate>,
        store: Rc<dyn KvStore>,
        clock: MonotonicClock,
    ) -> Self {
        let start = clock.now();
        Self {
            config,
            registry: Registry::new(),
            clock,
            host,
            store,
            pause_level: 0,
            tick: 1000,
            update_interval_in_store: true,
            resuming: false,
            start,
            host_free: 0,
            xen_free0: 0,
            host_lien0: 0,
            free_slack: 0,
            infos: HashMap::new(),
        }
    }

    pub fn host(&self) -> &dyn HostGate {
        &*self.host
    }

    pub(crate) fn host_rc(&self) -> Rc<dyn HostGate> {
        Rc::clone(&self.host)
    }

    pub fn store(&self) -> &dyn KvStore {
        &*self.store
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn page_kb(&self) -> u64 {
        self.host.page_size_kb()
    }

    /// Allocation quantum: one host page.
    pub(crate) fn quantum_kb(&self) -> u64 {
        self.host.page_size_kb()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_xs_retries.value())
    }

    pub(crate) fn sleeper(&self) -> impl Fn(u64) {
        let clock = self.clock;
        move |ms| clock.sleep_ms(ms)
    }

    /// Milliseconds since engine start, on the daemon clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now().diff_ms(self.start)
    }

    // ── Startup ────────────────────────────────────────────────

    /// Reconciles report slots left over from a previous run and enlists
    /// every currently existing domain as Pending.
    pub fn bootstrap(&mut self) -> Result<(), EngineError> {
        let policy = self.retry_policy();
        let sleep = self.sleeper();
        let qids = channel::resync_qids(&*self.store, &policy, &sleep)?;
        self.registry.load_qids(qids);

        let now_ms = self.now_ms();
        for id in self.host.enumerate_domains()? {
            if !self.registry.is_known(id) {
                self.registry.transition_new_pending(id, now_ms);
            }
        }
        self.process_pending_domains()?;
        Ok(())
    }

    // ── Pause / resume ─────────────────────────────────────────

    pub fn pause(&mut self) -> u32 {
        self.pause_level += 1;
        tracing::info!(
            "domain memory adjustment paused by system administrator (pause level {})",
            self.pause_level
        );
        self.pause_level
    }

    pub fn resume(&mut self, force: bool) -> u32 {
        if force {
            self.pause_level = 0;
        } else if self.pause_level > 0 {
            self.pause_level -= 1;
        }
        if self.pause_level == 0 {
            tracing::info!("domain memory adjustment resumed by system administrator");
        } else {
            tracing::info!(
                "domain memory adjustment pause level reduced by system administrator (to {})",
                self.pause_level
            );
        }
        self.pause_level
    }

    // ── Scheduling entry points ────────────────────────────────

    /// One scheduling tick: collect, meet the reserves, rebalance, enact.
    pub fn run_sched_tick(&mut self) -> Result<(), EngineError> {
        self.tick += 1;

        if self.registry.managed_len() == 0 {
            tracing::debug!(tick = self.tick, "sched tick with no managed domains");
            return Ok(());
        }
        tracing::debug!(
            tick = self.tick,
            managed = self.registry.managed_len(),
            paused = self.pause_level > 0,
            "sched tick"
        );

        crate::collect::stage_collect(self)?;

        if self.pause_level != 0 {
            return Ok(());
        }

        crate::reclaim::stage_reserved_hard(self)?;
        crate::reclaim::stage_reserved_soft(self);
        crate::rebalance::stage_rebalance(self)?;
        crate::resize::enact_resizes(self)?;
        Ok(())
    }

    /// Advances the tick counter over a sleep with no managed domains.
    pub fn sched_slept(&mut self, ms: i64) {
        let interval_ms = self.config.interval.value() as i64 * 1000;
        if interval_ms > 0 && ms > 0 {
            self.tick += (ms / interval_ms) as u64;
        }
    }

    /// Whether the scheduler is waking after managed domains reappeared;
    /// reading clears the flag.
    pub fn take_resuming(&mut self) -> bool {
        std::mem::take(&mut self.resuming)
    }

    // ── Pending processing ─────────────────────────────────────

    /// Classifies every Pending domain; called on the 1-second cadence.
    pub fn process_pending_domains(&mut self) -> Result<(), EngineError> {
        if self.registry.pending_len() == 0 {
            return Ok(());
        }

        let mut newly_managed: Vec<DomainId> = Vec::new();
        let timeout_ms = self.config.domain_pending_timeout.value() as i64 * 1000;

        for id in self.registry.pending_ids() {
            let verdict = {
                let config = self.config.clone();
                let host = Rc::clone(&self.host);
                let store = Rc::clone(&self.store);
                let Some(rec) = self.registry.pending_mut(id) else {
                    continue;
                };
                process_pending_domain(rec, &config, &*host, &*store)?
            };

            match verdict {
                PendingVerdict::Dead => self.transition_dead(id),
                PendingVerdict::Manage => {
                    self.registry.transition_pending_managed(id);
                    if self.registry.managed_len() == 1 {
                        self.resuming = true;
                    }
                    newly_managed.push(id);
                }
                PendingVerdict::Unmanage => self.demote_pending(id),
                PendingVerdict::Again => {
                    let now_ms = self.now_ms();
                    let rec = self.registry.pending(id).expect("record is pending");
                    if now_ms - rec.pending_entered_ms > timeout_ms {
                        self.pending_timeout(id);
                    }
                }
            }
        }

        // Give each new managed domain its report slot, then refresh the
        // interval key protection so the new guests can read it.
        let policy = self.retry_policy();
        let sleep = self.sleeper();
        for id in &newly_managed {
            match channel::init_report_slot(&*self.store, &policy, &sleep, *id)? {
                Some(qid) => self.registry.set_qid(*id, qid),
                None => self.unmanage_domain(*id)?,
            }
        }

        if !newly_managed.is_empty() {
            self.refresh_interval_key()?;
        }
        Ok(())
    }

    fn pending_timeout(&mut self, id: DomainId) {
        let timeout = self.config.domain_pending_timeout.value();
        let samples = consts::PRIVATE_DATA_SIZE_SAMPLES;
        if let Some(rec) = self.registry.pending(id) {
            tracing::error!(
                "failed to collect data for domain {} within {} seconds, \
                 treating it as unmanaged by membalance",
                rec.printable_name(),
                timeout
            );
            let missing = rec.missing_data(samples);
            let missing = if missing.is_empty() {
                "nothing".to_string()
            } else {
                missing
            };
            tracing::error!("data missing for domain {}: {}", id, missing);
        }
        self.demote_pending(id);
    }

    fn demote_pending(&mut self, id: DomainId) {
        if let Some(rec) = self.registry.transition_pending_unmanaged(id) {
            if id != 0 || !self.config.dom0_mode.value().is_empty() {
                tracing::info!("will not manage domain {}", rec.printable_name());
            }
        }
    }

    /// Publishes the interval value (when due) and re-applies the ACL for
    /// the current managed set.
    pub fn refresh_interval_key(&mut self) -> Result<(), EngineError> {
        let policy = self.retry_policy();
        let sleep = self.sleeper();
        let managed = self.registry.managed_ids();
        channel::write_interval(
            &*self.store,
            &policy,
            &sleep,
            self.config.interval.value(),
            &managed,
            self.update_interval_in_store,
        )?;
        self.update_interval_in_store = false;
        Ok(())
    }

    // ── Lifecycle side effects ─────────────────────────────────

    /// Managed/Pending → Unmanaged, with the one-shot trim to quota when
    /// the record's settings call for it.
    pub fn unmanage_domain(&mut self, id: DomainId) -> Result<(), EngineError> {
        if let Some(mut rec) = self.registry.transition_managed_unmanaged(id) {
            if rec.trim_unmanaged {
                self.trim_to_quota(&mut rec)?;
            }
        } else {
            self.demote_pending(id);
        }
        Ok(())
    }

    /// Any → Dead, releasing the report slot.
    pub fn transition_dead(&mut self, id: DomainId) {
        if let Some(qid) = self.registry.transition_dead(id) {
            if let Err(e) = channel::release_qid(&*self.store, &qid) {
                tracing::error!(error = %e, %qid, "unable to remove report slot");
            }
        }
    }

    /// Trims a domain above quota down to quota. Returns whether trimming
    /// was initiated.
    pub(crate) fn trim_to_quota(&self, rec: &mut DomainRecord) -> Result<bool, EngineError> {
        crate::resize::trim_to_quota(&*self.host, self.page_kb(), rec)
    }

    // ── Watch events ───────────────────────────────────────────

    /// Reacts to a change notification from the shared namespace.
    pub fn handle_watch_event(&mut self, path: &str) -> Result<(), EngineError> {
        let Some((id, subpath)) = paths::parse_local_domain_path(path) else {
            return Ok(());
        };

        if id == 0 && self.config.dom0_mode.value().is_empty() {
            return Ok(());
        }

        // The domain's root key appearing or vanishing is a create or
        // destroy.
        if subpath.is_empty() {
            let exists = self.store.read(None, &paths::domain_path(id))?.is_some();
            if exists {
                if !self.registry.is_known(id) {
                    let now_ms = self.now_ms();
                    self.registry.transition_new_pending(id, now_ms);
                }
            } else if self.registry.is_known(id) {
                self.transition_dead(id);
            }
            return Ok(());
        }

        let is_managed = matches!(
            self.registry.state_of(id),
            Some(domain_registry::DomainState::Managed)
        );
        let is_tracked = self.registry.record_mut(id).is_some();

        if !is_tracked {
            // For unmanaged domains a change to a size-defining key may
            // unblock resolution: rescan.
            if self.registry.unmanaged_ids().contains(&id)
                && (subpath == "memory/static-max" || subpath == "memory/videoram")
            {
                let exists = self.store.read(None, &paths::domain_path(id))?.is_some();
                if exists {
                    let now_ms = self.now_ms();
                    self.registry.transition_unmanaged_pending(id, now_ms);
                } else {
                    self.transition_dead(id);
                }
            }
            return Ok(());
        }

        enum Value {
            Num(i64),
            Text(String),
            Invalid,
            Missing,
        }

        let read_num = |store: &dyn KvStore, path: &str, min: i64| -> Result<Value, EngineError> {
            match store.read(None, path)? {
                None => Ok(Value::Missing),
                Some(raw) => match raw.trim().parse::<i64>() {
                    Ok(v) if v >= min => Ok(Value::Num(v)),
                    _ => {
                        tracing::error!(%path, %raw, "invalid key value");
                        Ok(Value::Invalid)
                    }
                },
            }
        };

        let (value, resolve_needed) = match subpath {
            "memory/static-max" => (read_num(&*self.store, path, 0)?, true),
            "memory/target" => (read_num(&*self.store, path, 0)?, false),
            "memory/videoram" => (read_num(&*self.store, path, -1)?, true),
            "name" => match self.store.read(None, path)? {
                Some(v) => (Value::Text(v), false),
                None => (Value::Missing, false),
            },
            _ => return Ok(()),
        };

        let ok = {
            let rec = self.registry.record_mut(id).expect("record tracked above");
            match (&value, subpath) {
                (Value::Num(v), "memory/static-max") => {
                    rec.xs_mem_max = *v;
                    true
                }
                (Value::Num(v), "memory/target") => {
                    rec.xs_mem_target = *v;
                    true
                }
                (Value::Num(v), "memory/videoram") => {
                    rec.xs_mem_videoram = *v;
                    true
                }
                (Value::Text(v), "name") => {
                    rec.name = Some(v.clone());
                    true
                }
                _ => false,
            }
        };

        // A deleted subkey usually precedes domain destruction; a bad
        // value makes the domain unmanageable either way.
        if !ok {
            self.unmanage_domain(id)?;
            return Ok(());
        }

        if resolve_needed && is_managed {
            let resolved = {
                let config = self.config.clone();
                let quantum = self.quantum_kb();
                let rec = self.registry.managed_mut(id).expect("managed above");
                resolve::resolve_settings(rec, &config, quantum)
            };
            if !resolved {
                self.unmanage_domain(id)?;
            }
        }
        Ok(())
    }

    // ── Configuration changes ──────────────────────────────────

    /// Installs a freshly loaded configuration and re-examines domains.
    pub fn apply_new_config(&mut self, new: GlobalConfig) -> Result<(), EngineError> {
        let old = std::mem::replace(&mut self.config, new);

        if self.config.interval.value() != old.interval.value() && !self.update_interval_in_store {
            self.update_interval_in_store = true;
            self.refresh_interval_key()?;
        }

        self.rescan_on_config_change(&old)
    }

    fn rescan_on_config_change(&mut self, old: &GlobalConfig) -> Result<(), EngineError> {
        // dom0 enable/disable moves it between the maps.
        let now_ms = self.now_ms();
        if !self.config.dom0_mode.value().is_empty() {
            if self.registry.unmanaged_ids().contains(&0) {
                self.registry.transition_unmanaged_pending(0, now_ms);
            }
        } else {
            match self.registry.state_of(0) {
                Some(domain_registry::DomainState::Managed) => {
                    self.unmanage_domain(0)?;
                }
                Some(domain_registry::DomainState::Pending) => {
                    self.demote_pending(0);
                }
                _ => {}
            }
        }

        // Managed domains re-resolve against the new snapshot; failures
        // drop out.
        for id in self.registry.managed_ids() {
            let resolved = {
                let config = self.config.clone();
                let quantum = self.quantum_kb();
                let Some(rec) = self.registry.managed_mut(id) else {
                    continue;
                };
                resolve::resolve_settings(rec, &config, quantum)
            };
            if !resolved {
                self.unmanage_domain(id)?;
            }
        }

        // Unmanaged domains are re-examined only when the change could
        // alter resolution for them.
        if resolve::resolve_settings_affected(old, &self.config) {
            let now_ms = self.now_ms();
            for id in self.registry.unmanaged_ids() {
                if id != 0 || !self.config.dom0_mode.value().is_empty() {
                    self.registry.transition_unmanaged_pending(id, now_ms);
                }
            }
        }
        Ok(())
    }

    // ── Operator requests ──────────────────────────────────────

    /// `manage-domain` request; `id = −1` rescans all unmanaged domains.
    pub fn rescan_domain(&mut self, id: i64) -> (ManageStatus, String) {
        use domain_registry::DomainState;

        if id == -1 {
            let unmanaged = self.registry.unmanaged_ids();
            let mut any = false;
            let now_ms = self.now_ms();
            for uid in unmanaged {
                if uid == 0 && self.config.dom0_mode.value().is_empty() {
                    continue;
                }
                self.registry.transition_unmanaged_pending(uid, now_ms);
                any = true;
            }
            return if any {
                (
                    ManageStatus::Pending,
                    "Unmanaged domains are being rescanned".to_string(),
                )
            } else {
                (
                    ManageStatus::Managed,
                    "There is currently no unmanaged domains".to_string(),
                )
            };
        }

        if id == 0 && self.config.dom0_mode.value().is_empty() {
            return (
                ManageStatus::Rejected,
                "Dom0 management is disabled".to_string(),
            );
        }

        match self.registry.state_of(id) {
            Some(DomainState::Managed) => (
                ManageStatus::Managed,
                format!("Domain {id} is already managed"),
            ),
            Some(DomainState::Unmanaged) => {
                let now_ms = self.now_ms();
                self.registry.transition_unmanaged_pending(id, now_ms);
                (
                    ManageStatus::Pending,
                    format!("Unmanaged domain {id} is being rescanned"),
                )
            }
            Some(DomainState::Pending) => (
                ManageStatus::Pending,
                format!("Domain {id} is already being rescanned"),
            ),
            None => (ManageStatus::Rejected, format!("Domain {id} does not exist")),
        }
    }

    /// Reports one domain's settings as a key-value list.
    pub fn get_domain_settings(
        &self,
        id: i64,
    ) -> (ManageStatus, String, Vec<(String, String)>) {
        use domain_registry::DomainState;

        let mut kv: Vec<(String, String)> = Vec::new();
        match self.registry.state_of(id) {
            Some(DomainState::Unmanaged) => {
                kv.push(("state".into(), "unmanaged".into()));
                return (ManageStatus::Unmanaged, String::new(), kv);
            }
            Some(DomainState::Pending) => {
                kv.push(("state".into(), "pending".into()));
                return (ManageStatus::Pending, String::new(), kv);
            }
            None => {
                return (
                    ManageStatus::Rejected,
                    format!("Domain {id} does not exist"),
                    kv,
                );
            }
            Some(DomainState::Managed) => {}
        }

        let rec = self.registry.managed(id).expect("state checked above");
        kv.push(("state".into(), "managed".into()));
        kv.push(("domain_id".into(), rec.domain_id.to_string()));
        if let Some(name) = &rec.name {
            kv.push(("vm_name".into(), name.clone()));
        }
        if let Some(uuid) = &rec.uuid {
            kv.push(("vm_uuid".into(), uuid.clone()));
        }
        kv.push(("ctrl_modes_allowed".into(), rec.ctrl_modes_allowed.code()));
        let mode = rec.ctrl_mode.code();
        kv.push((
            "ctrl_mode".into(),
            if mode.is_empty() { "-".to_string() } else { mode },
        ));
        if rec.xs_mem_max >= 0 {
            kv.push(("xs_mem_max".into(), rec.xs_mem_max.to_string()));
        }
        if rec.xs_mem_target >= 0 {
            kv.push(("xs_mem_target".into(), rec.xs_mem_target.to_string()));
        }
        if rec.xs_mem_videoram != domain_registry::VIDEORAM_UNSET {
            kv.push(("xs_mem_videoram".into(), rec.xs_mem_videoram.to_string()));
        }
        if rec.dmem_max >= 0 {
            kv.push(("dmem_max".into(), rec.dmem_max.to_string()));
        }
        if rec.dmem_quota >= 0 {
            kv.push(("dmem_quota".into(), rec.dmem_quota.to_string()));
        }
        if rec.dmem_min >= 0 {
            kv.push(("dmem_min".into(), rec.dmem_min.to_string()));
        }
        if rec.dmem_incr >= 0.0 {
            kv.push(("dmem_incr".into(), format!("{}", rec.dmem_incr * 100.0)));
        }
        if rec.dmem_decr >= 0.0 {
            kv.push(("dmem_decr".into(), format!("{}", rec.dmem_decr * 100.0)));
        }
        if rec.rate_high >= 0 {
            kv.push(("rate_high".into(), rec.rate_high.to_string()));
        }
        if rec.rate_low >= 0 {
            kv.push(("rate_low".into(), rec.rate_low.to_string()));
        }
        if rec.rate_zero >= 0 {
            kv.push(("rate_zero".into(), rec.rate_zero.to_string()));
        }
        if rec.guest_free_threshold >= 0.0 {
            kv.push((
                "guest_free_threshold".into(),
                format!("{}", rec.guest_free_threshold * 100.0),
            ));
        }
        if rec.startup_time >= 0 {
            kv.push(("startup_time".into(), rec.startup_time.to_string()));
        }
        if rec.trim_unresponsive >= 0 {
            kv.push(("trim_unresponsive".into(), rec.trim_unresponsive.to_string()));
        }
        kv.push((
            "trim_unmanaged".into(),
            (rec.trim_unmanaged as i32).to_string(),
        ));

        (ManageStatus::Managed, String::new(), kv)
    }

    // ── Shared collection helpers ──────────────────────────────

    /// Refreshes host accounting and re-derives the per-domain memory
    /// base lines, unmanaging domains the host no longer reports.
    pub fn collect_memory_info(&mut self) -> Result<(), EngineError> {
        self.infos = self.host.collect_info()?;
        let page = self.page_kb();
        let quantum = self.quantum_kb();
        let tick = self.tick;
        for id in self.registry.managed_ids() {
            match self.infos.get(&id).copied() {
                None => {
                    self.unmanage_domain(id)?;
                }
                Some(info) => {
                    let rec = self.registry.managed_mut(id).expect("managed id");
                    rec.record_memory_info(&info, page, quantum, tick);
                }
            }
        }
        Ok(())
    }

    /// Outstanding lien on free memory: paused managed domains whose goal
    /// exceeds their current allocation are still owed the difference.
    pub(crate) fn eval_memory_lien(&self) -> i64 {
        let mut lien = 0;
        for rec in self.registry.managed_iter() {
            if rec.flags.paused {
                lien += (rec.memgoal0 + rec.xen_data_size - rec.memsize0).max(0);
            }
        }
        lien
    }

    /// The latest free-memory figures, for status displays.
    pub fn free_figures(&self) -> (i64, i64) {
        (self.xen_free0, self.free_slack)
    }
}
