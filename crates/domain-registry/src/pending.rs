// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Processing of Pending domains.
//!
//! Called up to once a second per domain. Each pass tries to advance the
//! record through three phases:
//!
//! 1. collect the host-published keys (name, uuid, memory sizes, start
//!    time),
//! 2. capture a stable reading of the hypervisor private-data size (the
//!    difference between possessed pages and the published target), and
//! 3. fetch and parse the build config, then resolve settings.
//!
//! The scan frequency backs off with the number of completed passes so a
//! domain that is slow to initialise does not hammer the host interface:
//! the first 3 cycles run every pass, the next 3 every other, the next 14
//! every fifth, and every tenth from then on.

use crate::record::{round_up, BuildStatus};
use crate::{resolve, DomainRecord, RegistryError};
use config_store::GlobalConfig;
use host_gate::{Alive, HostGate};
use probe_channel::{paths, KvStore};

/// Outcome of one pending pass for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingVerdict {
    /// All data collected and coherent: promote to Managed.
    Manage,
    /// The domain cannot or must not be managed.
    Unmanage,
    /// The host says the domain no longer exists.
    Dead,
    /// Not resolved yet; try again on a later pass.
    Again,
}

/// Forces the next 1-second pass to process this record regardless of the
/// back-off ladder.
fn again_next_second(rec: &mut DomainRecord) -> PendingVerdict {
    rec.skip_counter = 100;
    PendingVerdict::Again
}

/// Runs one pending pass over `rec`.
pub fn process_pending_domain(
    rec: &mut DomainRecord,
    cfg: &GlobalConfig,
    host: &dyn HostGate,
    store: &dyn KvStore,
) -> Result<PendingVerdict, RegistryError> {
    // The privileged domain is only managed when explicitly enabled.
    if rec.domain_id == 0 && cfg.dom0_mode.value().is_empty() {
        return Ok(PendingVerdict::Unmanage);
    }

    // Back-off ladder over completed cycles.
    rec.pending_cycle += 1;
    let due = if rec.pending_cycle <= 3 {
        true
    } else {
        let needed = if rec.pending_cycle <= 6 {
            2
        } else if rec.pending_cycle <= 20 {
            5
        } else {
            10
        };
        rec.skip_counter += 1;
        rec.skip_counter >= needed
    };
    if !due {
        return Ok(PendingVerdict::Again);
    }
    rec.skip_counter = 0;

    tracing::debug!("processing pending domain {}", rec.printable_name());

    if !rec.is_published_data_complete() {
        match read_published_keys(rec, store)? {
            ReadOutcome::Proceed => {}
            ReadOutcome::Again => return Ok(PendingVerdict::Again),
            ReadOutcome::Unmanage => return Ok(PendingVerdict::Unmanage),
            ReadOutcome::Dead => return Ok(PendingVerdict::Dead),
        }
    } else if host.domain_alive(rec.domain_id) == Alive::No {
        return Ok(PendingVerdict::Dead);
    }

    // Capture the hypervisor private-data size over consecutive stable
    // 1-second samples. Any change restarts the run.
    let samples = config_store::consts::PRIVATE_DATA_SIZE_SAMPLES;
    if rec.xen_data_size_phase < samples {
        let prev = rec.xen_data_size;
        match eval_private_size(rec, host)? {
            PrivateSizeOutcome::Have => {}
            PrivateSizeOutcome::AgainSoon => return Ok(again_next_second(rec)),
            PrivateSizeOutcome::Again => return Ok(PendingVerdict::Again),
            PrivateSizeOutcome::Dead => return Ok(PendingVerdict::Dead),
        }

        if rec.xen_data_size_phase == 0 || prev != rec.xen_data_size {
            rec.xen_data_size_phase = 1;
            return Ok(again_next_second(rec));
        }
        rec.xen_data_size_phase += 1;
        if rec.xen_data_size_phase < samples {
            return Ok(again_next_second(rec));
        }
    }

    // Fetch and parse the build config.
    if rec.build_status == BuildStatus::NotFetched {
        match host.fetch_build_config(rec.domain_id) {
            Ok(Some(blob)) if !blob.is_empty() => {
                let source = format!("config for domain {}", rec.printable_name());
                resolve::parse_build_config(rec, &blob, &source);
            }
            Ok(_) => {
                // A transient condition can return an empty blob while the
                // domain is still being brought up; re-read later.
                tracing::debug!(
                    "host returned empty config for domain {}, will retry reading",
                    rec.printable_name()
                );
                return Ok(PendingVerdict::Again);
            }
            Err(e) if e.is_gone() => return Ok(PendingVerdict::Dead),
            Err(e) => return Err(e.into()),
        }
    }

    match rec.build_status {
        BuildStatus::Parsed => {
            if rec.resolved_config_seq == cfg.seq {
                Ok(PendingVerdict::Manage)
            } else if resolve::resolve_settings(rec, cfg, host.page_size_kb()) {
                rec.resolved_config_seq = cfg.seq;
                Ok(PendingVerdict::Manage)
            } else {
                Ok(PendingVerdict::Unmanage)
            }
        }
        BuildStatus::Failed => Ok(PendingVerdict::Unmanage),
        BuildStatus::NotFetched => Ok(PendingVerdict::Again),
    }
}

enum ReadOutcome {
    Proceed,
    Again,
    Unmanage,
    Dead,
}

/// Reads the not-yet-collected host-published keys in one consistent
/// snapshot.
fn read_published_keys(
    rec: &mut DomainRecord,
    store: &dyn KvStore,
) -> Result<ReadOutcome, RegistryError> {
    let txn = store.begin()?;
    let out = read_published_keys_in(rec, store, txn);
    store.abort(txn);
    out
}

fn read_published_keys_in(
    rec: &mut DomainRecord,
    store: &dyn KvStore,
    txn: probe_channel::TxnId,
) -> Result<ReadOutcome, RegistryError> {
    let id = rec.domain_id;
    let mut exists = false;

    if rec.name.is_none() {
        if let Some(v) = store.read(Some(txn), &paths::name_path(id))? {
            rec.name = Some(v);
            exists = true;
        }
    }

    if rec.uuid.is_none() && id != 0 {
        // The root domain's tree has no vm subkey.
        if let Some(v) = store.read(Some(txn), &paths::vm_path(id))? {
            match v.strip_prefix("/vm/") {
                Some(uuid) => {
                    rec.uuid = Some(uuid.to_string());
                    exists = true;
                }
                None => {
                    tracing::error!(
                        "unexpected value of key ({}), will not manage domain {} (name: {})",
                        paths::vm_path(id),
                        id,
                        rec.name.as_deref().unwrap_or("<unknown>")
                    );
                    return Ok(ReadOutcome::Unmanage);
                }
            }
        }
    }

    if rec.xs_mem_max == -1 {
        match read_numeric(store, txn, &paths::mem_static_max_path(id), 0)? {
            Numeric::Value(v) => {
                rec.xs_mem_max = v;
                exists = true;
            }
            Numeric::Invalid => return Ok(ReadOutcome::Unmanage),
            Numeric::Missing => {}
        }
    }

    if rec.xs_mem_target == -1 {
        match read_numeric(store, txn, &paths::mem_target_path(id), 0)? {
            Numeric::Value(v) => {
                rec.xs_mem_target = v;
                exists = true;
            }
            Numeric::Invalid => return Ok(ReadOutcome::Unmanage),
            Numeric::Missing => {}
        }
    }

    if rec.xs_mem_videoram == crate::VIDEORAM_UNSET {
        match read_numeric(store, txn, &paths::mem_videoram_path(id), -1)? {
            Numeric::Value(v) => {
                rec.xs_mem_videoram = v;
                exists = true;
            }
            Numeric::Invalid => return Ok(ReadOutcome::Unmanage),
            Numeric::Missing => {}
        }
    }

    // The root domain publishes no videoram key at all.
    if id == 0
        && rec.xs_mem_videoram == crate::VIDEORAM_UNSET
        && rec.xs_mem_max != -1
        && rec.xs_mem_target != -1
    {
        rec.xs_mem_videoram = 0;
    }

    if rec.start_time.is_none() && id != 0 {
        if let Some(uuid) = rec.uuid.clone() {
            // One of the last markers of guest bring-up; required for
            // uptime queries to mean anything.
            if let Some(v) = store.read(Some(txn), &paths::vm_start_time_path(&uuid))? {
                rec.start_time = Some(v);
                exists = true;
            }
        }
    }

    if !exists && store.read(Some(txn), &paths::domain_path(id))?.is_none() {
        return Ok(ReadOutcome::Dead);
    }

    if !rec.is_published_data_complete() {
        return Ok(ReadOutcome::Again);
    }

    Ok(ReadOutcome::Proceed)
}

enum Numeric {
    Value(i64),
    Missing,
    Invalid,
}

fn read_numeric(
    store: &dyn KvStore,
    txn: probe_channel::TxnId,
    path: &str,
    min: i64,
) -> Result<Numeric, RegistryError> {
    let Some(raw) = store.read(Some(txn), path)? else {
        return Ok(Numeric::Missing);
    };
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= min => Ok(Numeric::Value(v)),
        Ok(v) => {
            tracing::error!(%path, value = v, "key value below minimum ({min})");
            Ok(Numeric::Invalid)
        }
        Err(_) => {
            tracing::error!(%path, %raw, "key value is not numeric");
            Ok(Numeric::Invalid)
        }
    }
}

enum PrivateSizeOutcome {
    Have,
    /// Sample again in one second.
    AgainSoon,
    /// Sample again on a later pass.
    Again,
    Dead,
}

/// Takes one private-data-size sample:
/// `tot_pages · page − round_up(target + videoram, quantum)`.
fn eval_private_size(
    rec: &mut DomainRecord,
    host: &dyn HostGate,
) -> Result<PrivateSizeOutcome, RegistryError> {
    let Some(info) = host.domain_info(rec.domain_id)? else {
        return Ok(PrivateSizeOutcome::Dead);
    };

    if !info.flags.runnable() {
        // a paused or dying domain's sizing is frozen mid-move
        return Ok(PrivateSizeOutcome::Again);
    }

    let page = host.page_size_kb();

    // With free memory depleted, allocation can trail the target for a
    // long time; that gap must not be mistaken for private size.
    if host.free_memory()? < page * 100 {
        return Ok(PrivateSizeOutcome::AgainSoon);
    }

    if info.outstanding_pages != 0 {
        return Ok(PrivateSizeOutcome::AgainSoon);
    }

    let curr_size = info.tot_kb(page) as i64;
    let goal = round_up(rec.xs_mem_target + rec.xs_mem_videoram, page as i64);
    let mut xds = curr_size - goal;

    if xds < 0 {
        return Ok(PrivateSizeOutcome::AgainSoon);
    }

    if xds % page as i64 != 0 {
        tracing::error!(
            "private data size is not a multiple of pages for domain {}",
            rec.printable_name()
        );
        xds -= xds % page as i64;
    }

    rec.xen_data_size = xds;
    Ok(PrivateSizeOutcome::Have)
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_gate::{SimDomain, SimHost};
    use probe_channel::MemStore;

    const BLOB: &str = "\
memory = 1024
membalance_mode = \"auto\"
membalance_dmem_min = 512mb
membalance_dmem_quota = 1024mb
membalance_dmem_max = 2048mb
";

    fn sim_setup(id: i64) -> (SimHost, MemStore) {
        let host = SimHost::new(16 * 1024 * 1024, 128 * 1024);
        let mut dom = SimDomain::new(id, 1024 * 1024 + 2048);
        dom.target_kb = 1024 * 1024;
        dom.xen_data_kb = 2048;
        dom.build_config = Some(BLOB.to_string());
        host.add_domain(dom);

        let store = MemStore::new();
        store.write(None, &paths::domain_path(id), "").unwrap();
        store.write(None, &paths::name_path(id), "web").unwrap();
        store.write(None, &paths::vm_path(id), "/vm/u-web").unwrap();
        store
            .write(None, &paths::mem_static_max_path(id), &(4096 * 1024).to_string())
            .unwrap();
        store
            .write(None, &paths::mem_target_path(id), &(1024 * 1024).to_string())
            .unwrap();
        store.write(None, &paths::mem_videoram_path(id), "-1").unwrap();
        store
            .write(None, "/vm/u-web/start_time", "1700000000.00")
            .unwrap();
        (host, store)
    }

    /// Runs pending passes until the verdict settles or `limit` is hit.
    fn drive(
        rec: &mut DomainRecord,
        cfg: &GlobalConfig,
        host: &SimHost,
        store: &MemStore,
        limit: u32,
    ) -> PendingVerdict {
        for _ in 0..limit {
            match process_pending_domain(rec, cfg, host, store).unwrap() {
                PendingVerdict::Again => continue,
                v => return v,
            }
        }
        PendingVerdict::Again
    }

    #[test]
    fn test_full_pending_run_promotes() {
        let (host, store) = sim_setup(5);
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        rec.on_enter_pending(0);

        let verdict = drive(&mut rec, &cfg, &host, &store, 32);
        assert_eq!(verdict, PendingVerdict::Manage);
        assert_eq!(rec.name.as_deref(), Some("web"));
        assert_eq!(rec.uuid.as_deref(), Some("u-web"));
        assert_eq!(rec.xs_mem_videoram, -1);
        assert_eq!(rec.xen_data_size, 2048);
        assert_eq!(rec.dmem_quota, 1024 * 1024);
        assert_eq!(rec.resolved_config_seq, cfg.seq);
    }

    #[test]
    fn test_dom0_unmanaged_by_default() {
        let (host, store) = sim_setup(0);
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(0);
        assert_eq!(
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap(),
            PendingVerdict::Unmanage
        );
    }

    #[test]
    fn test_dead_domain_detected() {
        let (host, store) = sim_setup(5);
        host.remove_domain(5);
        store.remove(None, &paths::domain_path(5)).unwrap();
        // also remove published keys so collection cannot proceed
        store.remove(None, &paths::name_path(5)).unwrap();
        store.remove(None, &paths::vm_path(5)).unwrap();
        store.remove(None, &paths::mem_static_max_path(5)).unwrap();
        store.remove(None, &paths::mem_target_path(5)).unwrap();
        store.remove(None, &paths::mem_videoram_path(5)).unwrap();

        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        assert_eq!(
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap(),
            PendingVerdict::Dead
        );
    }

    #[test]
    fn test_bad_vm_key_unmanages() {
        let (host, store) = sim_setup(5);
        store.write(None, &paths::vm_path(5), "garbage").unwrap();
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        assert_eq!(
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap(),
            PendingVerdict::Unmanage
        );
    }

    #[test]
    fn test_nonnumeric_size_key_unmanages() {
        let (host, store) = sim_setup(5);
        store
            .write(None, &paths::mem_static_max_path(5), "lots")
            .unwrap();
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        assert_eq!(
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap(),
            PendingVerdict::Unmanage
        );
    }

    #[test]
    fn test_off_mode_unmanages() {
        let (host, store) = sim_setup(5);
        if let Some(mut d) = host.domain(5) {
            d.build_config = Some("memory = 1024\nmembalance_mode = \"off\"\n".to_string());
            host.remove_domain(5);
            host.add_domain(d);
        }
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        rec.on_enter_pending(0);
        assert_eq!(drive(&mut rec, &cfg, &host, &store, 32), PendingVerdict::Unmanage);
    }

    #[test]
    fn test_backoff_ladder_skips() {
        let (host, store) = sim_setup(5);
        // remove the name key so the domain can never complete
        store.remove(None, &paths::name_path(5)).unwrap();
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);

        // cycles 1-3 process every pass (skip counter untouched)
        for _ in 0..3 {
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
            assert_eq!(rec.skip_counter, 0);
        }
        // cycle 4 is skipped, cycle 5 processes
        process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
        assert_eq!(rec.skip_counter, 1);
        process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
        assert_eq!(rec.skip_counter, 0);
    }

    #[test]
    fn test_private_size_restarts_on_change() {
        let (host, store) = sim_setup(5);
        let cfg = GlobalConfig::defaults();
        let mut rec = DomainRecord::new(5);
        rec.on_enter_pending(0);

        // collect published keys first
        while !rec.is_published_data_complete() {
            process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
        }

        // first sample
        process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
        assert_eq!(rec.xen_data_size_phase, 1);

        // grow the domain's private part: the capture must restart
        if let Some(mut d) = host.domain(5) {
            d.xen_data_kb += 8;
            d.cur_kb += 8;
            host.remove_domain(5);
            host.add_domain(d);
        }
        process_pending_domain(&mut rec, &cfg, &host, &store).unwrap();
        assert_eq!(rec.xen_data_size_phase, 1);
    }
}
