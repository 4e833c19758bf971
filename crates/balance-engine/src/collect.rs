// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stage 1: data collection.
//!
//! Snapshots host free memory and per-domain accounting, drains the guest
//! report slots, folds fresh reports into the rate averages, and computes
//! each domain's base line and per-tick resize caps. Domains that stayed
//! silent reuse the previous tick's report once; longer silence drops them
//! from normal participation and, past `trim_unresponsive`, triggers a
//! one-shot trim to quota.
//!
//! Any free-memory reading is a spot value: domains outside the daemon's
//! control may be mid-resize, and the host exposes no commitment tracking.
//! The only lien that can be accounted for is paused managed domains with
//! an expansion still owed.

use crate::{Engine, EngineError};
use config_store::consts;
use probe_channel::{channel, GuestReport};

pub(crate) fn stage_collect(eng: &mut Engine) -> Result<(), EngineError> {
    eng.free_slack = eng.host().free_slack()? as i64;
    eng.xen_free0 = eng.host().free_memory()? as i64;

    eng.infos = eng.host().collect_info()?;

    let slots = eng.registry.managed_slots();
    let policy = eng.retry_policy();
    let sleep = eng.sleeper();
    let mut reports = channel::drain_reports(eng.store(), &policy, &sleep, &slots)?;

    let page = eng.host().page_size_kb();
    let quantum = page;
    let tick = eng.tick;
    let interval = eng.config.interval.value();
    let samples = consts::PRIVATE_DATA_SIZE_SAMPLES;
    let xen_free0 = eng.xen_free0;

    // First pass: memory accounting per domain; unmanage the ones the
    // host no longer reports.
    for id in eng.registry.managed_ids() {
        match eng.infos.get(&id).copied() {
            None => {
                eng.unmanage_domain(id)?;
            }
            Some(info) => {
                let rec = eng.registry.managed_mut(id).expect("managed id");
                rec.begin_sched_tick();
                rec.record_memory_info(&info, page, quantum, tick);
                rec.reset_preshrink();
                rec.reeval_xen_data_size(xen_free0, page, samples);
            }
        }
    }

    // Second pass: fold in reports and decide per-domain validity.
    for id in eng.registry.managed_ids() {
        let raw = reports.remove(&id);

        let parsed = match raw {
            None => None,
            Some(raw) => match GuestReport::parse(&raw) {
                Ok(rep) => Some(rep),
                Err(e) => {
                    let name = eng
                        .registry
                        .managed(id)
                        .map(|r| r.printable_name())
                        .unwrap_or_else(|| id.to_string());
                    tracing::debug!(report = %raw, error = %e, "domain {name} reported malformatted data");
                    tracing::error!(
                        "unmanaging domain {name} because it submitted malformatted report"
                    );
                    eng.unmanage_domain(id)?;
                    continue;
                }
            },
        };

        let pause_level = eng.pause_level;
        let mut trim_request: Option<i64> = None;
        {
            let Some(rec) = eng.registry.managed_mut(id) else {
                continue;
            };

            match parsed {
                Some(rep) => {
                    rec.intake_report(&rep, tick, interval);
                }
                None if rec.flags.runnable() => {
                    rec.no_report_time += interval as i64;
                    if rec.trim_unresponsive > 0
                        && rec.no_report_time > rec.trim_unresponsive
                        && pause_level == 0
                    {
                        trim_request = Some(id);
                    }
                }
                None => {}
            }
        }

        if let Some(id) = trim_request.take() {
            let trimmed = {
                let host = eng.host_rc();
                let rec = eng.registry.managed_mut(id).expect("managed id");
                crate::resize::trim_to_quota(&*host, page, rec)?
            };
            if trimmed {
                let rec = eng.registry.managed_mut(id).expect("managed id");
                rec.trimming_to_quota = true;
                // The freed memory may take a while to materialise and is
                // partly reflected in later free readings already; it is
                // not credited to host_free here.
                rec.memgoal0 = rec.dmem_quota;
                rec.memsize0 = rec.dmem_quota;
                rec.memsize = rec.dmem_quota;
                continue;
            }
        }

        let rec = eng.registry.managed_mut(id).expect("managed id");
        if !rec.flags.runnable() {
            continue;
        }
        // Without a report this tick, last tick's data is reused once.
        if tick > rec.last_report_tick + 1 {
            continue;
        }
        rec.valid_data = true;

        tracing::trace!(
            domain = %rec.printable_name(),
            memsize = rec.memsize,
            memsize_incr = rec.memsize_incr,
            memsize_decr = rec.memsize_decr,
            rate = rec.rate,
            slow_rate = rec.slow_rate,
            fast_rate = rec.fast_rate,
            freepct = rec.freepct,
            "collected domain"
        );
    }

    // Free memory less slack and lien, the figure the reserves defend.
    eng.host_lien0 = eng.eval_memory_lien();
    eng.xen_free0 = eng.host().free_memory()? as i64;
    eng.host_free = eng.xen_free0 - eng.free_slack - eng.host_lien0;

    tracing::trace!(
        host_free = eng.host_free,
        lien = eng.host_lien0,
        slack = eng.free_slack,
        "free memory less slack"
    );

    Ok(())
}
