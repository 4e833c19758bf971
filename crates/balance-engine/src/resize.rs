// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Enacting the planned resizes.
//!
//! Shrinks go out first, biggest givers leading. Expansions follow in
//! expand-force order, but the host does not release shrinker memory
//! instantly: the loop re-reads current sizes, grants each expander only
//! what two accountings allow (from the tick-start figures plus memory
//! actually released, and from the live free reading), and waits in
//! 100 ms steps for more to come back. It gives up after a bounded number
//! of no-progress cycles or when the per-tick wait budget runs out;
//! whatever expansion is left over waits for the next tick.
//!
//! Shortfalls under 1 MB per shrinker are expected drift of the
//! hypervisor's private per-domain allocation and log at debug only.

use crate::{Engine, EngineError};
use config_store::consts;
use domain_registry::{round_down, round_up, DomainRecord};
use host_gate::{DomainId, HostGate, HostInfo};
use std::collections::HashMap;

/// Issues a resize and re-reads the published target, which the mechanism
/// may have silently clamped.
///
/// Returns `Ok(false)` when the domain is gone; the next collection pass
/// will retire it.
pub(crate) fn set_target_checked(
    host: &dyn HostGate,
    quantum_kb: u64,
    rec: &mut DomainRecord,
    kb: i64,
) -> Result<bool, EngineError> {
    let mut kb = kb;
    if kb % quantum_kb as i64 != 0 {
        tracing::error!(
            domain = rec.domain_id,
            kb,
            "resize target is not a multiple of the allocation quant"
        );
        kb = round_up(kb, quantum_kb as i64);
    }

    match host.set_memory_target(rec.domain_id, kb as u64) {
        Ok(()) => {}
        Err(e) if e.is_gone() => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let rsize = host.get_target(rec.domain_id);
    if rsize == -1 {
        return Ok(false);
    }
    rec.xs_mem_target = rsize;

    if rec.xs_mem_target + rec.xs_mem_videoram == kb {
        return Ok(true);
    }

    // Discrepancy: distinguish a dying domain from a clamped request.
    match host.domain_info(rec.domain_id)? {
        None => Ok(false),
        Some(info) if info.flags.dying || info.flags.shutdown => Ok(false),
        Some(_) => {
            tracing::error!(
                "unable to resize domain {}, requested size: {}, actual size: {}",
                rec.printable_name(),
                kb,
                rec.xs_mem_target + rec.xs_mem_videoram
            );
            Ok(true)
        }
    }
}

/// Trims a domain above quota down to its quota.
pub(crate) fn trim_to_quota(
    host: &dyn HostGate,
    page_kb: u64,
    rec: &mut DomainRecord,
) -> Result<bool, EngineError> {
    if rec.dmem_quota < 0 {
        return Ok(false);
    }
    let goal = round_up(rec.xs_mem_target + rec.xs_mem_videoram, page_kb as i64);
    if goal <= rec.dmem_quota {
        return Ok(false);
    }

    tracing::debug!(
        "trimming domain {} down to quota, {} kbs -> {} kbs",
        rec.printable_name(),
        goal,
        rec.dmem_quota
    );

    match set_target_checked(host, page_kb, rec, rec.dmem_quota) {
        Ok(ok) => Ok(ok),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "unable to trim domain {} memory allocation down to its quota",
                rec.printable_name()
            );
            Ok(false)
        }
    }
}

fn do_resize(
    host: &dyn HostGate,
    quantum_kb: u64,
    rec: &mut DomainRecord,
    size: i64,
    verb: &str,
) -> Result<(), EngineError> {
    match set_target_checked(host, quantum_kb, rec, size) {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "unable to {verb} memory allocation for domain {}",
                rec.printable_name()
            );
            Ok(())
        }
    }
}

fn log_resize(rec: &DomainRecord, action: &str) {
    let delta = rec.memsize - rec.memsize0;
    tracing::debug!(
        "{action} domain {} ({} kb -> {} kb) by [{}] {} kbs",
        rec.printable_name(),
        rec.memsize0,
        rec.memsize,
        if delta > 0 { "+" } else { "-" },
        delta.abs()
    );
}

/// A movement already in progress has overshot the re-planned goal:
/// redirect it.
fn regoal(
    host: &dyn HostGate,
    quantum_kb: u64,
    rec: &mut DomainRecord,
    size: i64,
) -> Result<(), EngineError> {
    do_resize(host, quantum_kb, rec, size, "redirect")?;
    rec.memgoal0 = size;
    tracing::debug!("regoal domain {}", rec.printable_name());
    Ok(())
}

pub(crate) fn enact_resizes(eng: &mut Engine) -> Result<(), EngineError> {
    let host = eng.host_rc();
    let quantum = eng.quantum_kb();
    let page = eng.page_kb() as i64;
    let hard = eng.config.host_reserved_hard.value() as i64;

    let mut vec_up: Vec<DomainId> = Vec::new();
    let mut vec_down: Vec<DomainId> = Vec::new();

    for id in eng.registry.managed_ids() {
        let host_free = eng.host_free;
        let rec = eng.registry.managed_mut(id).expect("managed id");
        if !rec.flags.runnable() {
            continue;
        }

        // Bug-catching sieves: no stage may plan below the minimum while
        // free memory remains above the hard reserve, nor above the
        // maximum (unless the domain arrived oversized and is moving
        // down).
        if rec.memsize < rec.dmem_min && host_free > hard {
            tracing::error!(
                "planned size for domain {} below dmem_min",
                rec.printable_name()
            );
            let delta = (rec.dmem_min - rec.memsize).min(host_free - hard);
            rec.memsize += delta;
            eng.host_free -= delta;
        }
        let rec = eng.registry.managed_mut(id).expect("managed id");
        if rec.memsize > rec.dmem_max && !(rec.memsize0 > rec.dmem_max && rec.memsize <= rec.memsize0)
        {
            tracing::error!(
                "planned size for domain {} above dmem_max",
                rec.printable_name()
            );
            eng.host_free += rec.memsize - rec.dmem_max;
            let rec = eng.registry.managed_mut(id).expect("managed id");
            rec.memsize = rec.dmem_max;
        }

        let rec = eng.registry.managed_mut(id).expect("managed id");
        if rec.memsize > rec.memsize0 {
            vec_up.push(id);
            if rec.memgoal0 > rec.memsize {
                let target = rec.memsize;
                regoal(&*host, quantum, rec, target)?;
            }
        } else if rec.memsize < rec.memsize0 {
            vec_down.push(id);
            if rec.memgoal0 < rec.memsize {
                let target = rec.memsize;
                regoal(&*host, quantum, rec, target)?;
            }
        }
        // When the plan leaves the size unchanged the goal is left alone
        // even if it deviates: driving it back would keep the domain
        // size-unstable forever and the private-size re-capture could
        // never converge on a drifted value.
    }

    // Shrinks first, biggest givers leading.
    vec_down.sort_by_key(|id| {
        let r = eng.registry.managed(*id).expect("managed");
        r.memsize - r.memsize0
    });

    // Expansions in the order of the forces frozen at rebalance start.
    vec_up.sort_by(|a, b| {
        let fa = eng.registry.managed(*a).expect("managed").expand_force0;
        let fb = eng.registry.managed(*b).expect("managed").expand_force0;
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });

    for &id in &vec_down {
        let rec = eng.registry.managed_mut(id).expect("managed id");
        log_resize(rec, "shrink");
        let target = rec.memsize;
        do_resize(&*host, quantum, rec, target, "shrink")?;
    }

    // The host tracks no memory liens, so expansion accounting is an
    // approximation rebuilt from two directions on every pass.
    let ts0 = eng.clock.now();
    let mut allocated: i64 = 0;
    let mut xinfo = host.collect_info()?;
    let mut nomem_cycles: u32 = 0;
    let mut warn = false;

    struct Prev {
        dom: Option<DomainId>,
        goal: i64,
        alloc: i64,
    }
    let mut prev = Prev {
        dom: None,
        goal: 0,
        alloc: 0,
    };

    while !vec_up.is_empty() {
        let id = vec_up[0];

        let Some(info) = xinfo.get(&id).copied() else {
            vec_up.remove(0);
            continue;
        };

        if prev.dom != Some(id) {
            let rec = eng.registry.managed(id).expect("managed");
            prev.dom = Some(id);
            prev.goal = rec.memgoal0;
            prev.alloc = rec.memsize0;
        }

        let curr_size = {
            let rec = eng.registry.managed(id).expect("managed");
            info.tot_kb(page as u64) as i64 - rec.xen_data_size
        };

        let goal = eval_allocate(eng, &*host, id, curr_size, prev.alloc, &vec_down, &xinfo, allocated)?;

        if goal > prev.goal {
            let rec = eng.registry.managed_mut(id).expect("managed id");
            do_resize(&*host, quantum, rec, goal, "expand")?;
            allocated += goal - prev.alloc;
            prev.alloc = goal;
            prev.goal = goal;
            let tick = eng.tick;
            let rec = eng.registry.managed_mut(id).expect("managed id");
            rec.last_expand_tick = tick;
            nomem_cycles = 0;
        }

        if goal == eng.registry.managed(id).expect("managed").memsize {
            log_resize(eng.registry.managed(id).expect("managed"), "expand");
            vec_up.remove(0);
            continue;
        }

        // Not enough memory yet. Wait for shrinkers to deliver, within
        // the budget; during this wait the daemon services nothing else.
        if nomem_cycles >= consts::DOMAIN_EXPANSION_TIMEOUT_ABORT || vec_down.is_empty() {
            warn = true;
            break;
        }
        let budget_ms = (consts::DOMAIN_EXPANSION_TIMEOUT_MAX_SECS as i64 * 1000).min(
            (consts::DOMAIN_EXPANSION_TIMEOUT_FRAC * eng.config.interval.value() as f64 * 1000.0)
                as i64,
        );
        let remaining = budget_ms - eng.clock.now().diff_ms(ts0);
        if remaining <= 0 {
            break;
        }
        eng.clock.sleep_ms(remaining.min(100) as u64);
        xinfo = host.collect_info()?;
        nomem_cycles += 1;
    }

    if !vec_up.is_empty() {
        let head = vec_up[0];
        let partial = prev.dom == Some(head)
            && prev.goal != eng.registry.managed(head).expect("managed").memgoal0;

        let shortage = mem_shortage(eng, &vec_up, partial, prev.goal);
        if shortage <= 1024 * vec_down.len() as i64 {
            warn = false;
        }
        log_unexpanded(eng, vec_up, warn, partial, prev.goal, shortage);
    }

    Ok(())
}

/// How much can be granted to expand `id` right now. Accounts both from
/// the tick-start snapshot (free at start, memory actually released by
/// shrinkers, memory already granted) and from the live free reading,
/// and takes the minimum.
#[allow(clippy::too_many_arguments)]
fn eval_allocate(
    eng: &Engine,
    host: &dyn HostGate,
    id: DomainId,
    curr_size: i64,
    prev_alloc: i64,
    vec_down: &[DomainId],
    xinfo: &HashMap<DomainId, HostInfo>,
    allocated: i64,
) -> Result<i64, EngineError> {
    let page = eng.page_kb() as i64;
    let hard = eng.config.host_reserved_hard.value() as i64;

    // The hard reserve applies regardless of the requester's pressure:
    // this can be a transfer between domains with the overall residue
    // legitimately below the soft reserve.
    let mut m1 = eng.xen_free0 - hard - eng.free_slack - eng.host_lien0
        + mem_released_by(eng, vec_down, xinfo)
        - allocated;
    m1 = m1.max(0);
    m1 = round_down(m1, page);
    m1 += prev_alloc;

    let mut m2 = host.free_memory()? as i64 - hard - eng.free_slack - eng.host_lien0;
    m2 = m2.max(0);
    m2 = round_down(m2, page);
    m2 += curr_size;

    let rec = eng.registry.managed(id).expect("managed");
    let mut m = m1.min(m2);
    m = m.max(rec.memsize0); // expanding: never push below the base line
    m = m.min(rec.memsize); // never beyond the planned goal

    tracing::trace!(
        domain = id,
        curr = curr_size,
        goal = m,
        m1,
        m2,
        memsize0 = rec.memsize0,
        memsize = rec.memsize,
        "eval_allocate"
    );

    Ok(m)
}

/// Memory released so far by the shrinking domains, from the live size
/// snapshot. Domains that vanished mid-flight are credited conservatively.
fn mem_released_by(eng: &Engine, vec_down: &[DomainId], xinfo: &HashMap<DomainId, HostInfo>) -> i64 {
    let page = eng.page_kb() as u64;
    let mut sum = 0;

    for &id in vec_down {
        let Some(rec) = eng.registry.managed(id) else {
            continue;
        };
        if let Some(info) = xinfo.get(&id) {
            let oldsize = rec.memsize0 + rec.xen_data_size;
            let newsize = info.tot_kb(page) as i64;
            sum += oldsize - newsize;
        }
    }

    for rec in eng.registry.managed_iter() {
        if !xinfo.contains_key(&rec.domain_id) {
            sum += rec.memsize0.min(rec.memsize) + rec.xen_data_size;
        }
    }

    sum
}

/// By how much this tick's expansions fell short of their goals.
fn mem_shortage(eng: &Engine, vec_up: &[DomainId], partial: bool, prev_goal: i64) -> i64 {
    let mut shortage = 0;
    for (k, &id) in vec_up.iter().enumerate() {
        let rec = eng.registry.managed(id).expect("managed");
        if k == 0 && partial {
            shortage += (rec.memsize - prev_goal).max(0);
        } else {
            shortage += (rec.memsize - rec.memsize0).max(0);
        }
    }
    shortage
}

/// Logs the domains left unexpanded or partially expanded.
fn log_unexpanded(
    eng: &Engine,
    mut vec_up: Vec<DomainId>,
    warn: bool,
    partial: bool,
    prev_goal: i64,
    shortage: i64,
) {
    let mut nshort = 0;

    if partial {
        let rec = eng.registry.managed(vec_up[0]).expect("managed");
        tracing::debug!(
            "domain {} was expanded partially, short by {} kbs",
            rec.printable_name(),
            rec.memsize - prev_goal
        );
        vec_up.remove(0);
        nshort += 1;
    }

    for id in vec_up {
        let rec = eng.registry.managed(id).expect("managed");
        log_resize(rec, "will not expand");
        nshort += 1;
    }

    if nshort != 0 && warn {
        tracing::warn!(
            "was unable to {}expand {} domain{} in the current tick, memory shortage = {} kbs",
            if partial { "fully " } else { "" },
            nshort,
            if nshort == 1 { "" } else { "s" },
            shortage
        );
    } else if nshort != 0 {
        tracing::debug!(
            "was unable to {}expand {} domain{} in the current tick [ok, still reclaiming memory]",
            if partial { "fully " } else { "" },
            nshort,
            if nshort == 1 { "" } else { "s" }
        );
    }
}
