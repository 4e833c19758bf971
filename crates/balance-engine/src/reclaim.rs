// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stages 2 and 3: defending the free-memory reserves.
//!
//! Both stages only schedule trimming by lowering records' planned
//! `memsize`; nothing is enacted here.
//!
//! The hard reserve is met by force, in five rounds that start with the
//! domains least likely to suffer (long-idle ones, then over-quota ones)
//! and end with last-resort trimming of every runnable domain toward its
//! minimum — including domains without fresh data, ranked by resist force
//! with rate treated as zero (young domains get the benefit of the doubt
//! instead).
//!
//! The soft reserve is approached gradually: three rounds, each domain
//! capped by its per-tick `dmem_decr`, and recently expanded domains are
//! protected to stop upsize/downsize jitter.

use crate::forces::{eval_resist_force, ForceContext};
use crate::{Engine, EngineError};
use config_store::consts;
use domain_registry::{round_up, DomainRecord};
use host_gate::DomainId;

/// One more `dmem_decr` slice off the current planned size.
fn eval_more_decr(rec: &DomainRecord, quantum: i64) -> i64 {
    let mut m = (rec.memsize as f64 * (1.0 - rec.dmem_decr)) as i64;
    m = round_up(m, quantum);
    m = m.max(rec.dmem_min);
    m.min(rec.dmem_max)
}

/// Shrink protection after a recent expansion. Applies to the soft stage
/// and rebalancing, never to the hard stage.
pub(crate) fn is_shrink_soft_protected(tick: u64, rec: &DomainRecord) -> bool {
    tick.saturating_sub(rec.last_expand_tick) <= consts::SHRINK_PROTECTION_TICKS
}

// ── Stage 2: hard reserve ──────────────────────────────────────

pub(crate) fn stage_reserved_hard(eng: &mut Engine) -> Result<(), EngineError> {
    let hard = eng.config.host_reserved_hard.value() as i64;
    if eng.host_free < hard {
        let need = hard - eng.host_free;
        let reclaimed = hard_reclaim(eng, need);
        eng.host_free += reclaimed;

        if reclaimed >= need {
            tracing::debug!(reclaimed_kb = reclaimed, "reserved_hard met");
        } else {
            tracing::debug!(
                reclaimed_kb = reclaimed,
                short_kb = need - reclaimed,
                "reserved_hard not fully met"
            );
        }
    }
    Ok(())
}

/// Schedules trimming to recover up to `goal` KB. Returns the amount
/// actually scheduled, which can fall short when every candidate is at
/// its floor. Shared with the operator free-memory command.
pub(crate) fn hard_reclaim(eng: &mut Engine, goal: i64) -> i64 {
    let quantum = eng.quantum_kb() as i64;
    let mut goal = round_up(goal, quantum);
    let requested = goal;

    hard_round_1(eng, &mut goal);
    hard_round_2(eng, &mut goal);
    hard_round_3(eng, &mut goal);
    hard_round_4(eng, &mut goal);
    hard_round_5(eng, &mut goal);

    requested - goal
}

/// Domains idle the longest give first, down to the per-tick floor.
fn hard_round_1(eng: &mut Engine, goal: &mut i64) {
    if *goal <= 0 {
        return;
    }

    let mut vec: Vec<(i64, DomainId)> = eng
        .registry
        .managed_iter()
        .filter(|r| {
            r.valid_data && r.time_rate_below_low != 0 && r.flags.runnable() && !r.trimming_to_quota
        })
        .map(|r| (r.time_rate_below_low, r.domain_id))
        .collect();
    vec.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, id) in vec {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        let trim = (rec.memsize - rec.memsize_decr).min(*goal);
        if trim > 0 {
            rec.memsize -= trim;
            *goal -= trim;
            if *goal <= 0 {
                break;
            }
        }
    }
}

/// Over-quota domains below the high rate, longest-below-high first, not
/// yet trimmed this tick, down to max(per-tick floor, quota).
fn hard_round_2(eng: &mut Engine, goal: &mut i64) {
    if *goal <= 0 {
        return;
    }

    let mut vec: Vec<(i64, DomainId)> = eng
        .registry
        .managed_iter()
        .filter(|r| {
            r.valid_data
                && r.time_rate_below_high != 0
                && r.memsize > r.dmem_quota
                && r.memsize == r.memsize0
                && r.flags.runnable()
                && !r.trimming_to_quota
        })
        .map(|r| (r.time_rate_below_high, r.domain_id))
        .collect();
    vec.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, id) in vec {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        let floor = rec.memsize_decr.max(rec.dmem_quota);
        let trim = (rec.memsize - floor).min(*goal);
        if trim > 0 {
            rec.memsize -= trim;
            *goal -= trim;
            if *goal <= 0 {
                break;
            }
        }
    }
}

/// Same selection as round 2 but including already-trimmed domains: one
/// further `dmem_decr` slice on top of earlier trimming, never below
/// quota.
fn hard_round_3(eng: &mut Engine, goal: &mut i64) {
    if *goal <= 0 {
        return;
    }
    let quantum = eng.quantum_kb() as i64;

    let mut vec: Vec<(i64, DomainId)> = eng
        .registry
        .managed_iter()
        .filter(|r| {
            r.valid_data
                && r.time_rate_below_high != 0
                && r.memsize > r.dmem_quota
                && r.flags.runnable()
                && !r.trimming_to_quota
        })
        .map(|r| (r.time_rate_below_high, r.domain_id))
        .collect();
    vec.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, id) in vec {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        let floor = eval_more_decr(rec, quantum).max(rec.dmem_quota);
        let trim = (rec.memsize - floor).min(*goal);
        if trim > 0 {
            rec.memsize -= trim;
            *goal -= trim;
            if *goal <= 0 {
                break;
            }
        }
    }
}

/// All over-quota domains by ascending resist force, in repeated
/// one-slice passes until the goal is met or all sit at quota. Domains
/// without fresh data count as rate zero.
fn hard_round_4(eng: &mut Engine, goal: &mut i64) {
    if *goal <= 0 {
        return;
    }
    let quantum = eng.quantum_kb() as i64;

    let mut ids: Vec<DomainId> = Vec::new();
    for id in eng.registry.managed_ids() {
        let rec = eng.registry.managed_mut(id).expect("managed id");
        if rec.memsize > rec.dmem_quota && rec.flags.runnable() && !rec.trimming_to_quota {
            if !rec.valid_data {
                rec.rate = 0;
                rec.slow_rate = 0;
                rec.fast_rate = 0;
            }
            ids.push(id);
        }
    }

    while *goal > 0 && !ids.is_empty() {
        rank_by_resist(eng, &mut ids);

        let mut k = 0;
        while k < ids.len() {
            let id = ids[k];
            let rec = eng.registry.managed_mut(id).expect("candidate is managed");
            let floor = eval_more_decr(rec, quantum).max(rec.dmem_quota);
            let trim = (rec.memsize - floor).min(*goal);
            if trim > 0 {
                rec.memsize -= trim;
                *goal -= trim;
                if *goal <= 0 {
                    break;
                }
            }
            if rec.memsize <= rec.dmem_quota {
                ids.remove(k);
            } else {
                k += 1;
            }
        }
    }
}

/// Last resort: every runnable domain above its minimum, by ascending
/// resist force, repeatedly, toward `dmem_min`. Non-reporting domains
/// count as rate zero — except young ones, which are presumed busy
/// booting and get a rate just above their high threshold.
fn hard_round_5(eng: &mut Engine, goal: &mut i64) {
    if *goal <= 0 {
        return;
    }
    let quantum = eng.quantum_kb() as i64;
    let host = eng.host_rc();

    let mut ids: Vec<DomainId> = Vec::new();
    for id in eng.registry.managed_ids() {
        let uptime = host.domain_uptime(id);
        let rec = eng.registry.managed_mut(id).expect("managed id");
        if rec.memsize > rec.dmem_min && rec.flags.runnable() {
            if !rec.valid_data {
                // The root domain is never young.
                if rec.domain_id != 0 && rec.startup_time >= 0 && uptime <= rec.startup_time {
                    rec.rate = rec.rate_high + 1;
                    rec.slow_rate = rec.rate_high + 1;
                    rec.fast_rate = rec.rate_high + 1;
                } else {
                    rec.rate = 0;
                    rec.slow_rate = 0;
                    rec.fast_rate = 0;
                }
            }
            ids.push(id);
        }
    }

    while *goal > 0 && !ids.is_empty() {
        rank_by_resist(eng, &mut ids);

        let mut k = 0;
        while k < ids.len() {
            let id = ids[k];
            let rec = eng.registry.managed_mut(id).expect("candidate is managed");
            let floor = eval_more_decr(rec, quantum).max(rec.dmem_min);
            let trim = (rec.memsize - floor).min(*goal);
            if trim > 0 {
                rec.memsize -= trim;
                *goal -= trim;
                if *goal <= 0 {
                    break;
                }
            }
            if rec.memsize <= rec.dmem_min {
                ids.remove(k);
            } else {
                k += 1;
            }
        }
    }
}

/// Recomputes resist forces for `ids` and sorts ascending.
fn rank_by_resist(eng: &mut Engine, ids: &mut [DomainId]) {
    let ctx = ForceContext::for_resist(
        ids.iter()
            .filter_map(|id| eng.registry.managed(*id)),
    );
    for &id in ids.iter() {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        eval_resist_force(&ctx, rec);
    }
    ids.sort_by(|a, b| {
        let fa = eng.registry.managed(*a).expect("managed").resist_force;
        let fb = eng.registry.managed(*b).expect("managed").resist_force;
        fa.partial_cmp(&fb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });
}

// ── Stage 3: soft reserve ──────────────────────────────────────

pub(crate) fn stage_reserved_soft(eng: &mut Engine) {
    let soft = eng.config.host_reserved_soft.value() as i64;
    if eng.host_free < soft {
        let need = soft - eng.host_free;
        let reclaimed = soft_reclaim(eng, need);
        eng.host_free += reclaimed;

        if reclaimed >= need {
            tracing::debug!(reclaimed_kb = reclaimed, "reserved_soft met");
        } else {
            tracing::debug!(
                reclaimed_kb = reclaimed,
                short_kb = need - reclaimed,
                "reserved_soft not fully met, continuing next tick"
            );
        }
    }
}

fn soft_reclaim(eng: &mut Engine, goal: i64) -> i64 {
    let quantum = eng.quantum_kb() as i64;
    let mut goal = round_up(goal, quantum);
    let requested = goal;

    soft_round(eng, &mut goal, SoftRound::LowRateOverQuota);
    soft_round(eng, &mut goal, SoftRound::LowRateAnySize);
    soft_round(eng, &mut goal, SoftRound::BelowHighOverQuota);

    requested - goal
}

enum SoftRound {
    /// rate ≤ low and size > quota, trim toward quota.
    LowRateOverQuota,
    /// rate ≤ low, any size, trim toward the minimum.
    LowRateAnySize,
    /// rate < high and size > quota, trim toward quota.
    BelowHighOverQuota,
}

fn soft_round(eng: &mut Engine, goal: &mut i64, round: SoftRound) {
    if *goal <= 0 {
        return;
    }
    let tick = eng.tick;

    let mut vec: Vec<(i64, DomainId)> = eng
        .registry
        .managed_iter()
        .filter(|r| {
            if !(r.valid_data && r.flags.runnable() && !r.trimming_to_quota)
                || is_shrink_soft_protected(tick, r)
            {
                return false;
            }
            match round {
                SoftRound::LowRateOverQuota => {
                    r.time_rate_below_low != 0 && r.memsize > r.dmem_quota
                }
                SoftRound::LowRateAnySize => r.time_rate_below_low != 0,
                SoftRound::BelowHighOverQuota => {
                    r.time_rate_below_high != 0 && r.memsize > r.dmem_quota
                }
            }
        })
        .map(|r| {
            let key = match round {
                SoftRound::BelowHighOverQuota => r.time_rate_below_high,
                _ => r.time_rate_below_low,
            };
            (key, r.domain_id)
        })
        .collect();
    vec.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, id) in vec {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        // Total trim within the tick stays within dmem_decr: the floor is
        // the per-tick cap already charged with earlier trimming.
        let floor = match round {
            SoftRound::LowRateAnySize => rec.memsize_decr.max(rec.dmem_min),
            _ => rec.memsize_decr.max(rec.dmem_quota),
        };
        let trim = (rec.memsize - floor).min(*goal);
        if trim > 0 {
            rec.memsize -= trim;
            *goal -= trim;
            if *goal <= 0 {
                break;
            }
        }
    }
}
