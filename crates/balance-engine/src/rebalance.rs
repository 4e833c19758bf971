// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Stage 4: rebalancing between domains.
//!
//! Domains wishing to expand are ranked by expand force and served in
//! order: free memory first (respecting the soft reserve unless the
//! requester presses harder than the soft band resists), then by taking
//! memory from the lowest-resisting victims. The auction ends the moment
//! the strongest remaining requester cannot outbid the weakest remaining
//! victim.
//!
//! Growth proceeds in chunks up to the next size-category threshold: a
//! domain crossing `dmem_min` or `dmem_quota` changes tier, its force is
//! recomputed, and it is reinserted at its new rank. The same applies to
//! victims crossing a threshold downwards. Re-insertion goes before equal
//! entries so fewer domains end up moving.

use crate::forces::{
    eval_expand_force, eval_resist_force, size_expand_category, size_resist_category,
    ForceContext, EPS, RESIST_FORCE_FREE_SOFT,
};
use crate::{Engine, EngineError};
use domain_registry::{round_down, BalanceSide};
use host_gate::DomainId;

pub(crate) fn stage_rebalance(eng: &mut Engine) -> Result<(), EngineError> {
    // Candidates: fresh data, runnable, not already being trimmed.
    let mut vec_expand: Vec<DomainId> = eng
        .registry
        .managed_iter()
        .filter(|r| r.valid_data && r.flags.runnable() && !r.trimming_to_quota)
        .map(|r| r.domain_id)
        .collect();
    if vec_expand.is_empty() {
        return Ok(());
    }
    let mut vec_shrink = vec_expand.clone();

    let expand_ctx = ForceContext::for_expand(
        vec_expand
            .iter()
            .filter_map(|id| eng.registry.managed(*id)),
    );
    let resist_ctx = ForceContext::for_resist(
        vec_shrink
            .iter()
            .filter_map(|id| eng.registry.managed(*id)),
    );
    for &id in &vec_expand {
        let rec = eng.registry.managed_mut(id).expect("candidate is managed");
        eval_expand_force(&expand_ctx, rec);
        eval_resist_force(&resist_ctx, rec);
        // Precedence order for the execution phase is frozen now.
        rec.expand_force0 = rec.expand_force;
    }

    // Domains that do not want to grow or are already at their per-tick
    // cap drop out of the expansion side; domains at their per-tick floor
    // or freshly expanded drop out of the shrink side.
    let tick = eng.tick;
    vec_expand.retain(|id| {
        let r = eng.registry.managed(*id).expect("candidate is managed");
        r.expand_force > EPS && r.memsize < r.memsize_incr
    });
    vec_shrink.retain(|id| {
        let r = eng.registry.managed(*id).expect("candidate is managed");
        r.memsize > r.memsize_decr && !crate::reclaim::is_shrink_soft_protected(tick, r)
    });

    sort_desc_by_expand_force(eng, &mut vec_expand);
    sort_asc_by_resist_force(eng, &mut vec_shrink);

    while !vec_expand.is_empty() {
        let id = vec_expand[0];

        // Reaching a domain already shrinking means the low-pressure end
        // of the vector: nothing past it can be a requester either.
        {
            let rec = eng.registry.managed_mut(id).expect("candidate is managed");
            if rec.balside == BalanceSide::Shrinking {
                vec_expand.remove(0);
                continue;
            }
            rec.balside = BalanceSide::Expanding;
        }

        let (chunk_target, c_size) = {
            let rec = eng.registry.managed(id).expect("candidate is managed");
            // Grow in chunks up to the next category-changing threshold so
            // the force can be re-ranked at the crossing.
            let m = if rec.memsize < rec.dmem_min {
                rec.dmem_min.min(rec.memsize_incr)
            } else if rec.memsize < rec.dmem_quota {
                rec.dmem_quota.min(rec.memsize_incr)
            } else {
                rec.memsize_incr
            };
            (m, size_expand_category(rec, rec.memsize))
        };

        let need = chunk_target - eng.registry.managed(id).expect("managed").memsize;

        if !expand_into_freemem(eng, id, need) {
            let before = eng.registry.managed(id).expect("managed").memsize;
            rebalance_from_victims(eng, id, need, &resist_ctx, &mut vec_shrink);
            if eng.registry.managed(id).expect("managed").memsize == before {
                // could not grow the strongest requester at all: done
                break;
            }
        }

        let rec = eng.registry.managed(id).expect("candidate is managed");
        if rec.memsize >= rec.memsize_incr {
            vec_expand.remove(0);
            continue;
        }

        if size_expand_category(rec, rec.memsize) != c_size {
            let rec = eng.registry.managed_mut(id).expect("candidate is managed");
            eval_expand_force(&expand_ctx, rec);
            vec_expand.remove(0);
            insert_into_vec_expand(eng, &mut vec_expand, id);
        } else if eng.registry.managed(id).expect("managed").memsize == chunk_target {
            // A chunk boundary below the per-tick cap is always a category
            // threshold; reaching it without crossing means the chunk
            // arithmetic is wrong, and carrying on would loop forever.
            return Err(EngineError::Bug(format!(
                "stage_rebalance: size category did not change (domain {id})"
            )));
        }
    }
    Ok(())
}

/// Tries to satisfy `need` KB for `id` from free memory. The reserve
/// respected depends on how hard the domain presses: above the soft
/// band's resistance it may dig down to the hard reserve.
fn expand_into_freemem(eng: &mut Engine, id: DomainId, need: i64) -> bool {
    let force = eng.registry.managed(id).expect("managed").expand_force;
    let chunk = free_allocate(eng, force, need);
    if chunk == 0 {
        return false;
    }
    let rec = eng.registry.managed_mut(id).expect("managed");
    rec.memsize += chunk;
    tracing::trace!(
        domain = id,
        chunk_kb = chunk,
        force,
        host_free = eng.host_free,
        "expansion from free memory"
    );
    true
}

/// Allocates up to `need` KB of free memory at the given expand force,
/// in quantum multiples. Returns 0..=need.
fn free_allocate(eng: &mut Engine, expand_force: f64, need: i64) -> i64 {
    debug_assert!(need >= 0, "free_allocate with negative need");

    let reserve = if expand_force > RESIST_FORCE_FREE_SOFT {
        eng.config.host_reserved_hard.value() as i64
    } else {
        eng.config.host_reserved_soft.value() as i64
    };

    let avail = eng.host_free - reserve;
    if avail <= 0 {
        return 0;
    }

    let allocated = round_down(avail.min(need), eng.quantum_kb() as i64);
    eng.host_free -= allocated;
    allocated
}

/// Expands `id` by up to `need` at the cost of the shrink candidates, in
/// ascending resist-force order.
fn rebalance_from_victims(
    eng: &mut Engine,
    id: DomainId,
    mut need: i64,
    resist_ctx: &ForceContext,
    vec_shrink: &mut Vec<DomainId>,
) {
    while need > 0 && !vec_shrink.is_empty() {
        let victim = vec_shrink[0];

        // A domain on the expansion side, or one with nothing left to
        // give this tick, is no victim.
        {
            let v = eng.registry.managed(victim).expect("victim is managed");
            if v.balside == BalanceSide::Expanding || v.memsize <= v.memsize_decr {
                vec_shrink.remove(0);
                continue;
            }
            let requester_force = eng.registry.managed(id).expect("managed").expand_force;
            if requester_force <= v.resist_force {
                // even the weakest victim will not yield
                return;
            }
        }

        // How much until the victim's next size threshold?
        let (mut chunk, c_size) = {
            let v = eng.registry.managed(victim).expect("victim is managed");
            let floor = if v.memsize > v.dmem_quota {
                v.memsize_decr.max(v.dmem_quota)
            } else {
                v.memsize_decr
            };
            (v.memsize - floor, size_resist_category(v, v.memsize))
        };

        chunk = chunk.min(need);
        {
            let v = eng.registry.managed_mut(victim).expect("victim is managed");
            v.memsize -= chunk;
            v.balside = BalanceSide::Shrinking;
        }
        {
            let d = eng.registry.managed_mut(id).expect("managed");
            d.memsize += chunk;
        }
        need -= chunk;
        tracing::trace!(victim, to = id, chunk_kb = chunk, "rebalance transfer");

        let v = eng.registry.managed(victim).expect("victim is managed");
        if v.memsize <= v.memsize_decr {
            // spent as a supplier for this tick
            vec_shrink.remove(0);
        } else if size_resist_category(v, v.memsize) != c_size {
            let v = eng.registry.managed_mut(victim).expect("victim is managed");
            eval_resist_force(resist_ctx, v);
            vec_shrink.remove(0);
            insert_into_vec_shrink(eng, vec_shrink, victim);
        }
    }
}

fn sort_desc_by_expand_force(eng: &Engine, vec: &mut [DomainId]) {
    vec.sort_by(|a, b| {
        let fa = eng.registry.managed(*a).expect("managed").expand_force;
        let fb = eng.registry.managed(*b).expect("managed").expand_force;
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });
}

fn sort_asc_by_resist_force(eng: &Engine, vec: &mut [DomainId]) {
    vec.sort_by(|a, b| {
        let fa = eng.registry.managed(*a).expect("managed").resist_force;
        let fb = eng.registry.managed(*b).expect("managed").resist_force;
        fa.partial_cmp(&fb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });
}

/// Inserts into a vector sorted by descending expand force, before any
/// equal entries (expanding one domain beats expanding two).
fn insert_into_vec_expand(eng: &Engine, vec: &mut Vec<DomainId>, id: DomainId) {
    let force = eng.registry.managed(id).expect("managed").expand_force;
    let pos = vec.partition_point(|other| {
        eng.registry.managed(*other).expect("managed").expand_force > force
    });
    vec.insert(pos, id);
}

/// Inserts into a vector sorted by ascending resist force, before any
/// equal entries.
fn insert_into_vec_shrink(eng: &Engine, vec: &mut Vec<DomainId>, id: DomainId) {
    let force = eng.registry.managed(id).expect("managed").resist_force;
    let pos = vec.partition_point(|other| {
        eng.registry.managed(*other).expect("managed").resist_force < force
    });
    vec.insert(pos, id);
}
