// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The operator `free-memory` command.
//!
//! Reclaims a requested amount of host free memory by shrinking managed
//! domains, using the hard-reserve reclaim engine with a caller-supplied
//! goal. Requires the scheduler to be paused: the command and the tick
//! would otherwise fight over the same domains.
//!
//! The host exposes no commitment tracking, so "how much is free" is only
//! meaningful once domain movements settle; the command first waits for
//! the free reading to stabilise, then schedules and enacts the shrinks,
//! then waits a bounded time for the memory to actually appear. Amounts
//! shed here are recorded as `preshrink` on each record and charged
//! against the next tick's contraction cap.

use crate::{reclaim, Engine, EngineError};
use config_store::consts;
use domain_registry::{round_down, round_up};

/// Parameters of one free-memory request.
#[derive(Debug, Clone, Copy)]
pub struct FreememRequest {
    pub needed_kb: u64,
    /// Count the requested amount on top of the host's free slack.
    pub above_slack: bool,
    /// Allow drawing the hard reserve down.
    pub use_reserved_hard: bool,
    /// Refuse to shrink anything when the goal is unattainable.
    pub must: bool,
    pub timeout_ms: i64,
}

/// Result of a free-memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreememOutcome {
    /// `P`: rejected, scheduler not paused. `N`: not attempted, goal
    /// unattainable under `must`. `A`: attempted (or already satisfied);
    /// the fields show what is attainable.
    pub status: char,
    pub freemem_with_slack: u64,
    pub freemem_less_slack: u64,
}

fn calc_avail(mfree: i64, lien: i64, slack: i64, hard: i64, above_slack: bool, draw_hard: bool, quantum: i64) -> i64 {
    let mut m = mfree;
    if above_slack {
        m -= slack;
    }
    if !draw_hard {
        m -= hard;
    }
    m -= lien;
    round_down(m.max(0), quantum)
}

/// Runs one free-memory request to completion.
pub fn free_memory_request(
    eng: &mut Engine,
    req: FreememRequest,
) -> Result<FreememOutcome, EngineError> {
    if eng.pause_level == 0 {
        return Ok(FreememOutcome {
            status: 'P',
            freemem_with_slack: 0,
            freemem_less_slack: 0,
        });
    }

    let quantum = eng.quantum_kb() as i64;
    let hard = eng.config.host_reserved_hard.value() as i64;

    // Let in-flight movements settle within the caller's budget, keeping
    // enough back for the post-shrink wait.
    let stabilise_ms = (req.timeout_ms - consts::DOMAIN_FREEMEM_TIMEOUT_MS).max(0);
    let mut xen_free = eng.host().wait_free_memory_stable(stabilise_ms)? as i64;
    let slack = eng.host().free_slack()? as i64;
    eng.free_slack = slack;
    eng.collect_memory_info()?;
    let mut lien = eng.eval_memory_lien();

    // The absolute ceiling: everything attainable with every runnable
    // managed domain shrunk to its minimum.
    let mut freeable: i64 = 0;
    for rec in eng.registry.managed_iter() {
        if rec.memsize > rec.dmem_min && rec.flags.runnable() {
            freeable += rec.memsize - rec.dmem_min;
        }
    }
    let max_free = xen_free + freeable;

    let max_avail = calc_avail(max_free, lien, slack, hard, req.above_slack, req.use_reserved_hard, quantum);
    let max_avail_with_slack =
        calc_avail(max_free, lien, slack, hard, false, req.use_reserved_hard, quantum);
    let max_avail_less_slack =
        calc_avail(max_free, lien, slack, hard, true, req.use_reserved_hard, quantum);

    if req.needed_kb == 0 {
        return Ok(FreememOutcome {
            status: 'A',
            freemem_with_slack: max_avail_with_slack as u64,
            freemem_less_slack: max_avail_less_slack as u64,
        });
    }

    // Guard the arithmetic below against absurd requests.
    if req.needed_kb >= i64::MAX as u64 / 2 {
        return Ok(FreememOutcome {
            status: 'A',
            freemem_with_slack: 0,
            freemem_less_slack: 0,
        });
    }

    let needed = round_up(req.needed_kb as i64, quantum);

    if req.must && needed > max_avail {
        return Ok(FreememOutcome {
            status: 'N',
            freemem_with_slack: max_avail_with_slack as u64,
            freemem_less_slack: max_avail_less_slack as u64,
        });
    }

    // Perhaps the request is already satisfied without shrinking anything
    // or drawing on the hard reserve.
    let avail = calc_avail(xen_free, lien, slack, hard, req.above_slack, false, quantum);
    let avail_with_slack = calc_avail(xen_free, lien, slack, hard, false, false, quantum);
    let avail_less_slack = calc_avail(xen_free, lien, slack, hard, true, false, quantum);
    if needed <= avail {
        return Ok(FreememOutcome {
            status: 'A',
            freemem_with_slack: avail_with_slack as u64,
            freemem_less_slack: avail_less_slack as u64,
        });
    }

    // Schedule the squeeze.
    let cond_slack = if req.above_slack { slack } else { 0 };
    let mut reclaim_goal = needed + hard + cond_slack + lien - xen_free;
    reclaim_goal = reclaim_goal.max(0).min(freeable);
    reclaim_goal = round_up(reclaim_goal, quantum);
    let reclaimed = reclaim::hard_reclaim(eng, reclaim_goal);

    if reclaimed < reclaim_goal {
        // the ceiling above said this amount was attainable
        tracing::error!(
            reclaimed,
            goal = reclaim_goal,
            "free-memory reclaimed less than scheduled"
        );
        if req.must {
            return Ok(FreememOutcome {
                status: 'N',
                freemem_with_slack: avail_with_slack as u64,
                freemem_less_slack: avail_less_slack as u64,
            });
        }
    }

    // Enact the shrinks and remember them for the next tick's cap.
    let host = eng.host_rc();
    let tick = eng.tick();
    for id in eng.registry.managed_ids() {
        let rec = eng.registry.managed_mut(id).expect("managed id");
        if rec.memsize < rec.memgoal0 && rec.flags.runnable() {
            let target = rec.memsize;
            tracing::debug!(
                "shrink domain {} ({} kb -> {} kb)",
                rec.printable_name(),
                rec.memsize0,
                rec.memsize
            );
            match crate::resize::set_target_checked(&*host, quantum as u64, rec, target) {
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "unable to shrink memory allocation for domain {}",
                        rec.printable_name()
                    );
                }
            }

            if rec.preshrink_tick != tick {
                rec.preshrink_tick = tick;
                rec.preshrink = 0;
            }
            rec.preshrink += (rec.memsize0 - rec.memsize).max(0);
        }
    }

    // Wait a bounded time for the memory to materialise.
    let prev_free = xen_free;
    let target = xen_free + reclaimed.min(reclaim_goal);
    xen_free = eng
        .host()
        .wait_free_memory(target.max(0) as u64, consts::DOMAIN_FREEMEM_TIMEOUT_MS)?
        as i64;

    if xen_free < target {
        tracing::warn!(
            "free-memory was unable to reclaim enough memory: reclaimed only {} instead of {} kbs",
            xen_free - prev_free,
            target - prev_free
        );
    }

    // The lien may have moved while waiting.
    eng.collect_memory_info()?;
    lien = eng.eval_memory_lien();

    Ok(FreememOutcome {
        status: 'A',
        freemem_with_slack: calc_avail(xen_free, lien, slack, hard, false, req.use_reserved_hard, quantum)
            as u64,
        freemem_less_slack: calc_avail(xen_free, lien, slack, hard, true, req.use_reserved_hard, quantum)
            as u64,
    })
}
