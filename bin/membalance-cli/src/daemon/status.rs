// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Status and debug-state rendering for the control RPC.

use crate::proto::{PROGNAME, PROGVERSION};
use crate::util::{decode_memsize, pct};
use balance_engine::Engine;
use domain_registry::{BuildStatus, DomainRecord, VIDEORAM_UNSET};
use std::fmt::Write;

/// Category codes used by the status tables: H(igh), L(ow) or blank.
fn rate_category_code(rec: &DomainRecord, rate: i64) -> char {
    if rate >= rec.rate_high {
        'H'
    } else if rate <= rec.rate_low {
        'L'
    } else {
        ' '
    }
}

fn size_category_code(rec: &DomainRecord, size: i64) -> char {
    if size > rec.dmem_quota {
        'H'
    } else if size <= rec.dmem_min {
        'L'
    } else {
        ' '
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// The `membalancectl list` report.
pub fn render_status(eng: &mut Engine) -> String {
    let mut out = String::new();

    // refresh memory figures the tables draw on
    let collect_err = eng.collect_memory_info().err();
    let xen_free = eng.host().free_memory().unwrap_or(0) as i64;
    let slack = eng.host().free_slack().unwrap_or(0) as i64;

    let _ = writeln!(out, "Status of {PROGNAME} {PROGVERSION} at {}", timestamp());
    let _ = writeln!(out);
    if let Some(e) = collect_err {
        let _ = writeln!(out, "Warning: host accounting unavailable: {e}");
        let _ = writeln!(out);
    }

    // global settings
    if eng.pause_level != 0 {
        let _ = writeln!(out, "Domain adjustment is paused (depth {})", eng.pause_level);
    } else {
        let _ = writeln!(out, "Domain adjustment is enabled");
    }
    let _ = writeln!(
        out,
        "Memory balancing interval: {} sec",
        eng.config.interval.value()
    );
    let _ = writeln!(out);

    let hard = decode_memsize(eng.config.host_reserved_hard.value() as i64);
    let soft = decode_memsize(eng.config.host_reserved_soft.value() as i64);
    let w = hard.len().max(soft.len());
    let _ = writeln!(out, "host_reserved_hard:  {hard:>w$} (MB.KB)");
    let _ = writeln!(out, "host_reserved_soft:  {soft:>w$} (MB.KB)");
    let _ = writeln!(out);

    // memory status
    let free_kbs = xen_free - slack;
    let signed = |v: i64| {
        if v < 0 {
            format!("(-) {}", decode_memsize(-v))
        } else {
            decode_memsize(v)
        }
    };
    let free_str = signed(free_kbs);
    let soft_str = signed(free_kbs - eng.config.host_reserved_soft.value() as i64);
    let hard_str = signed(free_kbs - eng.config.host_reserved_hard.value() as i64);
    let w = free_str.len().max(soft_str.len()).max(hard_str.len());
    let _ = writeln!(
        out,
        "Free memory:   {free_str:>w$} (MB.KB) + Xen free memory slack of {} (MB.KB)",
        decode_memsize(slack)
    );
    let _ = writeln!(out, "Over soft by:  {soft_str:>w$} (MB.KB)");
    let _ = writeln!(out, "Over hard by:  {hard_str:>w$} (MB.KB)");
    let _ = writeln!(out);

    render_managed_table(eng, &mut out);
    render_pending_table(eng, &mut out);
    render_unmanaged_table(eng, &mut out);

    out
}

fn render_managed_table(eng: &Engine, out: &mut String) {
    let ids = eng.registry.managed_ids();
    if ids.is_empty() {
        let _ = writeln!(out, "Managed domains: none");
        let _ = writeln!(out);
        return;
    }

    let _ = writeln!(out, "Managed domains:");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "                                                      size         rate       rate  trend"
    );
    let _ = writeln!(
        out,
        "    ID                    name                      (MB.KB)     (MB.KB/sec)   (MB.KB/sec)"
    );
    let _ = writeln!(
        out,
        "  ----- ---------------------------------------- ------------- ------------- -------------"
    );

    for id in ids {
        let rec = eng.registry.managed(id).expect("listed id");
        let name = rec.name.as_deref().unwrap_or("");
        let _ = write!(out, "  {:>5} {:<40} ", rec.domain_id, name);

        if rec.valid_memory_data {
            let _ = write!(
                out,
                "{:>11} {} ",
                decode_memsize(rec.memsize),
                size_category_code(rec, rec.memsize)
            );
        } else {
            let _ = write!(out, "{:>11}   ", "");
        }

        if rec.valid_data {
            let _ = write!(
                out,
                "{:>11} {} ",
                decode_memsize(rec.rate),
                rate_category_code(rec, rec.rate)
            );
            let _ = write!(
                out,
                "{:>11} {}",
                decode_memsize(rec.slow_rate),
                rate_category_code(rec, rec.slow_rate)
            );
        }

        let _ = writeln!(out);
    }
    let _ = writeln!(out);
}

fn render_pending_table(eng: &Engine, out: &mut String) {
    let ids = eng.registry.pending_ids();
    if ids.is_empty() {
        let _ = writeln!(out, "Pending domains: none");
        let _ = writeln!(out);
        return;
    }

    let _ = writeln!(out, "Pending domains:");
    let _ = writeln!(out);
    let _ = writeln!(out, "    ID                    name");
    let _ = writeln!(out, "  ----- ----------------------------------------");
    for id in ids {
        let rec = eng.registry.pending(id).expect("listed id");
        let _ = writeln!(
            out,
            "  {:>5} {:<40}",
            rec.domain_id,
            rec.name.as_deref().unwrap_or("")
        );
    }
    let _ = writeln!(out);
}

fn render_unmanaged_table(eng: &Engine, out: &mut String) {
    let ids = eng.registry.unmanaged_ids();
    if ids.is_empty() {
        let _ = writeln!(out, "Unmanaged domains: none");
        return;
    }
    if ids == [0] {
        let _ = writeln!(out, "Unmanaged domains: only Dom0");
        return;
    }

    let _ = writeln!(out, "Unmanaged domains:");
    let _ = writeln!(out);
    let _ = writeln!(out, "    ID");
    let _ = writeln!(out, "  -----");
    for id in ids {
        let _ = writeln!(out, "  {id:>5}");
    }
}

/// The full daemon state, for `dump-debug` / `show-debug` and SIGUSR1.
pub fn render_debug(eng: &Engine) -> String {
    let mut out = String::new();
    let cfg = &eng.config;

    let _ = writeln!(out, "{PROGNAME} {PROGVERSION} at {}", timestamp());
    let _ = writeln!(out);
    if eng.pause_level != 0 {
        let _ = writeln!(out, "domain adjustment:       paused (depth {})", eng.pause_level);
    } else {
        let _ = writeln!(out, "domain adjustment:       enabled");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "sched interval:          {} sec", cfg.interval.value());
    let _ = writeln!(
        out,
        "domain_pending_timeout:  {} sec",
        cfg.domain_pending_timeout.value()
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "host_reserved_hard:      {} KB",
        cfg.host_reserved_hard.value()
    );
    let _ = writeln!(
        out,
        "host_reserved_soft:      {} KB",
        cfg.host_reserved_soft.value()
    );
    let _ = writeln!(out, "rate_high:               {} KB/s", cfg.rate_high.value());
    let _ = writeln!(out, "rate_low:                {} KB/s", cfg.rate_low.value());
    let _ = writeln!(out, "rate_zero:               {} KB/s", cfg.rate_zero.value());
    let _ = writeln!(out, "dmem_incr:               {}%", pct(cfg.dmem_incr.value()));
    let _ = writeln!(out, "dmem_decr:               {}%", pct(cfg.dmem_decr.value()));
    let _ = writeln!(
        out,
        "guest_free_threshold:    {}%",
        pct(cfg.guest_free_threshold.value())
    );
    let _ = writeln!(out, "startup_time:            {} sec", cfg.startup_time.value());
    let _ = writeln!(
        out,
        "trim_unresponsive:       {} sec",
        cfg.trim_unresponsive.value()
    );
    let _ = writeln!(
        out,
        "trim_unmanaged:          {}",
        if cfg.trim_unmanaged.value() { "yes" } else { "no" }
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "debug_level:             {}", super::logging::debug_level());
    let _ = writeln!(out, "max_xs_retries:          {}", cfg.max_xs_retries.value());
    let _ = writeln!(
        out,
        "max_xen_init_retries:    {} sec",
        cfg.max_xen_init_retries.value()
    );
    let _ = writeln!(
        out,
        "xen_init_retry_msg:      {} sec",
        cfg.xen_init_retry_msg.value()
    );
    let _ = writeln!(out);

    render_domain_set(&mut out, "Managed domains", eng, &eng.registry.managed_ids(), true);
    render_unmanaged_set(&mut out, &eng.registry.unmanaged_ids());
    render_domain_set(&mut out, "Pending domains", eng, &eng.registry.pending_ids(), false);

    out
}

fn record_of<'e>(eng: &'e Engine, id: i64, managed: bool) -> Option<&'e DomainRecord> {
    if managed {
        eng.registry.managed(id)
    } else {
        eng.registry.pending(id)
    }
}

fn render_domain_set(out: &mut String, title: &str, eng: &Engine, ids: &[i64], managed: bool) {
    if ids.is_empty() {
        let _ = writeln!(out, "{title}: none");
        let _ = writeln!(out);
        return;
    }

    let _ = writeln!(out, "{title}: ({} total)", ids.len());
    let _ = writeln!(out);

    for &id in ids {
        let Some(rec) = record_of(eng, id, managed) else {
            continue;
        };

        let _ = write!(out, "    id: {id}");
        match (&rec.name, &rec.uuid) {
            (Some(n), Some(u)) => {
                let _ = write!(out, " (name: {n}, uuid: {u})");
            }
            (Some(n), None) => {
                let _ = write!(out, " (name: {n})");
            }
            (None, Some(u)) => {
                let _ = write!(out, " (uuid: {u})");
            }
            (None, None) => {}
        }
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "        active:  dmem_min: {}, dmem_quota: {}, dmem_max: {}",
            rec.dmem_min, rec.dmem_quota, rec.dmem_max
        );
        let _ = writeln!(
            out,
            "                 dmem_incr: {}%, dmem_decr: {}%, rate_high: {}, rate_low: {}",
            pct(rec.dmem_incr),
            pct(rec.dmem_decr),
            rec.rate_high,
            rec.rate_low
        );
        let _ = writeln!(
            out,
            "                 rate_zero: {}, guest_free_threshold: {}%",
            rec.rate_zero,
            pct(rec.guest_free_threshold)
        );
        let _ = writeln!(
            out,
            "                 startup_time: {}, trim_unresponsive: {}, trim_unmanaged: {}",
            rec.startup_time, rec.trim_unresponsive, rec.trim_unmanaged as i32
        );

        match rec.build_status {
            BuildStatus::Parsed => {
                let _ = writeln!(
                    out,
                    "        dom cfg: memory: {}, maxmem: {}",
                    rec.build.memory, rec.build.maxmem
                );
                let _ = writeln!(
                    out,
                    "                 dmem_min: {}, dmem_quota: {}, dmem_max: {}",
                    rec.build.dmem_min, rec.build.dmem_quota, rec.build.dmem_max
                );
                let _ = writeln!(
                    out,
                    "                 dmem_incr: {}%, dmem_decr: {}%, rate_high: {}, rate_low: {}",
                    pct(rec.build.dmem_incr),
                    pct(rec.build.dmem_decr),
                    rec.build.rate_high,
                    rec.build.rate_low
                );
                let _ = writeln!(
                    out,
                    "                 rate_zero: {}, guest_free_threshold: {}%",
                    rec.build.rate_zero,
                    pct(rec.build.guest_free_threshold)
                );
                // the first field is the resolved value here, matching the
                // long-standing output of this report
                let _ = writeln!(
                    out,
                    "                 startup_time: {}, trim_unresponsive: {}, trim_unmanaged: {}",
                    rec.startup_time,
                    rec.build.trim_unresponsive,
                    rec.build.trim_unmanaged.map(|b| b as i32).unwrap_or(-1)
                );
            }
            BuildStatus::Failed => {
                let _ = writeln!(out, "        dom cfg: cannot fetch");
            }
            BuildStatus::NotFetched => {
                let _ = writeln!(out, "        dom cfg: still retrieving");
            }
        }

        let videoram = if rec.xs_mem_videoram == VIDEORAM_UNSET {
            "unread".to_string()
        } else {
            rec.xs_mem_videoram.to_string()
        };
        let _ = writeln!(
            out,
            "        xenstore data: memory (max: {}, target: {}, videoram: {})",
            rec.xs_mem_max, rec.xs_mem_target, videoram
        );
        let _ = writeln!(out);
    }
    let _ = writeln!(out);
}

fn render_unmanaged_set(out: &mut String, ids: &[i64]) {
    if ids.is_empty() {
        let _ = writeln!(out, "Unmanaged domains: none");
        let _ = writeln!(out);
        return;
    }
    let _ = writeln!(out, "Unmanaged domains: ({} total)", ids.len());
    let _ = writeln!(out);
    for id in ids {
        let _ = writeln!(out, "    id: {id}");
    }
    let _ = writeln!(out);
}
