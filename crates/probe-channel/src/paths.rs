// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Shared namespace layout.
//!
//! The layout is fixed for compatibility with existing guests:
//!
//! ```text
//! /local/domain/<id>/name
//! /local/domain/<id>/vm                                  ("/vm/<uuid>")
//! /local/domain/<id>/memory/{static-max,target,videoram}
//! /local/domain/<id>/membalance/report_path
//! /tool/membalance/interval
//! /tool/membalance/domain/<qid>/domid
//! /tool/membalance/domain/<qid>/report
//! ```

/// Root of the per-domain host-published subtree (watched).
pub const LOCAL_DOMAIN_ROOT: &str = "/local/domain";

/// The shared sampling-interval key.
pub const INTERVAL_PATH: &str = "/tool/membalance/interval";

/// Root of the per-qid report slots (deliberately not under the watched
/// subtree).
pub const DOMAIN_SLOT_ROOT: &str = "/tool/membalance/domain";

pub fn domain_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}")
}

pub fn name_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/name")
}

pub fn vm_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/vm")
}

pub fn mem_static_max_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/memory/static-max")
}

pub fn mem_target_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/memory/target")
}

pub fn mem_videoram_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/memory/videoram")
}

pub fn freemem_slack_path() -> String {
    format!("{LOCAL_DOMAIN_ROOT}/0/memory/freemem-slack")
}

/// Where the daemon records the location of a domain's report slot.
pub fn report_link_path(id: i64) -> String {
    format!("{LOCAL_DOMAIN_ROOT}/{id}/membalance/report_path")
}

pub fn vm_start_time_path(uuid: &str) -> String {
    format!("/vm/{uuid}/start_time")
}

pub fn slot_domid_path(qid: &str) -> String {
    format!("{DOMAIN_SLOT_ROOT}/{qid}/domid")
}

pub fn slot_report_path(qid: &str) -> String {
    format!("{DOMAIN_SLOT_ROOT}/{qid}/report")
}

pub fn slot_path(qid: &str) -> String {
    format!("{DOMAIN_SLOT_ROOT}/{qid}")
}

/// Decomposes a path under `/local/domain` into (domain id, subpath).
///
/// The subpath is empty for the domain's root key itself:
///
/// ```
/// use probe_channel::paths::parse_local_domain_path;
///
/// assert_eq!(parse_local_domain_path("/local/domain/5"), Some((5, "")));
/// assert_eq!(
///     parse_local_domain_path("/local/domain/5/memory/target"),
///     Some((5, "memory/target"))
/// );
/// assert_eq!(parse_local_domain_path("/other/path"), None);
/// ```
pub fn parse_local_domain_path(path: &str) -> Option<(i64, &str)> {
    let rest = path.strip_prefix(LOCAL_DOMAIN_ROOT)?;
    let rest = rest.strip_prefix('/')?;
    let (id_part, subpath) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    let id: i64 = id_part.parse().ok()?;
    if id < 0 {
        return None;
    }
    Some((id, subpath))
}

/// Validates a report-link value (`/tool/membalance/domain/<qid>/report`)
/// and extracts the qid.
pub fn parse_report_link(value: &str) -> Option<&str> {
    let rest = value.strip_prefix(DOMAIN_SLOT_ROOT)?;
    let rest = rest.strip_prefix('/')?;
    let qid = rest.strip_suffix("/report")?;
    if qid.is_empty() || qid.contains('/') {
        return None;
    }
    Some(qid)
}
