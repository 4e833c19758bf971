// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Build-config parsing and settings resolution.
//!
//! The resolution chain for every adjustable per-domain setting is:
//!
//! 1. host-published keys (where applicable)
//! 2. the domain's build config
//! 3. the global configuration
//! 4. hardwired defaults
//!
//! When AUTO mode is allowed, the full rate-driven parameter set must be
//! defined after the chain completes; otherwise only the size bounds are
//! required. Resolution failure logs a precise, comma-separated list of
//! unfulfilled conditions and leaves the domain unmanageable.

use crate::record::{round_up, BuildStatus, DomainRecord};
use config_store::{consts, units, ControlModes, GlobalConfig};

/// Splits a build-config blob into `key = value` pairs.
///
/// The blob is a config-file-style text: one assignment per line, `#`
/// comments, values optionally in single or double quotes.
fn blob_pairs(blob: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw in blob.lines() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if !key.is_empty() {
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    pairs
}

/// Parses the membalance settings out of a domain's build-config blob into
/// the record's raw `build` block.
///
/// Returns `true` when the blob parsed and the domain participates;
/// `false` marks the build config permanently unusable (the domain becomes
/// Unmanaged). The record's `build_status` is updated either way.
pub fn parse_build_config(rec: &mut DomainRecord, blob: &str, source: &str) -> bool {
    let pairs = blob_pairs(blob);
    let get = |key: &str| -> Option<&str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let membalance_keys = pairs
        .iter()
        .filter(|(k, _)| k.starts_with("membalance_"))
        .count();

    let ok = (|| -> bool {
        match get("membalance_mode") {
            Some(v) => match units::parse_control_modes(source, "membalance_mode", v) {
                Ok(modes) if !modes.is_empty() => rec.ctrl_modes_allowed = modes,
                Ok(_) => return false, // "off"
                Err(e) => {
                    tracing::error!(error = %e, "unable to parse {source}");
                    return false;
                }
            },
            None => {
                if membalance_keys == 0 {
                    // no membalance configuration at all
                    return false;
                }
                tracing::error!("unable to parse {source}: missing \"membalance_mode\" key");
                return false;
            }
        }

        // With a single permitted mode it is active from the start;
        // otherwise the guest's first message determines it.
        rec.ctrl_mode = if rec.ctrl_modes_allowed == ControlModes::AUTO
            || rec.ctrl_modes_allowed == ControlModes::DIRECT
        {
            rec.ctrl_modes_allowed
        } else {
            ControlModes::empty()
        };

        match get("memory") {
            Some(v) => match v.trim().parse::<i64>() {
                Ok(mb) if (0..=i64::MAX / 1024).contains(&mb) => {
                    rec.build.memory = mb * 1024;
                    rec.build.maxmem = mb * 1024;
                }
                _ => {
                    tracing::error!("invalid value for \"memory\" in {source}");
                    return false;
                }
            },
            None => {
                tracing::error!("unable to parse {source}: missing \"memory\" key");
                return false;
            }
        }

        if let Some(v) = get("maxmem") {
            match v.trim().parse::<i64>() {
                Ok(mb) if (0..=i64::MAX / 1024).contains(&mb) => rec.build.maxmem = mb * 1024,
                _ => {
                    tracing::error!("invalid value for \"maxmem\" in {source}");
                    return false;
                }
            }
        }

        macro_rules! take {
            ($key:literal, $field:ident, $parse:expr) => {
                if let Some(v) = get($key) {
                    match $parse(source, $key, v) {
                        Ok(parsed) => rec.build.$field = parsed,
                        Err(e) => {
                            tracing::error!(error = %e, "unable to parse {source}");
                            return false;
                        }
                    }
                }
            };
        }

        take!("membalance_dmem_max", dmem_max, |s, k, v| {
            units::parse_kb(s, k, v, "mb").map(|n| n as i64)
        });
        take!("membalance_dmem_min", dmem_min, |s, k, v| {
            units::parse_kb(s, k, v, "mb").map(|n| n as i64)
        });
        take!("membalance_dmem_quota", dmem_quota, |s, k, v| {
            units::parse_kb(s, k, v, "mb").map(|n| n as i64)
        });
        take!("membalance_rate_high", rate_high, |s, k, v| {
            units::parse_kb_sec(s, k, v, "kb/s").map(|n| n as i64)
        });
        take!("membalance_rate_low", rate_low, |s, k, v| {
            units::parse_kb_sec(s, k, v, "kb/s").map(|n| n as i64)
        });
        take!("membalance_rate_zero", rate_zero, |s, k, v| {
            units::parse_kb_sec(s, k, v, "kb/s").map(|n| n as i64)
        });
        take!("membalance_dmem_incr", dmem_incr, |s, k, v| {
            units::parse_pct_range(s, k, v, consts::MIN_DMEM_INCR, consts::MAX_DMEM_INCR)
        });
        take!("membalance_dmem_decr", dmem_decr, |s, k, v| {
            units::parse_pct_range(s, k, v, consts::MIN_DMEM_DECR, consts::MAX_DMEM_DECR)
        });
        take!(
            "membalance_guest_free_threshold",
            guest_free_threshold,
            |s, k, v| units::parse_pct_range(s, k, v, 0.0, 1.0)
        );
        take!("membalance_startup_time", startup_time, |s, k, v| {
            units::parse_sec(s, k, v).map(|n| n as i64)
        });
        take!(
            "membalance_trim_unresponsive",
            trim_unresponsive,
            |s, k, v| units::parse_sec(s, k, v).map(|n| n as i64)
        );
        take!("membalance_trim_unmanaged", trim_unmanaged, |s, k, v| {
            units::parse_bool(s, k, v).map(Some)
        });

        true
    })();

    rec.build_status = if ok {
        BuildStatus::Parsed
    } else {
        BuildStatus::Failed
    };
    ok
}

/// Resolves the record's active settings against the global configuration
/// and validates the result.
///
/// Returns `false` (with error messages already logged) when the settings
/// are incomplete, invalid or incoherent.
pub fn resolve_settings(rec: &mut DomainRecord, cfg: &GlobalConfig, quantum_kb: u64) -> bool {
    let mut valid = true;
    let automode = rec.ctrl_modes_allowed.contains(ControlModes::AUTO);

    let undefined = |rec: &DomainRecord, key: &str| {
        tracing::error!(
            "parameter {key} undefined for domain {}",
            rec.printable_name()
        );
    };

    if rec.build.dmem_min >= 0 {
        rec.dmem_min = rec.build.dmem_min;
    } else if rec.build.memory >= 0 {
        rec.dmem_min = rec.build.memory;
    } else {
        undefined(rec, "dmem_min");
        valid = false;
    }

    if rec.build.dmem_max >= 0 {
        rec.dmem_max = rec.build.dmem_max;
    } else if rec.xs_mem_max >= 0 {
        rec.dmem_max = rec.xs_mem_max;
    } else if rec.build.memory >= 0 {
        rec.dmem_max = rec.build.memory;
    } else {
        undefined(rec, "dmem_max");
        valid = false;
    }

    if automode {
        if rec.build.dmem_quota >= 0 {
            rec.dmem_quota = rec.build.dmem_quota;
        } else if rec.build.memory >= 0 {
            rec.dmem_quota = rec.build.memory;
        } else {
            undefined(rec, "dmem_quota");
            valid = false;
        }

        if rec.build.dmem_incr >= 0.0 {
            rec.dmem_incr = rec.build.dmem_incr;
        } else if cfg.dmem_incr.has_value() {
            rec.dmem_incr = cfg.dmem_incr.value();
        } else {
            undefined(rec, "dmem_incr");
            valid = false;
        }

        if rec.build.dmem_decr >= 0.0 {
            rec.dmem_decr = rec.build.dmem_decr;
        } else if cfg.dmem_decr.has_value() {
            rec.dmem_decr = cfg.dmem_decr.value();
        } else {
            undefined(rec, "dmem_decr");
            valid = false;
        }

        if rec.build.rate_high >= 0 {
            rec.rate_high = rec.build.rate_high;
        } else if cfg.rate_high.has_value() {
            rec.rate_high = cfg.rate_high.value() as i64;
        } else {
            undefined(rec, "rate_high");
            valid = false;
        }

        if rec.build.rate_low >= 0 {
            rec.rate_low = rec.build.rate_low;
        } else if cfg.rate_low.has_value() {
            rec.rate_low = cfg.rate_low.value() as i64;
        } else {
            undefined(rec, "rate_low");
            valid = false;
        }

        if rec.build.rate_zero >= 0 {
            rec.rate_zero = rec.build.rate_zero;
        } else if cfg.rate_zero.has_value() {
            rec.rate_zero = cfg.rate_zero.value() as i64;
        } else {
            undefined(rec, "rate_zero");
            valid = false;
        }

        if rec.build.guest_free_threshold >= 0.0 {
            rec.guest_free_threshold = rec.build.guest_free_threshold;
        } else if cfg.guest_free_threshold.has_value() {
            rec.guest_free_threshold = cfg.guest_free_threshold.value();
        } else {
            undefined(rec, "guest_free_threshold");
            valid = false;
        }

        if rec.build.startup_time >= 0 {
            rec.startup_time = rec.build.startup_time;
        } else if cfg.startup_time.has_value() {
            rec.startup_time = cfg.startup_time.value() as i64;
        }

        if rec.build.trim_unresponsive >= 0 {
            rec.trim_unresponsive = rec.build.trim_unresponsive;
        } else if cfg.trim_unresponsive.has_value() {
            rec.trim_unresponsive = cfg.trim_unresponsive.value() as i64;
        }

        if let Some(t) = rec.build.trim_unmanaged {
            rec.trim_unmanaged = t;
        } else if cfg.trim_unmanaged.has_value() {
            rec.trim_unmanaged = cfg.trim_unmanaged.value();
        }
    }

    if !valid {
        return false;
    }

    let quantum = quantum_kb as i64;
    if rec.dmem_max >= 0 {
        rec.dmem_max = round_up(rec.dmem_max, quantum);
    }
    if rec.dmem_min >= 0 {
        rec.dmem_min = round_up(rec.dmem_min, quantum);
    }
    if rec.dmem_quota >= 0 {
        rec.dmem_quota = round_up(rec.dmem_quota, quantum);
    }

    let mut unfulfilled: Vec<String> = Vec::new();

    if automode && !(rec.rate_low < rec.rate_high) {
        unfulfilled.push(format!(
            "rate_low ({}) < rate_high ({})",
            rec.rate_low, rec.rate_high
        ));
    }
    if automode && !(rec.dmem_min <= rec.dmem_quota) {
        unfulfilled.push(format!(
            "dmem_min ({}) <= dmem_quota ({})",
            rec.dmem_min, rec.dmem_quota
        ));
    }
    if automode && !(rec.dmem_quota <= rec.dmem_max) {
        unfulfilled.push(format!(
            "dmem_quota ({}) <= dmem_max ({})",
            rec.dmem_quota, rec.dmem_max
        ));
    }
    if !automode && !(rec.dmem_min <= rec.dmem_max) {
        unfulfilled.push(format!(
            "dmem_min ({}) <= dmem_max ({})",
            rec.dmem_min, rec.dmem_max
        ));
    }
    if !(rec.dmem_max <= rec.xs_mem_max) {
        unfulfilled.push(format!(
            "dmem_max (rounded up to page size: {}) <= maxmem ({})",
            rec.dmem_max, rec.xs_mem_max
        ));
    }
    if rec.xs_mem_videoram > 0 && rec.xs_mem_videoram % quantum != 0 {
        unfulfilled.push(format!(
            "videoram ({}) is multiple of page size ({}K)",
            rec.xs_mem_videoram, quantum
        ));
    }

    if !unfulfilled.is_empty() {
        tracing::error!(
            "parameter values are incoherent for domain {}, unfulfilled: {}",
            rec.printable_name(),
            unfulfilled.join(", ")
        );
        return false;
    }

    if rec.dmem_min == rec.dmem_max {
        tracing::warn!(
            "domain {} cannot be managed because dmem_min == dmem_max ({})",
            rec.printable_name(),
            rec.dmem_min
        );
        return false;
    }

    true
}

/// Whether a configuration change can alter the outcome of
/// [`resolve_settings`] for domains that previously failed it.
///
/// Only gates the re-examination of Unmanaged domains; Managed domains are
/// always re-resolved on a config change.
pub fn resolve_settings_affected(old: &GlobalConfig, new: &GlobalConfig) -> bool {
    // newly defined values
    if (!old.dmem_incr.has_value() && new.dmem_incr.has_value())
        || (!old.dmem_decr.has_value() && new.dmem_decr.has_value())
        || (!old.rate_high.has_value() && new.rate_high.has_value())
        || (!old.rate_low.has_value() && new.rate_low.has_value())
        || (!old.rate_zero.has_value() && new.rate_zero.has_value())
        || (!old.guest_free_threshold.has_value() && new.guest_free_threshold.has_value())
    {
        return true;
    }

    if old.rate_high.has_value()
        && new.rate_high.has_value()
        && old.rate_high.value() != new.rate_high.value()
    {
        return true;
    }

    if old.rate_low.has_value()
        && new.rate_low.has_value()
        && old.rate_low.value() != new.rate_low.value()
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainRecord;

    const BLOB: &str = r#"
name = "web"
memory = 2048
maxmem = 32768
membalance_mode = "auto"
membalance_dmem_min = 1024mb
membalance_dmem_quota = 4096 mb
membalance_dmem_max = 32768mb
"#;

    fn pending_record() -> DomainRecord {
        let mut r = DomainRecord::new(5);
        r.name = Some("web".into());
        r.uuid = Some("u-5".into());
        r.xs_mem_max = 32 * 1024 * 1024;
        r.xs_mem_target = 2 * 1024 * 1024;
        r.xs_mem_videoram = 0;
        r
    }

    #[test]
    fn test_parse_build_config() {
        let mut r = pending_record();
        assert!(parse_build_config(&mut r, BLOB, "config for domain 5"));
        assert_eq!(r.ctrl_modes_allowed, ControlModes::AUTO);
        assert_eq!(r.ctrl_mode, ControlModes::AUTO);
        assert_eq!(r.build.memory, 2048 * 1024);
        assert_eq!(r.build.maxmem, 32768 * 1024);
        assert_eq!(r.build.dmem_min, 1024 * 1024);
        assert_eq!(r.build.dmem_quota, 4096 * 1024);
        assert_eq!(r.build_status, BuildStatus::Parsed);
    }

    #[test]
    fn test_no_membalance_keys_means_unmanaged() {
        let mut r = pending_record();
        assert!(!parse_build_config(
            &mut r,
            "name = \"web\"\nmemory = 1024\n",
            "cfg"
        ));
        assert_eq!(r.build_status, BuildStatus::Failed);
    }

    #[test]
    fn test_mode_off_means_unmanaged() {
        let mut r = pending_record();
        let blob = "memory = 1024\nmembalance_mode = \"off\"\n";
        assert!(!parse_build_config(&mut r, blob, "cfg"));
    }

    #[test]
    fn test_membalance_keys_without_mode_fail() {
        let mut r = pending_record();
        let blob = "memory = 1024\nmembalance_dmem_min = 512mb\n";
        assert!(!parse_build_config(&mut r, blob, "cfg"));
    }

    #[test]
    fn test_missing_memory_key_fails() {
        let mut r = pending_record();
        let blob = "membalance_mode = \"auto\"\n";
        assert!(!parse_build_config(&mut r, blob, "cfg"));
    }

    #[test]
    fn test_both_modes_leave_active_mode_open() {
        let mut r = pending_record();
        let blob = "memory = 1024\nmembalance_mode = \"auto,direct\"\n";
        assert!(parse_build_config(&mut r, blob, "cfg"));
        assert!(r.ctrl_mode.is_empty());
        assert_eq!(
            r.ctrl_modes_allowed,
            ControlModes::AUTO | ControlModes::DIRECT
        );
    }

    #[test]
    fn test_resolve_settings_fills_from_global() {
        let mut r = pending_record();
        assert!(parse_build_config(&mut r, BLOB, "cfg"));
        let cfg = GlobalConfig::defaults();
        assert!(resolve_settings(&mut r, &cfg, 4));
        assert_eq!(r.dmem_min, 1024 * 1024);
        assert_eq!(r.dmem_quota, 4096 * 1024);
        assert_eq!(r.dmem_max, 32768 * 1024);
        assert_eq!(r.rate_high, 200);
        assert_eq!(r.rate_low, 0);
        assert_eq!(r.rate_zero, 30);
        assert!((r.dmem_incr - 0.06).abs() < 1e-9);
        assert_eq!(r.startup_time, 300);
        assert!(r.trim_unmanaged);
    }

    #[test]
    fn test_resolve_fails_on_incoherent_bounds() {
        let mut r = pending_record();
        let blob = "\
memory = 2048
membalance_mode = \"auto\"
membalance_dmem_min = 8192mb
membalance_dmem_quota = 4096mb
membalance_dmem_max = 32768mb
";
        assert!(parse_build_config(&mut r, blob, "cfg"));
        let cfg = GlobalConfig::defaults();
        assert!(!resolve_settings(&mut r, &cfg, 4));
    }

    #[test]
    fn test_resolve_fails_when_dmem_max_exceeds_static_max() {
        let mut r = pending_record();
        r.xs_mem_max = 1024 * 1024; // static max 1 GB
        assert!(parse_build_config(&mut r, BLOB, "cfg")); // dmem_max 32 GB
        let cfg = GlobalConfig::defaults();
        assert!(!resolve_settings(&mut r, &cfg, 4));
    }

    #[test]
    fn test_resolve_fails_when_min_equals_max() {
        let mut r = pending_record();
        let blob = "\
memory = 2048
membalance_mode = \"direct\"
membalance_dmem_min = 2048mb
membalance_dmem_max = 2048mb
";
        assert!(parse_build_config(&mut r, blob, "cfg"));
        let cfg = GlobalConfig::defaults();
        assert!(!resolve_settings(&mut r, &cfg, 4));
    }

    #[test]
    fn test_direct_mode_needs_only_bounds() {
        let mut r = pending_record();
        let blob = "memory = 2048\nmembalance_mode = \"direct\"\n";
        assert!(parse_build_config(&mut r, blob, "cfg"));
        let cfg = GlobalConfig::defaults();
        assert!(resolve_settings(&mut r, &cfg, 4));
        assert_eq!(r.dmem_min, 2048 * 1024);
        // rate thresholds stay unresolved in DIRECT-only mode
        assert_eq!(r.rate_high, -1);
    }

    #[test]
    fn test_sizes_rounded_to_quantum() {
        let mut r = pending_record();
        let blob = "\
memory = 2048
membalance_mode = \"auto\"
membalance_dmem_min = 1000001kb
membalance_dmem_quota = 2000001kb
membalance_dmem_max = 3000001kb
";
        assert!(parse_build_config(&mut r, blob, "cfg"));
        let cfg = GlobalConfig::defaults();
        assert!(resolve_settings(&mut r, &cfg, 4));
        assert_eq!(r.dmem_min % 4, 0);
        assert_eq!(r.dmem_quota % 4, 0);
        assert_eq!(r.dmem_max % 4, 0);
    }

    #[test]
    fn test_affected_gate() {
        let old = GlobalConfig::defaults();
        let mut new = GlobalConfig::defaults();
        assert!(!resolve_settings_affected(&old, &new));

        new.rate_high.set(400);
        assert!(resolve_settings_affected(&old, &new));

        let mut new = GlobalConfig::defaults();
        new.rate_low.set(50);
        assert!(resolve_settings_affected(&old, &new));

        // an unrelated change does not trigger re-examination
        let mut new = GlobalConfig::defaults();
        new.host_reserved_hard.set(1024);
        assert!(!resolve_settings_affected(&old, &new));
    }
}
