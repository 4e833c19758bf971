// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Global configuration file parser.
//!
//! The file format is one `key = value [unit]` per line; `#` starts a
//! comment. A bad value is logged and the key stays at its default — the
//! rest of the file remains in effect. Unknown and duplicate keys warn.
//!
//! ```text
//! # /etc/membalance.conf
//! interval = 5
//! host_reserved_hard = 200 mb
//! rate_high = 400 kb/s
//! dmem_incr = 6 %
//! ```

use crate::global::consts;
use crate::units;
use crate::{ConfigError, GlobalConfig};
use std::collections::HashSet;
use std::path::Path;

/// Default location of the daemon configuration file.
pub const CONF_PATH: &str = "/etc/membalance.conf";

const KNOWN_KEYS: &[&str] = &[
    "interval",
    "max_xs_retries",
    "max_xen_init_retries",
    "xen_init_retry_msg",
    "domain_pending_timeout",
    "host_reserved_hard",
    "host_reserved_soft",
    "rate_high",
    "rate_low",
    "rate_zero",
    "dmem_incr",
    "dmem_decr",
    "guest_free_threshold",
    "startup_time",
    "trim_unresponsive",
    "trim_unmanaged",
    "dom0_membalance_mode",
];

impl GlobalConfig {
    /// Reads and parses the configuration file at `path`.
    ///
    /// A missing file is not an error here: the caller decides whether that
    /// is fatal (initial load of an explicitly configured system) or merely
    /// worth a warning (reload).
    pub fn load_file(path: &Path) -> Result<GlobalConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            source: e,
        })?;
        let source = format!("configuration file {}", path.display());
        Ok(Self::parse_str(&text, &source))
    }

    /// Parses configuration text. Returns a config that starts from the
    /// built-in defaults with every valid `key = value` applied on top.
    pub fn parse_str(text: &str, source: &str) -> GlobalConfig {
        let mut cfg = GlobalConfig::defaults();
        let mut seen: HashSet<String> = HashSet::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line = lineno + 1, %source, "malformed line (no '='), ignored");
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if !KNOWN_KEYS.contains(&key) {
                tracing::warn!(%key, %source, "unknown configuration key");
                continue;
            }
            if !seen.insert(key.to_string()) {
                tracing::warn!(%key, %source, "duplicate configuration key, first value kept");
                continue;
            }

            if let Err(e) = apply_key(&mut cfg, source, key, value) {
                tracing::error!(error = %e, "ignoring configuration value");
            }
        }

        if cfg.rate_low.value() >= cfg.rate_high.value() {
            tracing::warn!(
                rate_low = cfg.rate_low.value(),
                rate_high = cfg.rate_high.value(),
                %source,
                "rate_low is not below rate_high"
            );
        }

        cfg
    }
}

fn out_of_range(source: &str, key: &str) -> ConfigError {
    ConfigError::OutOfRange {
        origin: source.to_string(),
        key: key.to_string(),
    }
}

fn apply_key(
    cfg: &mut GlobalConfig,
    source: &str,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match key {
        "interval" => {
            let secs = units::parse_sec(source, key, value)?;
            if secs == 0 {
                return Err(out_of_range(source, key));
            }
            if secs < consts::MIN_INTERVAL {
                tracing::warn!(
                    %source,
                    requested = secs,
                    "interval too low, setting to {}",
                    consts::MIN_INTERVAL
                );
                cfg.interval.set(consts::MIN_INTERVAL);
            } else if secs > consts::MAX_INTERVAL {
                tracing::warn!(
                    %source,
                    requested = secs,
                    "interval too high, clamped down to {}",
                    consts::MAX_INTERVAL
                );
                cfg.interval.set(consts::MAX_INTERVAL);
            } else {
                cfg.interval.set(secs);
            }
        }
        "max_xs_retries" => {
            let n: u32 = value
                .parse()
                .map_err(|_| out_of_range(source, key))?;
            cfg.max_xs_retries.set(n);
        }
        "max_xen_init_retries" => {
            cfg.max_xen_init_retries
                .set(units::parse_sec(source, key, value)?);
        }
        "xen_init_retry_msg" => {
            cfg.xen_init_retry_msg
                .set(units::parse_sec(source, key, value)?);
        }
        "domain_pending_timeout" => {
            cfg.domain_pending_timeout
                .set(units::parse_sec(source, key, value)?);
        }
        "host_reserved_hard" => {
            cfg.host_reserved_hard
                .set(units::parse_kb(source, key, value, "mb")?);
        }
        "host_reserved_soft" => {
            cfg.host_reserved_soft
                .set(units::parse_kb(source, key, value, "mb")?);
        }
        "rate_high" => {
            cfg.rate_high
                .set(units::parse_kb_sec(source, key, value, "kb/s")?);
        }
        "rate_low" => {
            cfg.rate_low
                .set(units::parse_kb_sec(source, key, value, "kb/s")?);
        }
        "rate_zero" => {
            cfg.rate_zero
                .set(units::parse_kb_sec(source, key, value, "kb/s")?);
        }
        "dmem_incr" => {
            cfg.dmem_incr.set(units::parse_pct_range(
                source,
                key,
                value,
                consts::MIN_DMEM_INCR,
                consts::MAX_DMEM_INCR,
            )?);
        }
        "dmem_decr" => {
            cfg.dmem_decr.set(units::parse_pct_range(
                source,
                key,
                value,
                consts::MIN_DMEM_DECR,
                consts::MAX_DMEM_DECR,
            )?);
        }
        "guest_free_threshold" => {
            cfg.guest_free_threshold
                .set(units::parse_pct_range(source, key, value, 0.0, 1.0)?);
        }
        "startup_time" => {
            cfg.startup_time.set(units::parse_sec(source, key, value)?);
        }
        "trim_unresponsive" => {
            cfg.trim_unresponsive
                .set(units::parse_sec(source, key, value)?);
        }
        "trim_unmanaged" => {
            cfg.trim_unmanaged
                .set(units::parse_bool(source, key, value)?);
        }
        "dom0_membalance_mode" => {
            cfg.dom0_mode
                .set(units::parse_control_modes(source, key, value)?);
        }
        _ => unreachable!("key filtered against KNOWN_KEYS"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlModes;

    #[test]
    fn test_parse_basic() {
        let text = "\
# comment
interval = 10
host_reserved_hard = 200 mb
rate_high = 400
dmem_incr = 8 %
trim_unmanaged = no
dom0_membalance_mode = auto
";
        let cfg = GlobalConfig::parse_str(text, "test");
        assert_eq!(cfg.interval.value(), 10);
        assert!(cfg.interval.is_set());
        assert_eq!(cfg.host_reserved_hard.value(), 200 * 1024);
        assert_eq!(cfg.rate_high.value(), 400);
        assert!((cfg.dmem_incr.value() - 0.08).abs() < 1e-9);
        assert!(!cfg.trim_unmanaged.value());
        assert_eq!(cfg.dom0_mode.value(), ControlModes::AUTO);
        // untouched keys stay defaulted
        assert!(cfg.rate_low.is_defaulted());
    }

    #[test]
    fn test_interval_clamped() {
        let cfg = GlobalConfig::parse_str("interval = 1\n", "test");
        assert_eq!(cfg.interval.value(), 2);
        let cfg = GlobalConfig::parse_str("interval = 2 min\n", "test");
        assert_eq!(cfg.interval.value(), 30);
    }

    #[test]
    fn test_bad_value_leaves_default() {
        let cfg = GlobalConfig::parse_str("rate_high = fast\ninterval = 7\n", "test");
        assert_eq!(cfg.rate_high.value(), 200);
        assert!(cfg.rate_high.is_defaulted());
        assert_eq!(cfg.interval.value(), 7);
    }

    #[test]
    fn test_dmem_bounds_enforced() {
        // 50% is far over the 30% cap; key must stay defaulted
        let cfg = GlobalConfig::parse_str("dmem_incr = 50\n", "test");
        assert!(cfg.dmem_incr.is_defaulted());
        assert!((cfg.dmem_incr.value() - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_key_keeps_first() {
        let cfg = GlobalConfig::parse_str("interval = 7\ninterval = 9\n", "test");
        assert_eq!(cfg.interval.value(), 7);
    }

    #[test]
    fn test_inline_comment_and_whitespace() {
        let cfg = GlobalConfig::parse_str("  rate_zero = 50 kb/s  # quiet floor\n", "test");
        assert_eq!(cfg.rate_zero.value(), 50);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membalance.conf");
        std::fs::write(&path, "interval = 6\n").unwrap();
        let cfg = GlobalConfig::load_file(&path).unwrap();
        assert_eq!(cfg.interval.value(), 6);
        assert!(GlobalConfig::load_file(&dir.path().join("missing.conf")).is_err());
    }
}
