// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Unit-aware value parsing.
//!
//! Values arrive as text from the global config file, per-domain build
//! configs and the operator CLI, optionally followed by a unit:
//!
//! - sizes: `k`, `kb`, `m`, `mb`, `g`, `gb` (result in KB)
//! - rates: `kb/s`, `kb/sec`, `kbs`, `mb/s`, ..., `gbs` (result in KB/s)
//! - times: `s`, `sec(s)`, `second(s)`, `m`, `min(s)`, `minute(s)`,
//!   `h`, `hr(s)`, `hour(s)` (result in seconds)
//! - percentages: `%` (result as a fraction, `15%` → `0.15`)
//!
//! The unit may be attached (`512mb`) or separated by whitespace
//! (`512 mb`); case does not matter. A missing unit falls back to the
//! caller-supplied default.

use crate::{ConfigError, ControlModes};

/// Splits `text` into a numeric prefix and a trailing unit token.
fn split_number(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    let end = text
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let (num, unit) = text.split_at(end);
    Some((num, unit.trim()))
}

fn invalid(source: &str, key: &str) -> ConfigError {
    ConfigError::InvalidValue {
        origin: source.to_string(),
        key: key.to_string(),
    }
}

fn unknown_unit(source: &str, key: &str, unit: &str) -> ConfigError {
    ConfigError::UnknownUnit {
        origin: source.to_string(),
        key: key.to_string(),
        unit: unit.to_string(),
    }
}

/// Multiplier for a memory-size unit, in KB.
fn mem_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "k" | "kb" => Some(1),
        "m" | "mb" => Some(1024),
        "g" | "gb" => Some(1024 * 1024),
        _ => None,
    }
}

/// Multiplier for a data-rate unit, in KB/s.
fn rate_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "kb/s" | "kb/sec" | "kbs" => Some(1),
        "mb/s" | "mb/sec" | "mbs" => Some(1024),
        "gb/s" | "gb/sec" | "gbs" => Some(1024 * 1024),
        _ => None,
    }
}

/// Multiplier for a time unit, in seconds.
fn time_multiplier(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3600),
        _ => None,
    }
}

/// Parses a memory size into KB. `default_unit` applies when no unit is given.
pub fn parse_kb(
    source: &str,
    key: &str,
    value: &str,
    default_unit: &str,
) -> Result<u64, ConfigError> {
    let (num, unit) = split_number(value).ok_or_else(|| invalid(source, key))?;
    let n: u64 = num.parse().map_err(|_| invalid(source, key))?;
    let unit = if unit.is_empty() { default_unit } else { unit };
    let mult = mem_multiplier(unit).ok_or_else(|| unknown_unit(source, key, unit))?;
    n.checked_mul(mult).ok_or_else(|| invalid(source, key))
}

/// Parses a data rate into KB/s. `default_unit` applies when no unit is given.
pub fn parse_kb_sec(
    source: &str,
    key: &str,
    value: &str,
    default_unit: &str,
) -> Result<u64, ConfigError> {
    let (num, unit) = split_number(value).ok_or_else(|| invalid(source, key))?;
    let n: u64 = num.parse().map_err(|_| invalid(source, key))?;
    let unit = if unit.is_empty() { default_unit } else { unit };
    let mult = rate_multiplier(unit)
        .or_else(|| mem_multiplier(unit))
        .ok_or_else(|| unknown_unit(source, key, unit))?;
    n.checked_mul(mult).ok_or_else(|| invalid(source, key))
}

/// Parses a time span into seconds. `default_unit` applies when no unit is given.
pub fn parse_sec(source: &str, key: &str, value: &str) -> Result<u32, ConfigError> {
    let (num, unit) = split_number(value).ok_or_else(|| invalid(source, key))?;
    let n: u64 = num.parse().map_err(|_| invalid(source, key))?;
    let unit = if unit.is_empty() { "sec" } else { unit };
    let mult = time_multiplier(unit).ok_or_else(|| unknown_unit(source, key, unit))?;
    let secs = n.checked_mul(mult).ok_or_else(|| invalid(source, key))?;
    u32::try_from(secs).map_err(|_| invalid(source, key))
}

/// Parses a percentage into a fraction (`15%` → `0.15`).
pub fn parse_pct(source: &str, key: &str, value: &str) -> Result<f64, ConfigError> {
    let (num, unit) = split_number(value).ok_or_else(|| invalid(source, key))?;
    let n: f64 = num.parse().map_err(|_| invalid(source, key))?;
    if !(unit.is_empty() || unit == "%") {
        return Err(unknown_unit(source, key, unit));
    }
    Ok(n / 100.0)
}

/// Parses a percentage and verifies the fraction lands in `[min, max]`.
pub fn parse_pct_range(
    source: &str,
    key: &str,
    value: &str,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    let v = parse_pct(source, key, value)?;
    if v >= min && v <= max {
        Ok(v)
    } else {
        Err(ConfigError::OutOfRange {
            origin: source.to_string(),
            key: key.to_string(),
        })
    }
}

/// Parses a boolean (`yes/no`, `true/false`, `on/off`, `1/0`).
pub fn parse_bool(source: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(invalid(source, key)),
    }
}

/// Parses a control-mode list: a comma-separated subset of
/// {`off`, `auto`, `direct`}, where `off` must appear alone.
pub fn parse_control_modes(
    source: &str,
    key: &str,
    value: &str,
) -> Result<ControlModes, ConfigError> {
    let mut modes = ControlModes::empty();
    let mut off = false;
    let mut ntokens = 0;

    for token in value.split([',', ' ', '\t']) {
        if token.is_empty() {
            continue;
        }
        ntokens += 1;
        match token.to_ascii_lowercase().as_str() {
            "off" => off = true,
            "auto" => modes |= ControlModes::AUTO,
            "direct" => modes |= ControlModes::DIRECT,
            _ => return Err(invalid(source, key)),
        }
    }

    if ntokens == 0 || (off && !modes.is_empty()) {
        return Err(invalid(source, key));
    }

    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kb_units() {
        assert_eq!(parse_kb("t", "k", "100", "kb").unwrap(), 100);
        assert_eq!(parse_kb("t", "k", "100 kb", "mb").unwrap(), 100);
        assert_eq!(parse_kb("t", "k", "2mb", "kb").unwrap(), 2048);
        assert_eq!(parse_kb("t", "k", "1 g", "kb").unwrap(), 1024 * 1024);
        assert_eq!(parse_kb("t", "k", "3", "mb").unwrap(), 3072);
        assert_eq!(parse_kb("t", "k", "4GB", "kb").unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_parse_kb_invalid() {
        assert!(parse_kb("t", "k", "abc", "kb").is_err());
        assert!(parse_kb("t", "k", "12 parsec", "kb").is_err());
        assert!(parse_kb("t", "k", "", "kb").is_err());
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_kb_sec("t", "k", "200", "kb/s").unwrap(), 200);
        assert_eq!(parse_kb_sec("t", "k", "1 mb/s", "kb/s").unwrap(), 1024);
        assert_eq!(parse_kb_sec("t", "k", "2mbs", "kb/s").unwrap(), 2048);
        assert_eq!(
            parse_kb_sec("t", "k", "1 gb/sec", "kb/s").unwrap(),
            1024 * 1024
        );
    }

    #[test]
    fn test_parse_sec_units() {
        assert_eq!(parse_sec("t", "k", "30").unwrap(), 30);
        assert_eq!(parse_sec("t", "k", "5 min").unwrap(), 300);
        assert_eq!(parse_sec("t", "k", "2h").unwrap(), 7200);
        assert_eq!(parse_sec("t", "k", "1 hour").unwrap(), 3600);
        assert!(parse_sec("t", "k", "5 lightyears").is_err());
    }

    #[test]
    fn test_parse_pct() {
        assert!((parse_pct("t", "k", "15").unwrap() - 0.15).abs() < 1e-9);
        assert!((parse_pct("t", "k", "15%").unwrap() - 0.15).abs() < 1e-9);
        assert!((parse_pct("t", "k", "2.5 %").unwrap() - 0.025).abs() < 1e-9);
        assert!(parse_pct_range("t", "k", "15", 0.0, 0.1).is_err());
        assert!(parse_pct_range("t", "k", "5", 0.0, 0.1).is_ok());
    }

    #[test]
    fn test_parse_bool_values() {
        assert!(parse_bool("t", "k", "yes").unwrap());
        assert!(parse_bool("t", "k", "TRUE").unwrap());
        assert!(!parse_bool("t", "k", "off").unwrap());
        assert!(parse_bool("t", "k", "maybe").is_err());
    }

    #[test]
    fn test_parse_control_modes() {
        assert_eq!(
            parse_control_modes("t", "k", "auto").unwrap(),
            ControlModes::AUTO
        );
        assert_eq!(
            parse_control_modes("t", "k", "auto,direct").unwrap(),
            ControlModes::AUTO | ControlModes::DIRECT
        );
        assert_eq!(
            parse_control_modes("t", "k", "direct, auto").unwrap(),
            ControlModes::AUTO | ControlModes::DIRECT
        );
        assert!(parse_control_modes("t", "k", "off").unwrap().is_empty());
        // "off" must appear alone
        assert!(parse_control_modes("t", "k", "off,auto").is_err());
        assert!(parse_control_modes("t", "k", "").is_err());
        assert!(parse_control_modes("t", "k", "turbo").is_err());
    }
}
