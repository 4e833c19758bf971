// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Guest report wire format.
//!
//! A probe publishes newline-delimited `key: value` text; the first line is
//! a single-character format version, currently `A`:
//!
//! ```text
//! A
//! action: report
//! progname: memprobed
//! progversion: 0.1
//! seq: 12
//! kb: 500
//! kbsec: 100
//! freepct: 5.0
//! ```
//!
//! A malformed or wrong-version report is a hard error; the registry
//! responds by unmanaging the reporting domain.

use crate::ReportError;
use std::collections::HashMap;

/// The current report format version line.
pub const REPORT_VERSION: char = 'A';

/// One parsed guest report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GuestReport {
    pub progname: Option<String>,
    pub progversion: Option<String>,
    /// Probe-side sequence number.
    pub seq: Option<u64>,
    /// KB mapped in since the previous report.
    pub kb: Option<u64>,
    /// Data map-in rate, KB/s.
    pub kbsec: u64,
    /// Guest free memory percentage, 0..100.
    pub freepct: f64,
}

impl GuestReport {
    /// Parses a raw report blob.
    pub fn parse(raw: &str) -> Result<GuestReport, ReportError> {
        let mut lines = raw.lines();

        match lines.next() {
            Some(v) if v == REPORT_VERSION.to_string().as_str() => {}
            Some(v) => return Err(ReportError::BadVersion(v.chars().next())),
            None => return Err(ReportError::BadVersion(None)),
        }

        let mut kv: HashMap<&str, &str> = HashMap::new();
        for line in lines {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            kv.insert(key.trim(), value.trim());
        }

        match kv.get("action") {
            Some(&"report") => {}
            Some(other) => return Err(ReportError::BadAction((*other).to_string())),
            None => return Err(ReportError::MissingField("action")),
        }

        let kbsec = parse_u64_field(&kv, "kbsec")?.ok_or(ReportError::MissingField("kbsec"))?;
        let freepct = match kv.get("freepct") {
            Some(v) => v.parse::<f64>().map_err(|_| ReportError::BadField {
                field: "freepct",
                value: (*v).to_string(),
            })?,
            None => return Err(ReportError::MissingField("freepct")),
        };

        Ok(GuestReport {
            progname: kv.get("progname").map(|s| s.to_string()),
            progversion: kv.get("progversion").map(|s| s.to_string()),
            seq: parse_u64_field(&kv, "seq")?,
            kb: parse_u64_field(&kv, "kb")?,
            kbsec,
            freepct,
        })
    }
}

fn parse_u64_field(
    kv: &HashMap<&str, &str>,
    field: &'static str,
) -> Result<Option<u64>, ReportError> {
    match kv.get(field) {
        None => Ok(None),
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ReportError::BadField {
                field,
                value: (*v).to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
A
action: report
progname: memprobed
progversion: 0.1
seq: 12
kb: 500
kbsec: 100
freepct: 5.0
";

    #[test]
    fn test_parse_full_report() {
        let r = GuestReport::parse(SAMPLE).unwrap();
        assert_eq!(r.progname.as_deref(), Some("memprobed"));
        assert_eq!(r.seq, Some(12));
        assert_eq!(r.kb, Some(500));
        assert_eq!(r.kbsec, 100);
        assert!((r.freepct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_minimal_report() {
        let r = GuestReport::parse("A\naction: report\nkbsec: 0\nfreepct: 100\n").unwrap();
        assert_eq!(r.kbsec, 0);
        assert!((r.freepct - 100.0).abs() < 1e-9);
        assert_eq!(r.seq, None);
    }

    #[test]
    fn test_wrong_version() {
        assert_eq!(
            GuestReport::parse("B\naction: report\nkbsec: 1\nfreepct: 0\n"),
            Err(ReportError::BadVersion(Some('B')))
        );
        assert_eq!(GuestReport::parse(""), Err(ReportError::BadVersion(None)));
    }

    #[test]
    fn test_wrong_action() {
        assert!(matches!(
            GuestReport::parse("A\naction: hello\nkbsec: 1\nfreepct: 0\n"),
            Err(ReportError::BadAction(_))
        ));
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            GuestReport::parse("A\naction: report\nfreepct: 0\n"),
            Err(ReportError::MissingField("kbsec"))
        );
        assert_eq!(
            GuestReport::parse("A\naction: report\nkbsec: 1\n"),
            Err(ReportError::MissingField("freepct"))
        );
    }

    #[test]
    fn test_bad_numeric() {
        assert!(matches!(
            GuestReport::parse("A\naction: report\nkbsec: fast\nfreepct: 0\n"),
            Err(ReportError::BadField { field: "kbsec", .. })
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let r =
            GuestReport::parse("A\naction: report\nkbsec: 7\nfreepct: 1\nfuture_key: x\n").unwrap();
        assert_eq!(r.kbsec, 7);
    }
}
