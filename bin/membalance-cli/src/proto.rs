// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Control RPC wire format.
//!
//! The operator CLI opens one connection to the daemon's unix socket per
//! invocation, writes a single JSON request line, reads a single JSON
//! response line, and closes.

use serde::{Deserialize, Serialize};

/// Well-known daemon paths.
pub const RUN_DIR: &str = "/var/run/membalance";
pub const LOCK_PATH: &str = "/var/run/membalance/membalanced.lock";
pub const SOCKET_PATH: &str = "/var/run/membalance/membalanced.socket";
pub const LOG_PATH: &str = "/var/log/membalanced.log";

pub const PROGNAME: &str = "membalanced";
pub const CTL_PROGNAME: &str = "membalancectl";
pub const PROGVERSION: &str = env!("CARGO_PKG_VERSION");

/// One request from the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe.
    Null,
    Pause,
    Resume {
        force: bool,
    },
    Freemem {
        amt_kb: u64,
        above_slack: bool,
        use_reserved_hard: bool,
        must: bool,
        timeout_secs: u32,
    },
    /// `domain_id = −1` means "all unmanaged domains".
    ManageDomain {
        domain_id: i64,
    },
    ShowStatus {
        verbosity: u32,
    },
    /// Dump the daemon state to its log.
    DebugDump,
    /// Dump the daemon state into the response.
    DebugDumpToString,
    /// `level = −1` queries without changing.
    SetDebugLevel {
        level: i32,
    },
    /// 0 = syslog, 1 = logfile, −1 = query.
    SetLoggingSink {
        sink: i32,
    },
    GetDomainSettings {
        domain_id: i64,
    },
    SetDomainSettings {
        domain_id: i64,
        settings: Vec<(String, String)>,
    },
    /// Development-mode hook; rejected in production builds.
    Test {
        args: Vec<String>,
    },
}

/// One response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resp", rename_all = "snake_case")]
pub enum Response {
    Ok,
    /// Current pause level after a pause/resume.
    Level { level: u32 },
    Freemem {
        status: char,
        freemem_with_slack: u64,
        freemem_less_slack: u64,
    },
    /// Status code plus a human-readable message.
    Status { status: char, message: String },
    Text { text: String },
    /// Previous value of an adjustable daemon knob.
    Value { value: i32 },
    Settings {
        status: char,
        message: String,
        kvs: Vec<(String, String)>,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Request::Freemem {
            amt_kb: 1024,
            above_slack: true,
            use_reserved_hard: false,
            must: true,
            timeout_secs: 10,
        };
        let line = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&line).unwrap();
        match back {
            Request::Freemem { amt_kb, must, .. } => {
                assert_eq!(amt_kb, 1024);
                assert!(must);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = Response::Freemem {
            status: 'A',
            freemem_with_slack: 2048,
            freemem_less_slack: 1024,
        };
        let line = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&line).unwrap();
        match back {
            Response::Freemem { status, .. } => assert_eq!(status, 'A'),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_requests_are_single_line() {
        let req = Request::SetDomainSettings {
            domain_id: 3,
            settings: vec![("dmem_quota".into(), "4096".into())],
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains('\n'));
    }
}
