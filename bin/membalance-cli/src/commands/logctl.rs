// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl log-level` / `log-sink`: query or adjust the daemon's
//! logging at run time.

use crate::client;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::bail;

pub fn log_level(ctx: &Ctx, level: Option<i32>) -> anyhow::Result<()> {
    if matches!(level, Some(l) if l < 0) {
        bail!("the debug level cannot be negative");
    }
    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::SetDebugLevel {
            level: level.unwrap_or(-1),
        },
    )?;
    match resp {
        Response::Value { value } => {
            if !ctx.quiet {
                match level {
                    Some(new) => println!("debug level changed: {value} -> {new}"),
                    None => println!("debug level: {value}"),
                }
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

pub fn log_sink(ctx: &Ctx, sink: Option<String>) -> anyhow::Result<()> {
    let code = match sink.as_deref() {
        None => -1,
        Some("syslog") => 0,
        Some("logfile") => 1,
        Some(other) => bail!("unknown log sink \"{other}\", expected syslog or logfile"),
    };
    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::SetLoggingSink { sink: code },
    )?;
    match resp {
        Response::Value { value } => {
            if !ctx.quiet {
                let name = |v: i32| if v == 1 { "logfile" } else { "syslog" };
                match code {
                    -1 => println!("log sink: {}", name(value)),
                    new => println!("log sink changed: {} -> {}", name(value), name(new)),
                }
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
