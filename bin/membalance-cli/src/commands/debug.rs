// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl dump-debug` / `show-debug`: the daemon's full state,
//! either into its own log or onto this terminal.

use crate::client;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::bail;

pub fn dump(ctx: &Ctx) -> anyhow::Result<()> {
    let resp = client::call(ctx.socket.as_deref(), ctx.timeout, &Request::DebugDump)?;
    match resp {
        Response::Ok => {
            if !ctx.quiet {
                println!("state dumped to the daemon log ({})", crate::proto::LOG_PATH);
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

pub fn show(ctx: &Ctx) -> anyhow::Result<()> {
    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::DebugDumpToString,
    )?;
    match resp {
        Response::Text { text } => {
            print!("{text}");
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
