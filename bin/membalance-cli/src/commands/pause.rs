// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl pause` / `resume`: the pause level is a counter, so
//! nested tooling can pause without stepping on each other; `--force`
//! zeroes it.

use crate::client;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::bail;

pub fn pause(ctx: &Ctx) -> anyhow::Result<()> {
    let resp = client::call(ctx.socket.as_deref(), ctx.timeout, &Request::Pause)?;
    match resp {
        Response::Level { level } => {
            if !ctx.quiet {
                println!("memory adjustment paused (pause level {level})");
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}

pub fn resume(ctx: &Ctx, force: bool) -> anyhow::Result<()> {
    let resp = client::call(ctx.socket.as_deref(), ctx.timeout, &Request::Resume { force })?;
    match resp {
        Response::Level { level } => {
            if !ctx.quiet {
                if level == 0 {
                    println!("memory adjustment resumed");
                } else {
                    println!("pause level reduced to {level}");
                }
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
