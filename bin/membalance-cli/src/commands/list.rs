// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl list`: print the daemon's status report.

use crate::client;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::bail;

pub fn execute(ctx: &Ctx) -> anyhow::Result<()> {
    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::ShowStatus { verbosity: 0 },
    )?;
    match resp {
        Response::Text { text } => {
            print!("{text}");
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
