// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl manage-domain`: ask the daemon to (re)examine a domain
//! — or all unmanaged domains with `--all`.

use crate::client;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::bail;

pub fn execute(ctx: &Ctx, domain_id: Option<i64>, all: bool) -> anyhow::Result<()> {
    let domain_id = match (domain_id, all) {
        (Some(id), false) if id >= 0 => id,
        (None, true) => -1,
        _ => bail!("specify a domain id or --all"),
    };

    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::ManageDomain { domain_id },
    )?;
    match resp {
        Response::Status { status, message } => {
            if !ctx.quiet {
                println!("{message}");
            }
            if status == 'X' {
                bail!("request rejected");
            }
            Ok(())
        }
        other => bail!("unexpected response: {other:?}"),
    }
}
