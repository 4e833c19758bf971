// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `membalancectl free-memory`: reclaim a given amount of host memory,
//! for purposes such as starting a new virtual machine.
//!
//! The amount comes either directly (`free-memory 2gb`) or from the
//! `memory` keys of a domain config file (`free-memory --config vm.cfg`),
//! which is the amount that VM will need to start.

use crate::client;
use crate::util::decode_memsize;
use crate::commands::Ctx;
use crate::proto::{Request, Response};
use anyhow::{bail, Context};
use config_store::units;
use std::path::PathBuf;

pub fn execute(
    ctx: &Ctx,
    amount: Option<String>,
    config: Option<PathBuf>,
    above_slack: bool,
    use_reserved_hard: bool,
    must: bool,
) -> anyhow::Result<()> {
    let amt_kb = match (&amount, &config) {
        (Some(text), None) => {
            units::parse_kb("command line", "amount", text, "mb").map_err(anyhow::Error::from)?
        }
        (None, Some(path)) => config_file_memory(path)?,
        (None, None) => bail!("specify an amount or --config <file>"),
        (Some(_), Some(_)) => unreachable!("clap rejects the combination"),
    };

    let resp = client::call(
        ctx.socket.as_deref(),
        ctx.timeout,
        &Request::Freemem {
            amt_kb,
            above_slack,
            use_reserved_hard,
            must,
            timeout_secs: ctx.timeout,
        },
    )?;

    let (status, with_slack, less_slack) = match resp {
        Response::Freemem {
            status,
            freemem_with_slack,
            freemem_less_slack,
        } => (status, freemem_with_slack, freemem_less_slack),
        other => bail!("unexpected response: {other:?}"),
    };

    let show = |kb: u64| {
        if ctx.human {
            format!("{} (MB.KB)", decode_memsize(kb as i64))
        } else {
            format!("{kb} KB")
        }
    };

    match status {
        'A' => {
            if !ctx.quiet {
                println!("free memory including slack: {}", show(with_slack));
                println!("free memory above slack:     {}", show(less_slack));
            }
            if less_slack < amt_kb && must {
                bail!("attained less than requested");
            }
            Ok(())
        }
        'N' => bail!(
            "the requested amount is not attainable; maximum attainable \
             above slack is {}",
            show(less_slack)
        ),
        'P' => bail!("automatic memory adjustment is not paused (run \"membalancectl pause\" first)"),
        other => bail!("unexpected status {other:?}"),
    }
}

/// Sums the `memory` keys (MB) of a domain config file into KB.
fn config_file_memory(path: &std::path::Path) -> anyhow::Result<u64> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;

    let mut total_kb: u64 = 0;
    let mut found = false;
    for raw in text.lines() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() != "memory" {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        let mb: u64 = value
            .parse()
            .with_context(|| format!("invalid \"memory\" value in {}", path.display()))?;
        total_kb += mb * 1024;
        found = true;
    }

    if !found {
        bail!("no \"memory\" key in {}", path.display());
    }
    Ok(total_kb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.cfg");
        std::fs::write(&path, "name = \"web\"\nmemory = 2048\n# memory = 512\n").unwrap();
        assert_eq!(config_file_memory(&path).unwrap(), 2048 * 1024);

        std::fs::write(&path, "name = \"web\"\n").unwrap();
        assert!(config_file_memory(&path).is_err());
    }
}
