// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Operator CLI command implementations.
//!
//! Every command opens one RPC connection to the daemon, prints its
//! result, and exits 0 on success, 1 on failure.

pub mod debug;
pub mod freemem;
pub mod list;
pub mod logctl;
pub mod manage;
pub mod pause;

use crate::{CtlCli, CtlCommand};
use tracing_subscriber::EnvFilter;

/// Shared per-invocation context distilled from the global flags.
pub struct Ctx {
    pub timeout: u32,
    pub quiet: bool,
    pub human: bool,
    pub socket: Option<std::path::PathBuf>,
}

/// Initialises stderr tracing for the CLI based on `-v` count.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Runs the selected command; returns the process exit code.
pub fn dispatch(cli: CtlCli) -> i32 {
    init_tracing(cli.verbose);

    let ctx = Ctx {
        timeout: cli.timeout,
        quiet: cli.quiet,
        human: cli.human,
        socket: cli.exec.clone(),
    };

    let result = match cli.command {
        CtlCommand::List => list::execute(&ctx),
        CtlCommand::Pause => pause::pause(&ctx),
        CtlCommand::Resume { force } => pause::resume(&ctx, force),
        CtlCommand::FreeMemory {
            amount,
            config,
            above_slack,
            use_reserved_hard,
            must,
        } => freemem::execute(&ctx, amount, config, above_slack, use_reserved_hard, must),
        CtlCommand::ManageDomain { domain_id, all } => manage::execute(&ctx, domain_id, all),
        CtlCommand::LogLevel { level } => logctl::log_level(&ctx, level),
        CtlCommand::LogSink { sink } => logctl::log_sink(&ctx, sink),
        CtlCommand::DumpDebug => debug::dump(&ctx),
        CtlCommand::ShowDebug => debug::show(&ctx),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}: {e:#}", crate::proto::CTL_PROGNAME);
            1
        }
    }
}
