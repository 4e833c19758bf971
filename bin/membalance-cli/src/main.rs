// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # membalance
//!
//! One executable hosting both halves of the membalance tool chain,
//! dispatched by the name it was invoked under:
//!
//! - **membalanced** — the balancing daemon,
//! - **membalancectl** — the operator command-line interface.
//!
//! ## Usage
//! ```bash
//! # run the daemon in the foreground with file logging
//! membalanced --log --debug-level 1
//!
//! # operator commands
//! membalancectl list
//! membalancectl pause
//! membalancectl free-memory 2gb --above-slack
//! membalancectl resume --force
//! ```

mod client;
mod commands;
mod daemon;
mod proto;
mod util;

use clap::{ArgAction, Parser, Subcommand};

/// Daemon command line (`membalanced`).
#[derive(Parser, Debug)]
#[command(name = "membalanced", version, about = "Membalance memory balancing daemon")]
struct DaemonCli {
    /// Run as a daemon.
    #[arg(long)]
    daemon: bool,

    /// Set the debugging output level.
    #[arg(long, default_value_t = 0)]
    debug_level: i32,

    /// Log to the daemon log file instead of syslog.
    #[arg(long)]
    log: bool,

    /// Do not prefix log records with timestamps.
    #[arg(long)]
    no_log_timestamps: bool,
}

/// Operator command line (`membalancectl`).
#[derive(Parser, Debug)]
#[command(
    name = "membalancectl",
    version,
    about = "Membalance daemon control utility",
    disable_help_flag = true
)]
struct CtlCli {
    /// RPC timeout, seconds.
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u32,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress informational output.
    #[arg(long, global = true)]
    quiet: bool,

    /// Display sizes in a human-readable MB.KB form.
    #[arg(short = 'h', long = "human", global = true)]
    human: bool,

    /// Use an alternate daemon control endpoint.
    #[arg(long, global = true, value_name = "path")]
    exec: Option<std::path::PathBuf>,

    /// Print help.
    #[arg(long, global = true, action = ArgAction::Help)]
    help: Option<bool>,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand, Debug)]
enum CtlCommand {
    /// Show daemon, memory and domain status.
    #[command(disable_help_flag = true)]
    List,

    /// Pause automatic memory adjustment.
    #[command(disable_help_flag = true)]
    Pause,

    /// Resume automatic memory adjustment.
    #[command(disable_help_flag = true)]
    Resume {
        /// Clear the pause level entirely.
        #[arg(long)]
        force: bool,
    },

    /// Reclaim free memory, shrinking managed domains if necessary.
    #[command(name = "free-memory", disable_help_flag = true)]
    FreeMemory {
        /// Amount to free, with an optional unit (e.g. "512mb", "2gb").
        amount: Option<String>,

        /// Take the amount from the `memory` keys of a domain config file.
        #[arg(long, value_name = "file", conflicts_with = "amount")]
        config: Option<std::path::PathBuf>,

        /// Count the amount on top of the host free-memory slack.
        #[arg(long)]
        above_slack: bool,

        /// Allow drawing down the hard reserve.
        #[arg(long)]
        use_reserved_hard: bool,

        /// Fail without shrinking anything if the goal is unattainable.
        #[arg(long)]
        must: bool,
    },

    /// Ask the daemon to (re)examine a domain for management.
    #[command(name = "manage-domain", disable_help_flag = true)]
    ManageDomain {
        /// Domain id.
        domain_id: Option<i64>,

        /// Rescan all currently unmanaged domains.
        #[arg(long, short = 'a', conflicts_with = "domain_id")]
        all: bool,
    },

    /// Query or set the daemon debug level.
    #[command(name = "log-level", disable_help_flag = true)]
    LogLevel { level: Option<i32> },

    /// Query or set the daemon logging sink.
    #[command(name = "log-sink", disable_help_flag = true)]
    LogSink {
        /// "syslog" or "logfile".
        sink: Option<String>,
    },

    /// Ask the daemon to dump its state to its log.
    #[command(name = "dump-debug", disable_help_flag = true)]
    DumpDebug,

    /// Fetch the daemon's debug state and print it.
    #[command(name = "show-debug", disable_help_flag = true)]
    ShowDebug,
}

fn main() {
    let progname = invoked_name();
    let code = match progname.as_str() {
        proto::CTL_PROGNAME => {
            let cli = CtlCli::parse();
            commands::dispatch(cli)
        }
        proto::PROGNAME => {
            let cli = DaemonCli::parse();
            daemon::run(cli.daemon, cli.debug_level, cli.log, cli.no_log_timestamps)
        }
        other => {
            eprintln!(
                "error: unrecognized program name \"{other}\", \
                 must be either membalancectl or membalanced"
            );
            1
        }
    };
    std::process::exit(code);
}

/// The basename the executable was invoked under.
fn invoked_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(|arg0| {
            std::path::Path::new(arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg0.to_string())
        })
        .unwrap_or_else(|| proto::PROGNAME.to_string())
}
