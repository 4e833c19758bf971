// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The daemon event loop.
//!
//! One task multiplexes everything: scheduler ticks (every `interval`
//! seconds), pending-domain passes (every second while anything is
//! pending), namespace watch events, control RPC connections, and
//! signals — SIGTERM exits cleanly, SIGHUP reloads the configuration,
//! SIGUSR1 dumps the daemon state to the log, and the legacy real-time
//! control signal is acknowledged as deprecated.
//!
//! The wait before each pass is the minimum of the next tick deadline,
//! the next pending pass (only while domains are pending), one second
//! when an interval refresh is outstanding, and a day otherwise. A
//! deadline within the 200 ms tolerance runs without further sleeping.

use crate::daemon::{rpc, status};
use crate::proto::LOG_PATH;
use balance_engine::Engine;
use config_store::consts;
use host_gate::Stamp;
use probe_channel::WatchEvent;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;

/// Milliseconds until the next scheduled work item.
fn calc_wait_ms(eng: &Engine, now: Stamp, ts0_sched: Stamp, ts0_pending: Stamp) -> i64 {
    // with nothing to do, wake once in a blue moon
    let mut wait_ms: i64 = 24 * 3600 * 1000;

    if eng.registry.managed_len() > 0 {
        let interval_ms = eng.config.interval.value() as i64 * 1000;
        wait_ms = wait_ms.min(interval_ms - now.diff_ms(ts0_sched));
    }

    if eng.registry.pending_len() > 0 {
        wait_ms = wait_ms.min(1000 - now.diff_ms(ts0_pending));
    }

    if eng.update_interval_in_store {
        wait_ms = wait_ms.min(1000);
    }

    wait_ms.max(0)
}

pub async fn run(
    eng: &mut Engine,
    listener: UnixListener,
    mut watch_rx: UnboundedReceiver<WatchEvent>,
) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    // SIGRTMIN+5, the historical membalancectl signalling channel.
    let mut sigctrl = signal(SignalKind::from_raw(libc::SIGRTMIN() + 5))?;

    let clock = eng.clock;
    let mut ts0_sched = clock.now();
    let mut ts0_pending = clock.now();

    loop {
        let wait_ms = calc_wait_ms(eng, clock.now(), ts0_sched, ts0_pending);

        if wait_ms >= consts::TOLERANCE_MS {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => {}

                _ = sigterm.recv() => {
                    tracing::info!("terminating...");
                    return Ok(());
                }

                _ = sighup.recv() => {
                    reload_configuration(eng)?;
                    continue;
                }

                _ = sigusr1.recv() => {
                    tracing::info!(
                        "received SIGUSR1, dumping the state to log file ({LOG_PATH}) ..."
                    );
                    rpc::write_dump_to_log(&status::render_debug(eng));
                    tracing::info!("SIGUSR1 dump completed.");
                    continue;
                }

                _ = sigctrl.recv() => {
                    tracing::warn!(
                        "legacy control signal received; use membalancectl pause/resume"
                    );
                    continue;
                }

                event = watch_rx.recv() => {
                    // drain the whole batch before re-evaluating deadlines
                    if let Some(event) = event {
                        eng.handle_watch_event(&event.path)?;
                        while let Ok(event) = watch_rx.try_recv() {
                            eng.handle_watch_event(&event.path)?;
                        }
                    }
                    continue;
                }

                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => rpc::handle_connection(eng, stream).await,
                        Err(e) => tracing::error!("unable to accept RPC connection: {e}"),
                    }
                    continue;
                }
            }
        }

        // A refresh of the published interval may be outstanding after a
        // configuration change with no promotion to piggyback on.
        if eng.update_interval_in_store && eng.registry.managed_len() > 0 {
            eng.refresh_interval_key()?;
        }

        let now = clock.now();
        if eng.registry.pending_len() > 0
            && now.diff_ms(ts0_pending) >= 1000 - consts::TOLERANCE_MS
        {
            eng.process_pending_domains()?;
            ts0_pending = clock.now();
        }

        let now = clock.now();
        if eng.registry.managed_len() > 0
            && now.diff_ms(ts0_sched)
                >= eng.config.interval.value() as i64 * 1000 - consts::TOLERANCE_MS
        {
            if eng.take_resuming() {
                eng.sched_slept(now.diff_ms(ts0_sched));
            }
            eng.run_sched_tick()?;
            ts0_sched = clock.now();
        }
    }
}

/// SIGHUP: reload the configuration file and re-examine domains.
fn reload_configuration(eng: &mut Engine) -> anyhow::Result<()> {
    let mut new = crate::daemon::load_configuration(true)?;
    new.derive_reserved_soft(
        eng.host().physical_memory()?,
        eng.host().free_slack()?,
        eng.host().privileged_minsize()?,
        eng.host().page_size_kb(),
    );
    eng.apply_new_config(new)?;
    Ok(())
}
