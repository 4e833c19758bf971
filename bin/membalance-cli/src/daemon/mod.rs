// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The membalance daemon proper.
//!
//! Startup order: daemonise (when asked), initialise logging, select the
//! clock, take the single-instance lock, load the configuration, wire the
//! collaborator backends, bind the control socket, reconcile leftover
//! report slots, enlist existing domains, and enter the event loop.
//!
//! Everything mutable lives in the [`balance_engine::Engine`] owned by
//! the event loop; there is exactly one control thread.

mod event_loop;
pub mod logging;
pub mod rpc;
pub mod status;

use crate::proto::{LOCK_PATH, LOG_PATH, PROGNAME, RUN_DIR};
use anyhow::Context;
use balance_engine::Engine;
use config_store::{file::CONF_PATH, ConfigError, GlobalConfig};
use host_gate::{HostGate, MonotonicClock, SimHost};
use probe_channel::{paths, KvStore, MemStore};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::rc::Rc;

/// Daemon entry point; returns the process exit code.
pub fn run(daemonize: bool, debug_level: i32, log_to_file: bool, no_log_timestamps: bool) -> i32 {
    if daemonize {
        if let Err(e) = daemonize_process() {
            eprintln!("{PROGNAME}: unable to daemonize: {e:#}");
            return 1;
        }
    }

    let foreground = !daemonize && unsafe { libc::isatty(libc::STDERR_FILENO) } == 1;
    logging::init(debug_level, log_to_file, !no_log_timestamps, foreground);
    tracing::debug!("debug level set to {debug_level}");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("unable to start the runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(daemon_main()) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            1
        }
    }
}

async fn daemon_main() -> anyhow::Result<()> {
    let clock = MonotonicClock::select().context("no usable clock")?;

    make_rundir().context("unable to prepare the run directory")?;
    let _lock = one_instance().context("instance interlock")?;

    let config = load_configuration(false)?;

    let (host, store) = backend();

    // The soft reserve default derives from host figures.
    let mut config = config;
    config.derive_reserved_soft(
        host.physical_memory()?,
        host.free_slack()?,
        host.privileged_minsize()?,
        host.page_size_kb(),
    );

    let watch_rx = store.subscribe(paths::LOCAL_DOMAIN_ROOT);
    let listener = rpc::bind_socket(rpc::socket_path())?;

    let mut engine = Engine::new(config, host, store, clock);
    engine.bootstrap()?;

    event_loop::run(&mut engine, listener, watch_rx).await
}

/// Loads `/etc/membalance.conf`. A missing file only warns; an unreadable
/// file is fatal on the initial load and an error on reload.
pub fn load_configuration(reload: bool) -> anyhow::Result<GlobalConfig> {
    tracing::debug!(
        "{} configuration",
        if reload { "reloading" } else { "loading" }
    );
    match GlobalConfig::load_file(Path::new(CONF_PATH)) {
        Ok(cfg) => Ok(cfg),
        Err(ConfigError::ReadError { path, source })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::warn!("unable to read configuration file {path}");
            Ok(GlobalConfig::defaults())
        }
        Err(e) if reload => {
            tracing::error!("{e}");
            Ok(GlobalConfig::defaults())
        }
        Err(e) => Err(e.into()),
    }
}

/// Wires the engine's collaborators.
///
/// The hypervisor control surface and the shared namespace are external
/// components reached through the [`HostGate`] and [`KvStore`] traits;
/// this build links the simulated backends, which is what development and
/// the test suite run against. A production build plugs the real control
/// surface in here.
fn backend() -> (Rc<dyn HostGate>, Rc<dyn KvStore>) {
    let host = Rc::new(SimHost::new(16 * 1024 * 1024, 128 * 1024));
    let store = Rc::new(MemStore::new());
    (host, store)
}

/// Ensures `/var/run/membalance` exists with mode 0700.
fn make_rundir() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let dir = Path::new(RUN_DIR);
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Takes the exclusive advisory lock that guarantees a single daemon
/// instance. The returned fd must stay open for the daemon's lifetime.
fn one_instance() -> anyhow::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let path = std::ffi::CString::new(LOCK_PATH).expect("static path");
    // SAFETY: path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o700) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("unable to create or open {LOCK_PATH}"));
    }
    // SAFETY: fd was just returned by open and is owned by no one else.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let lk = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 1,
        l_pid: 0,
    };
    // SAFETY: fd is valid and lk is a properly initialised flock.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &lk) };
    if rc == 0 {
        return Ok(owned);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => {
            anyhow::bail!("another instance of {PROGNAME} is already running")
        }
        _ => Err(err).with_context(|| format!("unable to acquire lock on {LOCK_PATH}")),
    }
}

/// Classic double-fork daemonisation: detach from the controlling
/// terminal, redirect stdio to /dev/null and the daemon log. Must run
/// before the async runtime starts.
fn daemonize_process() -> anyhow::Result<()> {
    // SAFETY: single-threaded at this point; fork/setsid/dup2 are used in
    // the ordinary daemonisation sequence.
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() < 0 {
            anyhow::bail!("setsid: {}", std::io::Error::last_os_error());
        }
        libc::umask(0);

        match libc::fork() {
            -1 => anyhow::bail!("fork: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) < 0 {
            anyhow::bail!("chdir to root: {}", std::io::Error::last_os_error());
        }

        let nullfd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if nullfd < 0 {
            anyhow::bail!("cannot open /dev/null: {}", std::io::Error::last_os_error());
        }

        let log_path = std::ffi::CString::new(LOG_PATH).expect("static path");
        let logfd = libc::open(
            log_path.as_ptr(),
            libc::O_CREAT | libc::O_APPEND | libc::O_RDWR,
            0o700,
        );
        if logfd < 0 {
            anyhow::bail!("cannot open {LOG_PATH}: {}", std::io::Error::last_os_error());
        }

        if libc::dup2(nullfd, libc::STDIN_FILENO) != libc::STDIN_FILENO
            || libc::dup2(logfd, libc::STDOUT_FILENO) != libc::STDOUT_FILENO
            || libc::dup2(logfd, libc::STDERR_FILENO) != libc::STDERR_FILENO
        {
            anyhow::bail!("dup2: {}", std::io::Error::last_os_error());
        }
        libc::close(nullfd);
        libc::close(logfd);
    }
    Ok(())
}
