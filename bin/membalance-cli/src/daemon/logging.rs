// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Daemon logging.
//!
//! The daemon logs to syslog by default, to its private log file with
//! `--log`, or to the terminal when running interactively. Both the sink
//! and the debug level are adjustable at run time through the control
//! RPC; the tracing writer consults the sink atomically on every record
//! and the level goes through a reloadable filter.
//!
//! The numeric debug level maps onto tracing levels: 0 is informational,
//! 1 and above enables debug records, 10 and above trace records.

use crate::proto::LOG_PATH;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Layer, Registry};

/// 0 = syslog, 1 = logfile (the RPC wire encoding).
static SINK: AtomicI32 = AtomicI32::new(0);
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);
/// Interactive foreground run: log to stderr regardless of the sink.
static FOREGROUND: AtomicBool = AtomicBool::new(false);

type FilterHandle = reload::Handle<LevelFilter, Registry>;
static FILTER: OnceLock<FilterHandle> = OnceLock::new();

fn level_filter(debug_level: i32) -> LevelFilter {
    if debug_level >= 10 {
        LevelFilter::TRACE
    } else if debug_level >= 1 {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Initialises the tracing stack. Called once at daemon startup.
pub fn init(debug_level: i32, log_to_file: bool, timestamps: bool, foreground: bool) {
    DEBUG_LEVEL.store(debug_level, Ordering::Relaxed);
    SINK.store(if log_to_file { 1 } else { 0 }, Ordering::Relaxed);
    FOREGROUND.store(foreground && !log_to_file, Ordering::Relaxed);

    let (filter, handle) = reload::Layer::new(level_filter(debug_level));
    let _ = FILTER.set(handle);

    let fmt = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(SinkMaker);
    let fmt: Box<dyn Layer<_> + Send + Sync> = if timestamps {
        Box::new(fmt)
    } else {
        Box::new(fmt.without_time())
    };

    tracing_subscriber::registry().with(filter).with(fmt).init();
}

/// Current numeric debug level.
pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Sets the debug level; returns the previous one.
pub fn set_debug_level(level: i32) -> i32 {
    let old = DEBUG_LEVEL.swap(level, Ordering::Relaxed);
    if let Some(handle) = FILTER.get() {
        let _ = handle.reload(level_filter(level));
    }
    old
}

/// Sets the log sink (0 = syslog, 1 = logfile); −1 queries. Returns the
/// previous sink.
pub fn set_sink(sink: i32) -> i32 {
    let old = SINK.load(Ordering::Relaxed);
    if sink == 0 || sink == 1 {
        SINK.store(sink, Ordering::Relaxed);
        if sink != old {
            FOREGROUND.store(false, Ordering::Relaxed);
        }
    }
    old
}

// ── The switchable writer ──────────────────────────────────────

#[derive(Clone, Copy)]
pub struct SinkMaker;

pub enum SinkWriter {
    Stderr(io::Stderr),
    File(std::fs::File),
    /// Buffered until flush, then handed to syslog line by line.
    Syslog(Vec<u8>),
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkMaker {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> SinkWriter {
        if FOREGROUND.load(Ordering::Relaxed) {
            return SinkWriter::Stderr(io::stderr());
        }
        match SINK.load(Ordering::Relaxed) {
            1 => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(LOG_PATH)
            {
                Ok(file) => SinkWriter::File(file),
                Err(_) => SinkWriter::Stderr(io::stderr()),
            },
            _ => SinkWriter::Syslog(Vec::new()),
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Stderr(w) => w.write(buf),
            SinkWriter::File(w) => w.write(buf),
            SinkWriter::Syslog(pending) => {
                pending.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Stderr(w) => w.flush(),
            SinkWriter::File(w) => w.flush(),
            SinkWriter::Syslog(pending) => {
                emit_syslog(pending);
                pending.clear();
                Ok(())
            }
        }
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if let SinkWriter::Syslog(pending) = self {
            if !pending.is_empty() {
                emit_syslog(pending);
            }
        }
    }
}

fn emit_syslog(buf: &[u8]) {
    static OPENED: OnceLock<()> = OnceLock::new();
    OPENED.get_or_init(|| {
        static IDENT: &[u8] = b"membalanced\0";
        // SAFETY: IDENT is a static NUL-terminated string; openlog keeps
        // the pointer, which stays valid for the process lifetime.
        unsafe {
            libc::openlog(
                IDENT.as_ptr() as *const libc::c_char,
                libc::LOG_CONS | libc::LOG_PID,
                libc::LOG_DAEMON,
            );
        }
    });

    for line in buf.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Ok(cline) = std::ffi::CString::new(line.to_vec()) {
            // SAFETY: both format and argument are valid NUL-terminated
            // strings; the fixed "%s" format defuses any format
            // characters in the message.
            unsafe {
                libc::syslog(
                    libc::LOG_INFO,
                    b"%s\0".as_ptr() as *const libc::c_char,
                    cline.as_ptr(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(0), LevelFilter::INFO);
        assert_eq!(level_filter(1), LevelFilter::DEBUG);
        assert_eq!(level_filter(5), LevelFilter::DEBUG);
        assert_eq!(level_filter(10), LevelFilter::TRACE);
    }

    #[test]
    fn test_sink_switch_reports_previous() {
        SINK.store(0, Ordering::Relaxed);
        assert_eq!(set_sink(-1), 0); // query does not change
        assert_eq!(set_sink(1), 0);
        assert_eq!(set_sink(0), 1);
        assert_eq!(set_sink(7), 0); // out of range: query semantics
    }
}
