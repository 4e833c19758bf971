// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Control RPC server side.
//!
//! One connection carries one request. The dispatcher runs on the single
//! control thread between scheduler deadlines, so every handler operates
//! on the engine without any locking.

use crate::daemon::{logging, status};
use crate::proto::{Request, Response, LOG_PATH, SOCKET_PATH};
use balance_engine::{free_memory_request, Engine, FreememRequest};
use std::io::Write as _;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Binds the control socket, replacing a stale socket file if its owner
/// is gone. A live owner means another daemon instance.
pub fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => anyhow::bail!("membalanced is already running and owns the RPC socket"),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                std::fs::remove_file(path)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("socket file {} in a bad state", path.display())));
            }
        }
    }

    let listener = UnixListener::bind(path)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o700);
    std::fs::set_permissions(path, perms)?;
    tracing::debug!(path = %path.display(), "control RPC socket ready");
    Ok(listener)
}

/// Serves one accepted connection: read a request line, dispatch, write
/// the response line.
pub async fn handle_connection(eng: &mut Engine, stream: UnixStream) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let response = match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) => match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => dispatch(eng, request),
            Err(e) => Response::Error {
                message: format!("malformed request: {e}"),
            },
        },
        Err(e) => {
            tracing::debug!(error = %e, "error reading RPC request");
            return;
        }
    };

    let mut reply = match serde_json::to_string(&response) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "unable to serialise RPC response");
            return;
        }
    };
    reply.push('\n');

    let mut stream = reader.into_inner();
    if let Err(e) = stream.write_all(reply.as_bytes()).await {
        tracing::debug!(error = %e, "error writing RPC response");
    }
}

fn dispatch(eng: &mut Engine, request: Request) -> Response {
    match request {
        Request::Null => Response::Ok,

        Request::Pause => Response::Level { level: eng.pause() },

        Request::Resume { force } => Response::Level {
            level: eng.resume(force),
        },

        Request::Freemem {
            amt_kb,
            above_slack,
            use_reserved_hard,
            must,
            timeout_secs,
        } => {
            let req = FreememRequest {
                needed_kb: amt_kb,
                above_slack,
                use_reserved_hard,
                must,
                timeout_ms: timeout_secs as i64 * 1000,
            };
            match free_memory_request(eng, req) {
                Ok(out) => Response::Freemem {
                    status: out.status,
                    freemem_with_slack: out.freemem_with_slack,
                    freemem_less_slack: out.freemem_less_slack,
                },
                Err(e) => Response::Error {
                    message: format!("free-memory failed: {e}"),
                },
            }
        }

        Request::ManageDomain { domain_id } => {
            let (st, message) = eng.rescan_domain(domain_id);
            Response::Status {
                status: st.code(),
                message,
            }
        }

        Request::ShowStatus { verbosity: _ } => Response::Text {
            text: status::render_status(eng),
        },

        Request::DebugDump => {
            tracing::info!(
                "received debug dump request, dumping the state to log file ({LOG_PATH}) ..."
            );
            let text = status::render_debug(eng);
            write_dump_to_log(&text);
            tracing::info!("debug dump completed.");
            Response::Ok
        }

        Request::DebugDumpToString => Response::Text {
            text: status::render_debug(eng),
        },

        Request::SetDebugLevel { level } => {
            let old = logging::debug_level();
            if level >= 0 {
                logging::set_debug_level(level);
                tracing::info!("setting logging level to {level}");
            }
            Response::Value { value: old }
        }

        Request::SetLoggingSink { sink } => Response::Value {
            value: logging::set_sink(sink),
        },

        Request::GetDomainSettings { domain_id } => {
            let (st, message, kvs) = eng.get_domain_settings(domain_id);
            Response::Settings {
                status: st.code(),
                message,
                kvs,
            }
        }

        Request::SetDomainSettings { .. } => Response::Settings {
            status: 'X',
            message: "function is not implemented yet".to_string(),
            kvs: Vec::new(),
        },

        Request::Test { .. } => Response::Status {
            status: 'X',
            message: "test commands are not available in production builds".to_string(),
        },
    }
}

/// Appends a multi-line state dump to the daemon log file with the
/// separators the log readers expect.
pub fn write_dump_to_log(text: &str) {
    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_PATH)
    else {
        tracing::error!("unable to open {LOG_PATH} for the debug dump");
        return;
    };
    let _ = writeln!(file, "======================================================");
    let _ = writeln!(file);
    let _ = file.write_all(text.as_bytes());
    let _ = writeln!(file, "------------------------------------------------------");
}

/// The default socket path, for the daemon setup code.
pub fn socket_path() -> &'static Path {
    Path::new(SOCKET_PATH)
}
