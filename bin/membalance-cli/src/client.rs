// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! RPC client side: one connection per request.

use crate::proto::{Request, Response, SOCKET_PATH};
use anyhow::{bail, Context};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Sends one request to the daemon and reads the response.
pub fn call(
    socket_path: Option<&Path>,
    timeout_secs: u32,
    request: &Request,
) -> anyhow::Result<Response> {
    let path = socket_path.unwrap_or_else(|| Path::new(SOCKET_PATH));

    let mut stream = UnixStream::connect(path)
        .with_context(|| format!("unable to connect to membalanced at {}", path.display()))?;
    let timeout = Some(Duration::from_secs(timeout_secs.max(1) as u64));
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader
        .read_line(&mut reply)
        .context("no response from membalanced")?;
    if reply.trim().is_empty() {
        bail!("membalanced closed the connection without a response");
    }

    let response: Response =
        serde_json::from_str(reply.trim()).context("malformed response from membalanced")?;
    if let Response::Error { message } = &response {
        bail!("membalanced: {message}");
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_without_daemon_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("none.socket");
        let out = call(Some(&path), 1, &Request::Null);
        assert!(out.is_err());
    }
}
