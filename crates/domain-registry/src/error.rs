// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for registry operations.

use host_gate::HostError;
use probe_channel::StoreError;

/// Failures while collecting or maintaining domain data.
///
/// Per-domain classification outcomes (unmanage, dead, retry later) are not
/// errors — they are ordinary verdicts. These variants cover collaborator
/// faults that the caller either retries or treats as fatal.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
