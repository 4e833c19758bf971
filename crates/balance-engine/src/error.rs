// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the balancing engine.

use domain_registry::RegistryError;
use host_gate::HostError;
use probe_channel::StoreError;

/// Collaborator failures surfacing from a scheduling pass.
///
/// "Domain gone" never reaches here — it is absorbed as a Dead transition.
/// What remains is host or store trouble the daemon treats as fatal.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An internal invariant was violated: a programmer error, not an
    /// operational condition. Propagates to the daemon's log-and-exit
    /// path rather than being absorbed where it was detected.
    #[error("bug: {0}")]
    Bug(String),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Host(e) => EngineError::Host(e),
            RegistryError::Store(e) => EngineError::Store(e),
        }
    }
}
