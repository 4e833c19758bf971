// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the host control surface.

/// Errors from the hypervisor control surface.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The referenced domain no longer exists. Routine during teardown:
    /// the registry reacts by transitioning the domain to Dead, never by
    /// surfacing an operator-visible error.
    #[error("domain {0} is gone")]
    DomainGone(i64),

    /// No usable monotonic clock on this host. Fatal at startup.
    #[error("no monotonic clock available (tried boot-time, monotonic-raw, monotonic)")]
    NoMonotonicClock,

    /// Any other control-surface fault.
    #[error("host control failure in {op}: {detail}")]
    ControlFailure { op: &'static str, detail: String },
}

impl HostError {
    pub fn control(op: &'static str, detail: impl Into<String>) -> Self {
        HostError::ControlFailure {
            op,
            detail: detail.into(),
        }
    }

    /// `true` for the "domain gone" outcome, which is never operator-visible.
    pub fn is_gone(&self) -> bool {
        matches!(self, HostError::DomainGone(_))
    }
}
