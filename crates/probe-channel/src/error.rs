// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the shared namespace and the report wire format.

/// Errors from the shared key-value namespace.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A transaction commit lost the optimistic-concurrency race. The
    /// retry machinery consumes this; callers normally never see it.
    #[error("transaction commit conflict")]
    Conflict,

    /// The commit retry budget ran out.
    #[error("transaction retry limit exceeded after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The backing store failed outright.
    #[error("store failure in {op} on {path}: {detail}")]
    Backend {
        op: &'static str,
        path: String,
        detail: String,
    },
}

impl StoreError {
    pub fn backend(op: &'static str, path: impl Into<String>, detail: impl Into<String>) -> Self {
        StoreError::Backend {
            op,
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Errors parsing a guest report blob. Any of these unmanages the domain.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("unsupported report version {0:?}")]
    BadVersion(Option<char>),

    #[error("report is missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("report field \"{field}\" has invalid value {value:?}")]
    BadField { field: &'static str, value: String },

    #[error("report action is {0:?}, expected \"report\"")]
    BadAction(String),
}
