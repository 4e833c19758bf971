// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for configuration parsing.

/// Errors produced while parsing configuration text.
///
/// A failed key never aborts the surrounding file or blob: the caller logs
/// the error for that key and leaves the rest in effect.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The value is syntactically not a number (or number + unit).
    #[error("invalid value for \"{key}\" in {origin}")]
    InvalidValue { origin: String, key: String },

    /// The numeric part is fine but the unit suffix is not recognised.
    #[error("unrecognised unit \"{unit}\" for \"{key}\" in {origin}")]
    UnknownUnit {
        origin: String,
        key: String,
        unit: String,
    },

    /// The value parsed but falls outside the permitted range.
    #[error("value of \"{key}\" in {origin} is out of range")]
    OutOfRange { origin: String, key: String },

    /// The configuration file could not be read at all.
    #[error("unable to read {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
