// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The shared key-value namespace trait.
//!
//! The backing store is serialisable: a transaction operates against a
//! snapshot taken at `begin`, and `commit` fails with
//! [`crate::StoreError::Conflict`] if the store moved underneath it. All
//! daemon mutations that must be atomic across keys go through a
//! transaction; single reads and writes may pass `txn = None`.

use crate::StoreError;
use tokio::sync::mpsc;

/// Handle for an open transaction.
pub type TxnId = u64;

/// One entry of a key's access-control list.
///
/// The first entry names the owner and the default for unlisted domains
/// follows store convention (no access).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm {
    pub domain_id: i64,
    pub read: bool,
    pub write: bool,
}

impl Perm {
    pub fn rw(domain_id: i64) -> Self {
        Perm {
            domain_id,
            read: true,
            write: true,
        }
    }

    pub fn read_only(domain_id: i64) -> Self {
        Perm {
            domain_id,
            read: true,
            write: false,
        }
    }
}

/// A change notification for a watched subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Full path of the key that changed (written, created or removed).
    pub path: String,
}

/// The shared key-value namespace.
///
/// Paths are `/`-separated absolute keys. A missing key reads as `None`;
/// removing a key removes its whole subtree.
pub trait KvStore {
    fn begin(&self) -> Result<TxnId, StoreError>;

    /// Commits; `Err(Conflict)` means the work must be redone from `begin`.
    fn commit(&self, txn: TxnId) -> Result<(), StoreError>;

    fn abort(&self, txn: TxnId);

    fn read(&self, txn: Option<TxnId>, path: &str) -> Result<Option<String>, StoreError>;

    fn write(&self, txn: Option<TxnId>, path: &str, value: &str) -> Result<(), StoreError>;

    /// Removes the key and its subtree. Removing a missing key is not an
    /// error.
    fn remove(&self, txn: Option<TxnId>, path: &str) -> Result<(), StoreError>;

    /// Immediate child key names under `path`.
    fn list(&self, txn: Option<TxnId>, path: &str) -> Result<Vec<String>, StoreError>;

    fn set_acl(&self, txn: Option<TxnId>, path: &str, acl: &[Perm]) -> Result<(), StoreError>;

    /// Subscribes to change events for keys under `prefix`. Events are
    /// delivered after the originating write or commit completes.
    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent>;
}
