// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Bounded transaction retry with backoff.
//!
//! Commit conflicts are expected under contention and are retried up to a
//! configured budget. The first half of the budget retries immediately; the
//! second half waits, ramping linearly from 20 ms at attempt ⌈R/2⌉ to 5 s
//! at attempt R.

use crate::{KvStore, StoreError, TxnId};

/// Retry budget for transactional store operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Backoff before retry `attempt` (1-based), in milliseconds.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let n1 = self.max_retries / 2;
        let n2 = self.max_retries;
        if attempt < n1 || n2 == n1 {
            return 0;
        }
        const W1: f64 = 20.0;
        const W2: f64 = 5000.0;
        let w = W1 + (attempt - n1) as f64 * (W2 - W1) / (n2 - n1) as f64;
        w as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 20 }
    }
}

/// What the transaction body wants done with its work.
pub enum TxnControl<T> {
    /// Commit the writes, then return the value.
    Commit(T),
    /// Nothing changed: abort the transaction and return the value.
    Abort(T),
}

/// Runs `body` inside a transaction, retrying commit conflicts per
/// `policy`. `sleep` performs the backoff wait.
pub fn run_transaction<S, T, F>(
    store: &S,
    policy: &RetryPolicy,
    sleep: &dyn Fn(u64),
    mut body: F,
) -> Result<T, StoreError>
where
    S: KvStore + ?Sized,
    F: FnMut(&S, TxnId) -> Result<TxnControl<T>, StoreError>,
{
    let mut attempts = 0u32;
    loop {
        let txn = store.begin()?;
        let control = match body(store, txn) {
            Ok(c) => c,
            Err(e) => {
                store.abort(txn);
                return Err(e);
            }
        };

        match control {
            TxnControl::Abort(value) => {
                store.abort(txn);
                return Ok(value);
            }
            TxnControl::Commit(value) => match store.commit(txn) {
                Ok(()) => return Ok(value),
                Err(StoreError::Conflict) => {
                    attempts += 1;
                    if attempts > policy.max_retries {
                        return Err(StoreError::RetriesExhausted { attempts });
                    }
                    let wait = policy.backoff_ms(attempts);
                    if wait > 0 {
                        sleep(wait);
                    }
                    tracing::debug!(attempts, "restarting store transaction");
                }
                Err(e) => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    #[test]
    fn test_backoff_shape() {
        let p = RetryPolicy::new(20);
        assert_eq!(p.backoff_ms(1), 0);
        assert_eq!(p.backoff_ms(9), 0);
        // ramp starts at attempt 10
        assert_eq!(p.backoff_ms(10), 20);
        assert_eq!(p.backoff_ms(20), 5000);
        let mid = p.backoff_ms(15);
        assert!(mid > 20 && mid < 5000);
    }

    #[test]
    fn test_commit_applies_writes() {
        let store = MemStore::new();
        let policy = RetryPolicy::default();
        run_transaction(&store, &policy, &|_| {}, |s, txn| {
            s.write(Some(txn), "/a/b", "1")?;
            Ok(TxnControl::Commit(()))
        })
        .unwrap();
        assert_eq!(store.read(None, "/a/b").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_abort_discards_writes() {
        let store = MemStore::new();
        let policy = RetryPolicy::default();
        let v = run_transaction(&store, &policy, &|_| {}, |s, txn| {
            s.write(Some(txn), "/a/b", "1")?;
            Ok(TxnControl::Abort(42))
        })
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(store.read(None, "/a/b").unwrap(), None);
    }

    #[test]
    fn test_conflicts_retried_until_budget() {
        let store = MemStore::new();
        let policy = RetryPolicy::new(4);
        store.force_conflicts(2);
        let mut runs = 0;
        run_transaction(&store, &policy, &|_| {}, |s, txn| {
            runs += 1;
            s.write(Some(txn), "/k", "v")?;
            Ok(TxnControl::Commit(()))
        })
        .unwrap();
        assert_eq!(runs, 3);

        store.force_conflicts(10);
        let out: Result<(), _> = run_transaction(&store, &policy, &|_| {}, |s, txn| {
            s.write(Some(txn), "/k", "v")?;
            Ok(TxnControl::Commit(()))
        });
        assert!(matches!(out, Err(StoreError::RetriesExhausted { .. })));
    }
}
