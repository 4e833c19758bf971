// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! In-memory [`KvStore`] implementation.
//!
//! Faithful to the store semantics the daemon depends on: serialisable
//! transactions (snapshot at `begin`, conflict when the store generation
//! moved by commit time), subtree removal, child listing, and watch events
//! on committed changes. Used by every test and by development mode.

use crate::{KvStore, Perm, StoreError, TxnId, WatchEvent};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    acl: Vec<Perm>,
}

#[derive(Debug)]
struct Txn {
    base_generation: u64,
    snapshot: BTreeMap<String, Entry>,
    changed: Vec<String>,
}

#[derive(Default)]
struct Inner {
    tree: BTreeMap<String, Entry>,
    generation: u64,
    next_txn: TxnId,
    txns: HashMap<TxnId, Txn>,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
    forced_conflicts: u32,
}

impl Inner {
    fn emit(&mut self, path: &str) {
        self.watchers.retain(|(prefix, tx)| {
            let matches = path == prefix || path.starts_with(&format!("{prefix}/"));
            if matches {
                tx.send(WatchEvent {
                    path: path.to_string(),
                })
                .is_ok()
            } else {
                true
            }
        });
    }
}

/// An in-memory shared namespace. Single-threaded by design, matching the
/// daemon's concurrency model.
#[derive(Default)]
pub struct MemStore {
    inner: RefCell<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a conflict, for retry tests.
    pub fn force_conflicts(&self, n: u32) {
        self.inner.borrow_mut().forced_conflicts = n;
    }

    /// The ACL recorded on a key, for assertions.
    pub fn acl_of(&self, path: &str) -> Option<Vec<Perm>> {
        self.inner.borrow().tree.get(path).map(|e| e.acl.clone())
    }
}

fn subtree_remove(tree: &mut BTreeMap<String, Entry>, path: &str) -> bool {
    let prefix = format!("{path}/");
    let doomed: Vec<String> = tree
        .keys()
        .filter(|k| *k == path || k.starts_with(&prefix))
        .cloned()
        .collect();
    for k in &doomed {
        tree.remove(k);
    }
    !doomed.is_empty()
}

fn list_children(tree: &BTreeMap<String, Entry>, path: &str) -> Vec<String> {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let mut children: Vec<String> = Vec::new();
    for key in tree.keys() {
        if let Some(rest) = key.strip_prefix(&prefix) {
            let child = match rest.find('/') {
                Some(pos) => &rest[..pos],
                None => rest,
            };
            if children.last().map(|c: &String| c.as_str()) != Some(child) {
                children.push(child.to_string());
            }
        }
    }
    children.dedup();
    children
}

impl KvStore for MemStore {
    fn begin(&self) -> Result<TxnId, StoreError> {
        let mut inner = self.inner.borrow_mut();
        inner.next_txn += 1;
        let id = inner.next_txn;
        let txn = Txn {
            base_generation: inner.generation,
            snapshot: inner.tree.clone(),
            changed: Vec::new(),
        };
        inner.txns.insert(id, txn);
        Ok(id)
    }

    fn commit(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        let t = inner
            .txns
            .remove(&txn)
            .ok_or_else(|| StoreError::backend("commit", "", "unknown transaction"))?;

        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        if t.base_generation != inner.generation {
            return Err(StoreError::Conflict);
        }

        inner.tree = t.snapshot;
        inner.generation += 1;
        for path in t.changed {
            inner.emit(&path);
        }
        Ok(())
    }

    fn abort(&self, txn: TxnId) {
        self.inner.borrow_mut().txns.remove(&txn);
    }

    fn read(&self, txn: Option<TxnId>, path: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.borrow();
        let tree = match txn {
            Some(id) => {
                &inner
                    .txns
                    .get(&id)
                    .ok_or_else(|| StoreError::backend("read", path, "unknown transaction"))?
                    .snapshot
            }
            None => &inner.tree,
        };
        Ok(tree.get(path).map(|e| e.value.clone()))
    }

    fn write(&self, txn: Option<TxnId>, path: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(id) => {
                let t = inner
                    .txns
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::backend("write", path, "unknown transaction"))?;
                let entry = t.snapshot.entry(path.to_string()).or_insert(Entry {
                    value: String::new(),
                    acl: vec![Perm::rw(0)],
                });
                entry.value = value.to_string();
                t.changed.push(path.to_string());
            }
            None => {
                let entry = inner.tree.entry(path.to_string()).or_insert(Entry {
                    value: String::new(),
                    acl: vec![Perm::rw(0)],
                });
                entry.value = value.to_string();
                inner.generation += 1;
                inner.emit(path);
            }
        }
        Ok(())
    }

    fn remove(&self, txn: Option<TxnId>, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(id) => {
                let t = inner
                    .txns
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::backend("remove", path, "unknown transaction"))?;
                if subtree_remove(&mut t.snapshot, path) {
                    t.changed.push(path.to_string());
                }
            }
            None => {
                if subtree_remove(&mut inner.tree, path) {
                    inner.generation += 1;
                    inner.emit(path);
                }
            }
        }
        Ok(())
    }

    fn list(&self, txn: Option<TxnId>, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.borrow();
        let tree = match txn {
            Some(id) => {
                &inner
                    .txns
                    .get(&id)
                    .ok_or_else(|| StoreError::backend("list", path, "unknown transaction"))?
                    .snapshot
            }
            None => &inner.tree,
        };
        Ok(list_children(tree, path))
    }

    fn set_acl(&self, txn: Option<TxnId>, path: &str, acl: &[Perm]) -> Result<(), StoreError> {
        let mut inner = self.inner.borrow_mut();
        let tree = match txn {
            Some(id) => {
                &mut inner
                    .txns
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::backend("set_acl", path, "unknown transaction"))?
                    .snapshot
            }
            None => &mut inner.tree,
        };
        match tree.get_mut(path) {
            Some(entry) => {
                entry.acl = acl.to_vec();
                Ok(())
            }
            None => Err(StoreError::backend("set_acl", path, "no such key")),
        }
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .borrow_mut()
            .watchers
            .push((prefix.trim_end_matches('/').to_string(), tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_remove() {
        let s = MemStore::new();
        assert_eq!(s.read(None, "/a").unwrap(), None);
        s.write(None, "/a/b/c", "v").unwrap();
        assert_eq!(s.read(None, "/a/b/c").unwrap().as_deref(), Some("v"));
        s.remove(None, "/a/b").unwrap();
        assert_eq!(s.read(None, "/a/b/c").unwrap(), None);
        // removing again is not an error
        s.remove(None, "/a/b").unwrap();
    }

    #[test]
    fn test_list_children() {
        let s = MemStore::new();
        s.write(None, "/t/x/domid", "1").unwrap();
        s.write(None, "/t/x/report", "").unwrap();
        s.write(None, "/t/y/domid", "2").unwrap();
        let mut kids = s.list(None, "/t").unwrap();
        kids.sort();
        assert_eq!(kids, vec!["x", "y"]);
        assert_eq!(s.list(None, "/none").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_txn_isolation() {
        let s = MemStore::new();
        s.write(None, "/k", "old").unwrap();
        let t = s.begin().unwrap();
        s.write(Some(t), "/k", "new").unwrap();
        // outside the transaction the old value is still visible
        assert_eq!(s.read(None, "/k").unwrap().as_deref(), Some("old"));
        s.commit(t).unwrap();
        assert_eq!(s.read(None, "/k").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_txn_conflict_on_concurrent_write() {
        let s = MemStore::new();
        let t = s.begin().unwrap();
        s.write(Some(t), "/k", "txn").unwrap();
        // a non-transactional write advances the generation
        s.write(None, "/other", "x").unwrap();
        assert!(matches!(s.commit(t), Err(StoreError::Conflict)));
    }

    #[test]
    fn test_watch_on_commit() {
        let s = MemStore::new();
        let mut rx = s.subscribe("/local/domain");
        let t = s.begin().unwrap();
        s.write(Some(t), "/local/domain/3/name", "web").unwrap();
        s.write(Some(t), "/elsewhere", "x").unwrap();
        assert!(rx.try_recv().is_err()); // nothing until commit
        s.commit(t).unwrap();
        assert_eq!(rx.try_recv().unwrap().path, "/local/domain/3/name");
        assert!(rx.try_recv().is_err()); // /elsewhere filtered by prefix
    }

    #[test]
    fn test_watch_on_direct_write() {
        let s = MemStore::new();
        let mut rx = s.subscribe("/local/domain");
        s.write(None, "/local/domain/7", "").unwrap();
        assert_eq!(rx.try_recv().unwrap().path, "/local/domain/7");
        s.remove(None, "/local/domain/7").unwrap();
        assert_eq!(rx.try_recv().unwrap().path, "/local/domain/7");
    }

    #[test]
    fn test_acl() {
        let s = MemStore::new();
        s.write(None, "/k", "v").unwrap();
        s.set_acl(None, "/k", &[Perm::rw(0), Perm::read_only(5)])
            .unwrap();
        assert_eq!(
            s.acl_of("/k").unwrap(),
            vec![Perm::rw(0), Perm::read_only(5)]
        );
        assert!(s.set_acl(None, "/missing", &[Perm::rw(0)]).is_err());
    }
}
