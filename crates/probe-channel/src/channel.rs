// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Report-slot lifecycle and interval publication.
//!
//! Each managed domain gets a report slot addressed by a generated `qid`;
//! the qid decouples the frequently written report key from the watched
//! `/local/domain` subtree. The slot's ACL grants the daemon read+write and
//! the target domain read+write on its own report only; the link key under
//! the domain's subtree is read-only for the guest.

use crate::paths;
use crate::{run_transaction, KvStore, Perm, RetryPolicy, StoreError, TxnControl};
use std::collections::{BTreeMap, HashMap};

/// Generates a fresh 128-bit qid rendered in the canonical hyphenated form.
pub fn generate_qid() -> String {
    let v: u128 = rand::random();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (v >> 96) as u32,
        (v >> 80) as u16,
        (v >> 64) as u16,
        (v >> 48) as u16,
        v & 0xffff_ffff_ffff
    )
}

/// Creates (or adopts) the report slot for a freshly managed domain.
///
/// Returns the slot's qid, or `None` when the domain disappeared before
/// the slot could be committed — the caller reacts by unmanaging.
pub fn init_report_slot(
    store: &dyn KvStore,
    policy: &RetryPolicy,
    sleep: &dyn Fn(u64),
    domain_id: i64,
) -> Result<Option<String>, StoreError> {
    let link_path = paths::report_link_path(domain_id);

    run_transaction(store, policy, sleep, |s, txn| {
        if s.read(Some(txn), &paths::domain_path(domain_id))?.is_none() {
            return Ok(TxnControl::Abort(None));
        }

        // A valid pre-existing link (daemon restart) is adopted as-is.
        if let Some(link) = s.read(Some(txn), &link_path)? {
            if let Some(qid) = paths::parse_report_link(&link) {
                let qid = qid.to_string();
                s.write(Some(txn), &paths::slot_report_path(&qid), "")?;
                return Ok(TxnControl::Commit(Some(qid)));
            }
        }

        // Generate a qid not already taken by another slot.
        let qid = loop {
            let candidate = generate_qid();
            if s.read(Some(txn), &paths::slot_domid_path(&candidate))?
                .is_none()
            {
                break candidate;
            }
        };

        let report_path = paths::slot_report_path(&qid);
        s.write(Some(txn), &paths::slot_domid_path(&qid), &domain_id.to_string())?;
        s.write(Some(txn), &report_path, "")?;
        s.set_acl(Some(txn), &report_path, &[Perm::rw(0), Perm::rw(domain_id)])?;
        s.write(Some(txn), &link_path, &report_path)?;
        s.set_acl(
            Some(txn),
            &link_path,
            &[Perm::rw(0), Perm::read_only(domain_id)],
        )?;

        Ok(TxnControl::Commit(Some(qid)))
    })
}

/// Startup reconciliation of the slot subtree.
///
/// Deletes slots whose domain no longer exists and returns the surviving
/// `domain id → qid` mapping.
pub fn resync_qids(
    store: &dyn KvStore,
    policy: &RetryPolicy,
    sleep: &dyn Fn(u64),
) -> Result<BTreeMap<i64, String>, StoreError> {
    run_transaction(store, policy, sleep, |s, txn| {
        let mut map = BTreeMap::new();
        let mut changed = false;

        for qid in s.list(Some(txn), paths::DOMAIN_SLOT_ROOT)? {
            let domid_path = paths::slot_domid_path(&qid);
            let Some(value) = s.read(Some(txn), &domid_path)? else {
                continue;
            };
            let Ok(domain_id) = value.parse::<i64>() else {
                tracing::error!(%qid, %value, "invalid domid recorded for report slot");
                continue;
            };
            if domain_id < 0 {
                tracing::error!(%qid, %value, "invalid domid recorded for report slot");
                continue;
            }

            if s.read(Some(txn), &paths::domain_path(domain_id))?.is_some() {
                map.insert(domain_id, qid);
            } else {
                s.remove(Some(txn), &paths::slot_path(&qid))?;
                changed = true;
            }
        }

        if changed {
            Ok(TxnControl::Commit(map))
        } else {
            Ok(TxnControl::Abort(map))
        }
    })
}

/// Releases a dead domain's report slot.
pub fn release_qid(store: &dyn KvStore, qid: &str) -> Result<(), StoreError> {
    store.remove(None, &paths::slot_path(qid))
}

/// Drains all managed report slots in one transaction.
///
/// Only slots that actually held a report are cleared, keeping the write
/// set (and therefore the conflict window) narrow. Returns the raw blobs
/// by domain id.
pub fn drain_reports(
    store: &dyn KvStore,
    policy: &RetryPolicy,
    sleep: &dyn Fn(u64),
    slots: &[(i64, String)],
) -> Result<HashMap<i64, String>, StoreError> {
    run_transaction(store, policy, sleep, |s, txn| {
        let mut reports = HashMap::new();
        let mut changed = false;

        for (domain_id, qid) in slots {
            let report_path = paths::slot_report_path(qid);
            if let Some(raw) = s.read(Some(txn), &report_path)? {
                if !raw.is_empty() {
                    s.write(Some(txn), &report_path, "")?;
                    reports.insert(*domain_id, raw);
                    changed = true;
                }
            }
        }

        if changed {
            Ok(TxnControl::Commit(reports))
        } else {
            Ok(TxnControl::Abort(reports))
        }
    })
}

/// Publishes the sampling interval and refreshes the key's ACL to the
/// current managed set (daemon read+write, each managed domain read-only).
///
/// `write_value` is false when only the ACL needs refreshing.
pub fn write_interval(
    store: &dyn KvStore,
    policy: &RetryPolicy,
    sleep: &dyn Fn(u64),
    interval_secs: u32,
    managed: &[i64],
    write_value: bool,
) -> Result<(), StoreError> {
    run_transaction(store, policy, sleep, |s, txn| {
        if write_value || s.read(Some(txn), paths::INTERVAL_PATH)?.is_none() {
            s.write(Some(txn), paths::INTERVAL_PATH, &interval_secs.to_string())?;
        }

        let mut acl = Vec::with_capacity(managed.len() + 1);
        acl.push(Perm::rw(0));
        for &id in managed {
            acl.push(Perm::read_only(id));
        }
        s.set_acl(Some(txn), paths::INTERVAL_PATH, &acl)?;

        Ok(TxnControl::Commit(()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    fn no_sleep(_: u64) {}

    fn store_with_domain(id: i64) -> MemStore {
        let s = MemStore::new();
        s.write(None, &paths::domain_path(id), "").unwrap();
        s
    }

    #[test]
    fn test_qid_format() {
        let qid = generate_qid();
        assert_eq!(qid.len(), 36);
        assert_eq!(qid.chars().filter(|&c| c == '-').count(), 4);
        assert_ne!(generate_qid(), generate_qid());
    }

    #[test]
    fn test_init_slot_creates_structure() {
        let s = store_with_domain(5);
        let policy = RetryPolicy::default();
        let qid = init_report_slot(&s, &policy, &no_sleep, 5).unwrap().unwrap();

        assert_eq!(
            s.read(None, &paths::slot_domid_path(&qid)).unwrap().as_deref(),
            Some("5")
        );
        assert_eq!(
            s.read(None, &paths::slot_report_path(&qid)).unwrap().as_deref(),
            Some("")
        );
        assert_eq!(
            s.read(None, &paths::report_link_path(5)).unwrap().as_deref(),
            Some(paths::slot_report_path(&qid).as_str())
        );
        assert_eq!(
            s.acl_of(&paths::slot_report_path(&qid)).unwrap(),
            vec![Perm::rw(0), Perm::rw(5)]
        );
        assert_eq!(
            s.acl_of(&paths::report_link_path(5)).unwrap(),
            vec![Perm::rw(0), Perm::read_only(5)]
        );
    }

    #[test]
    fn test_init_slot_adopts_existing_link() {
        let s = store_with_domain(5);
        let policy = RetryPolicy::default();
        let qid1 = init_report_slot(&s, &policy, &no_sleep, 5).unwrap().unwrap();
        // leftover report content must be blanked on adoption
        s.write(None, &paths::slot_report_path(&qid1), "A\nstale")
            .unwrap();
        let qid2 = init_report_slot(&s, &policy, &no_sleep, 5).unwrap().unwrap();
        assert_eq!(qid1, qid2);
        assert_eq!(
            s.read(None, &paths::slot_report_path(&qid1)).unwrap().as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_init_slot_dead_domain() {
        let s = MemStore::new();
        let policy = RetryPolicy::default();
        assert_eq!(init_report_slot(&s, &policy, &no_sleep, 9).unwrap(), None);
    }

    #[test]
    fn test_resync_drops_dead_slots() {
        let s = store_with_domain(1);
        let policy = RetryPolicy::default();
        let qid1 = init_report_slot(&s, &policy, &no_sleep, 1).unwrap().unwrap();

        // a slot for a domain that no longer exists
        s.write(None, &paths::slot_domid_path("dead-qid"), "7").unwrap();
        s.write(None, &paths::slot_report_path("dead-qid"), "").unwrap();

        let map = resync_qids(&s, &policy, &no_sleep).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&1), Some(&qid1));
        assert_eq!(s.read(None, &paths::slot_domid_path("dead-qid")).unwrap(), None);
    }

    #[test]
    fn test_drain_reports_clears_only_written_slots() {
        let s = store_with_domain(1);
        s.write(None, &paths::domain_path(2), "").unwrap();
        let policy = RetryPolicy::default();
        let q1 = init_report_slot(&s, &policy, &no_sleep, 1).unwrap().unwrap();
        let q2 = init_report_slot(&s, &policy, &no_sleep, 2).unwrap().unwrap();

        s.write(None, &paths::slot_report_path(&q1), "A\naction: report\n")
            .unwrap();

        let slots = vec![(1, q1.clone()), (2, q2.clone())];
        let reports = drain_reports(&s, &policy, &no_sleep, &slots).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[&1].starts_with('A'));
        assert_eq!(
            s.read(None, &paths::slot_report_path(&q1)).unwrap().as_deref(),
            Some("")
        );

        // nothing pending: second drain commits nothing
        let reports = drain_reports(&s, &policy, &no_sleep, &slots).unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn test_write_interval_and_acl() {
        let s = MemStore::new();
        let policy = RetryPolicy::default();
        write_interval(&s, &policy, &no_sleep, 5, &[3, 8], true).unwrap();
        assert_eq!(
            s.read(None, paths::INTERVAL_PATH).unwrap().as_deref(),
            Some("5")
        );
        assert_eq!(
            s.acl_of(paths::INTERVAL_PATH).unwrap(),
            vec![Perm::rw(0), Perm::read_only(3), Perm::read_only(8)]
        );

        // ACL-only refresh keeps the value
        write_interval(&s, &policy, &no_sleep, 9, &[3], false).unwrap();
        assert_eq!(
            s.read(None, paths::INTERVAL_PATH).unwrap().as_deref(),
            Some("5")
        );
        assert_eq!(
            s.acl_of(paths::INTERVAL_PATH).unwrap(),
            vec![Perm::rw(0), Perm::read_only(3)]
        );
    }

    #[test]
    fn test_interval_roundtrip() {
        let s = MemStore::new();
        let policy = RetryPolicy::default();
        write_interval(&s, &policy, &no_sleep, 17, &[], true).unwrap();
        let read: u32 = s
            .read(None, paths::INTERVAL_PATH)
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(read, 17);
    }
}
