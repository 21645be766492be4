// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ReplicaId, TxnId};
use std::sync::atomic::{AtomicU64, Ordering};

/// TidMgr hands out the transaction ids ([TxnId]s) of transactions
/// coordinated by the current replica. Ids are a plain counter, monotonic and
/// never reused, starting at 1; nothing in the protocol depends on them being
/// related to wall-clock time, only on them ordering each replica's
/// transactions the way they were issued.
///
/// A transaction that fails validation and is retried keeps its id: the id
/// names the client's request, not the attempt.
pub struct TidMgr {
    self_id: ReplicaId,
    next: AtomicU64,
}

impl TidMgr {
    pub(crate) fn new(self_id: ReplicaId) -> Self {
        TidMgr {
            self_id,
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    pub(crate) fn create_txn_id(&self) -> TxnId {
        TxnId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The next id that would be issued; every id below it has been issued.
    pub(crate) fn watermark(&self) -> TxnId {
        TxnId(self.next.load(Ordering::SeqCst))
    }
}

#[test]
fn test_txn_ids_are_monotonic() {
    let t = TidMgr::new(ReplicaId(2));
    let a = t.create_txn_id();
    let b = t.create_txn_id();
    assert_eq!(a, TxnId(1));
    assert!(b > a);
    assert_eq!(t.watermark(), TxnId(3));
    assert_eq!(t.self_id(), ReplicaId(2));
}
