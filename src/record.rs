// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A [TransactionRecord] is what a replica keeps of a locally executed
//! transaction: its id, the query that produced it, the keys it read and the
//! writes it made, and enough provenance about each read to decide later
//! whether it was stale. Records are frozen into batches and travel to every
//! replica unchanged; the global commit consumes each exactly once.

use crate::{CommitId, GlobalTxnId, Key, Query, ReplicaId, TxnId, WriteSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome assigned to a record by conflict resolution. Records start out as
/// `Conflict` (or `NonExecuted` if they were only key-collected) and the
/// resolver moves winning chains to `None` and stale chains to `Stale`.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictStatus {
    Conflict,
    None,
    Stale,
    NonExecuted,
}

impl Default for ConflictStatus {
    fn default() -> Self {
        ConflictStatus::Conflict
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxnId,
    pub source: ReplicaId,

    /// Same-replica transactions whose uncommitted writes this one observed,
    /// either by reading them from the overlay or by overwriting a key that
    /// one of them had written.
    pub prev: BTreeSet<TxnId>,

    pub query: Query,
    pub writes: WriteSet,
    pub reads: BTreeSet<Key>,

    /// For every key read from the committed store rather than the overlay,
    /// the commit id observed (`None` if the key was absent).
    pub snapshot_reads: BTreeMap<Key, Option<CommitId>>,

    pub status: ConflictStatus,
}

impl TransactionRecord {
    pub fn global_id(&self) -> GlobalTxnId {
        GlobalTxnId {
            replica: self.source,
            txn: self.id,
        }
    }

    pub fn is_non_executed(&self) -> bool {
        self.status == ConflictStatus::NonExecuted
    }

    /// Keys written, then keys only read. This is the order in which the
    /// deterministic lock manager requests locks.
    pub fn lock_keys(&self) -> impl Iterator<Item = (&Key, bool)> {
        let writes = self.writes.keys().map(|k| (k, true));
        let reads = self
            .reads
            .iter()
            .filter(move |k| !self.writes.contains_key(*k))
            .map(|k| (k, false));
        writes.chain(reads)
    }
}

/// What a client eventually learns about a submitted transaction.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnOutcome {
    Executed(String),
    NotExecuted(String),
}

impl TxnOutcome {
    pub fn executed(&self) -> bool {
        matches!(self, TxnOutcome::Executed(_))
    }
}
