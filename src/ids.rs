// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Identifier newtypes shared by every layer of the protocol.
//!
//! None of these carry wall-clock time: transaction ids are a per-replica
//! counter, batch ids are a per-replica log index, and epochs are the index of
//! a commit vector in the consensus-ordered log. Every write applied to the
//! store is stamped with the epoch that applied it, so an [Epoch] doubles as a
//! "commit id" when comparing snapshot reads against the store.

use serde::{Deserialize, Serialize};

/// Identifies a replica. Replicas are numbered densely from zero so that the
/// per-replica vectors in commit vectors and PoA bookkeeping can be indexed
/// directly by the id.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// Transaction ids are issued monotonically by each replica and are only
/// unique when paired with the issuing [ReplicaId].
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl std::fmt::Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("t{}", self.0))
    }
}

/// Index of a batch in its source replica's log.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl BatchId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
    pub fn next(&self) -> BatchId {
        BatchId(self.0 + 1)
    }
}

impl std::fmt::Debug for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("b{}", self.0))
    }
}

/// One round of global commit. Also used as the commit id of every write
/// applied during that round.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(pub u64);

pub type CommitId = Epoch;

impl Epoch {
    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("e{}", self.0))
    }
}

/// Globally unique name of a transaction: the replica that executed it
/// locally and the id it was issued there.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalTxnId {
    pub replica: ReplicaId,
    pub txn: TxnId,
}

impl std::fmt::Debug for GlobalTxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}@{}", self.txn, self.replica.0))
    }
}

/// One "commit up to this batch" entry per replica, as proposed by the
/// coordinator and ordered by the sequencer. `None` means nothing from that
/// replica has been committed yet.
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitVector {
    pub epoch: Epoch,
    pub indices: Vec<Option<BatchId>>,
}

impl CommitVector {
    pub fn empty(epoch: Epoch, replicas: usize) -> Self {
        CommitVector {
            epoch,
            indices: vec![None; replicas],
        }
    }

    /// True if any index in `self` is strictly past the same index in `prev`.
    pub fn advances_past(&self, prev: &[Option<BatchId>]) -> bool {
        self.indices
            .iter()
            .zip(prev.iter())
            .any(|(new, old)| new > old)
    }
}
