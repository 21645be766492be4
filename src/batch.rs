// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Batches and the per-replica batch logs they are disseminated into.
//!
//! Each replica appends its locally completed transactions to a current
//! batch, closes it periodically and broadcasts it. Every replica keeps one
//! [ReplicaLog] per source replica, indexed by batch id. A source counts
//! acknowledgements for its own batches; a batch acked by an
//! [crate::quorum::ack_quorum] of replicas is *available*, and a proof of
//! availability (PoA) for batch `i` is announced once every batch `0..=i`
//! is available. The coordinator only ever proposes commit vectors made of
//! announced PoAs, so a committed batch can always be fetched from someone.

use crate::{quorum::ack_quorum, BatchId, Error, ReplicaId, TransactionRecord};
use async_std::sync::Arc;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Active,
    LocalCompleted,
    Available,
    PoASent,
    Committed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub source: ReplicaId,
    pub records: Vec<TransactionRecord>,
    /// Sum of the serialized sizes of `records`.
    pub size: usize,
}

pub(crate) fn encoded_len<T: Serialize>(t: &T) -> Result<usize, Error> {
    Ok(bincode::serde::encode_to_vec(t, bincode::config::standard())?.len())
}

/// The `Active` batch of the local replica.
pub(crate) struct BatchBuilder {
    source: ReplicaId,
    id: BatchId,
    records: Vec<TransactionRecord>,
    size: usize,
    opened: Instant,
}

impl BatchBuilder {
    pub(crate) fn new(source: ReplicaId) -> Self {
        BatchBuilder {
            source,
            id: BatchId(0),
            records: Vec::new(),
            size: 0,
            opened: Instant::now(),
        }
    }

    pub(crate) fn push(&mut self, rec: TransactionRecord) -> Result<(), Error> {
        self.size += encoded_len(&rec)?;
        self.records.push(rec);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// A batch closes when its interval has elapsed or it has outgrown
    /// `max_size`, but an empty batch only ever closes as the very first one.
    pub(crate) fn should_close(&self, interval: Duration, max_size: usize) -> bool {
        let due = self.opened.elapsed() >= interval || self.size > max_size;
        due && (!self.records.is_empty() || self.id == BatchId(0))
    }

    pub(crate) fn close(&mut self) -> Batch {
        let batch = Batch {
            id: self.id,
            source: self.source,
            records: std::mem::take(&mut self.records),
            size: self.size,
        };
        self.id = self.id.next();
        self.size = 0;
        self.opened = Instant::now();
        batch
    }
}

#[derive(Clone, Debug)]
struct Slot {
    batch: Arc<Batch>,
    status: BatchStatus,
}

/// All batches from one source replica that this replica holds.
#[derive(Debug, Default)]
pub(crate) struct ReplicaLog {
    slots: Vec<Option<Slot>>,
    // Highest batch with an announced PoA.
    last_poa: Option<BatchId>,
    // Slots below this index have been garbage-collected.
    collected: usize,
}

impl ReplicaLog {
    /// Stores `batch` in its slot. Returns false if the slot was already
    /// filled or collected, in which case nothing changes.
    pub(crate) fn insert(&mut self, batch: Arc<Batch>, status: BatchStatus) -> bool {
        let i = batch.id.index();
        if i < self.collected {
            return false;
        }
        if self.slots.len() <= i {
            self.slots.resize(i + 1, None);
        }
        match self.slots[i] {
            Some(_) => false,
            None => {
                self.slots[i] = Some(Slot { batch, status });
                true
            }
        }
    }

    pub(crate) fn get(&self, id: BatchId) -> Option<Arc<Batch>> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|s| s.batch.clone())
    }

    pub(crate) fn status(&self, id: BatchId) -> Option<BatchStatus> {
        self.slots
            .get(id.index())
            .and_then(|s| s.as_ref())
            .map(|s| s.status)
    }

    fn set_status(&mut self, id: BatchId, status: BatchStatus) {
        if let Some(Some(s)) = self.slots.get_mut(id.index()) {
            if s.status < status {
                s.status = status;
            }
        }
    }

    pub(crate) fn mark_available(&mut self, id: BatchId) {
        self.set_status(id, BatchStatus::Available)
    }

    /// Extends the PoA over every consecutive available batch after the last
    /// one announced. Returns the new PoA if it moved.
    pub(crate) fn advance_poa(&mut self) -> Option<BatchId> {
        let mut next = self.last_poa.map(|b| b.next()).unwrap_or(BatchId(0));
        let mut moved = false;
        while self.status(next) == Some(BatchStatus::Available) {
            self.set_status(next, BatchStatus::PoASent);
            self.last_poa = Some(next);
            next = next.next();
            moved = true;
        }
        if moved {
            self.last_poa
        } else {
            None
        }
    }

    pub(crate) fn last_poa(&self) -> Option<BatchId> {
        self.last_poa
    }

    /// Records a PoA announced by this log's source. Returns the batches up
    /// to it that are missing locally.
    pub(crate) fn observe_poa(&mut self, id: BatchId) -> Vec<BatchId> {
        if self.last_poa < Some(id) {
            self.last_poa = Some(id);
        }
        self.missing(None, Some(id))
    }

    /// Batches in `(after, upto]` that are neither present nor collected.
    pub(crate) fn missing(&self, after: Option<BatchId>, upto: Option<BatchId>) -> Vec<BatchId> {
        let upto = match upto {
            None => return Vec::new(),
            Some(u) => u.0,
        };
        let from = std::cmp::max(
            after.map(|a| a.0 + 1).unwrap_or(0),
            self.collected as u64,
        );
        (from..=upto)
            .map(BatchId)
            .filter(|b| self.get(*b).is_none())
            .collect()
    }

    pub(crate) fn mark_committed(&mut self, after: Option<BatchId>, upto: Option<BatchId>) {
        if let Some(u) = upto {
            let from = after.map(|a| a.0 + 1).unwrap_or(0);
            for b in from..=u.0 {
                self.set_status(BatchId(b), BatchStatus::Committed);
            }
        }
    }

    /// Drops every batch up to and including `upto`.
    pub(crate) fn collect_through(&mut self, upto: BatchId) -> usize {
        let end = std::cmp::min(upto.index() + 1, self.slots.len());
        let mut n = 0;
        for i in self.collected..end {
            if self.slots[i].take().is_some() {
                n += 1;
            }
        }
        self.collected = std::cmp::max(self.collected, upto.index() + 1);
        n
    }

    pub(crate) fn held(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Acknowledgements received for the local replica's own batches.
#[derive(Debug)]
pub(crate) struct AckTracker {
    quorum: usize,
    acks: HashMap<BatchId, BTreeSet<ReplicaId>>,
}

impl AckTracker {
    pub(crate) fn new(replicas: usize) -> Self {
        AckTracker {
            quorum: ack_quorum(replicas),
            acks: HashMap::new(),
        }
    }

    /// Returns true exactly once per batch: on the ack that completes its
    /// quorum of distinct replicas.
    pub(crate) fn record(&mut self, batch: BatchId, from: ReplicaId) -> bool {
        let set = self.acks.entry(batch).or_default();
        let before = set.len();
        set.insert(from);
        before < self.quorum && set.len() >= self.quorum
    }

    pub(crate) fn forget_through(&mut self, upto: BatchId) {
        self.acks.retain(|b, _| *b > upto);
    }
}
