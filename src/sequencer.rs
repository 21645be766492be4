// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The consensus sequencer orders commit vectors into a durable log indexed
//! by epoch. The protocol only needs two things from it: a proposal for
//! epoch `e` succeeds at most once, and every replica can read back entry
//! `e` once it exists. Any consensus implementation can sit behind
//! [ConsensusSequencer]; [MemorySequencer] is a shared in-process log for
//! tests and single-process clusters.

use crate::{CommitVector, Epoch, Error, SyncBoxFuture};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::trace;

pub trait ConsensusSequencer: Send + Sync + 'static {
    /// Appends `vector` as the entry for `vector.epoch`. Fails with
    /// [Error::SequencerRejected] if that epoch is already decided or would
    /// leave a gap.
    fn propose(&self, vector: CommitVector) -> SyncBoxFuture<Result<(), Error>>;

    /// The decided entry for `epoch`, if there is one yet.
    fn next_uncommitted(&self, epoch: Epoch) -> SyncBoxFuture<Option<CommitVector>>;
}

/// Epochs are numbered from 1; entry `e` lives at index `e - 1`.
#[derive(Clone, Default)]
pub struct MemorySequencer {
    log: Arc<Mutex<Vec<CommitVector>>>,
}

impl MemorySequencer {
    pub fn new() -> Self {
        MemorySequencer::default()
    }

    // A panic while holding the lock cannot leave the Vec half-updated, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<CommitVector>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConsensusSequencer for MemorySequencer {
    fn propose(&self, vector: CommitVector) -> SyncBoxFuture<Result<(), Error>> {
        let res = {
            let mut log = self.lock();
            if vector.epoch.0 == log.len() as u64 + 1 {
                trace!("sequenced {:?}", vector);
                log.push(vector);
                Ok(())
            } else {
                Err(Error::SequencerRejected)
            }
        };
        Box::pin(async move { res })
    }

    fn next_uncommitted(&self, epoch: Epoch) -> SyncBoxFuture<Option<CommitVector>> {
        let res = match epoch.0 {
            0 => None,
            e => self.lock().get((e - 1) as usize).cloned(),
        };
        Box::pin(async move { res })
    }
}

/// Reorders commit vectors arriving from the sequencer and from peer
/// broadcasts into strict epoch order.
#[derive(Debug)]
pub(crate) struct SequencerLog {
    next: Epoch,
    pending: BTreeMap<Epoch, CommitVector>,
}

impl Default for SequencerLog {
    fn default() -> Self {
        SequencerLog {
            next: Epoch(1),
            pending: BTreeMap::new(),
        }
    }
}

impl SequencerLog {
    pub(crate) fn next(&self) -> Epoch {
        self.next
    }

    pub(crate) fn offer(&mut self, vector: CommitVector) {
        if vector.epoch >= self.next {
            self.pending.entry(vector.epoch).or_insert(vector);
        }
    }

    pub(crate) fn pop_ready(&mut self) -> Option<CommitVector> {
        let v = self.pending.remove(&self.next)?;
        self.next = self.next.next();
        Some(v)
    }
}
