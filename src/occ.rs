// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Local optimistic execution.
//!
//! A replica executes client transactions immediately, against the committed
//! store plus an *overlay* of writes made by its own transactions that have
//! not yet been through a global commit. Execution holds the overlay in read
//! mode; validation and installation take it in write mode, so at most one
//! transaction installs at a time.
//!
//! Validation is narrow: a transaction fails only if some key it both read
//! and wrote was overwritten in the overlay after it read it. Everything else
//! (cross-replica conflicts, reads of since-updated committed state) is left
//! to the conflict resolver at global-commit time.
//!
//! The same [LocalTxn] machinery, with no overlay, serves two other roles:
//! the key-collecting pass used in high-contention mode and the transaction
//! wrapper used by deterministic replay.

use crate::{
    execute, CommitId, ConflictStatus, Error, Key, Query, ReplicaId, TransactionRecord, TxnId,
    TxnOps, Value, VersionedStore, WriteOp, WriteSet,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OverlayEntry {
    pub(crate) value: Value,
    pub(crate) ts: u64,
    pub(crate) writer: TxnId,
}

/// Uncommitted local writes, each tagged with a strictly increasing install
/// timestamp and the id of the transaction that installed it.
#[derive(Debug, Default)]
pub(crate) struct Overlay {
    entries: HashMap<Key, OverlayEntry>,
    clock: u64,
}

impl Overlay {
    pub(crate) fn get(&self, key: &Key) -> Option<&OverlayEntry> {
        self.entries.get(key)
    }

    pub(crate) fn install(&mut self, key: Key, value: Value, writer: TxnId) {
        self.clock += 1;
        let ts = self.clock;
        self.entries.insert(key, OverlayEntry { value, ts, writer });
    }

    /// Drops every entry. The clock keeps running so that a reader holding a
    /// timestamp from before the clear still validates correctly.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One execution of a plan. With an overlay this is an optimistic local
/// transaction; without one it reads the committed store only. A run ends
/// aborted, installed into the overlay as a `Conflict` record, or collected
/// as a `NonExecuted` one.
pub(crate) struct LocalTxn<'a, S: VersionedStore> {
    overlay: Option<&'a Overlay>,
    store: &'a S,
    id: TxnId,

    // Materialized values of everything written so far.
    local: BTreeMap<Key, Value>,
    writes: WriteSet,
    reads: BTreeSet<Key>,
    read_ts: BTreeMap<Key, u64>,
    prev: BTreeSet<TxnId>,
    snapshot_reads: BTreeMap<Key, Option<CommitId>>,
}

impl<'a, S: VersionedStore> LocalTxn<'a, S> {
    pub(crate) fn optimistic(id: TxnId, overlay: &'a Overlay, store: &'a S) -> Self {
        Self::new(id, Some(overlay), store)
    }

    pub(crate) fn store_only(id: TxnId, store: &'a S) -> Self {
        Self::new(id, None, store)
    }

    fn new(id: TxnId, overlay: Option<&'a Overlay>, store: &'a S) -> Self {
        LocalTxn {
            overlay,
            store,
            id,
            local: BTreeMap::new(),
            writes: WriteSet::new(),
            reads: BTreeSet::new(),
            read_ts: BTreeMap::new(),
            prev: BTreeSet::new(),
            snapshot_reads: BTreeMap::new(),
        }
    }

    /// Runs `query`'s plan to completion, returning the plan's result and the
    /// owned state needed to validate or record it.
    pub(crate) fn run(mut self, query: &Query) -> Result<(String, Executed), Error> {
        let res = execute(query, &mut self)?;
        Ok((
            res,
            Executed {
                id: self.id,
                local: self.local,
                writes: self.writes,
                reads: self.reads,
                read_ts: self.read_ts,
                prev: self.prev,
                snapshot_reads: self.snapshot_reads,
            },
        ))
    }
}

impl<'a, S: VersionedStore> TxnOps for LocalTxn<'a, S> {
    fn get(&mut self, key: &Key) -> Result<Option<Value>, Error> {
        if let Some(v) = self.local.get(key) {
            return Ok(Some(v.clone()));
        }
        self.reads.insert(key.clone());
        if let Some(e) = self.overlay.and_then(|o| o.get(key)) {
            self.read_ts.insert(key.clone(), e.ts);
            if e.writer != self.id {
                self.prev.insert(e.writer);
            }
            return Ok(Some(e.value.clone()));
        }
        self.read_ts.insert(key.clone(), 0);
        let entry = self.store.get(key);
        self.snapshot_reads
            .insert(key.clone(), entry.map(|e| e.commit));
        Ok(entry.map(|e| e.value.clone()))
    }

    fn put(&mut self, key: Key, value: Value) {
        self.local.insert(key.clone(), value.clone());
        self.writes.insert(key, WriteOp::Put(value));
    }

    fn patch(&mut self, key: Key, patch: Value) -> Result<(), Error> {
        let mut base = self.get(&key)?.ok_or(Error::TxnAbort)?;
        base.patch(&patch)?;
        match self.writes.get_mut(&key) {
            Some(WriteOp::Put(v)) => *v = base.clone(),
            Some(WriteOp::Patch(p)) => p.patch(&patch)?,
            None => {
                self.writes.insert(key.clone(), WriteOp::Patch(patch));
            }
        }
        self.local.insert(key, base);
        Ok(())
    }

    // The committed index plus any customer written locally or in the
    // overlay under this name. Every match is read through `get`, which drops
    // customers renamed since and puts the rest in the read set.
    fn customers_by_last_name(&mut self, w: i64, d: i64, last: &str) -> Vec<i64> {
        let named = |v: &Value| matches!(v, Value::Customer(c) if c.last == last);
        let in_district = |k: &Key| match k {
            Key::Customer { w: kw, d: kd, c } if *kw == w && *kd == d => Some(*c),
            _ => None,
        };
        let mut ids: BTreeSet<i64> = self
            .store
            .customers_by_last_name(w, d, last)
            .into_iter()
            .collect();
        for (k, v) in self.local.iter() {
            match in_district(k) {
                Some(c) if named(v) => {
                    ids.insert(c);
                }
                _ => (),
            }
        }
        if let Some(overlay) = self.overlay {
            for (k, e) in overlay.entries.iter() {
                match in_district(k) {
                    Some(c) if named(&e.value) => {
                        ids.insert(c);
                    }
                    _ => (),
                }
            }
        }
        let mut out = Vec::with_capacity(ids.len());
        for c in ids {
            match self.get(&Key::Customer { w, d, c }) {
                Ok(Some(v)) if named(&v) => out.push(c),
                _ => (),
            }
        }
        out
    }
}

/// The owned residue of a [LocalTxn] after its plan has run.
#[derive(Debug)]
pub(crate) struct Executed {
    id: TxnId,
    local: BTreeMap<Key, Value>,
    writes: WriteSet,
    reads: BTreeSet<Key>,
    read_ts: BTreeMap<Key, u64>,
    prev: BTreeSet<TxnId>,
    snapshot_reads: BTreeMap<Key, Option<CommitId>>,
}

impl Executed {
    pub(crate) fn writes(&self) -> &WriteSet {
        &self.writes
    }

    /// Validates against the overlay and, on success, installs this
    /// transaction's writes into it. Fails with [Error::TxnFailed] if a key
    /// that was read and then written has been reinstalled since the read.
    pub(crate) fn validate_and_install(
        mut self,
        overlay: &mut Overlay,
        source: ReplicaId,
        query: Query,
    ) -> Result<TransactionRecord, Error> {
        for key in self.writes.keys() {
            let current = overlay.get(key);
            if let Some(read_ts) = self.read_ts.get(key) {
                if let Some(e) = current {
                    if e.ts > *read_ts {
                        trace!("{:?} failed validation on {:?}", self.id, key);
                        return Err(Error::TxnFailed);
                    }
                }
            }
            if let Some(e) = current {
                if e.writer != self.id {
                    self.prev.insert(e.writer);
                }
            }
        }
        for (key, value) in std::mem::take(&mut self.local) {
            overlay.install(key, value, self.id);
        }
        Ok(self.into_record(source, query, ConflictStatus::Conflict))
    }

    /// Records the key sets only, for resolution by deterministic replay.
    pub(crate) fn into_collected(self, source: ReplicaId, query: Query) -> TransactionRecord {
        self.into_record(source, query, ConflictStatus::NonExecuted)
    }

    fn into_record(
        self,
        source: ReplicaId,
        query: Query,
        status: ConflictStatus,
    ) -> TransactionRecord {
        TransactionRecord {
            id: self.id,
            source,
            prev: self.prev,
            query,
            writes: self.writes,
            reads: self.reads,
            snapshot_reads: self.snapshot_reads,
            status,
        }
    }
}
