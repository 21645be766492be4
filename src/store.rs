// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{CommitId, EntityType, Error, Key, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A [PersistEntry] is the unit the [VersionedStore] keeps per [Key]: the
/// latest committed value and the epoch whose global commit wrote it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistEntry {
    pub value: Value,
    pub commit: CommitId,
}

/// A buffered write. `Patch` carries a partial row whose default-valued
/// fields are left untouched when applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Put(Value),
    Patch(Value),
}

impl WriteOp {
    pub fn value(&self) -> &Value {
        match self {
            WriteOp::Put(v) | WriteOp::Patch(v) => v,
        }
    }
}

/// Writes of one transaction, ordered by key (and so grouped by entity type).
pub type WriteSet = BTreeMap<Key, WriteOp>;

/// A `VersionedStore` is responsible for committed state. Clients of the
/// library provide an implementation and pass an instance in to the
/// constructor of [crate::Replica]; [MemStore] is the in-memory one.
///
/// The store only ever sees globally committed writes: winners of a global
/// commit and deterministic re-executions, each stamped with the epoch that
/// applied them. Speculative local writes live in the replica's overlay and
/// never reach the store directly. Every replica must end up with identical
/// stores after applying the same sequence of epochs, so implementations must
/// not reorder or drop writes.
pub trait VersionedStore: Send + Sync + 'static {
    fn get(&self, key: &Key) -> Option<&PersistEntry>;
    fn set(&mut self, key: Key, value: Value, commit: CommitId);

    /// Merges `patch` into the existing value. Patching an absent key fails
    /// with [Error::MissingKey].
    fn patch(&mut self, key: Key, patch: &Value, commit: CommitId) -> Result<(), Error>;

    /// Customer ids in warehouse `w`, district `d` with last name `last`.
    fn customers_by_last_name(&self, w: i64, d: i64, last: &str) -> Vec<i64>;

    fn commit_of(&self, key: &Key) -> Option<CommitId> {
        self.get(key).map(|e| e.commit)
    }

    fn apply_writes(&mut self, writes: &WriteSet, commit: CommitId) -> Result<(), Error> {
        for (key, op) in writes.iter() {
            match op {
                WriteOp::Put(v) => self.set(key.clone(), v.clone(), commit),
                WriteOp::Patch(p) => self.patch(key.clone(), p, commit)?,
            }
        }
        Ok(())
    }
}

/// Ordered in-memory [VersionedStore], one map per [EntityType], with a
/// last-name index over customers kept current by every customer write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemStore {
    tables: BTreeMap<EntityType, BTreeMap<Key, PersistEntry>>,
    last_names: BTreeMap<(i64, i64, String), BTreeSet<i64>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Key, &PersistEntry)> {
        self.tables.values().flat_map(|t| t.iter())
    }

    fn last_name_of(&self, key: &Key) -> Option<String> {
        match self.get(key).map(|e| &e.value) {
            Some(Value::Customer(cust)) => Some(cust.last.clone()),
            _ => None,
        }
    }

    // Moves customer `key` from the `old` last-name entry to the `new` one.
    fn reindex_customer(&mut self, key: &Key, old: Option<String>, new: Option<String>) {
        let (w, d, c) = match key {
            Key::Customer { w, d, c } => (*w, *d, *c),
            _ => return,
        };
        if let Some(last) = old {
            let name = (w, d, last);
            if let Some(ids) = self.last_names.get_mut(&name) {
                ids.remove(&c);
                if ids.is_empty() {
                    self.last_names.remove(&name);
                }
            }
        }
        if let Some(last) = new {
            self.last_names.entry((w, d, last)).or_default().insert(c);
        }
    }
}

impl VersionedStore for MemStore {
    fn get(&self, key: &Key) -> Option<&PersistEntry> {
        self.tables.get(&key.entity()).and_then(|t| t.get(key))
    }

    fn set(&mut self, key: Key, value: Value, commit: CommitId) {
        let old = self.last_name_of(&key);
        let new = match &value {
            Value::Customer(cust) => Some(cust.last.clone()),
            _ => None,
        };
        self.reindex_customer(&key, old, new);
        self.tables
            .entry(key.entity())
            .or_default()
            .insert(key, PersistEntry { value, commit });
    }

    fn patch(&mut self, key: Key, patch: &Value, commit: CommitId) -> Result<(), Error> {
        let old = self.last_name_of(&key);
        let entry = self
            .tables
            .get_mut(&key.entity())
            .and_then(|t| t.get_mut(&key))
            .ok_or(Error::MissingKey)?;
        entry.value.patch(patch)?;
        entry.commit = commit;
        let new = match &entry.value {
            Value::Customer(cust) => Some(cust.last.clone()),
            _ => None,
        };
        self.reindex_customer(&key, old, new);
        Ok(())
    }

    fn customers_by_last_name(&self, w: i64, d: i64, last: &str) -> Vec<i64> {
        match self.last_names.get(&(w, d, last.to_string())) {
            None => Vec::new(),
            Some(ids) => ids.iter().cloned().collect(),
        }
    }
}
