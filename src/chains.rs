// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Grouping of same-replica records into transaction chains.
//!
//! A record that observed another record's uncommitted writes can only be
//! correct if that other record is also applied as executed, so both must win
//! or lose together. Chains are the connected components of the predecessor
//! relation, restricted to the records of one global commit.

use crate::{ReplicaId, TransactionRecord, TxnId};
use std::collections::{BTreeMap, HashMap};

/// Disjoint sets over `0..n`, with path halving and union by rank.
#[derive(Clone, Debug)]
pub(crate) struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra;
        } else {
            self.parent[rb] = ra;
            self.rank[ra] += 1;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Chain {
    pub(crate) replica: ReplicaId,
    /// Indices into the record slice, ascending.
    pub(crate) members: Vec<usize>,
}

impl Chain {
    pub(crate) fn weight(&self) -> u64 {
        self.members.len() as u64
    }
}

/// Builds the chains of `records`, skipping key-collected records. Chains
/// come out ordered by replica id and then by smallest member txn id, so
/// every replica numbers them identically.
pub(crate) fn build_chains(records: &[TransactionRecord]) -> Vec<Chain> {
    let index: HashMap<(ReplicaId, TxnId), usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_non_executed())
        .map(|(i, r)| ((r.source, r.id), i))
        .collect();
    let mut uf = UnionFind::new(records.len());
    for (i, r) in records.iter().enumerate() {
        if r.is_non_executed() {
            continue;
        }
        for p in r.prev.iter() {
            if let Some(j) = index.get(&(r.source, *p)) {
                uf.union(i, *j);
            }
        }
    }
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in index.values() {
        let root = uf.find(*i);
        groups.entry(root).or_default().push(*i);
    }
    let mut chains: Vec<Chain> = groups
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_unstable();
            Chain {
                replica: records[members[0]].source,
                members,
            }
        })
        .collect();
    chains.sort_by_key(|c| {
        let min_id = c.members.iter().map(|m| records[*m].id).min();
        (c.replica, min_id)
    });
    chains
}
