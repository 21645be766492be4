// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Conflict resolution for one global commit.
//!
//! Given every record named by a commit vector (in replica, batch, position
//! order), the resolver decides which records stand as executed and which
//! must be re-executed by deterministic replay:
//!
//!   1. Records are grouped into chains.
//!
//!   2. A chain is stale if any member read a key from the committed store
//!      that has since been committed again, or depends on a transaction
//!      from an earlier commit that was re-executed.
//!
//!   3. The remaining chains become the vertices of a conflict graph, with an
//!      edge between chains of different replicas that write a common key or
//!      where one writes what the other reads.
//!
//!   4. A maximum-weight independent set of that graph wins; everything else
//!      is conflicted.
//!
//! The result is a pure function of the records, the store and the set of
//! previously re-executed transactions, so every replica reaches the same
//! decision.

use crate::{
    chains::{build_chains, Chain},
    trackers::ConflictTracker,
    ConflictGraph, ConflictStatus, Epoch, Error, GlobalTxnId, MwisSolver, SolveMode,
    TransactionRecord, VersionedStore,
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

/// Transactions re-executed by replay in recent epochs. A chain whose
/// predecessor lies outside its own commit can only point at a transaction
/// from the commit just before it, since the overlay is cleared after every
/// commit, so a short window is enough.
#[derive(Debug, Default)]
pub(crate) struct ReplayedSet {
    by_epoch: BTreeMap<Epoch, HashSet<GlobalTxnId>>,
}

impl ReplayedSet {
    const WINDOW: usize = 4;

    pub(crate) fn record(&mut self, epoch: Epoch, txns: impl IntoIterator<Item = GlobalTxnId>) {
        self.by_epoch.entry(epoch).or_default().extend(txns);
        while self.by_epoch.len() > Self::WINDOW {
            let first = match self.by_epoch.keys().next() {
                Some(e) => *e,
                None => break,
            };
            self.by_epoch.remove(&first);
        }
    }

    pub(crate) fn contains(&self, id: &GlobalTxnId) -> bool {
        self.by_epoch.values().any(|s| s.contains(id))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Resolution {
    /// Final status of every record, by record index.
    pub(crate) statuses: Vec<ConflictStatus>,
    /// Winning record indices in collection order, which is the order their
    /// writes must be applied in.
    pub(crate) winners: Vec<usize>,
    /// Per replica index, record indices sorted by txn id.
    pub(crate) stale: Vec<Vec<usize>>,
    pub(crate) conflicted: Vec<Vec<usize>>,
    pub(crate) non_executed: Vec<Vec<usize>>,
}

impl Resolution {
    pub(crate) fn count(lists: &[Vec<usize>]) -> usize {
        lists.iter().map(|l| l.len()).sum()
    }

    /// True when losers outnumber winners, which is the trigger for the
    /// key-collecting local mode.
    pub(crate) fn is_high_contention(&self) -> bool {
        self.winners.len() < Self::count(&self.stale) + Self::count(&self.conflicted)
    }
}

fn chain_is_stale<S: VersionedStore>(
    chain: &Chain,
    records: &[TransactionRecord],
    in_commit: &HashSet<GlobalTxnId>,
    store: &S,
    replayed: &ReplayedSet,
) -> bool {
    chain.members.iter().any(|m| {
        let r = &records[*m];
        let snapshot_moved = r
            .snapshot_reads
            .iter()
            .any(|(k, snap)| store.commit_of(k) > *snap);
        let dep_replayed = r.prev.iter().any(|p| {
            let g = GlobalTxnId {
                replica: r.source,
                txn: *p,
            };
            !in_commit.contains(&g) && replayed.contains(&g)
        });
        snapshot_moved || dep_replayed
    })
}

pub(crate) fn resolve<S: VersionedStore>(
    records: &[TransactionRecord],
    replicas: usize,
    store: &S,
    replayed: &ReplayedSet,
    solver: &dyn MwisSolver,
    mode: SolveMode,
) -> Result<Resolution, Error> {
    let in_commit: HashSet<GlobalTxnId> = records.iter().map(|r| r.global_id()).collect();
    let chains = build_chains(records);

    let mut statuses: Vec<ConflictStatus> = records.iter().map(|r| r.status).collect();
    let mut live: Vec<&Chain> = Vec::new();
    for chain in chains.iter() {
        if chain_is_stale(chain, records, &in_commit, store, replayed) {
            for m in chain.members.iter() {
                statuses[*m] = ConflictStatus::Stale;
            }
        } else {
            live.push(chain);
        }
    }

    let mut graph = ConflictGraph::new();
    graph.add_vertices(live.len());
    let mut tracker = ConflictTracker::default();
    for (v, chain) in live.iter().enumerate() {
        graph.set_weight(v, chain.weight());
        for m in chain.members.iter() {
            for k in records[*m].writes.keys() {
                tracker.note_write(k, v);
            }
        }
        for m in chain.members.iter() {
            for k in records[*m].reads.iter() {
                tracker.note_read(k, v);
            }
        }
    }
    for (a, b) in tracker.edges(|a, b| live[a].replica != live[b].replica) {
        graph.add_edge(a, b);
    }

    let solution = solver.solve(&graph, mode);
    if !solution.feasible || !graph.is_independent(&solution.vertices) {
        error!(
            "solver returned an unusable solution for {} chains",
            live.len()
        );
        return Err(Error::Infeasible);
    }
    for v in solution.vertices.iter() {
        for m in live[*v].members.iter() {
            statuses[*m] = ConflictStatus::None;
        }
    }

    let mut res = Resolution {
        statuses: Vec::new(),
        winners: Vec::new(),
        stale: vec![Vec::new(); replicas],
        conflicted: vec![Vec::new(); replicas],
        non_executed: vec![Vec::new(); replicas],
    };
    for (i, status) in statuses.iter().enumerate() {
        let r = records[i].source.index();
        if r >= replicas {
            return Err(Error::UnknownReplica);
        }
        match status {
            ConflictStatus::None => res.winners.push(i),
            ConflictStatus::Stale => res.stale[r].push(i),
            ConflictStatus::Conflict => res.conflicted[r].push(i),
            ConflictStatus::NonExecuted => res.non_executed[r].push(i),
        }
    }
    for lists in [&mut res.stale, &mut res.conflicted, &mut res.non_executed].iter_mut() {
        for l in lists.iter_mut() {
            l.sort_by_key(|i| records[*i].id);
        }
    }
    res.statuses = statuses;
    debug!(
        "resolved {} records in {} chains ({} edges): {} winners, {} stale, {} conflicted, {} non-executed",
        records.len(),
        chains.len(),
        graph.edge_count(),
        res.winners.len(),
        Resolution::count(&res.stale),
        Resolution::count(&res.conflicted),
        Resolution::count(&res.non_executed)
    );
    Ok(res)
}
