// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by a [crate::Replica]. Reset when the replica's workers are
/// launched, read through [Stats::snapshot].
#[derive(Default)]
pub struct Stats {
    total_applied: AtomicU64,
    total_local_executed: AtomicU64,
    stale: AtomicU64,
    conflicted: AtomicU64,
    non_local_executed: AtomicU64,
    epochs_applied: AtomicU64,
    high_contention_entries: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_applied: u64,
    pub total_local_executed: u64,
    pub stale: u64,
    pub conflicted: u64,
    pub non_local_executed: u64,
    pub epochs_applied: u64,
    pub high_contention_entries: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total Transactions: {}", self.total_applied)?;
        writeln!(f, "Total Local Transactions: {}", self.total_local_executed)?;
        writeln!(f, "Stale Transactions: {}", self.stale)?;
        writeln!(f, "Conflicted Transactions: {}", self.conflicted)?;
        writeln!(f, "Non Local Executed Transactions: {}", self.non_local_executed)?;
        writeln!(f, "Epochs Applied: {}", self.epochs_applied)?;
        write!(f, "High Contention Entries: {}", self.high_contention_entries)
    }
}

fn bump(c: &AtomicU64, n: usize) {
    c.fetch_add(n as u64, Ordering::Relaxed);
}

impl Stats {
    pub fn reset(&self) {
        for c in [
            &self.total_applied,
            &self.total_local_executed,
            &self.stale,
            &self.conflicted,
            &self.non_local_executed,
            &self.epochs_applied,
            &self.high_contention_entries,
        ]
        .iter()
        {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn local_executed(&self) {
        bump(&self.total_local_executed, 1)
    }

    pub(crate) fn epoch_applied(
        &self,
        applied: usize,
        stale: usize,
        conflicted: usize,
        non_executed: usize,
    ) {
        bump(&self.epochs_applied, 1);
        bump(&self.total_applied, applied);
        bump(&self.stale, stale);
        bump(&self.conflicted, conflicted);
        bump(&self.non_local_executed, non_executed);
    }

    pub(crate) fn entered_high_contention(&self) {
        bump(&self.high_contention_entries, 1)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_applied: self.total_applied.load(Ordering::Relaxed),
            total_local_executed: self.total_local_executed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            conflicted: self.conflicted.load(Ordering::Relaxed),
            non_local_executed: self.non_local_executed.load(Ordering::Relaxed),
            epochs_applied: self.epochs_applied.load(Ordering::Relaxed),
            high_contention_entries: self.high_contention_entries.load(Ordering::Relaxed),
        }
    }
}

#[test]
fn test_stats_reset() {
    let s = Stats::default();
    s.local_executed();
    s.epoch_applied(5, 1, 2, 3);
    let snap = s.snapshot();
    assert_eq!(snap.total_applied, 5);
    assert_eq!(snap.conflicted, 2);
    assert_eq!(snap.epochs_applied, 1);
    assert!(snap.to_string().contains("Stale Transactions: 1"));
    s.reset();
    assert_eq!(s.snapshot(), StatsSnapshot::default());
}
