// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{EntityType, Key};
use std::collections::{BTreeSet, HashMap};

type Index = HashMap<EntityType, HashMap<u64, Vec<usize>>>;

fn note(index: &mut Index, key: &Key, chain: usize) {
    let slot = index
        .entry(key.entity())
        .or_default()
        .entry(key.fingerprint())
        .or_default();
    if slot.last() != Some(&chain) {
        slot.push(chain);
    }
}

/// Per-entity indices from key fingerprints to the chains reading or
/// writing them. Chains must be noted in ascending order. A fingerprint
/// collision can only add edges, never hide one.
#[derive(Default)]
pub(crate) struct ConflictTracker {
    writes: Index,
    reads: Index,
}

impl ConflictTracker {
    pub(crate) fn note_write(&mut self, key: &Key, chain: usize) {
        note(&mut self.writes, key, chain)
    }

    pub(crate) fn note_read(&mut self, key: &Key, chain: usize) {
        note(&mut self.reads, key, chain)
    }

    /// Every pair of chains (lower index first) that share a written key or
    /// where one writes a key the other reads, restricted to pairs `allowed`
    /// accepts.
    pub(crate) fn edges<F>(&self, allowed: F) -> BTreeSet<(usize, usize)>
    where
        F: Fn(usize, usize) -> bool,
    {
        let mut out = BTreeSet::new();
        let mut add = |a: usize, b: usize| {
            let pair = if a < b { (a, b) } else { (b, a) };
            if a != b && allowed(pair.0, pair.1) {
                out.insert(pair);
            }
        };
        for (entity, writes) in self.writes.iter() {
            let reads = self.reads.get(entity);
            for (fp, writers) in writes.iter() {
                for (i, a) in writers.iter().enumerate() {
                    for b in writers[i + 1..].iter() {
                        add(*a, *b);
                    }
                }
                if let Some(readers) = reads.and_then(|r| r.get(fp)) {
                    for a in writers.iter() {
                        for b in readers.iter() {
                            add(*a, *b);
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kv(k: &str) -> Key {
        Key::Kv {
            shard: 0,
            key: k.into(),
        }
    }

    #[test]
    fn write_write_and_read_write_edges() {
        let mut t = ConflictTracker::default();
        t.note_write(&kv("a"), 0);
        t.note_write(&kv("a"), 1);
        t.note_read(&kv("b"), 0);
        t.note_write(&kv("b"), 2);
        t.note_read(&kv("c"), 1);
        t.note_read(&kv("c"), 2);
        let edges: Vec<_> = t.edges(|_, _| true).into_iter().collect();
        assert_eq!(edges, vec![(0, 1), (0, 2)]);

        let filtered: Vec<_> = t.edges(|a, _| a != 0).into_iter().collect();
        assert!(filtered.is_empty());
    }

    #[test]
    fn entity_types_are_separate() {
        let mut t = ConflictTracker::default();
        t.note_write(&Key::Warehouse { w: 1 }, 0);
        t.note_read(&Key::Item { i: 1 }, 1);
        assert!(t.edges(|_, _| true).is_empty());
    }
}
