// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A deterministic two-phase lock manager for replay.
//!
//! Every lock request of every transaction is registered up front, in replay
//! order, before anything runs. Each key then has a FIFO queue of requests,
//! and a request is granted only by its position in that queue: a write
//! when it reaches the front, a read when no write is queued ahead of it.
//! Since the registration order is a single total order, two conflicting
//! transactions always run in that order, whatever the number of workers or
//! the timing of completions. Transactions become runnable when all their
//! requests are granted and release everything at once when done.

use crate::Key;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LockQueue {
    // (transaction slot, is_write), in registration order.
    requests: VecDeque<(usize, bool)>,
    // Length of the granted prefix of `requests`.
    granted: usize,
}

impl LockQueue {
    fn grantable_prefix(&self) -> usize {
        match self.requests.front() {
            None => 0,
            Some((_, true)) => 1,
            Some(_) => self.requests.iter().take_while(|(_, w)| !*w).count(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct LockManager {
    queues: HashMap<Key, LockQueue>,
    held: Vec<Vec<Key>>,
    waiting: Vec<usize>,
    released: Vec<bool>,
}

impl LockManager {
    pub(crate) fn new(txns: usize) -> Self {
        LockManager {
            queues: HashMap::new(),
            held: vec![Vec::new(); txns],
            waiting: vec![0; txns],
            released: vec![false; txns],
        }
    }

    /// Registers `txn`'s requests. Transactions must be registered in slot
    /// order, and all of them before [LockManager::start].
    pub(crate) fn register<'a>(&mut self, txn: usize, keys: impl Iterator<Item = (&'a Key, bool)>) {
        for (key, write) in keys {
            let q = self.queues.entry(key.clone()).or_insert_with(|| LockQueue {
                requests: VecDeque::new(),
                granted: 0,
            });
            q.requests.push_back((txn, write));
            self.held[txn].push(key.clone());
            self.waiting[txn] += 1;
        }
    }

    /// Grants every initially grantable request, returning the transactions
    /// that are ready to run, in slot order.
    pub(crate) fn start(&mut self) -> Vec<usize> {
        let mut ready = Vec::new();
        for q in self.queues.values_mut() {
            Self::grant(q, &mut self.waiting, &mut ready);
        }
        for (txn, w) in self.waiting.iter().enumerate() {
            if *w == 0 && !ready.contains(&txn) {
                ready.push(txn);
            }
        }
        ready.sort_unstable();
        ready
    }

    fn grant(q: &mut LockQueue, waiting: &mut [usize], ready: &mut Vec<usize>) {
        let upto = q.grantable_prefix();
        while q.granted < upto {
            let (txn, _) = q.requests[q.granted];
            waiting[txn] -= 1;
            if waiting[txn] == 0 {
                ready.push(txn);
            }
            q.granted += 1;
        }
    }

    /// Releases all of `txn`'s locks, returning the transactions that became
    /// ready as a result, in slot order.
    pub(crate) fn release(&mut self, txn: usize) -> Vec<usize> {
        let mut ready = Vec::new();
        if self.released[txn] {
            return ready;
        }
        self.released[txn] = true;
        for key in std::mem::take(&mut self.held[txn]) {
            let now_empty = match self.queues.get_mut(&key) {
                None => false,
                Some(q) => {
                    if let Some(pos) = q.requests.iter().position(|(t, _)| *t == txn) {
                        q.requests.remove(pos);
                        if pos < q.granted {
                            q.granted -= 1;
                        }
                    }
                    Self::grant(q, &mut self.waiting, &mut ready);
                    q.requests.is_empty()
                }
            };
            if now_empty {
                self.queues.remove(&key);
            }
        }
        ready.sort_unstable();
        ready
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self, txn: usize) -> usize {
        self.waiting[txn]
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
    fn reads_share_and_writes_wait_their_turn() {
        let (a, b) = (kv("a"), kv("b"));
        let mut lm = LockManager::new(4);
        lm.register(0, vec![(&a, false)].into_iter());
        lm.register(1, vec![(&a, false), (&b, true)].into_iter());
        lm.register(2, vec![(&a, true)].into_iter());
        lm.register(3, vec![(&a, false), (&b, false)].into_iter());
        assert_eq!(lm.start(), vec![0, 1]);
        assert_eq!(lm.waiting(2), 1);
        assert_eq!(lm.waiting(3), 2);

        // The write on `a` waits for both earlier readers.
        assert!(lm.release(0).is_empty());
        assert_eq!(lm.release(1), vec![2]);
        // The later reader of `a` waits behind the write, though `b` is free.
        assert_eq!(lm.waiting(3), 1);
        assert_eq!(lm.release(2), vec![3]);
        assert!(lm.release(3).is_empty());
        assert!(lm.release(3).is_empty());
    }

    #[test]
    fn lockless_transactions_are_ready_at_once() {
        let mut lm = LockManager::new(2);
        lm.register(0, std::iter::empty());
        let k = kv("k");
        lm.register(1, vec![(&k, true)].into_iter());
        assert_eq!(lm.start(), vec![0, 1]);
    }
}
