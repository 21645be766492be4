// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Deterministic re-execution of the records a global commit did not accept
//! as executed.
//!
//! Replay order is fixed: stale records, then conflicted ones, then
//! key-collected ones; within each group replicas are taken in the configured
//! priority order and each replica's records by ascending txn id. Small
//! workloads run sequentially in that order. Larger ones run on a bounded
//! set of tasks under [LockManager], which serializes every conflicting pair
//! in the same order, so both paths leave the store in the same state.

use crate::{
    locks::LockManager, occ::LocalTxn, resolver::Resolution, Epoch, Error, GlobalTxnId,
    ReplayFailurePolicy, ReplicaId, TransactionRecord, TxnOutcome, VersionedStore,
};
use async_std::{
    sync::{Arc, RwLock},
    task,
};
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::collections::VecDeque;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Record indices in replay order.
pub(crate) fn replay_order(res: &Resolution, priority: &[ReplicaId]) -> Vec<usize> {
    let mut order = Vec::new();
    for lists in [&res.stale, &res.conflicted, &res.non_executed].iter() {
        for r in priority.iter() {
            if let Some(l) = lists.get(r.index()) {
                order.extend(l.iter().cloned());
            }
        }
    }
    order
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ReplayParams {
    pub(crate) epoch: Epoch,
    pub(crate) policy: ReplayFailurePolicy,
    pub(crate) workers: usize,
    pub(crate) sequential_threshold: usize,
}

/// Re-executes one record against the store and applies its writes.
fn replay_one<S: VersionedStore>(
    store: &mut S,
    rec: &TransactionRecord,
    epoch: Epoch,
) -> Result<TxnOutcome, Error> {
    let (res, done) = match LocalTxn::store_only(rec.id, &*store).run(&rec.query) {
        Ok(x) => x,
        Err(Error::TxnAbort) => return Ok(TxnOutcome::NotExecuted(Error::TxnAbort.to_string())),
        Err(e) => return Err(e),
    };
    store.apply_writes(done.writes(), epoch)?;
    Ok(TxnOutcome::Executed(res))
}

// Split variant of replay_one for the parallel path: execute under a shared
// guard, apply under an exclusive one.
async fn replay_one_shared<S: VersionedStore>(
    store: Arc<RwLock<S>>,
    records: Arc<Vec<TransactionRecord>>,
    idx: usize,
    epoch: Epoch,
) -> Result<TxnOutcome, Error> {
    let rec = &records[idx];
    let executed = {
        let guard = store.read().await;
        LocalTxn::store_only(rec.id, &*guard).run(&rec.query)
    };
    let (res, done) = match executed {
        Ok(x) => x,
        Err(Error::TxnAbort) => return Ok(TxnOutcome::NotExecuted(Error::TxnAbort.to_string())),
        Err(e) => return Err(e),
    };
    store.write().await.apply_writes(done.writes(), epoch)?;
    Ok(TxnOutcome::Executed(res))
}

fn settle(
    rec: &TransactionRecord,
    res: Result<TxnOutcome, Error>,
    policy: ReplayFailurePolicy,
) -> Result<TxnOutcome, Error> {
    match res {
        Ok(o) => Ok(o),
        Err(e) => match policy {
            ReplayFailurePolicy::Halt => {
                warn!("replay of {:?} failed: {}", rec.global_id(), e);
                Err(Error::ReplayFailed)
            }
            ReplayFailurePolicy::SkipTransaction => {
                warn!("replay of {:?} failed, skipping: {}", rec.global_id(), e);
                Ok(TxnOutcome::NotExecuted(e.to_string()))
            }
        },
    }
}

pub(crate) fn replay_sequential<S: VersionedStore>(
    store: &mut S,
    records: &[TransactionRecord],
    order: &[usize],
    params: &ReplayParams,
) -> Result<Vec<(GlobalTxnId, TxnOutcome)>, Error> {
    let mut out = Vec::with_capacity(order.len());
    for idx in order.iter() {
        let rec = &records[*idx];
        let res = replay_one(store, rec, params.epoch);
        trace!("replayed {:?}: {:?}", rec.global_id(), res);
        out.push((rec.global_id(), settle(rec, res, params.policy)?));
    }
    Ok(out)
}

pub(crate) async fn replay_parallel<S: VersionedStore>(
    store: Arc<RwLock<S>>,
    records: Arc<Vec<TransactionRecord>>,
    order: &[usize],
    params: &ReplayParams,
) -> Result<Vec<(GlobalTxnId, TxnOutcome)>, Error> {
    let n = order.len();
    let mut lm = LockManager::new(n);
    for (slot, idx) in order.iter().enumerate() {
        lm.register(slot, records[*idx].lock_keys());
    }
    let mut ready: VecDeque<usize> = lm.start().into_iter().collect();
    let mut outcomes: Vec<Option<TxnOutcome>> = vec![None; n];
    let mut inflight = FuturesUnordered::new();
    let workers = std::cmp::max(1, params.workers);
    // After a halting failure nothing new starts, but whatever is in flight
    // still runs to completion before the error is returned.
    let mut failed = None;
    loop {
        while failed.is_none() && inflight.len() < workers {
            let slot = match ready.pop_front() {
                None => break,
                Some(s) => s,
            };
            let idx = order[slot];
            let span = debug_span!("replay", txn=?records[idx].global_id());
            let fut = replay_one_shared(store.clone(), records.clone(), idx, params.epoch)
                .instrument(span);
            inflight.push(task::spawn(fut).map(move |r| (slot, r)));
        }
        let (slot, res) = match inflight.next().await {
            None => break,
            Some(x) => x,
        };
        let rec = &records[order[slot]];
        match settle(rec, res, params.policy) {
            Ok(o) => {
                outcomes[slot] = Some(o);
                ready.extend(lm.release(slot));
            }
            Err(e) => {
                if failed.is_none() {
                    failed = Some(e);
                }
            }
        }
    }
    if let Some(e) = failed {
        debug!("parallel replay at {:?} halted", params.epoch);
        return Err(e);
    }
    let mut out = Vec::with_capacity(n);
    for (slot, o) in outcomes.into_iter().enumerate() {
        match o {
            Some(o) => out.push((records[order[slot]].global_id(), o)),
            None => return Err(Error::ReplayFailed),
        }
    }
    Ok(out)
}

/// Replays `res`'s losers, choosing the sequential or lock-scheduled path by
/// workload size.
pub(crate) async fn replay<S: VersionedStore>(
    store: Arc<RwLock<S>>,
    records: Arc<Vec<TransactionRecord>>,
    res: &Resolution,
    priority: &[ReplicaId],
    params: ReplayParams,
) -> Result<Vec<(GlobalTxnId, TxnOutcome)>, Error> {
    let order = replay_order(res, priority);
    if order.is_empty() {
        return Ok(Vec::new());
    }
    debug!(
        "replaying {} records at {:?} ({})",
        order.len(),
        params.epoch,
        if order.len() <= params.sequential_threshold {
            "sequential"
        } else {
            "parallel"
        }
    );
    if order.len() <= params.sequential_threshold {
        let mut guard = store.write().await;
        replay_sequential(&mut *guard, &records, &order, &params)
    } else {
        replay_parallel(store, records, &order, &params).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ConflictStatus, Key, KvCmd, MemStore, NewOrderReq, OrderItem, Query, TxnId, Value,
    };
    use std::collections::BTreeSet;

    fn params(workers: usize, sequential_threshold: usize) -> ReplayParams {
        ReplayParams {
            epoch: Epoch(7),
            policy: ReplayFailurePolicy::Halt,
            workers,
            sequential_threshold,
        }
    }

    fn record(source: u32, id: u64, query: Query) -> TransactionRecord {
        // Key sets come from a store-only run against an empty store.
        let store = MemStore::new();
        let (reads, writes) = match LocalTxn::store_only(TxnId(id), &store).run(&query) {
            Ok((_, done)) => {
                let rec = done.into_collected(ReplicaId(source), query.clone());
                (rec.reads, rec.writes)
            }
            Err(_) => (BTreeSet::new(), Default::default()),
        };
        TransactionRecord {
            id: TxnId(id),
            source: ReplicaId(source),
            prev: BTreeSet::new(),
            query,
            writes,
            reads,
            snapshot_reads: Default::default(),
            status: ConflictStatus::Conflict,
        }
    }

    fn kv_txn(source: u32, id: u64, get: &str, set: &str, value: &str) -> TransactionRecord {
        record(
            source,
            id,
            Query::Kv(vec![
                KvCmd::Get {
                    shard: 0,
                    key: get.into(),
                },
                KvCmd::Set {
                    shard: 0,
                    key: set.into(),
                    value: value.into(),
                },
            ]),
        )
    }

    #[test]
    fn order_is_group_then_priority_then_id() {
        let res = Resolution {
            statuses: vec![],
            winners: vec![],
            stale: vec![vec![1], vec![0]],
            conflicted: vec![vec![], vec![2, 3]],
            non_executed: vec![vec![4], vec![]],
        };
        let prio = vec![ReplicaId(1), ReplicaId(0)];
        assert_eq!(replay_order(&res, &prio), vec![0, 1, 2, 3, 4]);
    }

    fn seeded_store() -> MemStore {
        let mut ops = crate::query::test::loaded_district();
        let mut store = MemStore::new();
        for (k, v) in std::mem::take(&mut ops.map) {
            store.set(k, v, Epoch(1));
        }
        store
    }

    fn workload() -> Vec<TransactionRecord> {
        let mut recs = Vec::new();
        for i in 0..12u64 {
            let a = format!("k{}", i % 4);
            let b = format!("k{}", (i + 1) % 4);
            recs.push(kv_txn((i % 3) as u32, i + 1, &a, &b, &format!("v{}", i)));
        }
        for i in 0..6i64 {
            let q = Query::NewOrder(NewOrderReq {
                w: 1,
                d: 1,
                c: 1 + i,
                items: vec![
                    OrderItem {
                        i_id: 1 + i,
                        supply_w: 1,
                        qty: 3,
                    },
                    OrderItem {
                        i_id: 2,
                        supply_w: 1,
                        qty: 1,
                    },
                ],
                entry_date: 1000,
            });
            let mut rec = record(i as u32 % 3, 100 + i as u64, q);
            // Key sets as seen by a run against the loaded store.
            let store = seeded_store();
            if let Ok((_, done)) = LocalTxn::store_only(rec.id, &store).run(&rec.query) {
                let c = done.into_collected(rec.source, rec.query.clone());
                rec.reads = c.reads;
                rec.writes = c.writes;
            }
            recs.push(rec);
        }
        // One whose item does not exist: a deterministic abort.
        recs.push(record(
            2,
            200,
            Query::NewOrder(NewOrderReq {
                w: 1,
                d: 1,
                c: 1,
                items: vec![OrderItem {
                    i_id: 999_999,
                    supply_w: 1,
                    qty: 1,
                }],
                entry_date: 1000,
            }),
        ));
        recs
    }

    #[test]
    fn sequential_and_parallel_replay_agree() {
        let records = Arc::new(workload());
        let order: Vec<usize> = (0..records.len()).collect();

        let mut expected = seeded_store();
        let seq = replay_sequential(&mut expected, &records, &order, &params(1, 0)).unwrap();
        assert!(!seq.last().map(|(_, o)| o.executed()).unwrap_or(true));
        assert_eq!(
            expected.get(&Key::Kv { shard: 0, key: "k0".into() }).unwrap().value,
            Value::Text("v11".into())
        );

        for workers in 1..=4 {
            let store = Arc::new(RwLock::new(seeded_store()));
            let par = task::block_on(replay_parallel(
                store.clone(),
                records.clone(),
                &order,
                &params(workers, 0),
            ))
            .unwrap();
            assert_eq!(par, seq);
            let got = task::block_on(async { store.read().await.clone() });
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn failures_follow_policy() {
        // A row of the wrong type is a hard failure, not an abort.
        let mut store = MemStore::new();
        store.set(
            Key::Warehouse { w: 1 },
            Value::Text("not a warehouse".into()),
            Epoch(1),
        );
        let records = vec![record(
            0,
            1,
            Query::NewOrder(NewOrderReq {
                w: 1,
                d: 1,
                c: 1,
                items: vec![],
                entry_date: 0,
            }),
        )];
        let mut p = params(1, 10);
        assert_eq!(
            replay_sequential(&mut store.clone(), &records, &[0], &p),
            Err(Error::ReplayFailed)
        );
        p.policy = ReplayFailurePolicy::SkipTransaction;
        let out = replay_sequential(&mut store, &records, &[0], &p).unwrap();
        assert!(!out[0].1.executed());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn halted_parallel_replay_leaves_nothing_running() {
        let mut seeded = MemStore::new();
        seeded.set(
            Key::Warehouse { w: 1 },
            Value::Text("not a warehouse".into()),
            Epoch(1),
        );
        let mut records = vec![record(
            0,
            1,
            Query::NewOrder(NewOrderReq {
                w: 1,
                d: 1,
                c: 1,
                items: vec![],
                entry_date: 0,
            }),
        )];
        for i in 0..32u64 {
            let k = format!("k{}", i);
            records.push(kv_txn(1, i + 2, &k, &k, "v"));
        }
        let records = Arc::new(records);
        let order: Vec<usize> = (0..records.len()).collect();
        let store = Arc::new(RwLock::new(seeded));
        task::block_on(async {
            let res = replay_parallel(store.clone(), records.clone(), &order, &params(4, 0)).await;
            assert_eq!(res, Err(Error::ReplayFailed));
            let after = store.read().await.clone();
            task::sleep(std::time::Duration::from_millis(50)).await;
            assert_eq!(*store.read().await, after);
        });
    }
}
