// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The replica's worker loops and the global commit they drive.
//!
//! Four loops run per replica:
//!
//!   - The *closer* closes the current batch every local epoch interval and
//!     disseminates it.
//!
//!   - The *proposer* (idle unless this replica is coordinator) turns the
//!     latest PoA vector into a commit-vector proposal for the sequencer.
//!
//!   - The *drainer* reads the sequencer's log in strict epoch order and runs
//!     a global commit for each entry, one at a time.
//!
//!   - The *collector* discards batches every replica has moved past.
//!
//! A global commit for vector `v` over previously committed vector `p`
//! fetches any missing batch in `(p, v]`, resolves conflicts among their
//! records, applies the winners, replays the rest, clears the overlay and
//! announces the new epoch.

use crate::{
    batch::{Batch, BatchStatus},
    quorum::high_contention_span,
    replay::{replay, ReplayParams},
    resolver::{resolve, Resolution},
    wire::PeerMsg,
    BatchId, CommitVector, Epoch, Error, Replica, TransactionRecord, VersionedStore,
};
use async_std::{
    sync::{Arc, RwLock},
    task,
};
use futures::{
    channel::{
        mpsc::{self, UnboundedSender},
        oneshot,
    },
    Future, StreamExt,
};
use std::{
    pin::Pin,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

pub(crate) type LoopFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// How often the closer looks at the current batch, so that one outgrowing
// the size limit closes without waiting out the interval.
const CLOSER_POLL: Duration = Duration::from_millis(1);

/// A large set of winners handed to the applier task.
pub(crate) struct ApplyJob {
    records: Arc<Vec<TransactionRecord>>,
    winners: Vec<usize>,
    epoch: Epoch,
    done: oneshot::Sender<Result<(), Error>>,
}

fn apply_winners<S: VersionedStore>(
    store: &mut S,
    records: &[TransactionRecord],
    winners: &[usize],
    epoch: Epoch,
) -> Result<(), Error> {
    for i in winners {
        store.apply_writes(&records[*i].writes, epoch)?;
    }
    Ok(())
}

fn spawn_applier<S: VersionedStore>(
    store: Arc<RwLock<S>>,
    span: tracing::Span,
) -> UnboundedSender<ApplyJob> {
    let (send, mut recv) = mpsc::unbounded::<ApplyJob>();
    task::spawn(
        async move {
            while let Some(job) = recv.next().await {
                let res = {
                    let mut guard = store.write().await;
                    apply_winners(&mut *guard, &job.records, &job.winners, job.epoch)
                };
                let _ = job.done.send(res);
            }
        }
        .instrument(span),
    );
    send
}

fn elementwise_max(a: &[Option<BatchId>], b: &[Option<BatchId>]) -> Vec<Option<BatchId>> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| std::cmp::max(*x, *y))
        .collect()
}

fn batch_range(after: Option<BatchId>, upto: Option<BatchId>) -> impl Iterator<Item = BatchId> {
    let from = after.map(|a| a.0 + 1).unwrap_or(0);
    let to = upto.map(|u| u.0 + 1).unwrap_or(0);
    (from..to).map(BatchId)
}

impl<S: VersionedStore> Replica<S> {
    pub(crate) fn run_closer_loop(self) -> LoopFuture {
        Box::pin(async move {
            let interval = self.config.local_epoch_interval();
            let mut ticked = Instant::now();
            while self.is_running() {
                task::sleep(CLOSER_POLL).await;
                if ticked.elapsed() >= interval {
                    ticked = Instant::now();
                    let _ = self
                        .contention
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
                }
                let closed = {
                    let mut current = self.current.lock().await;
                    if current.should_close(interval, self.config.max_batch_size) {
                        Some(current.close())
                    } else {
                        None
                    }
                };
                if let Some(batch) = closed {
                    self.publish_batch(batch).await;
                }
            }
            debug!("closer loop on {:?} exited", self.self_id);
        })
    }

    async fn publish_batch(&self, batch: Batch) {
        debug!(
            "closing {:?} with {} records ({} bytes)",
            batch.id,
            batch.records.len(),
            batch.size
        );
        let id = batch.id;
        let batch = Arc::new(batch);
        self.logs[self.self_id.index()]
            .lock()
            .await
            .insert(batch.clone(), BatchStatus::LocalCompleted);
        self.broadcast(&PeerMsg::Batch((*batch).clone())).await;
        self.on_ack(id, self.self_id).await;
    }

    pub(crate) fn run_proposer_loop(self) -> LoopFuture {
        Box::pin(async move {
            let interval = std::cmp::max(
                self.config.global_epoch_interval(),
                Duration::from_millis(1),
            );
            while self.is_running() {
                task::sleep(interval).await;
                if self.is_coordinator() {
                    self.propose_once().await;
                }
            }
            debug!("proposer loop on {:?} exited", self.self_id);
        })
    }

    /// Proposes the current PoA vector if it has moved since the last
    /// successful proposal.
    pub(crate) async fn propose_once(&self) {
        let mut poa = Vec::with_capacity(self.logs.len());
        for log in self.logs.iter() {
            poa.push(log.lock().await.last_poa());
        }
        let last_applied = self.commit.lock().await.last_applied;
        let vector = {
            let p = self.proposer.lock().await;
            let indices = elementwise_max(&poa, &p.last_proposed);
            let vector = CommitVector {
                epoch: std::cmp::max(p.next_epoch, last_applied.next()),
                indices,
            };
            if !vector.advances_past(&p.last_proposed) {
                return;
            }
            vector
        };
        match self.sequencer.propose(vector.clone()).await {
            Ok(()) => {
                {
                    let mut p = self.proposer.lock().await;
                    p.last_proposed = vector.indices.clone();
                    p.next_epoch = vector.epoch.next();
                }
                info!("proposed {:?}: {:?}", vector.epoch, vector.indices);
                self.broadcast(&PeerMsg::CommitVector(vector.clone())).await;
                self.seq_log.lock().await.offer(vector);
            }
            Err(e) => warn!("proposal for {:?} rejected: {}", vector.epoch, e),
        }
    }

    pub(crate) fn run_drainer_loop(self) -> LoopFuture {
        Box::pin(async move {
            let poll = std::cmp::max(
                self.config.local_epoch_interval() / 2,
                Duration::from_millis(1),
            );
            let span = debug_span!("applier", peer=?self.self_id);
            let applier = spawn_applier(self.store.clone(), span);
            'outer: while self.is_running() {
                loop {
                    let ready = self.seq_log.lock().await.pop_ready();
                    let vector = match ready {
                        Some(v) => v,
                        None => {
                            let next = self.seq_log.lock().await.next();
                            match self.sequencer.next_uncommitted(next).await {
                                Some(v) => {
                                    self.seq_log.lock().await.offer(v);
                                    continue;
                                }
                                None => break,
                            }
                        }
                    };
                    let epoch = vector.epoch;
                    let span = debug_span!("global-commit", peer=?self.self_id, ?epoch);
                    if let Err(e) = self.global_commit(vector, &applier).instrument(span).await {
                        if e != Error::Stopped {
                            error!("global commit of {:?} failed: {}", epoch, e);
                        }
                        self.stop().await;
                        break 'outer;
                    }
                }
                task::sleep(poll).await;
            }
            debug!("drainer loop on {:?} exited", self.self_id);
        })
    }

    // Waits until every batch in each replica's `(after, upto]` range is held
    // locally, asking peers for the ones that are not.
    async fn fetch_missing(
        &self,
        after: &[Option<BatchId>],
        upto: &[Option<BatchId>],
    ) -> Result<(), Error> {
        let mut attempt: u64 = 0;
        loop {
            let mut missing = Vec::new();
            for (r, log) in self.logs.iter().enumerate() {
                let log = log.lock().await;
                for b in log.missing(after[r], upto[r]) {
                    missing.push((crate::ReplicaId(r as u32), b));
                }
            }
            if missing.is_empty() {
                return Ok(());
            }
            if !self.is_running() {
                return Err(Error::Stopped);
            }
            attempt += 1;
            if attempt > 1 {
                warn!("still missing {} batches, attempt {}", missing.len(), attempt);
            }
            for (source, batch) in missing {
                self.broadcast(&PeerMsg::BatchRequest {
                    source,
                    batch,
                    from: self.self_id,
                })
                .await;
            }
            task::sleep(Duration::from_millis(std::cmp::min(2 * attempt, 20))).await;
        }
    }

    pub(crate) async fn global_commit(
        &self,
        vector: CommitVector,
        applier: &UnboundedSender<ApplyJob>,
    ) -> Result<(), Error> {
        let n = self.logs.len();
        if vector.indices.len() != n {
            return Err(Error::UnknownReplica);
        }
        let epoch = vector.epoch;
        let prev = self.commit.lock().await.committed.clone();
        let upto = elementwise_max(&prev, &vector.indices);
        self.fetch_missing(&prev, &upto).await?;

        let mut records = Vec::new();
        for (r, log) in self.logs.iter().enumerate() {
            let log = log.lock().await;
            for b in batch_range(prev[r], upto[r]) {
                match log.get(b) {
                    Some(batch) => records.extend(batch.records.iter().cloned()),
                    None => return Err(Error::NetworkingError),
                }
            }
        }
        let records = Arc::new(records);
        trace!("{:?} covers {} records", epoch, records.len());

        let res: Resolution = {
            let store = self.store.read().await;
            let commit = self.commit.lock().await;
            resolve(
                &records,
                n,
                &*store,
                &commit.replayed,
                &*self.solver,
                self.config.solve_mode(),
            )?
        };

        // Large winner sets are applied by the applier task while their
        // clients are notified; replay waits for both.
        let applying = if res.winners.len() > self.config.background_apply_threshold {
            let (done, wait) = oneshot::channel();
            let job = ApplyJob {
                records: records.clone(),
                winners: res.winners.clone(),
                epoch,
                done,
            };
            applier.unbounded_send(job).map_err(|_| Error::Stopped)?;
            Some(wait)
        } else {
            let mut store = self.store.write().await;
            apply_winners(&mut *store, &records, &res.winners, epoch)?;
            None
        };
        for i in res.winners.iter() {
            let rec = &records[*i];
            if rec.source == self.self_id {
                self.resolve_pending(rec.id, None).await;
            }
        }
        if let Some(wait) = applying {
            wait.await.map_err(|_| Error::Stopped)??;
        }

        let params = ReplayParams {
            epoch,
            policy: self.config.replay_failure_policy,
            workers: self.config.replay_workers,
            sequential_threshold: self.config.sequential_replay_threshold,
        };
        let priority = self.config.priority();
        let outcomes = replay(self.store.clone(), records.clone(), &res, &priority, params).await?;
        for (g, outcome) in outcomes.iter() {
            if g.replica == self.self_id {
                self.resolve_pending(g.txn, Some(outcome.clone())).await;
            }
        }

        {
            let mut overlay = self.overlay.write().await;
            trace!("dropping {} overlay entries", overlay.len());
            overlay.clear();
        }
        for (r, log) in self.logs.iter().enumerate() {
            log.lock().await.mark_committed(prev[r], upto[r]);
        }
        if let Some(own) = upto[self.self_id.index()] {
            self.acks.lock().await.forget_through(own);
        }

        self.stats.epoch_applied(
            records.len(),
            Resolution::count(&res.stale),
            Resolution::count(&res.conflicted),
            Resolution::count(&res.non_executed),
        );
        if res.is_high_contention() {
            self.enter_high_contention();
        }
        {
            let mut commit = self.commit.lock().await;
            commit.replayed.record(epoch, outcomes.iter().map(|(g, _)| *g));
            commit.last_applied = epoch;
            commit.committed = upto.clone();
            commit.applied.insert(epoch, upto);
            commit.announced[self.self_id.index()] = epoch;
        }
        info!(
            ?epoch,
            winners = res.winners.len(),
            replayed = outcomes.len(),
            stats = ?self.stats.snapshot(),
            "epoch applied"
        );
        self.broadcast(&PeerMsg::EpochAnnounce {
            replica: self.self_id,
            epoch,
        })
        .await;
        Ok(())
    }

    /// Starts a high-contention window unless one is already running.
    /// Returns whether a new window started.
    pub(crate) fn enter_high_contention(&self) -> bool {
        let span = high_contention_span(self.config.local_epoch_interval_ms);
        let entered = self
            .contention
            .compare_exchange(0, span, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if entered {
            self.stats.entered_high_contention();
            info!("entering high-contention mode for {} local epochs", span);
        }
        entered
    }

    pub(crate) fn run_gc_loop(self) -> LoopFuture {
        Box::pin(async move {
            let interval = std::cmp::max(self.config.gc_interval(), Duration::from_millis(1));
            while self.is_running() {
                task::sleep(interval).await;
                self.collect_once().await;
            }
            debug!("gc loop on {:?} exited", self.self_id);
        })
    }

    /// Drops batches covered by the commit vector of the oldest epoch every
    /// replica has announced.
    pub(crate) async fn collect_once(&self) -> usize {
        let plan = {
            let mut commit = self.commit.lock().await;
            let floor = match commit.announced.iter().min() {
                Some(e) => *e,
                None => return 0,
            };
            let vector = commit.applied.get(&floor).cloned();
            commit.applied.retain(|e, _| *e >= floor);
            vector.map(|v| (floor, v))
        };
        let (floor, vector) = match plan {
            None => return 0,
            Some(p) => p,
        };
        let mut dropped = 0;
        let mut held = 0;
        for (r, upto) in vector.iter().enumerate() {
            let mut log = self.logs[r].lock().await;
            if let Some(b) = upto {
                dropped += log.collect_through(*b);
            }
            held += log.held();
        }
        if dropped > 0 {
            debug!(
                "collected {} batches through {:?}, {} still held",
                dropped, floor, held
            );
        }
        dropped
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, Key, KvCmd, MemStore, MemorySequencer, Query, TxnOutcome};

    fn solo(tweak: impl Fn(&mut Config)) -> Replica<MemStore> {
        let mut cfg = Config::local_cluster(1, 0);
        tweak(&mut cfg);
        Replica::new(cfg, MemStore::new(), Arc::new(MemorySequencer::new())).unwrap()
    }

    #[test]
    fn oversized_batch_closes_before_interval() {
        let r = solo(|cfg| {
            cfg.local_epoch_interval_ms = 60_000;
            cfg.coordinator_global_epoch_interval_ms = 60_000;
            cfg.max_batch_size = 0;
        });
        task::block_on(async {
            r.running.store(true, Ordering::SeqCst);
            task::spawn(r.clone().run_closer_loop());
            let q = Query::Kv(vec![KvCmd::Set {
                shard: 0,
                key: "a".into(),
                value: "1".into(),
            }]);
            // Nothing commits within a minute-long epoch, but the batch
            // must already be out.
            let res = r.submit_with_timeout(q, Duration::from_millis(500)).await;
            assert_eq!(res, Err(Error::Timeout));
            let batch = r.logs[0].lock().await.get(BatchId(0));
            assert_eq!(batch.map(|b| b.records.len()), Some(1));
            assert_eq!(r.logs[0].lock().await.last_poa(), Some(BatchId(0)));
            r.stop().await;
        });
    }

    // Runs one local txn through a full global commit by hand.
    fn commit_one_set(r: &Replica<MemStore>) {
        task::block_on(async {
            r.running.store(true, Ordering::SeqCst);
            let q = Query::Kv(vec![KvCmd::Set {
                shard: 0,
                key: "w".into(),
                value: "1".into(),
            }]);
            let submitted = task::spawn(r.submit(q));
            while r.current.lock().await.len() == 0 {
                task::sleep(Duration::from_millis(1)).await;
            }
            let batch = r.current.lock().await.close();
            r.publish_batch(batch).await;
            r.propose_once().await;
            let vector = r.seq_log.lock().await.pop_ready().unwrap();
            assert_eq!(vector.epoch, Epoch(1));
            let applier = spawn_applier(r.store.clone(), tracing::Span::none());
            r.global_commit(vector, &applier).await.unwrap();

            assert_eq!(submitted.await, Ok(TxnOutcome::Executed("OK;".into())));
            let key = Key::Kv {
                shard: 0,
                key: "w".into(),
            };
            assert_eq!(r.with_store(|s| s.commit_of(&key)).await, Some(Epoch(1)));
            assert_eq!(r.last_applied().await, Epoch(1));
            r.stop().await;
        });
    }

    #[test]
    fn winners_are_stamped_with_their_epoch() {
        commit_one_set(&solo(|_| ()));
    }

    #[test]
    fn background_applier_stamps_winners_too() {
        commit_one_set(&solo(|cfg| cfg.background_apply_threshold = 0));
    }

    #[test]
    fn contention_window_is_not_extended_while_open() {
        let r = solo(|cfg| cfg.local_epoch_interval_ms = 40);
        assert!(r.enter_high_contention());
        assert_eq!(r.contention.load(Ordering::SeqCst), 5);
        r.contention.store(2, Ordering::SeqCst);
        assert!(!r.enter_high_contention());
        assert_eq!(r.contention.load(Ordering::SeqCst), 2);
        assert_eq!(r.stats().high_contention_entries, 1);
        r.contention.store(0, Ordering::SeqCst);
        assert!(r.enter_high_contention());
        assert_eq!(r.stats().high_contention_entries, 2);
    }

    #[test]
    fn ranges_are_half_open_on_the_left() {
        let r: Vec<_> = batch_range(None, Some(BatchId(2))).collect();
        assert_eq!(r, vec![BatchId(0), BatchId(1), BatchId(2)]);
        let r: Vec<_> = batch_range(Some(BatchId(2)), Some(BatchId(4))).collect();
        assert_eq!(r, vec![BatchId(3), BatchId(4)]);
        assert_eq!(batch_range(Some(BatchId(4)), Some(BatchId(4))).count(), 0);
        assert_eq!(batch_range(None, None).count(), 0);
    }

    #[test]
    fn max_never_regresses() {
        let a = vec![Some(BatchId(3)), None, Some(BatchId(1))];
        let b = vec![Some(BatchId(2)), Some(BatchId(0)), None];
        assert_eq!(
            elementwise_max(&a, &b),
            vec![Some(BatchId(3)), Some(BatchId(0)), Some(BatchId(1))]
        );
    }
}
