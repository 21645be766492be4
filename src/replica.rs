// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    batch::{AckTracker, BatchBuilder, ReplicaLog},
    occ::{LocalTxn, Overlay},
    quorum::{ack_quorum, failures_tolerated},
    resolver::ReplayedSet,
    sequencer::SequencerLog,
    BatchId, CommitVector, Config, ConsensusSequencer, Epoch, Error, InProcessSolver,
    MwisSolver, Query, ReplicaId, Stats, SyncBoxFuture, TidMgr, TransactionRecord, TxnId,
    TxnOutcome, VersionedStore,
};
use async_std::sync::{Arc, Mutex, RwLock};
use futures::{channel::oneshot, io::AsyncRead};
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, debug_span, instrument, trace, warn, Instrument};

pub(crate) struct Pending {
    pub(crate) tx: oneshot::Sender<TxnOutcome>,
    // The result the local execution produced, reported if it wins.
    pub(crate) result: String,
}

/// Global-commit bookkeeping, touched only by the commit drainer and the GC
/// loop.
pub(crate) struct CommitState {
    pub(crate) last_applied: Epoch,
    /// Upper bounds of everything committed so far, per replica.
    pub(crate) committed: Vec<Option<BatchId>>,
    /// Commit vectors of recent epochs, kept until GC passes them.
    pub(crate) applied: BTreeMap<Epoch, Vec<Option<BatchId>>>,
    pub(crate) replayed: ReplayedSet,
    /// Highest epoch each replica has announced applying.
    pub(crate) announced: Vec<Epoch>,
}

pub(crate) struct ProposerState {
    pub(crate) next_epoch: Epoch,
    pub(crate) last_proposed: Vec<Option<BatchId>>,
}

pub(crate) type PeerReader = Box<dyn AsyncRead + Send + Sync + Unpin + 'static>;

/// Main object that clients instantiate: one member of a replicated store.
/// Clients provide a [Config], a [VersionedStore] holding committed state and
/// a [ConsensusSequencer] shared by the group (and optionally their own
/// [MwisSolver]); then
/// [Replica::connect] it to every peer, call [Replica::launch_workers] and
/// [Replica::submit] queries.
pub struct Replica<S: VersionedStore> {
    pub self_id: ReplicaId,
    pub(crate) config: Arc<Config>,
    pub(crate) tidmgr: Arc<TidMgr>,

    // Committed state. Written only by global commits.
    pub(crate) store: Arc<RwLock<S>>,

    // Uncommitted local writes. Read-locked while executing, write-locked to
    // validate, install and append to the current batch as one step.
    pub(crate) overlay: Arc<RwLock<Overlay>>,

    pub(crate) current: Arc<Mutex<BatchBuilder>>,

    // One log per source replica, each under its own lock.
    pub(crate) logs: Arc<Vec<Mutex<ReplicaLog>>>,
    pub(crate) acks: Arc<Mutex<AckTracker>>,

    pub(crate) seq_log: Arc<Mutex<SequencerLog>>,
    pub(crate) commit: Arc<Mutex<CommitState>>,
    pub(crate) proposer: Arc<Mutex<ProposerState>>,

    // Each locally submitted txn waiting on a global commit. An entry is
    // removed and resolved under the same lock.
    pub(crate) pending: Arc<Mutex<HashMap<TxnId, Pending>>>,

    pub(crate) connections: Arc<RwLock<HashMap<ReplicaId, crate::network::Connection>>>,
    pub(crate) readers: Arc<Mutex<Vec<(ReplicaId, PeerReader)>>>,

    pub(crate) sequencer: Arc<dyn ConsensusSequencer>,
    pub(crate) solver: Arc<dyn MwisSolver>,
    pub(crate) stats: Arc<Stats>,

    pub(crate) running: Arc<AtomicBool>,
    pub(crate) coordinator: Arc<AtomicBool>,
    // Remaining local epoch intervals of high-contention mode.
    pub(crate) contention: Arc<AtomicUsize>,
}

impl<S: VersionedStore> Clone for Replica<S> {
    fn clone(&self) -> Self {
        Replica {
            self_id: self.self_id,
            config: self.config.clone(),
            tidmgr: self.tidmgr.clone(),
            store: self.store.clone(),
            overlay: self.overlay.clone(),
            current: self.current.clone(),
            logs: self.logs.clone(),
            acks: self.acks.clone(),
            seq_log: self.seq_log.clone(),
            commit: self.commit.clone(),
            proposer: self.proposer.clone(),
            pending: self.pending.clone(),
            connections: self.connections.clone(),
            readers: self.readers.clone(),
            sequencer: self.sequencer.clone(),
            solver: self.solver.clone(),
            stats: self.stats.clone(),
            running: self.running.clone(),
            coordinator: self.coordinator.clone(),
            contention: self.contention.clone(),
        }
    }
}

impl<S: VersionedStore> Replica<S> {
    /// Construct a new Replica from a validated [Config], resolving conflicts
    /// with an [InProcessSolver] built from the config's solver settings.
    pub fn new(
        config: Config,
        store: S,
        sequencer: Arc<dyn ConsensusSequencer>,
    ) -> Result<Self, Error> {
        let solver = Arc::new(InProcessSolver::from_config(&config));
        Self::with_solver(config, store, sequencer, solver)
    }

    /// Like [Replica::new] with a caller-provided solver. Every replica of a
    /// group must be given the same sequencer and an equivalent solver.
    pub fn with_solver(
        config: Config,
        store: S,
        sequencer: Arc<dyn ConsensusSequencer>,
        solver: Arc<dyn MwisSolver>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let self_id = config.self_id()?;
        let n = config.replica_count();
        let coordinator = config.coordinator;
        debug!(
            "replica {:?} of {}: ack quorum {}, tolerates {} failures",
            self_id,
            n,
            ack_quorum(n),
            failures_tolerated(n)
        );
        Ok(Replica {
            self_id,
            tidmgr: Arc::new(TidMgr::new(self_id)),
            store: Arc::new(RwLock::new(store)),
            overlay: Arc::new(RwLock::new(Overlay::default())),
            current: Arc::new(Mutex::new(BatchBuilder::new(self_id))),
            logs: Arc::new((0..n).map(|_| Mutex::new(ReplicaLog::default())).collect()),
            acks: Arc::new(Mutex::new(AckTracker::new(n))),
            seq_log: Arc::new(Mutex::new(SequencerLog::default())),
            commit: Arc::new(Mutex::new(CommitState {
                last_applied: Epoch(0),
                committed: vec![None; n],
                applied: BTreeMap::new(),
                replayed: ReplayedSet::default(),
                announced: vec![Epoch(0); n],
            })),
            proposer: Arc::new(Mutex::new(ProposerState {
                next_epoch: Epoch(1),
                last_proposed: vec![None; n],
            })),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            readers: Arc::new(Mutex::new(Vec::new())),
            sequencer,
            solver,
            stats: Arc::new(Stats::default()),
            running: Arc::new(AtomicBool::new(false)),
            coordinator: Arc::new(AtomicBool::new(coordinator)),
            contention: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> crate::StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.load(Ordering::SeqCst)
    }

    pub fn in_high_contention(&self) -> bool {
        self.contention.load(Ordering::SeqCst) > 0
    }

    /// The last epoch whose global commit this replica has applied.
    pub async fn last_applied(&self) -> Epoch {
        self.commit.lock().await.last_applied
    }

    /// Runs `f` against the committed store.
    pub async fn with_store<R, F: FnOnce(&S) -> R>(&self, f: F) -> R {
        let guard = self.store.read().await;
        f(&*guard)
    }

    /// Makes this replica start (or stop) proposing commit vectors. A new
    /// coordinator picks up after the last epoch it has applied.
    pub fn set_coordinator(&self, on: bool) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            if on {
                let commit = this.commit.lock().await;
                let mut p = this.proposer.lock().await;
                p.next_epoch = std::cmp::max(p.next_epoch, commit.last_applied.next());
                p.last_proposed = commit.committed.clone();
            }
            debug!("replica {:?} coordinator={}", this.self_id, on);
            this.coordinator.store(on, Ordering::SeqCst);
        })
    }

    /// Asks the worker loops to exit after their current step and fails every
    /// transaction still waiting on a global commit with [Error::Stopped].
    pub fn stop(&self) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            this.running.store(false, Ordering::SeqCst);
            let dropped = this.pending.lock().await.drain().count();
            debug!(
                "stopping replica {:?}, abandoning {} pending txns",
                this.self_id, dropped
            );
        })
    }

    /// Main entrypoint for clients submitting transactions. The txn executes
    /// locally at once and is resolved by a later global commit: either its
    /// local result stands, or it is re-executed deterministically and the
    /// re-execution's result is returned. A plan that aborts resolves
    /// immediately as not executed.
    #[instrument(skip(self))]
    pub fn submit(&self, query: Query) -> SyncBoxFuture<Result<TxnOutcome, Error>> {
        let this = self.clone();
        Box::pin(async move {
            let id = this.tidmgr.create_txn_id();
            let span = debug_span!("submit", peer=?this.self_id, txn=?id);
            this.submit_(id, query).instrument(span).await
        })
    }

    /// Like [Replica::submit], failing with [Error::Timeout] if no outcome
    /// arrives within `limit`. The txn itself is not cancelled.
    pub fn submit_with_timeout(
        &self,
        query: Query,
        limit: Duration,
    ) -> SyncBoxFuture<Result<TxnOutcome, Error>> {
        let fut = self.submit(query);
        Box::pin(async move {
            match async_std::future::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout),
            }
        })
    }

    async fn submit_(&self, id: TxnId, query: Query) -> Result<TxnOutcome, Error> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        let optimistic = self.config.occ_enabled && !self.in_high_contention();
        let queued = if optimistic {
            self.execute_optimistic(id, &query, tx).await
        } else {
            self.execute_collect(id, &query, tx).await
        };
        match queued {
            Ok(()) => (),
            Err(Error::TxnAbort) => {
                debug!("txn {:?} aborted locally", id);
                return Ok(TxnOutcome::NotExecuted(Error::TxnAbort.to_string()));
            }
            Err(e) => return Err(e),
        }
        trace!(
            "txn {:?} of {:?} queued for global commit (watermark {:?})",
            id,
            self.tidmgr.self_id(),
            self.tidmgr.watermark()
        );
        rx.await.map_err(|_| Error::Stopped)
    }

    // Execute, validate and install, retrying on validation failure. Falls
    // back to key collection once retries are exhausted.
    async fn execute_optimistic(
        &self,
        id: TxnId,
        query: &Query,
        tx: oneshot::Sender<TxnOutcome>,
    ) -> Result<(), Error> {
        for attempt in 0..=self.config.occ_max_retries {
            let (result, executed) = {
                let store = self.store.read().await;
                let overlay = self.overlay.read().await;
                LocalTxn::optimistic(id, &*overlay, &*store).run(query)?
            };
            let mut overlay = self.overlay.write().await;
            match executed.validate_and_install(&mut *overlay, self.self_id, query.clone()) {
                Ok(rec) => {
                    self.enqueue(rec, tx, result).await?;
                    drop(overlay);
                    self.stats.local_executed();
                    return Ok(());
                }
                Err(Error::TxnFailed) => {
                    trace!("txn {:?} validation failed, attempt {}", id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "txn {:?} failed validation {} times, deferring to replay",
            id,
            self.config.occ_max_retries + 1
        );
        self.execute_collect(id, query, tx).await
    }

    // Key collection only: the txn is re-executed by replay.
    async fn execute_collect(
        &self,
        id: TxnId,
        query: &Query,
        tx: oneshot::Sender<TxnOutcome>,
    ) -> Result<(), Error> {
        let (result, executed) = {
            let store = self.store.read().await;
            LocalTxn::store_only(id, &*store).run(query)?
        };
        let rec = executed.into_collected(self.self_id, query.clone());
        self.enqueue(rec, tx, result).await
    }

    async fn enqueue(
        &self,
        rec: TransactionRecord,
        tx: oneshot::Sender<TxnOutcome>,
        result: String,
    ) -> Result<(), Error> {
        let id = rec.id;
        let mut current = self.current.lock().await;
        current.push(rec)?;
        self.pending.lock().await.insert(id, Pending { tx, result });
        Ok(())
    }

    /// Resolves a local txn's client future. Does nothing if it was already
    /// resolved or abandoned.
    pub(crate) async fn resolve_pending(&self, id: TxnId, outcome: Option<TxnOutcome>) {
        let mut pending = self.pending.lock().await;
        if let Some(p) = pending.remove(&id) {
            let outcome = outcome.unwrap_or(TxnOutcome::Executed(p.result));
            let _ = p.tx.send(outcome);
        }
    }

    /// Every commit vector this replica has applied, newest last, that GC
    /// has not yet discarded.
    pub async fn applied_vectors(&self) -> Vec<CommitVector> {
        self.commit
            .lock()
            .await
            .applied
            .iter()
            .map(|(e, v)| CommitVector {
                epoch: *e,
                indices: v.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ConflictGraph, GreedyKind, KvCmd, MemStore, MemorySequencer, SolveMode};
    use async_std::task;

    fn solo() -> Replica<MemStore> {
        Replica::new(
            Config::local_cluster(1, 0),
            MemStore::new(),
            Arc::new(MemorySequencer::new()),
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let mut cfg = Config::local_cluster(2, 0);
        cfg.nodes[1].is_self = true;
        let r = Replica::new(cfg, MemStore::new(), Arc::new(MemorySequencer::new()));
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn solver_follows_config() {
        let mut cfg = Config::local_cluster(1, 0);
        cfg.solver_exact = true;
        cfg.exact_vertex_limit = 3;
        cfg.greedy = GreedyKind::Gwmin2;
        let r = Replica::new(cfg, MemStore::new(), Arc::new(MemorySequencer::new())).unwrap();
        let mut g = ConflictGraph::new();
        g.add_vertices(4);
        g.set_weight(0, 2);
        for v in 1..4 {
            g.set_weight(v, 1);
            g.add_edge(0, v);
        }
        assert_eq!(r.config().solve_mode(), SolveMode::Exact);
        // Four vertices exceed the limit, so GWMIN2 picks the centre.
        assert_eq!(r.solver.solve(&g, r.config().solve_mode()).vertices, vec![0]);
    }

    #[test]
    fn submit_before_launch_is_stopped() {
        let r = solo();
        let q = Query::Kv(vec![KvCmd::Get {
            shard: 0,
            key: "a".into(),
        }]);
        assert_eq!(task::block_on(r.submit(q)), Err(Error::Stopped));
    }

    #[test]
    fn local_abort_resolves_immediately() {
        let r = solo();
        r.running.store(true, Ordering::SeqCst);
        let q = Query::Payment(crate::PaymentReq {
            w: 1,
            d: 1,
            customer: crate::CustomerSelector::ById(1),
            amount: 1.0,
            date: 0,
        });
        let out = task::block_on(r.submit(q)).unwrap();
        assert!(!out.executed());
        assert_eq!(task::block_on(async { r.current.lock().await.len() }), 0);
    }
}
