// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate implements a replicated transactional store in which every
//! replica commits client transactions optimistically against its own state,
//! and a periodic, consensus-ordered global commit reconciles whatever the
//! replicas did concurrently. All replicas apply the same global commits in
//! the same order, and every step of applying one is deterministic, so all
//! replicas converge on the same store.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - A transaction is a [Query]: a request naming one deterministic
//!     execution plan over typed records.
//!
//!   - Each replica executes queries at once, against its committed store
//!     plus an overlay of its own uncommitted writes, validating reads with
//!     optimistic concurrency control. A transaction that read or overwrote
//!     another uncommitted local transaction's writes records it as a
//!     predecessor.
//!
//!   - Locally committed transactions are appended to the replica's current
//!     batch. Batches close on a timer and are broadcast; once a majority
//!     has acknowledged every batch up to some id, the source announces a
//!     proof of availability (PoA) for that prefix.
//!
//!   - A coordinator periodically proposes a commit vector, one PoA'd batch
//!     bound per replica, to a consensus sequencer. The sequencer's log
//!     numbers these by epoch.
//!
//!   - Each replica applies the sequencer's log in epoch order. Applying an
//!     epoch groups its transactions into chains of predecessors, marks
//!     chains stale if what they read has since been committed over, builds
//!     a conflict graph over the rest, and keeps a maximum-weight independent
//!     set of chains. The winners' writes are applied as they are; everything
//!     else is re-executed in a fixed order against the new state.
//!
//!   - A client learns either the local result (if its transaction won), the
//!     re-execution's result, or that the transaction did not execute.
//!
//! ## Caveats
//!
//!  - The consensus sequencer, the store and the MWIS solver are traits. The
//!    crate ships in-memory implementations of each, which are fine for
//!    tests and single-process clusters and nothing else.
//!
//!  - Queries must have deterministic read and write sets given the state
//!    they run against; loads that generate data take their RNG seed and
//!    dates as request parameters.
//!
//!  - There is no recovery, reconfiguration or durable storage. A replica
//!    that stops stays stopped.

use futures::Future;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, pin::Pin};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Txn was aborted")]
    TxnAbort,
    #[error("Txn failed validation")]
    TxnFailed,
    #[error("Patched key does not exist")]
    MissingKey,
    #[error("Value has the wrong type for its key")]
    TypeMismatch,
    #[error("Solver returned an infeasible selection")]
    Infeasible,
    #[error("Sequencer rejected proposal")]
    SequencerRejected,
    #[error("Networking error")]
    NetworkingError,
    #[error("Malformed frame")]
    Codec,
    #[error("Bad configuration: {0}")]
    Config(String),
    #[error("Timed out")]
    Timeout,
    #[error("Replica stopped")]
    Stopped,
    #[error("Replay failed")]
    ReplayFailed,
    #[error("Unknown replica")]
    UnknownReplica,
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::NetworkingError
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(_: bincode::error::EncodeError) -> Self {
        Error::Codec
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::Codec
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

mod batch;
mod chains;
mod commit;
mod config;
mod ids;
mod keys;
mod locks;
mod mwis;
mod network;
mod occ;
mod query;
mod quorum;
mod record;
mod records;
mod replay;
mod replica;
mod resolver;
mod sequencer;
mod stats;
mod store;
mod tidmgr;
mod trackers;
mod wire;

// We define a BoxFuture-like wrapper type here and wrap most of our nontrivial
// async fn calls in it, for compilation and code footprint reasons: it costs an
// extra heap allocation per async call, but keeps the replica's public futures
// nameable, lets trait objects like the sequencer return them, and keeps the
// instantiated future types small.
//
// We don't use the standard BoxFuture type because we want our boxed futures to
// also implement Sync, which the standard one doesn't.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use batch::{Batch, BatchStatus};
pub use config::{Config, NodeInfo, ReplayFailurePolicy, MAX_EXACT_VERTEX_LIMIT, MAX_PORT};
pub use ids::{BatchId, CommitId, CommitVector, Epoch, GlobalTxnId, ReplicaId, TxnId};
pub use keys::{EntityType, Key};
pub use mwis::{ConflictGraph, GreedyKind, InProcessSolver, MwisSolver, Solution, SolveMode};
pub use query::{
    execute, last_name, CustomerSelector, KvCmd, NewOrderReq, OrderItem, PaymentReq, Query,
    TxnOps,
};
pub use record::{ConflictStatus, TransactionRecord, TxnOutcome};
pub use records::{
    Customer, District, History, Item, NewOrder, Order, OrderLine, Stock, Value, Warehouse,
};
pub use replica::Replica;
pub use sequencer::{ConsensusSequencer, MemorySequencer};
pub use stats::{Stats, StatsSnapshot};
pub use store::{MemStore, PersistEntry, VersionedStore, WriteOp, WriteSet};
pub(crate) use tidmgr::TidMgr;
pub use wire::{
    decode, encode_frame, read_frame, write_frame, ClientRequest, ClientResponse, PeerMsg,
    MAX_FRAME,
};
