// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module glues together a set of peer connections, the framed message
//! codec in [crate::wire], and the message handlers of [Replica]. Each
//! connection gets a writer task draining an unbounded queue of encoded
//! frames and, once workers are launched, a reader task decoding frames and
//! dispatching them.

use crate::{
    batch::BatchStatus,
    replica::PeerReader,
    wire::{decode, encode_frame, read_frame, write_frame, ClientRequest, ClientResponse, PeerMsg},
    BatchId, Error, Replica, ReplicaId, SyncBoxFuture, TxnOutcome, VersionedStore,
};
use async_std::{sync::Arc, task};
use futures::{
    channel::mpsc::{self, UnboundedSender},
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    StreamExt,
};
use std::sync::atomic::Ordering;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Outgoing half of a peer connection: encoded frames queued for its writer
/// task.
pub(crate) type Connection = UnboundedSender<Vec<u8>>;

fn spawn_writer<W: AsyncWrite + Send + Unpin + 'static>(
    mut writer: W,
    span: tracing::Span,
) -> UnboundedSender<Vec<u8>> {
    let (send, mut recv) = mpsc::unbounded::<Vec<u8>>();
    task::spawn(
        async move {
            while let Some(frame) = recv.next().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("writer exiting: {}", e);
                    break;
                }
            }
        }
        .instrument(span),
    );
    send
}

impl<S: VersionedStore> Replica<S> {
    /// Adds a connection to a remote [ReplicaId]. The `io` handle should be a
    /// full-duplex `AsyncRead+AsyncWrite` type. Should be called before
    /// [Replica::launch_workers].
    pub async fn connect<IO>(&self, peer: ReplicaId, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        debug!(
            "connecting peers self={:?} to other={:?}",
            self.self_id, peer
        );
        let (reader, writer) = io.split();
        let span = debug_span!("writer", peer=?self.self_id, remote=?peer);
        let send = spawn_writer(writer, span);
        self.connections.write().await.insert(peer, send);
        let reader: PeerReader = Box::new(reader);
        self.readers.lock().await.push((peer, reader));
    }

    /// Start the worker tasks of this replica: one reader per connection, the
    /// batch closer, the epoch proposer, the commit drainer and the log
    /// collector. Resets the replica's stats.
    pub fn launch_workers(&self) -> SyncBoxFuture<()> {
        let this = self.clone();
        let fut = async move {
            this.stats.reset();
            this.running.store(true, Ordering::SeqCst);
            let readers: Vec<(ReplicaId, PeerReader)> =
                this.readers.lock().await.drain(..).collect();
            for (remote, mut reader) in readers {
                let this = this.clone();
                let span = debug_span!("service", peer=?this.self_id, ?remote);
                task::spawn(
                    async move {
                        let mut n: usize = 0;
                        loop {
                            n += 1;
                            let body = match read_frame(&mut reader).await {
                                Ok(Some(b)) => b,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("read from {:?} failed: {}", remote, e);
                                    break;
                                }
                            };
                            match decode::<PeerMsg>(&body) {
                                Ok(msg) => {
                                    trace!("message {} from {:?}: {:?}", n, remote, msg);
                                    this.serve_msg(remote, msg).await
                                }
                                Err(e) => warn!("bad frame from {:?}: {}", remote, e),
                            }
                            if !this.is_running() {
                                break;
                            }
                        }
                        warn!(
                            "service worker task on {:?} talking to {:?} exited",
                            this.self_id, remote
                        );
                    }
                    .instrument(span),
                );
            }
            for (which, fut) in vec![
                ("closer", this.clone().run_closer_loop()),
                ("proposer", this.clone().run_proposer_loop()),
                ("drainer", this.clone().run_drainer_loop()),
                ("gc", this.clone().run_gc_loop()),
            ] {
                let span = debug_span!("loop", peer=?this.self_id, which);
                task::spawn(fut.instrument(span));
            }
        };
        Box::pin(fut)
    }

    pub(crate) async fn serve_msg(&self, remote: ReplicaId, msg: PeerMsg) {
        let n = self.logs.len();
        match msg {
            PeerMsg::Batch(batch) => {
                let (source, id) = (batch.source, batch.id);
                if source.index() >= n || source == self.self_id {
                    warn!("ignoring batch {:?} from {:?} sourced at {:?}", id, remote, source);
                    return;
                }
                let fresh = self.logs[source.index()]
                    .lock()
                    .await
                    .insert(Arc::new(batch), BatchStatus::Available);
                trace!("received {:?} of {:?} (fresh={})", id, source, fresh);
                self.send_to(
                    source,
                    &PeerMsg::BatchAck {
                        source,
                        batch: id,
                        from: self.self_id,
                    },
                )
                .await;
            }
            PeerMsg::BatchAck {
                source,
                batch,
                from,
            } => {
                if source == self.self_id {
                    self.on_ack(batch, from).await;
                }
            }
            PeerMsg::Poa { source, batch } => {
                if source.index() >= n || source == self.self_id {
                    return;
                }
                let missing = self.logs[source.index()].lock().await.observe_poa(batch);
                for b in missing {
                    self.send_to(
                        source,
                        &PeerMsg::BatchRequest {
                            source,
                            batch: b,
                            from: self.self_id,
                        },
                    )
                    .await;
                }
            }
            PeerMsg::BatchRequest {
                source,
                batch,
                from,
            } => {
                if source.index() >= n {
                    return;
                }
                let found = self.logs[source.index()].lock().await.get(batch);
                if let Some(b) = found {
                    self.send_to(from, &PeerMsg::Batch((*b).clone())).await;
                }
            }
            PeerMsg::CommitVector(cv) => {
                self.seq_log.lock().await.offer(cv);
            }
            PeerMsg::EpochAnnounce { replica, epoch } => {
                let mut commit = self.commit.lock().await;
                if let Some(e) = commit.announced.get_mut(replica.index()) {
                    if *e < epoch {
                        *e = epoch;
                    }
                }
            }
        }
    }

    /// Counts an ack for one of our own batches, announcing a new PoA if the
    /// batch completes a prefix of available batches.
    pub(crate) async fn on_ack(&self, batch: BatchId, from: ReplicaId) {
        if !self.acks.lock().await.record(batch, from) {
            return;
        }
        let poa = {
            let mut log = self.logs[self.self_id.index()].lock().await;
            log.mark_available(batch);
            log.advance_poa()
        };
        if let Some(p) = poa {
            debug!("PoA for {:?} of {:?}", p, self.self_id);
            self.broadcast(&PeerMsg::Poa {
                source: self.self_id,
                batch: p,
            })
            .await;
        }
    }

    pub(crate) async fn send_to(&self, peer: ReplicaId, msg: &PeerMsg) {
        let frame = match encode_frame(msg) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot encode message for {:?}: {}", peer, e);
                return;
            }
        };
        match self.connections.read().await.get(&peer) {
            None => trace!("no connection to {:?}", peer),
            Some(conn) => {
                if conn.unbounded_send(frame).is_err() {
                    warn!("connection to {:?} is closed", peer);
                }
            }
        }
    }

    pub(crate) async fn broadcast(&self, msg: &PeerMsg) {
        let frame = match encode_frame(msg) {
            Ok(f) => f,
            Err(e) => {
                warn!("cannot encode broadcast: {}", e);
                return;
            }
        };
        for (peer, conn) in self.connections.read().await.iter() {
            if conn.unbounded_send(frame.clone()).is_err() {
                warn!("connection to {:?} is closed", peer);
            }
        }
    }

    /// Serves client requests arriving on `io` until it closes. Requests are
    /// submitted concurrently; responses carry the request's sequence number
    /// and may come back out of order.
    pub async fn serve_client<IO>(&self, io: IO) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = io.split();
        let span = debug_span!("client-writer", peer=?self.self_id);
        let send = spawn_writer(writer, span);
        while let Some(body) = read_frame(&mut reader).await? {
            let req: ClientRequest = decode(&body)?;
            let this = self.clone();
            let send = send.clone();
            let span = debug_span!("client-request", peer=?self.self_id, seq=req.seq);
            task::spawn(
                async move {
                    let (executed, result) = match this.submit(req.query).await {
                        Ok(TxnOutcome::Executed(r)) => (true, r),
                        Ok(TxnOutcome::NotExecuted(r)) => (false, r),
                        Err(e) => (false, e.to_string()),
                    };
                    let res = ClientResponse {
                        seq: req.seq,
                        executed,
                        result,
                    };
                    match encode_frame(&res) {
                        Ok(frame) => {
                            let _ = send.unbounded_send(frame);
                        }
                        Err(e) => warn!("cannot encode client response: {}", e),
                    }
                }
                .instrument(span),
            );
        }
        Ok(())
    }
}
