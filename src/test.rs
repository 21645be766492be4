// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use tessera::{
    decode, encode_frame, read_frame, write_frame, ClientRequest, ClientResponse, Config,
    ConsensusSequencer, CustomerSelector, Epoch, Key, KvCmd, MemStore, MemorySequencer,
    NewOrderReq, OrderItem, PaymentReq, Query, Replica, TxnOutcome, Value, VersionedStore,
};

use async_std::{sync::Arc, task};
use duplexify::Duplex;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::{collections::BTreeSet, time::Duration};
use tracing::{info, warn};

#[cfg(feature = "tracy")]
use tracing_subscriber::{self, layer::SubscriberExt};

#[cfg(feature = "tracy")]
use tracing_tracy;

use sluice::pipe::{pipe, PipeReader, PipeWriter};

type PipeRw = Duplex<PipeReader, PipeWriter>;
fn duplex_pair() -> (PipeRw, PipeRw) {
    let (a_recv, b_send) = pipe();
    let (b_recv, a_send) = pipe();
    let a_end = Duplex::new(a_recv, a_send);
    let b_end = Duplex::new(b_recv, b_send);
    (a_end, b_end)
}

#[cfg(feature = "tracy")]
fn setup_tracing_subscriber() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(tracing_tracy::TracyLayer::new()),
        )
        .unwrap();
    });
}

#[cfg(not(feature = "tracy"))]
fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

type Cluster = Vec<Replica<MemStore>>;

fn mk_cluster(n: u32, tweak: impl Fn(&mut Config)) -> (Cluster, MemorySequencer) {
    let seq = MemorySequencer::new();
    let replicas = (0..n)
        .map(|i| {
            let mut cfg = Config::local_cluster(n, i);
            tweak(&mut cfg);
            Replica::new(cfg, MemStore::new(), Arc::new(seq.clone())).unwrap()
        })
        .collect();
    (replicas, seq)
}

async fn connect_replicas(a: &Replica<MemStore>, b: &Replica<MemStore>) {
    let (a_end, b_end) = duplex_pair();
    a.connect(b.self_id, a_end).await;
    b.connect(a.self_id, b_end).await;
}

async fn start(cluster: &Cluster) {
    for i in 0..cluster.len() {
        for j in i + 1..cluster.len() {
            connect_replicas(&cluster[i], &cluster[j]).await;
        }
    }
    for r in cluster.iter() {
        r.launch_workers().await;
    }
}

async fn run_all(cluster: &Cluster, queries: Vec<(usize, Query)>) -> Vec<TxnOutcome> {
    let mut fu = FuturesUnordered::new();
    for (i, q) in queries {
        fu.push(cluster[i].submit_with_timeout(q, Duration::from_secs(30)));
    }
    let mut outcomes = Vec::new();
    while let Some(r) = fu.next().await {
        info!("resolved txn {:?}", r);
        outcomes.push(r.unwrap());
    }
    outcomes
}

// Waits until every replica has applied everything the sequencer holds, then
// checks they all hold the same store.
async fn converge(cluster: &Cluster, seq: &MemorySequencer) -> MemStore {
    for _ in 0..1000 {
        let target = Epoch(seq.len() as u64);
        let mut done = true;
        for r in cluster.iter() {
            if r.last_applied().await != target {
                done = false;
            }
        }
        if done {
            break;
        }
        task::sleep(Duration::from_millis(10)).await;
    }
    let target = Epoch(seq.len() as u64);
    let first = cluster[0].with_store(|s| s.clone()).await;
    for r in cluster.iter() {
        assert_eq!(r.last_applied().await, target);
        let store = r.with_store(|s| s.clone()).await;
        if store != first {
            warn!("replica {:?} diverged", r.self_id);
        }
        assert!(store == first);
    }
    first
}

async fn shutdown(cluster: &Cluster) {
    for r in cluster.iter() {
        r.stop().await;
    }
}

fn set(key: &str, value: &str) -> KvCmd {
    KvCmd::Set {
        shard: 0,
        key: key.into(),
        value: value.into(),
    }
}

fn get(key: &str) -> KvCmd {
    KvCmd::Get {
        shard: 0,
        key: key.into(),
    }
}

pub fn three_replica_kv_test() {
    setup_tracing_subscriber();
    let (cluster, seq) = mk_cluster(3, |_| ());
    let sz = 25;

    task::block_on(async move {
        start(&cluster).await;
        let mut queries = Vec::new();
        for i in 0..sz {
            for r in 0..cluster.len() {
                let k = format!("k{}", (i + r) % 5);
                let v = format!("{}-{}", r, i);
                queries.push((r, Query::Kv(vec![get(&format!("k{}", i % 5)), set(&k, &v)])));
            }
        }
        let outcomes = run_all(&cluster, queries).await;
        assert_eq!(outcomes.len(), sz * cluster.len());
        assert!(outcomes.iter().all(|o| o.executed()));

        let store = converge(&cluster, &seq).await;
        for k in 0..5 {
            let key = Key::Kv {
                shard: 0,
                key: format!("k{}", k),
            };
            let e = store.get(&key).unwrap();
            assert!(matches!(e.value, Value::Text(_)));
            assert!(e.commit > Epoch(0));
        }

        let res = cluster[1]
            .submit(Query::Kv(vec![get("k0"), get("nope")]))
            .await
            .unwrap();
        assert_eq!(res, TxnOutcome::Executed("OK;DNF;".into()));

        let stats = cluster[0].stats();
        info!("replica 0 stats:\n{}", stats);
        assert!(stats.epochs_applied > 0);
        assert!(stats.total_applied >= (sz * cluster.len()) as u64);
        assert!(stats.total_local_executed >= sz as u64);
        shutdown(&cluster).await;
    });
}

/// Each wave is a list of `(replica, key, writes)` ops submitted at once and
/// fully resolved before the next wave starts. Every key a wave writes must
/// end up stamped with an epoch applied during that wave; every other key
/// keeps its stamp.
pub fn random_kv_interleaving_test(waves: Vec<Vec<(usize, u8, bool)>>) {
    setup_tracing_subscriber();
    let (cluster, seq) = mk_cluster(2, |_| ());

    task::block_on(async move {
        start(&cluster).await;
        let mut before = converge(&cluster, &seq).await;
        let mut floor = Epoch(seq.len() as u64);
        for (w, wave) in waves.iter().enumerate() {
            let queries = wave
                .iter()
                .enumerate()
                .map(|(i, (r, k, writes))| {
                    let key = format!("k{}", k);
                    let second = if *writes {
                        set(&key, &format!("{}-{}", w, i))
                    } else {
                        get(&key)
                    };
                    (r % cluster.len(), Query::Kv(vec![get(&key), second]))
                })
                .collect();
            let outcomes = run_all(&cluster, queries).await;
            assert!(outcomes.iter().all(|o| o.executed()));

            let after = converge(&cluster, &seq).await;
            let ceiling = Epoch(seq.len() as u64);
            let written: BTreeSet<u8> = wave
                .iter()
                .filter(|(_, _, writes)| *writes)
                .map(|(_, k, _)| *k)
                .collect();
            for k in 0..4u8 {
                let key = Key::Kv {
                    shard: 0,
                    key: format!("k{}", k),
                };
                let old = before.get(&key).map(|e| e.commit);
                let new = after.get(&key).map(|e| e.commit);
                if written.contains(&k) {
                    let stamp = new.unwrap();
                    assert!(floor < stamp && stamp <= ceiling, "k{} at {:?}", k, stamp);
                } else {
                    assert_eq!(old, new, "k{}", k);
                }
            }
            before = after;
            floor = ceiling;
        }
        shutdown(&cluster).await;
    });
}

pub fn hot_key_contention_test() {
    setup_tracing_subscriber();
    // A long global interval gathers every replica's writes into one epoch.
    let (cluster, seq) = mk_cluster(3, |cfg| cfg.coordinator_global_epoch_interval_ms = 200);
    let sz = 20;

    task::block_on(async move {
        start(&cluster).await;
        let mut queries = Vec::new();
        for i in 0..sz {
            for r in 0..cluster.len() {
                queries.push((r, Query::Kv(vec![set("hot", &format!("{}-{}", r, i))])));
            }
        }
        let outcomes = run_all(&cluster, queries).await;
        assert!(outcomes.iter().all(|o| o.executed()));

        converge(&cluster, &seq).await;
        for r in cluster.iter() {
            let stats = r.stats();
            assert!(stats.conflicted > 0);
            assert!(stats.high_contention_entries > 0);
        }
        let conflicted: Vec<u64> = cluster.iter().map(|r| r.stats().conflicted).collect();
        assert!(conflicted.iter().all(|c| *c == conflicted[0]));
        shutdown(&cluster).await;
    });
}

fn load_district() -> Vec<Query> {
    vec![
        Query::LoadItems { chunk: 0, seed: 1 },
        Query::LoadWarehouse { w: 1, seed: 2 },
        Query::LoadDistrict { w: 1, d: 1, seed: 3 },
        Query::LoadCustomers {
            w: 1,
            d: 1,
            chunk: 0,
            seed: 4,
        },
        Query::LoadStock {
            w: 1,
            chunk: 0,
            seed: 5,
        },
    ]
}

pub fn new_order_convergence_test() {
    setup_tracing_subscriber();
    let (cluster, seq) = mk_cluster(3, |_| ());
    let sz = 8;

    task::block_on(async move {
        start(&cluster).await;
        let loads = load_district().into_iter().map(|q| (0, q)).collect();
        let loaded = run_all(&cluster, loads).await;
        assert!(loaded.iter().all(|o| o.executed()));
        converge(&cluster, &seq).await;

        let mut queries = Vec::new();
        for i in 0..sz {
            for r in 0..cluster.len() {
                let c = (i * 3 + r as i64) % 100 + 1;
                queries.push((
                    r,
                    Query::NewOrder(NewOrderReq {
                        w: 1,
                        d: 1,
                        c,
                        items: vec![
                            OrderItem {
                                i_id: c * 7 % 1000 + 1,
                                supply_w: 1,
                                qty: 3,
                            },
                            OrderItem {
                                i_id: c * 13 % 1000 + 1,
                                supply_w: 1,
                                qty: 1,
                            },
                        ],
                        entry_date: 1_600_000_000 + i,
                    }),
                ));
                queries.push((
                    r,
                    Query::Payment(PaymentReq {
                        w: 1,
                        d: 1,
                        customer: CustomerSelector::ById(c),
                        amount: 10.0,
                        date: 1_600_000_000 + i * 10 + r as i64,
                    }),
                ));
            }
        }
        let outcomes = run_all(&cluster, queries).await;
        assert!(outcomes.iter().all(|o| o.executed()));

        // Every order executed exactly once, locally or by replay, so the
        // district's counter moved once per order from its loaded 3001.
        let store = converge(&cluster, &seq).await;
        match store.get(&Key::District { w: 1, d: 1 }).map(|e| &e.value) {
            Some(Value::District(d)) => {
                assert_eq!(d.next_o_id, 3001 + sz * cluster.len() as i64)
            }
            other => panic!("unexpected district {:?}", other),
        }
        match store.get(&Key::Customer { w: 1, d: 1, c: 1 }).map(|e| &e.value) {
            Some(Value::Customer(c)) => assert!(c.payment_cnt >= 2),
            other => panic!("unexpected customer {:?}", other),
        }
        shutdown(&cluster).await;
    });
}

pub fn coordinator_handoff_test() {
    setup_tracing_subscriber();
    let (cluster, seq) = mk_cluster(3, |_| ());

    task::block_on(async move {
        start(&cluster).await;
        let first = (0..6).map(|i| (i % 3, Query::Kv(vec![set("a", &i.to_string())])));
        run_all(&cluster, first.collect()).await;
        converge(&cluster, &seq).await;
        let before = seq.len();

        cluster[0].set_coordinator(false).await;
        cluster[1].set_coordinator(true).await;
        assert!(!cluster[0].is_coordinator());

        let second = (0..6).map(|i| (i % 3, Query::Kv(vec![set("b", &i.to_string())])));
        let outcomes = run_all(&cluster, second.collect()).await;
        assert!(outcomes.iter().all(|o| o.executed()));
        converge(&cluster, &seq).await;
        assert!(seq.len() > before);
        for (i, v) in cluster[2].applied_vectors().await.iter().enumerate() {
            let decided = seq.next_uncommitted(v.epoch).await;
            assert_eq!(decided.as_ref(), Some(v), "vector {}", i);
        }
        shutdown(&cluster).await;
    });
}

pub fn client_framing_test() {
    setup_tracing_subscriber();
    let (cluster, _seq) = mk_cluster(1, |_| ());

    task::block_on(async move {
        start(&cluster).await;
        let (mut client, server) = duplex_pair();
        let replica = cluster[0].clone();
        task::spawn(async move {
            if let Err(e) = replica.serve_client(server).await {
                warn!("client service exited: {}", e);
            }
        });

        let reqs = vec![
            Query::Kv(vec![set("x", "1")]),
            Query::Kv(vec![get("x"), get("y")]),
            Query::Payment(PaymentReq {
                w: 9,
                d: 9,
                customer: CustomerSelector::ByLastName("BARBARBAR".into()),
                amount: 1.0,
                date: 0,
            }),
        ];
        let mut responses = Vec::new();
        for (seq, query) in reqs.into_iter().enumerate() {
            let frame = encode_frame(&ClientRequest {
                seq: seq as u64,
                query,
            })
            .unwrap();
            write_frame(&mut client, &frame).await.unwrap();
            let body = read_frame(&mut client).await.unwrap().unwrap();
            responses.push(decode::<ClientResponse>(&body).unwrap());
        }
        assert_eq!(responses[0].seq, 0);
        assert!(responses[0].executed);
        assert_eq!(responses[0].result, "OK;");
        assert_eq!(responses[1].result, "OK;DNF;");
        assert_eq!(responses[2].seq, 2);
        assert!(!responses[2].executed);
        shutdown(&cluster).await;
    });
}
