// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Replica configuration, loaded from JSON and validated before a
//! [crate::Replica] is constructed from it.

use crate::{Error, GreedyKind, ReplicaId, SolveMode};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

/// One member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u32,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub is_self: bool,
}

/// What to do when a deterministic re-execution fails with something other
/// than a plan-level abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayFailurePolicy {
    /// Fail the epoch's global commit; the replica stops applying epochs.
    Halt,
    /// Report the transaction as not executed and carry on.
    SkipTransaction,
}

impl Default for ReplayFailurePolicy {
    fn default() -> Self {
        ReplayFailurePolicy::Halt
    }
}

pub const MAX_PORT: u16 = 62535;
pub const MAX_EXACT_VERTEX_LIMIT: usize = 64;

fn default_max_batch_size() -> usize {
    4_000_000
}
fn default_exact_vertex_limit() -> usize {
    48
}
fn default_true() -> bool {
    true
}
fn default_replay_workers() -> usize {
    4
}
fn default_sequential_replay_threshold() -> usize {
    80
}
fn default_background_apply_threshold() -> usize {
    200
}
fn default_occ_max_retries() -> usize {
    64
}
fn default_gc_interval_ms() -> u64 {
    500
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub nodes: Vec<NodeInfo>,

    /// Solve conflict graphs exactly (per connected component, up to
    /// `exact_vertex_limit` vertices) instead of with the greedy heuristic.
    #[serde(default)]
    pub solver_exact: bool,
    #[serde(default = "default_exact_vertex_limit")]
    pub exact_vertex_limit: usize,
    #[serde(default)]
    pub greedy: GreedyKind,

    /// Total order over replicas used by every deterministic replay.
    pub replica_priority: Vec<u32>,

    pub local_epoch_interval_ms: u64,
    pub coordinator_global_epoch_interval_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Whether this replica starts out as the epoch coordinator.
    #[serde(default)]
    pub coordinator: bool,

    /// With OCC disabled every local transaction is only key-collected and
    /// left to deterministic replay.
    #[serde(default = "default_true")]
    pub occ_enabled: bool,
    #[serde(default = "default_occ_max_retries")]
    pub occ_max_retries: usize,

    #[serde(default = "default_replay_workers")]
    pub replay_workers: usize,
    #[serde(default = "default_sequential_replay_threshold")]
    pub sequential_replay_threshold: usize,
    #[serde(default = "default_background_apply_threshold")]
    pub background_apply_threshold: usize,
    #[serde(default)]
    pub replay_failure_policy: ReplayFailurePolicy,

    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

impl Config {
    /// A config for `n` replicas on localhost, with `self_id` marked as self
    /// and replica 0 as coordinator. Mostly useful for tests and demos.
    pub fn local_cluster(n: u32, self_id: u32) -> Self {
        let nodes = (0..n)
            .map(|id| NodeInfo {
                id,
                address: "127.0.0.1".into(),
                port: 7000 + id as u16,
                is_self: id == self_id,
            })
            .collect();
        Config {
            nodes,
            solver_exact: false,
            exact_vertex_limit: default_exact_vertex_limit(),
            greedy: GreedyKind::default(),
            replica_priority: (0..n).collect(),
            local_epoch_interval_ms: 10,
            coordinator_global_epoch_interval_ms: 20,
            max_batch_size: default_max_batch_size(),
            coordinator: self_id == 0,
            occ_enabled: true,
            occ_max_retries: default_occ_max_retries(),
            replay_workers: default_replay_workers(),
            sequential_replay_threshold: default_sequential_replay_threshold(),
            background_apply_threshold: default_background_apply_threshold(),
            replay_failure_policy: ReplayFailurePolicy::default(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, Error> {
        let cfg: Config = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.coordinator_global_epoch_interval_ms < self.local_epoch_interval_ms {
            return Err(Error::Config(
                "coordinator global epoch interval must not be below the local epoch interval"
                    .into(),
            ));
        }
        let selves = self.nodes.iter().filter(|n| n.is_self).count();
        if selves == 0 {
            return Err(Error::Config("no self node".into()));
        }
        if selves > 1 {
            return Err(Error::Config("too many self nodes".into()));
        }
        let mut addrs = HashSet::new();
        for n in self.nodes.iter() {
            if n.port > MAX_PORT {
                return Err(Error::Config(format!("invalid port number {}", n.port)));
            }
            if !addrs.insert((n.address.clone(), n.port)) {
                return Err(Error::Config(format!(
                    "duplicate node {}:{}",
                    n.address, n.port
                )));
            }
        }
        let mut ids: Vec<u32> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        if ids.iter().enumerate().any(|(i, id)| i as u32 != *id) {
            return Err(Error::Config("node ids must be 0..n without gaps".into()));
        }
        let mut prio = self.replica_priority.clone();
        prio.sort_unstable();
        if prio != ids {
            return Err(Error::Config(
                "replica priority must list every node exactly once".into(),
            ));
        }
        if self.exact_vertex_limit == 0 || self.exact_vertex_limit > MAX_EXACT_VERTEX_LIMIT {
            return Err(Error::Config(format!(
                "exact vertex limit must be in 1..={}",
                MAX_EXACT_VERTEX_LIMIT
            )));
        }
        if self.replay_workers == 0 {
            return Err(Error::Config("replay needs at least one worker".into()));
        }
        Ok(())
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn self_id(&self) -> Result<ReplicaId, Error> {
        self.nodes
            .iter()
            .find(|n| n.is_self)
            .map(|n| ReplicaId(n.id))
            .ok_or_else(|| Error::Config("no self node".into()))
    }

    pub fn priority(&self) -> Vec<ReplicaId> {
        self.replica_priority.iter().map(|r| ReplicaId(*r)).collect()
    }

    pub fn solve_mode(&self) -> SolveMode {
        if self.solver_exact {
            SolveMode::Exact
        } else {
            SolveMode::Greedy(self.greedy)
        }
    }

    pub fn local_epoch_interval(&self) -> Duration {
        Duration::from_millis(self.local_epoch_interval_ms)
    }

    pub fn global_epoch_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator_global_epoch_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const THREE_NODES: &str = r#"{
        "nodes": [
            {"id": 0, "address": "10.0.0.1", "port": 5000, "is_self": true},
            {"id": 1, "address": "10.0.0.2", "port": 5000},
            {"id": 2, "address": "10.0.0.3", "port": 5000}
        ],
        "solver_exact": true,
        "replica_priority": [2, 0, 1],
        "local_epoch_interval_ms": 10,
        "coordinator_global_epoch_interval_ms": 40
    }"#;

    #[test]
    fn parses_with_defaults() {
        let cfg = Config::from_json_str(THREE_NODES).unwrap();
        assert_eq!(cfg.replica_count(), 3);
        assert_eq!(cfg.self_id().unwrap(), ReplicaId(0));
        assert_eq!(cfg.max_batch_size, 4_000_000);
        assert_eq!(cfg.sequential_replay_threshold, 80);
        assert_eq!(cfg.replay_failure_policy, ReplayFailurePolicy::Halt);
        assert!(cfg.occ_enabled);
        assert_eq!(cfg.solve_mode(), SolveMode::Exact);
        assert_eq!(
            cfg.priority(),
            vec![ReplicaId(2), ReplicaId(0), ReplicaId(1)]
        );
    }

    #[test]
    fn rejects_bad_clusters() {
        let mut cfg = Config::local_cluster(3, 1);
        assert!(cfg.validate().is_ok());

        cfg.coordinator_global_epoch_interval_ms = 1;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::local_cluster(3, 1);
        cfg.nodes[2].is_self = true;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::local_cluster(3, 1);
        cfg.nodes[2].port = cfg.nodes[0].port;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::local_cluster(3, 1);
        cfg.nodes[2].port = 63000;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::local_cluster(3, 1);
        cfg.replica_priority = vec![0, 1, 1];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
