// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Maximum-weight independent set solving over conflict graphs.
//!
//! The resolver builds a [ConflictGraph] (one vertex per chain, weighted by
//! its record count, one edge per cross-replica conflict) and hands it to an
//! [MwisSolver]. Any backend can sit behind the trait; this module provides
//! [InProcessSolver], which solves small connected components exactly by
//! branch and bound and falls back to one of three classic greedy heuristics
//! (GWMIN, GWMIN2, GWMAX, as in Sakai, Togasaki and Yamazaki 2003) elsewhere.
//!
//! Every replica solves the same graph, so solvers must be deterministic:
//! ties are always broken towards the lowest vertex index.

use crate::{Config, MAX_EXACT_VERTEX_LIMIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GreedyKind {
    /// Pick the vertex maximizing `w(v) / (deg(v) + 1)`.
    Gwmin,
    /// Pick the vertex maximizing `w(v) / w(N[v])`.
    Gwmin2,
    /// Delete the vertex minimizing `w(v) / (deg(v) * (deg(v) + 1))` until
    /// no edges remain.
    Gwmax,
}

impl Default for GreedyKind {
    fn default() -> Self {
        GreedyKind::Gwmin2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveMode {
    Exact,
    Greedy(GreedyKind),
}

/// An undirected vertex-weighted graph. Duplicate edges and self-loops are
/// ignored.
#[derive(Clone, Debug, Default)]
pub struct ConflictGraph {
    weights: Vec<u64>,
    adj: Vec<BTreeSet<usize>>,
}

impl ConflictGraph {
    pub fn new() -> Self {
        ConflictGraph::default()
    }

    /// Adds `n` vertices of weight 1, returning the index of the first.
    pub fn add_vertices(&mut self, n: usize) -> usize {
        let first = self.weights.len();
        self.weights.resize(first + n, 1);
        self.adj.resize_with(first + n, BTreeSet::new);
        first
    }

    pub fn set_weight(&mut self, v: usize, w: u64) {
        self.weights[v] = w;
    }

    pub fn add_edge(&mut self, u: usize, v: usize) {
        if u != v {
            self.adj[u].insert(v);
            self.adj[v].insert(u);
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.weights.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adj.iter().map(|a| a.len()).sum::<usize>() / 2
    }

    pub fn weight(&self, v: usize) -> u64 {
        self.weights[v]
    }

    pub fn neighbors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.adj[v].iter().cloned()
    }

    pub fn has_edge(&self, u: usize, v: usize) -> bool {
        self.adj[u].contains(&v)
    }

    pub fn is_independent(&self, vs: &[usize]) -> bool {
        let set: BTreeSet<usize> = vs.iter().cloned().collect();
        set.len() == vs.len()
            && vs.iter().all(|v| *v < self.vertex_count())
            && vs
                .iter()
                .all(|v| self.adj[*v].iter().all(|u| !set.contains(u)))
    }

    pub fn total_weight(&self, vs: &[usize]) -> u64 {
        vs.iter().map(|v| self.weights[*v]).sum()
    }

    // Connected components of the non-isolated vertices, each sorted, in
    // order of their smallest vertex.
    fn components(&self) -> Vec<Vec<usize>> {
        let n = self.vertex_count();
        let mut seen = vec![false; n];
        let mut out = Vec::new();
        for start in 0..n {
            if seen[start] || self.adj[start].is_empty() {
                continue;
            }
            let mut comp = Vec::new();
            let mut stack = vec![start];
            seen[start] = true;
            while let Some(v) = stack.pop() {
                comp.push(v);
                for u in self.adj[v].iter() {
                    if !seen[*u] {
                        seen[*u] = true;
                        stack.push(*u);
                    }
                }
            }
            comp.sort_unstable();
            out.push(comp);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution {
    pub feasible: bool,
    pub vertices: Vec<usize>,
}

/// A pluggable MWIS backend. External (for example MILP-based) solvers can
/// implement this; the resolver treats any solution that is infeasible or
/// not independent as a hard error.
pub trait MwisSolver: Send + Sync + 'static {
    fn solve(&self, graph: &ConflictGraph, mode: SolveMode) -> Solution;
}

/// Exact for components up to `exact_vertex_limit` vertices when asked to be,
/// greedy otherwise.
pub struct InProcessSolver {
    pub exact_vertex_limit: usize,
    pub fallback: GreedyKind,
}

impl Default for InProcessSolver {
    fn default() -> Self {
        InProcessSolver {
            exact_vertex_limit: 48,
            fallback: GreedyKind::Gwmin2,
        }
    }
}

impl InProcessSolver {
    /// The solver a [crate::Replica] uses unless it is given another.
    pub fn from_config(config: &Config) -> Self {
        InProcessSolver {
            exact_vertex_limit: config.exact_vertex_limit,
            fallback: config.greedy,
        }
    }
}

impl MwisSolver for InProcessSolver {
    fn solve(&self, graph: &ConflictGraph, mode: SolveMode) -> Solution {
        let n = graph.vertex_count();
        let mut chosen: Vec<usize> = (0..n).filter(|v| graph.adj[*v].is_empty()).collect();
        let limit = std::cmp::min(self.exact_vertex_limit, MAX_EXACT_VERTEX_LIMIT);
        for comp in graph.components() {
            let picked = match mode {
                SolveMode::Exact if comp.len() <= limit => exact(graph, &comp),
                SolveMode::Exact => {
                    warn!(
                        "conflict component of {} vertices exceeds exact limit {}, using {:?}",
                        comp.len(),
                        limit,
                        self.fallback
                    );
                    greedy(graph, &comp, self.fallback)
                }
                SolveMode::Greedy(kind) => greedy(graph, &comp, kind),
            };
            chosen.extend(picked);
        }
        chosen.sort_unstable();
        trace!(
            "solved graph of {} vertices, {} edges: kept {} vertices",
            n,
            graph.edge_count(),
            chosen.len()
        );
        Solution {
            feasible: true,
            vertices: chosen,
        }
    }
}

// Branch and bound over one component, represented as bitmasks over the
// component's local indices.
fn exact(graph: &ConflictGraph, comp: &[usize]) -> Vec<usize> {
    let local = |v: usize| comp.binary_search(&v).ok();
    let weights: Vec<u64> = comp.iter().map(|v| graph.weight(*v)).collect();
    let nbrs: Vec<u64> = comp
        .iter()
        .map(|v| {
            graph
                .neighbors(*v)
                .filter_map(local)
                .fold(0u64, |m, i| m | (1u64 << i))
        })
        .collect();
    let all = if comp.len() == 64 {
        u64::MAX
    } else {
        (1u64 << comp.len()) - 1
    };
    let mut best = (0u64, 0u64);
    branch(all, 0, 0, &weights, &nbrs, &mut best);
    (0..comp.len())
        .filter(|i| best.1 & (1u64 << i) != 0)
        .map(|i| comp[i])
        .collect()
}

fn mask_weight(mut m: u64, weights: &[u64]) -> u64 {
    let mut w = 0;
    while m != 0 {
        let i = m.trailing_zeros() as usize;
        w += weights[i];
        m &= m - 1;
    }
    w
}

fn branch(cand: u64, cur_w: u64, cur: u64, weights: &[u64], nbrs: &[u64], best: &mut (u64, u64)) {
    if cand == 0 {
        if cur_w > best.0 {
            *best = (cur_w, cur);
        }
        return;
    }
    if cur_w + mask_weight(cand, weights) <= best.0 {
        return;
    }
    // Branch on the candidate with the most candidate neighbours.
    let mut v = cand.trailing_zeros() as usize;
    let mut deg = (nbrs[v] & cand).count_ones();
    let mut m = cand & (cand - 1);
    while m != 0 {
        let i = m.trailing_zeros() as usize;
        let d = (nbrs[i] & cand).count_ones();
        if d > deg {
            v = i;
            deg = d;
        }
        m &= m - 1;
    }
    if deg == 0 {
        let w = cur_w + mask_weight(cand, weights);
        if w > best.0 {
            *best = (w, cur | cand);
        }
        return;
    }
    let bit = 1u64 << v;
    branch(
        cand & !bit & !nbrs[v],
        cur_w + weights[v],
        cur | bit,
        weights,
        nbrs,
        best,
    );
    branch(cand & !bit, cur_w, cur, weights, nbrs, best);
}

// Compare a/b > c/d without floats; all terms are small enough for u128.
fn ratio_gt(a: u64, b: u64, c: u64, d: u64) -> bool {
    (a as u128) * (d as u128) > (c as u128) * (b as u128)
}

fn greedy(graph: &ConflictGraph, comp: &[usize], kind: GreedyKind) -> Vec<usize> {
    let n = graph.vertex_count();
    let mut alive = vec![false; n];
    for v in comp {
        alive[*v] = true;
    }
    let mut deg: Vec<u64> = vec![0; n];
    let mut nsum: Vec<u64> = vec![0; n];
    for v in comp {
        deg[*v] = graph.neighbors(*v).count() as u64;
        nsum[*v] = graph.weight(*v) + graph.neighbors(*v).map(|u| graph.weight(u)).sum::<u64>();
    }
    let remove = |v: usize, alive: &mut Vec<bool>, deg: &mut Vec<u64>, nsum: &mut Vec<u64>| {
        alive[v] = false;
        for u in graph.neighbors(v) {
            if alive[u] {
                deg[u] -= 1;
                nsum[u] -= graph.weight(v);
            }
        }
    };
    match kind {
        GreedyKind::Gwmin | GreedyKind::Gwmin2 => {
            let mut out = Vec::new();
            loop {
                let mut pick: Option<usize> = None;
                for v in comp.iter().cloned().filter(|v| alive[*v]) {
                    let better = match pick {
                        None => true,
                        Some(p) => match kind {
                            GreedyKind::Gwmin => {
                                ratio_gt(graph.weight(v), deg[v] + 1, graph.weight(p), deg[p] + 1)
                            }
                            _ => ratio_gt(graph.weight(v), nsum[v], graph.weight(p), nsum[p]),
                        },
                    };
                    if better {
                        pick = Some(v);
                    }
                }
                let v = match pick {
                    None => break,
                    Some(v) => v,
                };
                out.push(v);
                let nbrs: Vec<usize> = graph.neighbors(v).filter(|u| alive[*u]).collect();
                remove(v, &mut alive, &mut deg, &mut nsum);
                for u in nbrs {
                    remove(u, &mut alive, &mut deg, &mut nsum);
                }
            }
            out.sort_unstable();
            out
        }
        GreedyKind::Gwmax => {
            loop {
                let mut pick: Option<usize> = None;
                for v in comp.iter().cloned().filter(|v| alive[*v] && deg[*v] > 0) {
                    // Smallest w / (d (d + 1)) is deleted first.
                    let better = match pick {
                        None => true,
                        Some(p) => ratio_gt(
                            graph.weight(p),
                            deg[p] * (deg[p] + 1),
                            graph.weight(v),
                            deg[v] * (deg[v] + 1),
                        ),
                    };
                    if better {
                        pick = Some(v);
                    }
                }
                match pick {
                    None => break,
                    Some(v) => remove(v, &mut alive, &mut deg, &mut nsum),
                }
            }
            let mut out: Vec<usize> = comp.iter().cloned().filter(|v| alive[*v]).collect();
            // Re-admit deleted vertices that ended up with no kept neighbour.
            for v in comp.iter().cloned() {
                if !alive[v] && graph.neighbors(v).all(|u| !alive[u]) {
                    alive[v] = true;
                    out.push(v);
                }
            }
            out.sort_unstable();
            out
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn graph(weights: &[u64], edges: &[(usize, usize)]) -> ConflictGraph {
        let mut g = ConflictGraph::new();
        g.add_vertices(weights.len());
        for (v, w) in weights.iter().enumerate() {
            g.set_weight(v, *w);
        }
        for (u, v) in edges {
            g.add_edge(*u, *v);
        }
        g
    }

    #[test]
    fn star_prefers_heavy_centre_only_when_worth_it() {
        // Centre weight 10 against leaves of total 3.
        let g = graph(&[10, 1, 1, 1], &[(0, 1), (0, 2), (0, 3)]);
        let s = InProcessSolver::default();
        let sol = s.solve(&g, SolveMode::Exact);
        assert_eq!(sol.vertices, vec![0]);

        // Centre weight 2 against leaves of total 3.
        let g = graph(&[2, 1, 1, 1], &[(0, 1), (0, 2), (0, 3)]);
        let sol = s.solve(&g, SolveMode::Exact);
        assert_eq!(sol.vertices, vec![1, 2, 3]);
        for kind in [GreedyKind::Gwmin, GreedyKind::Gwmin2, GreedyKind::Gwmax].iter() {
            let sol = s.solve(&g, SolveMode::Greedy(*kind));
            assert!(g.is_independent(&sol.vertices));
        }
    }

    #[test]
    fn isolated_vertices_are_always_kept() {
        let g = graph(&[1, 5, 1, 7], &[(0, 1)]);
        let s = InProcessSolver::default();
        let sol = s.solve(&g, SolveMode::Greedy(GreedyKind::Gwmin));
        assert_eq!(sol.vertices, vec![1, 2, 3]);
    }

    #[test]
    fn exact_beats_or_matches_greedy_on_a_path() {
        // Path 0-1-2-3-4 with weights favouring the odd vertices.
        let g = graph(&[1, 4, 1, 4, 1], &[(0, 1), (1, 2), (2, 3), (3, 4)]);
        let s = InProcessSolver::default();
        let exact = s.solve(&g, SolveMode::Exact);
        assert_eq!(exact.vertices, vec![1, 3]);
        let greedy = s.solve(&g, SolveMode::Greedy(GreedyKind::Gwmin2));
        assert!(g.total_weight(&greedy.vertices) <= g.total_weight(&exact.vertices));
    }

    #[test]
    fn configured_limit_forces_greedy_fallback() {
        // Exact keeps the three leaves; GWMIN2 takes the centre.
        let g = graph(&[2, 1, 1, 1], &[(0, 1), (0, 2), (0, 3)]);
        let mut cfg = Config::local_cluster(1, 0);
        cfg.solver_exact = true;
        let s = InProcessSolver::from_config(&cfg);
        assert_eq!(s.solve(&g, cfg.solve_mode()).vertices, vec![1, 2, 3]);

        cfg.exact_vertex_limit = 3;
        cfg.greedy = GreedyKind::Gwmin2;
        let s = InProcessSolver::from_config(&cfg);
        assert_eq!(s.solve(&g, cfg.solve_mode()).vertices, vec![0]);
    }

    fn arb_graph() -> impl Strategy<Value = (Vec<u64>, Vec<(usize, usize)>)> {
        (1usize..24).prop_flat_map(|n| {
            (
                proptest::collection::vec(1u64..20, n),
                proptest::collection::vec((0..n, 0..n), 0..(n * 3)),
            )
        })
    }

    proptest! {
        #[test]
        fn every_mode_returns_an_independent_set((weights, edges) in arb_graph()) {
            let g = graph(&weights, &edges);
            let s = InProcessSolver { exact_vertex_limit: 24, fallback: GreedyKind::Gwmin };
            let exact = s.solve(&g, SolveMode::Exact);
            prop_assert!(exact.feasible);
            prop_assert!(g.is_independent(&exact.vertices));
            for kind in [GreedyKind::Gwmin, GreedyKind::Gwmin2, GreedyKind::Gwmax].iter() {
                let sol = s.solve(&g, SolveMode::Greedy(*kind));
                prop_assert!(g.is_independent(&sol.vertices));
                prop_assert!(g.total_weight(&sol.vertices) <= g.total_weight(&exact.vertices));
                // Deterministic: solving twice gives the same answer.
                prop_assert_eq!(sol, s.solve(&g, SolveMode::Greedy(*kind)));
            }
        }
    }
}
