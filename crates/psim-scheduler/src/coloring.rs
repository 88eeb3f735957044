//! Bipartite multigraph edge coloring: assigns each flow-instance edge a
//! spine index such that no two edges sharing a source or destination rack
//! get the same color, using as few colors as possible.
//!
//! Ported from `original_source/src/scheduler/scheduler.cc`'s `DisjointSet`,
//! `ComputeMaxDegree`, `HopcroftKarp`, and `ColorBipartiteMultigraph(Helper)`.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Union-find over `0..n`, used by the routing pass to merge racks whose
/// active ranges overlap (`MergeOverlappingRangesV7`).
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        DisjointSet { parent: (0..n).collect(), rank: vec![0; n] }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra;
        } else {
            self.parent[rb] = ra;
            self.rank[ra] += 1;
        }
    }
}

/// One undirected edge of the bipartite multigraph: a flow that must be
/// routed from a source-side node to a destination-side node.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub left: usize,
    pub right: usize,
}

/// The maximum number of parallel edges incident to any single left or
/// right node -- a lower bound on the number of colors any valid coloring
/// needs (`ComputeMaxDegree`).
pub fn compute_max_degree(edges: &[Edge], left_count: usize, right_count: usize) -> usize {
    let mut left_deg = vec![0usize; left_count];
    let mut right_deg = vec![0usize; right_count];
    for e in edges {
        left_deg[e.left] += 1;
        right_deg[e.right] += 1;
    }
    left_deg.into_iter().chain(right_deg).max().unwrap_or(0)
}

/// Hopcroft-Karp maximum bipartite matching restricted to the edge
/// indices in `candidates`. Returns the matched edge indices.
fn hopcroft_karp(edges: &[Edge], candidates: &[usize], left_count: usize, right_count: usize) -> Vec<usize> {
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); left_count];
    for &idx in candidates {
        adj[edges[idx].left].push(idx);
    }

    let mut match_left: Vec<Option<usize>> = vec![None; left_count];
    let mut match_right: Vec<Option<usize>> = vec![None; right_count];

    loop {
        let mut dist = vec![usize::MAX; left_count];
        let mut queue = VecDeque::new();
        for u in 0..left_count {
            if match_left[u].is_none() {
                dist[u] = 0;
                queue.push_back(u);
            }
        }
        let mut found = false;
        while let Some(u) = queue.pop_front() {
            for &edge_idx in &adj[u] {
                let v = edges[edge_idx].right;
                match match_right[v] {
                    None => found = true,
                    Some(edge_idx2) => {
                        let u2 = edges[edge_idx2].left;
                        if dist[u2] == usize::MAX {
                            dist[u2] = dist[u] + 1;
                            queue.push_back(u2);
                        }
                    }
                }
            }
        }
        if !found {
            break;
        }

        fn try_augment(
            u: usize,
            adj: &[Vec<usize>],
            edges: &[Edge],
            dist: &mut [usize],
            match_right: &mut [Option<usize>],
            match_left: &mut [Option<usize>],
        ) -> bool {
            for &edge_idx in &adj[u] {
                let v = edges[edge_idx].right;
                let ok = match match_right[v] {
                    None => true,
                    Some(edge_idx2) => {
                        let u2 = edges[edge_idx2].left;
                        dist[u2] == dist[u] + 1 && try_augment(u2, adj, edges, dist, match_right, match_left)
                    }
                };
                if ok {
                    match_right[v] = Some(edge_idx);
                    match_left[u] = Some(edge_idx);
                    return true;
                }
            }
            dist[u] = usize::MAX;
            false
        }

        for u in 0..left_count {
            if match_left[u].is_none() {
                try_augment(u, &adj, edges, &mut dist, &mut match_right, &mut match_left);
            }
        }
    }

    match_left.into_iter().flatten().collect()
}

/// Colors every edge with an index in `0..color_count`, such that edges
/// sharing the same color form a matching (no shared endpoint). Returns
/// `None` if `color_count` colors are not enough (`ColorBipartiteMultigraphHelper`).
pub fn color_bipartite_multigraph_helper(
    edges: &[Edge],
    left_count: usize,
    right_count: usize,
    color_count: usize,
    rng: &mut StdRng,
) -> Option<Vec<usize>> {
    let mut colors = vec![usize::MAX; edges.len()];
    let mut remaining: Vec<usize> = (0..edges.len()).collect();

    for color in 0..color_count {
        if remaining.is_empty() {
            break;
        }
        remaining.shuffle(rng);
        let matched = hopcroft_karp(edges, &remaining, left_count, right_count);
        if matched.is_empty() {
            continue;
        }
        for &idx in &matched {
            colors[idx] = color;
        }
        let matched_set: std::collections::HashSet<usize> = matched.into_iter().collect();
        remaining.retain(|idx| !matched_set.contains(idx));
    }

    if remaining.is_empty() {
        Some(colors)
    } else {
        None
    }
}

/// Colors the multigraph with the fewest colors found by doubling from
/// `compute_max_degree` up to `max_colors` (`ColorBipartiteMultigraph`).
pub fn color_bipartite_multigraph(
    edges: &[Edge],
    left_count: usize,
    right_count: usize,
    max_colors: usize,
    seed: u64,
) -> Result<Vec<usize>, String> {
    if edges.is_empty() {
        return Ok(Vec::new());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let min_colors = compute_max_degree(edges, left_count, right_count).max(1);
    for color_count in min_colors..=max_colors {
        if let Some(colors) = color_bipartite_multigraph_helper(edges, left_count, right_count, color_count, &mut rng) {
            return Ok(colors);
        }
    }
    Err(format!(
        "could not color {} edges with up to {} colors (min degree {})",
        edges.len(),
        max_colors,
        min_colors
    ))
}

/// Groups rack identifiers (arbitrary `i64`s) into dense `0..n` indices for
/// the matching routines above, returning the mapping both ways.
pub fn index_racks(racks: impl Iterator<Item = i64>) -> (HashMap<i64, usize>, Vec<i64>) {
    let mut to_index = HashMap::new();
    let mut to_rack = Vec::new();
    for rack in racks {
        to_index.entry(rack).or_insert_with(|| {
            to_rack.push(rack);
            to_rack.len() - 1
        });
    }
    (to_index, to_rack)
}
