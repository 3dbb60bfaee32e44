//! Topology - The coupling graph of a session
//!
//! Every generator here is a pure function of its parameters and yields an
//! undirected [`Adjacency`]: an edge `i-j` is always visible from both ends
//! and no node is ever its own neighbor.

use std::collections::BTreeMap;

use modal_core::{ModalError, ModalResult, NodeId, MAX_NODES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Weight of an ordinary coupling edge
pub const UNIT_WEIGHT: f32 = 1.0;

/// Undirected weighted graph over node indices `0..n`
#[derive(Debug, Clone, PartialEq)]
pub struct Adjacency {
    node_count: usize,
    /// index -> (neighbor index -> edge weight); both directions stored
    edges: BTreeMap<usize, BTreeMap<usize, f32>>,
}

impl Adjacency {
    /// Create an edgeless graph
    pub fn new(node_count: usize) -> ModalResult<Self> {
        if node_count > MAX_NODES {
            return Err(ModalError::TooManyNodes {
                count: node_count,
                max: MAX_NODES,
            });
        }
        Ok(Self {
            node_count,
            edges: BTreeMap::new(),
        })
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Add (or reweight) the undirected edge `a-b`
    pub fn add_edge(&mut self, a: usize, b: usize, weight: f32) -> ModalResult<()> {
        if a == b {
            return Err(ModalError::InvalidConfig(format!(
                "self-loop on node {a}"
            )));
        }
        if a >= self.node_count || b >= self.node_count {
            return Err(ModalError::InvalidConfig(format!(
                "edge {a}-{b} outside 0..{}",
                self.node_count
            )));
        }
        self.edges.entry(a).or_default().insert(b, weight);
        self.edges.entry(b).or_default().insert(a, weight);
        Ok(())
    }

    pub fn has_edge(&self, a: usize, b: usize) -> bool {
        self.weight(a, b).is_some()
    }

    pub fn weight(&self, a: usize, b: usize) -> Option<f32> {
        self.edges.get(&a).and_then(|n| n.get(&b)).copied()
    }

    /// Neighbor indices of `i`, ascending
    pub fn neighbors(&self, i: usize) -> Vec<usize> {
        self.edges
            .get(&i)
            .map(|n| n.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn degree(&self, i: usize) -> usize {
        self.edges.get(&i).map_or(0, BTreeMap::len)
    }

    /// Smallest weight among the edges touching `i`
    pub fn min_incident_weight(&self, i: usize) -> Option<f32> {
        self.edges
            .get(&i)?
            .values()
            .copied()
            .reduce(f32::min)
    }

    /// Each undirected edge once, as `(low, high, weight)`
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.edges.iter().flat_map(|(&a, n)| {
            n.iter()
                .filter(move |&(&b, _)| a < b)
                .map(move |(&b, &w)| (a, b, w))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    /// True when every edge is present in both directions with equal weight
    pub fn is_symmetric(&self) -> bool {
        self.edges.iter().all(|(&a, n)| {
            n.iter()
                .all(|(&b, &w)| a != b && self.weight(b, a) == Some(w))
        })
    }

    /// Neighbor ids of `i` under an index -> id mapping
    pub fn neighbor_ids(&self, i: usize, ids: &[NodeId]) -> Vec<NodeId> {
        self.neighbors(i)
            .into_iter()
            .filter_map(|j| ids.get(j).copied())
            .collect()
    }
}

/// Ring: `i` couples to `(i-1) mod n` and `(i+1) mod n`
pub fn ring(n: usize) -> ModalResult<Adjacency> {
    let mut adj = Adjacency::new(n)?;
    if n >= 2 {
        for i in 0..n {
            adj.add_edge(i, (i + 1) % n, UNIT_WEIGHT)?;
        }
    }
    Ok(adj)
}

/// Ring plus one long-range chord `(i + n/2) mod n` per node
pub fn small_world(n: usize) -> ModalResult<Adjacency> {
    let mut adj = ring(n)?;
    let half = n / 2;
    if half > 0 {
        for i in 0..n {
            let j = (i + half) % n;
            if j != i {
                adj.add_edge(i, j, UNIT_WEIGHT)?;
            }
        }
    }
    Ok(adj)
}

/// `clusters` equal rings, chained by one bridge edge between neighbors
///
/// Node `bridge_offset` of cluster `c` links to node `bridge_offset` of
/// cluster `c + 1`; only that edge carries `bridge_weight`. Leftover nodes
/// when `n` is not a multiple of `clusters` join the last cluster.
pub fn clustered(
    n: usize,
    clusters: usize,
    bridge_offset: usize,
    bridge_weight: f32,
) -> ModalResult<Adjacency> {
    let mut adj = Adjacency::new(n)?;
    if n == 0 {
        return Ok(adj);
    }
    let clusters = clusters.clamp(1, n);
    let size = n / clusters;

    let bounds = |c: usize| {
        let start = c * size;
        let end = if c + 1 == clusters { n } else { start + size };
        (start, end)
    };

    for c in 0..clusters {
        let (start, end) = bounds(c);
        let len = end - start;
        if len >= 2 {
            for k in 0..len {
                adj.add_edge(start + k, start + (k + 1) % len, UNIT_WEIGHT)?;
            }
        }
    }

    let offset = bridge_offset.min(size.saturating_sub(1));
    for c in 0..clusters.saturating_sub(1) {
        let (a, _) = bounds(c);
        let (b, _) = bounds(c + 1);
        adj.add_edge(a + offset, b + offset, bridge_weight)?;
    }
    Ok(adj)
}

/// Star centred on `hub`: the hub couples to all, spokes only to the hub
pub fn hub_spoke(n: usize, hub: usize) -> ModalResult<Adjacency> {
    let mut adj = Adjacency::new(n)?;
    if n > 0 && hub >= n {
        return Err(ModalError::InvalidConfig(format!(
            "hub index {hub} outside 0..{n}"
        )));
    }
    for i in (0..n).filter(|&i| i != hub) {
        adj.add_edge(hub, i, UNIT_WEIGHT)?;
    }
    Ok(adj)
}

/// Erdős–Rényi graph: each pair coupled with probability `p`
pub fn random(n: usize, p: f32, seed: u64) -> ModalResult<Adjacency> {
    let mut adj = Adjacency::new(n)?;
    let p = p.clamp(0.0, 1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..n {
        for j in (i + 1)..n {
            if rng.gen::<f32>() < p {
                adj.add_edge(i, j, UNIT_WEIGHT)?;
            }
        }
    }
    Ok(adj)
}

/// Every pair coupled
pub fn complete(n: usize) -> ModalResult<Adjacency> {
    let mut adj = Adjacency::new(n)?;
    for i in 0..n {
        for j in (i + 1)..n {
            adj.add_edge(i, j, UNIT_WEIGHT)?;
        }
    }
    Ok(adj)
}
