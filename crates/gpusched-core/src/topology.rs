//! Node-local interconnect topology model
//!
//! A node's topology is an undirected weighted graph over device ids,
//! stored as a flat arena (ids plus index-based adjacency) rather than an
//! owning pointer graph. Contiguity decisions work on high-bandwidth
//! components: maximal connected subgraphs using only edges whose weight
//! meets the configured threshold.

use std::collections::{BTreeSet, HashMap};

use crate::device::{Device, TopologyEdge};

/// Undirected weighted graph over device ids
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl TopologyGraph {
    /// Build a graph over the given devices
    ///
    /// Edges referencing unknown devices and self-loops are dropped;
    /// weights are clamped to [0, 1]. Duplicate edges keep the last weight.
    pub fn from_status(devices: &[Device], edges: &[TopologyEdge]) -> Self {
        let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        Self::from_parts(ids, edges)
    }

    fn from_parts(ids: Vec<String>, edges: &[TopologyEdge]) -> Self {
        let index: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let mut adjacency = vec![Vec::new(); ids.len()];

        for edge in edges {
            let (Some(&a), Some(&b)) = (index.get(&edge.a), index.get(&edge.b)) else {
                continue;
            };
            if a == b {
                continue;
            }
            let weight = edge.weight.clamp(0.0, 1.0);
            upsert(&mut adjacency[a], b, weight);
            upsert(&mut adjacency[b], a, weight);
        }

        Self {
            ids,
            index,
            adjacency,
        }
    }

    /// Device ids in the graph, in insertion order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the graph contains the given device
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Edge weight between two devices, if any
    pub fn weight(&self, a: &str, b: &str) -> Option<f64> {
        let (&ia, &ib) = (self.index.get(a)?, self.index.get(b)?);
        self.adjacency[ia]
            .iter()
            .find(|(peer, _)| *peer == ib)
            .map(|(_, w)| *w)
    }

    /// The subgraph induced by `keep`
    pub fn restrict(&self, keep: &BTreeSet<String>) -> TopologyGraph {
        let ids: Vec<String> = self.ids.iter().filter(|id| keep.contains(*id)).cloned().collect();
        let edges: Vec<TopologyEdge> = self
            .edge_list()
            .into_iter()
            .filter(|e| keep.contains(&e.a) && keep.contains(&e.b))
            .collect();
        Self::from_parts(ids, &edges)
    }

    /// High-bandwidth components: maximal connected subgraphs using only
    /// edges with weight >= `threshold`
    ///
    /// Each component is sorted lexicographically; components are ordered
    /// by their first member, so the result is deterministic.
    pub fn components(&self, threshold: f64) -> Vec<Vec<String>> {
        let mut visited = vec![false; self.ids.len()];
        let mut components = Vec::new();

        for start in 0..self.ids.len() {
            if visited[start] {
                continue;
            }
            let mut member_ids = Vec::new();
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(node) = stack.pop() {
                member_ids.push(self.ids[node].clone());
                for &(peer, weight) in &self.adjacency[node] {
                    if !visited[peer] && weight >= threshold {
                        visited[peer] = true;
                        stack.push(peer);
                    }
                }
            }
            member_ids.sort();
            components.push(member_ids);
        }

        components.sort_by(|a, b| a[0].cmp(&b[0]));
        components
    }

    /// Minimum edge weight over all pairs in `set`; absent edges count as
    /// 0.0, a set with fewer than two members scores 1.0
    pub fn min_pair_weight(&self, set: &[String]) -> f64 {
        self.fold_pair_weights(set, f64::INFINITY, f64::min)
            .unwrap_or(1.0)
    }

    /// Mean edge weight over all pairs in `set`; absent edges count as
    /// 0.0, a set with fewer than two members scores 1.0
    pub fn mean_pair_weight(&self, set: &[String]) -> f64 {
        let pairs = set.len() * set.len().saturating_sub(1) / 2;
        if pairs == 0 {
            return 1.0;
        }
        let total = self
            .fold_pair_weights(set, 0.0, |acc, w| acc + w)
            .unwrap_or(0.0);
        total / pairs as f64
    }

    fn fold_pair_weights(&self, set: &[String], init: f64, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
        if set.len() < 2 {
            return None;
        }
        let mut acc = init;
        for (i, a) in set.iter().enumerate() {
            for b in &set[i + 1..] {
                acc = f(acc, self.weight(a, b).unwrap_or(0.0));
            }
        }
        Some(acc)
    }

    /// All edges, each reported once
    fn edge_list(&self) -> Vec<TopologyEdge> {
        let mut edges = Vec::new();
        for (a, peers) in self.adjacency.iter().enumerate() {
            for &(b, weight) in peers {
                if a < b {
                    edges.push(TopologyEdge {
                        a: self.ids[a].clone(),
                        b: self.ids[b].clone(),
                        weight,
                    });
                }
            }
        }
        edges
    }
}

fn upsert(peers: &mut Vec<(usize, f64)>, peer: usize, weight: f64) {
    match peers.iter_mut().find(|(p, _)| *p == peer) {
        Some(entry) => entry.1 = weight,
        None => peers.push((peer, weight)),
    }
}
