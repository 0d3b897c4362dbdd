//! In-memory HNSW graph over pack vectors.
//!
//! Used by the vector lane when `hnsw_enabled` is set; otherwise the pack's
//! exact cosine scan answers. Layer assignment is derived from a hash of the
//! chunk id, which keeps builds deterministic for a given insertion order.

use crate::vecpack::{cosine, l2_norm};
use sha2::{Digest, Sha256};
use std::collections::{BinaryHeap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams { m: 16, ef_construction: 200, ef_search: 64 }
    }
}

struct Node {
    id: String,
    vector: Vec<f32>,
    norm: f32,
    /// Neighbor lists, one per layer (index 0 = base layer).
    neighbors: Vec<Vec<usize>>,
}

pub struct HnswIndex {
    params: HnswParams,
    nodes: Vec<Node>,
    entry: Option<usize>,
    level_mult: f64,
}

/// Candidate ordered by distance (min-heap via Reverse on push sites).
#[derive(PartialEq)]
struct Candidate {
    dist: f32,
    idx: usize,
}

impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl HnswIndex {
    pub fn new(params: HnswParams) -> HnswIndex {
        let m = params.m.max(2);
        HnswIndex {
            params: HnswParams { m, ..params },
            nodes: Vec::new(),
            entry: None,
            level_mult: 1.0 / (m as f64).ln(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn distance(&self, query: &[f32], query_norm: f32, idx: usize) -> f32 {
        let node = &self.nodes[idx];
        if query_norm == 0.0 || node.norm == 0.0 {
            return 1.0;
        }
        let dot: f32 = query.iter().zip(node.vector.iter()).map(|(a, b)| a * b).sum();
        1.0 - dot / (query_norm * node.norm)
    }

    /// Deterministic layer draw from the id hash.
    fn level_for(&self, id: &str) -> usize {
        let digest = Sha256::digest(id.as_bytes());
        let mut raw = 0u64;
        for byte in &digest[..8] {
            raw = (raw << 8) | *byte as u64;
        }
        let unit = (raw as f64 + 1.0) / (u64::MAX as f64 + 2.0);
        ((-unit.ln()) * self.level_mult).floor() as usize
    }

    pub fn insert(&mut self, id: &str, vector: Vec<f32>) {
        let level = self.level_for(id);
        let norm = l2_norm(&vector);
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.to_string(),
            norm,
            vector,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(mut current) = self.entry else {
            self.entry = Some(idx);
            return;
        };

        let query = self.nodes[idx].vector.clone();
        let query_norm = self.nodes[idx].norm;
        let top = self.nodes[current].neighbors.len() - 1;

        // Greedy descent through layers above the new node's level.
        for layer in (level + 1..=top).rev() {
            current = self.greedy_step(&query, query_norm, current, layer);
        }

        // Beam search + connect on the shared layers.
        let mut entry_points = vec![current];
        for layer in (0..=level.min(top)).rev() {
            let found =
                self.search_layer(&query, query_norm, &entry_points, self.params.ef_construction, layer);
            let max_links = if layer == 0 { self.params.m * 2 } else { self.params.m };
            let chosen: Vec<usize> =
                found.iter().take(max_links).map(|c| c.idx).collect();
            for &neighbor in &chosen {
                self.nodes[idx].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(idx);
                // Trim over-connected neighbors to their cap, dropping the
                // farthest link.
                if self.nodes[neighbor].neighbors[layer].len() > max_links {
                    let nvec = self.nodes[neighbor].vector.clone();
                    let nnorm = self.nodes[neighbor].norm;
                    let mut links = self.nodes[neighbor].neighbors[layer].clone();
                    links.sort_by(|a, b| {
                        self.distance(&nvec, nnorm, *a)
                            .partial_cmp(&self.distance(&nvec, nnorm, *b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    links.truncate(max_links);
                    self.nodes[neighbor].neighbors[layer] = links;
                }
            }
            entry_points = found.iter().map(|c| c.idx).collect();
            if entry_points.is_empty() {
                entry_points = vec![current];
            }
        }

        // A node drawn above the current top becomes the new entry point.
        if level > top {
            self.entry = Some(idx);
        }
    }

    fn greedy_step(&self, query: &[f32], query_norm: f32, start: usize, layer: usize) -> usize {
        let mut current = start;
        let mut current_dist = self.distance(query, query_norm, current);
        loop {
            let mut improved = false;
            if layer < self.nodes[current].neighbors.len() {
                for &neighbor in &self.nodes[current].neighbors[layer] {
                    let d = self.distance(query, query_norm, neighbor);
                    if d < current_dist {
                        current = neighbor;
                        current_dist = d;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Classic ef-bounded beam search within one layer, results sorted by
    /// ascending distance.
    fn search_layer(
        &self,
        query: &[f32],
        query_norm: f32,
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = entry_points.iter().copied().collect();
        let mut candidates: BinaryHeap<std::cmp::Reverse<Candidate>> = entry_points
            .iter()
            .map(|&idx| std::cmp::Reverse(Candidate { dist: self.distance(query, query_norm, idx), idx }))
            .collect();
        let mut best: BinaryHeap<Candidate> = candidates.iter().map(|c| Candidate { dist: c.0.dist, idx: c.0.idx }).collect();

        while let Some(std::cmp::Reverse(closest)) = candidates.pop() {
            let worst_best = best.peek().map(|c| c.dist).unwrap_or(f32::MAX);
            if closest.dist > worst_best && best.len() >= ef {
                break;
            }
            if layer >= self.nodes[closest.idx].neighbors.len() {
                continue;
            }
            for &neighbor in &self.nodes[closest.idx].neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance(query, query_norm, neighbor);
                let worst = best.peek().map(|c| c.dist).unwrap_or(f32::MAX);
                if best.len() < ef || d < worst {
                    candidates.push(std::cmp::Reverse(Candidate { dist: d, idx: neighbor }));
                    best.push(Candidate { dist: d, idx: neighbor });
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = best.into_vec();
        out.sort();
        out
    }

    /// k-nearest by cosine similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let Some(mut current) = self.entry else {
            return Vec::new();
        };
        let query_norm = l2_norm(query);
        let top = self.nodes[current].neighbors.len() - 1;
        for layer in (1..=top).rev() {
            current = self.greedy_step(query, query_norm, current, layer);
        }
        let ef = self.params.ef_search.max(k);
        let found = self.search_layer(query, query_norm, &[current], ef, 0);
        found
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.idx].id.clone(), cosine(query, &self.nodes[c.idx].vector)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
