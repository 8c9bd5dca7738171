//! A layered proximity graph for approximate nearest-neighbor search (§4.I).
//!
//! Grounded in the design guidance of SPEC_FULL §9: the graph is a flat
//! arena of nodes addressed by stable `usize` indices, never raw pointers or
//! `Rc`/`Weak` cycles, so the whole structure is trivially `Send` and
//! serializable. Deletion tombstones a node instead of freeing it mid-run;
//! [`HnswIndex::rebuild`] is the only operation that actually reclaims
//! slots, by re-inserting every live vector into a fresh arena.

use rand::Rng;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Max neighbors per node at layers above 0.
    pub m: usize,
    /// Max neighbors per node at layer 0 (conventionally `2*m`).
    pub m_max0: usize,
    pub ef_construction: usize,
    /// Level-assignment multiplier, conventionally `1 / ln(m)`.
    pub level_multiplier: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        let m = 16;
        HnswConfig { m, m_max0: m * 2, ef_construction: 200, level_multiplier: 1.0 / (m as f64).ln() }
    }
}

#[derive(Debug, Clone)]
struct Node {
    doc_id: String,
    vector: Vec<f32>,
    level: usize,
    /// `neighbors[layer]` is the adjacency list for that layer.
    neighbors: Vec<Vec<usize>>,
    tombstoned: bool,
}

/// A candidate paired with its distance, ordered for use in a max-heap (`BinaryHeap`
/// is a max-heap, so popping gives the *farthest* candidate -- what the HNSW
/// search-layer routine needs to evict when the working set overflows `ef`).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    score: f32,
    idx: usize,
}

impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.total_cmp(&other.score)
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Debug, Default)]
pub struct HnswIndex {
    config: HnswConfig,
    arena: Vec<Node>,
    id_to_idx: HashMap<String, usize>,
    entry_point: Option<usize>,
    max_level: usize,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        HnswIndex { config, arena: Vec::new(), id_to_idx: HashMap::new(), entry_point: None, max_level: 0 }
    }

    pub fn len(&self) -> usize {
        self.id_to_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_idx.is_empty()
    }

    pub fn has_document(&self, doc_id: &str) -> bool {
        self.id_to_idx.contains_key(doc_id)
    }

    pub fn get_all_doc_ids(&self) -> Vec<String> {
        self.id_to_idx.keys().cloned().collect()
    }

    fn random_level(&self, seed: Option<u64>) -> usize {
        let uniform: f64 = match seed {
            Some(s) => {
                // Deterministic for a given seed: a cheap splitmix-style derivation so
                // tests can assert on exact levels without pulling in a PRNG crate seam.
                let mut x = s ^ 0x9E3779B97F4A7C15;
                x ^= x >> 30;
                x = x.wrapping_mul(0xBF58476D1CE4E5B9);
                x ^= x >> 27;
                ((x >> 11) as f64) / ((1u64 << 53) as f64)
            }
            None => rand::rng().random::<f64>(),
        };
        let uniform = uniform.max(1e-12);
        (-uniform.ln() * self.config.level_multiplier).floor() as usize
    }

    /// Greedy single-nearest-neighbor descent through one layer, used above
    /// layer 0 during both insert and search.
    fn greedy_search_layer(&self, query: &[f32], entry: usize, layer: usize) -> usize {
        let mut current = entry;
        let mut current_score = cosine_similarity(query, &self.arena[current].vector);
        loop {
            let mut improved = false;
            for &neighbor in &self.arena[current].neighbors[layer] {
                let score = cosine_similarity(query, &self.arena[neighbor].vector);
                if score > current_score {
                    current = neighbor;
                    current_score = score;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search within one layer, returning up to `ef` candidates
    /// ordered by descending similarity. `allowed` optionally restricts
    /// neighbor expansion to a pre-filter candidate set (§4.I pre-filter
    /// strategy); tombstoned nodes are always excluded from the returned
    /// results but still traversed for graph connectivity.
    fn search_layer(&self, query: &[f32], entry: usize, ef: usize, layer: usize, allowed: Option<&HashSet<usize>>) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(entry);
        let entry_score = cosine_similarity(query, &self.arena[entry].vector);
        let mut candidates: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        candidates.push(std::cmp::Reverse(Candidate { score: entry_score, idx: entry }));
        let mut result: BinaryHeap<Candidate> = BinaryHeap::new();
        if !self.arena[entry].tombstoned && allowed.map_or(true, |set| set.contains(&entry)) {
            result.push(Candidate { score: entry_score, idx: entry });
        }

        while let Some(std::cmp::Reverse(current)) = candidates.pop() {
            if let Some(worst) = result.peek() {
                if result.len() >= ef && current.score < worst.score {
                    break;
                }
            }
            for &neighbor in &self.arena[current.idx].neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let score = cosine_similarity(query, &self.arena[neighbor].vector);
                let eligible = !self.arena[neighbor].tombstoned && allowed.map_or(true, |set| set.contains(&neighbor));
                if eligible {
                    result.push(Candidate { score, idx: neighbor });
                    if result.len() > ef {
                        result.pop(); // drop the farthest
                    }
                }
                candidates.push(std::cmp::Reverse(Candidate { score, idx: neighbor }));
            }
        }

        let mut out: Vec<Candidate> = result.into_vec();
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out
    }

    /// Inserts a vector under `doc_id`. `level` overrides the randomized
    /// layer assignment; `seed` makes that randomization deterministic when
    /// `level` is not given. Re-inserting an existing `doc_id` tombstones
    /// the prior node and adds a fresh one (simplest correct behavior; an
    /// in-place update would need neighbor-list surgery the spec does not
    /// otherwise require).
    pub fn insert(&mut self, vector: Vec<f32>, doc_id: String, level: Option<usize>, seed: Option<u64>) {
        if let Some(&old) = self.id_to_idx.get(&doc_id) {
            self.arena[old].tombstoned = true;
        }
        let level = level.unwrap_or_else(|| self.random_level(seed));
        let idx = self.arena.len();
        self.arena.push(Node {
            doc_id: doc_id.clone(),
            vector: vector.clone(),
            level,
            neighbors: vec![Vec::new(); level + 1],
            tombstoned: false,
        });
        self.id_to_idx.insert(doc_id, idx);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_level = level;
            return;
        };

        for layer in (level + 1..=self.max_level).rev() {
            entry = self.greedy_search_layer(&vector, entry, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&vector, entry, self.config.ef_construction, layer, None);
            let m = if layer == 0 { self.config.m_max0 } else { self.config.m };
            let selected: Vec<usize> = candidates.iter().take(m).map(|c| c.idx).collect();
            self.arena[idx].neighbors[layer] = selected.clone();
            for &neighbor in &selected {
                let back = &mut self.arena[neighbor].neighbors[layer];
                back.push(idx);
                if back.len() > m {
                    // Prune to the `m` closest of the existing list instead of
                    // arbitrarily truncating, keeping the graph well-connected.
                    let nvec = self.arena[neighbor].vector.clone();
                    let mut scored: Vec<(f32, usize)> =
                        back.iter().map(|&n| (cosine_similarity(&nvec, &self.arena[n].vector), n)).collect();
                    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                    scored.truncate(m);
                    *back = scored.into_iter().map(|(_, n)| n).collect();
                }
            }
            if !candidates.is_empty() {
                entry = candidates[0].idx;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(idx);
        }
    }

    pub fn remove(&mut self, doc_id: &str) -> bool {
        match self.id_to_idx.remove(doc_id) {
            Some(idx) => {
                self.arena[idx].tombstoned = true;
                true
            }
            None => false,
        }
    }

    /// Approximate-nearest-neighbor search. `allowed` restricts expansion to
    /// a candidate-id set (pre-filter strategy, §4.I); pass `None` for
    /// unconstrained search.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize, allowed: Option<&HashSet<usize>>) -> Vec<(String, f32)> {
        let Some(mut entry) = self.entry_point else { return Vec::new() };
        for layer in (1..=self.max_level).rev() {
            entry = self.greedy_search_layer(query, entry, layer);
        }
        let ef = ef_search.max(k);
        let candidates = self.search_layer(query, entry, ef, 0, allowed);
        candidates.into_iter().take(k).map(|c| (self.arena[c.idx].doc_id.clone(), c.score)).collect()
    }

    /// Resolves a set of doc ids to their stable arena indices, for building
    /// an `allowed` set to pass to [`Self::search`].
    pub fn resolve_ids<'a>(&self, doc_ids: impl Iterator<Item = &'a str>) -> HashSet<usize> {
        doc_ids.filter_map(|id| self.id_to_idx.get(id).copied()).collect()
    }

    /// Rebuilds the graph from scratch over only the live (non-tombstoned)
    /// vectors, reclaiming arena slots held by deleted nodes (§9 "periodic
    /// rebuild reclaims slots").
    pub fn rebuild(&mut self) {
        let live: Vec<(String, Vec<f32>, usize)> = self
            .arena
            .iter()
            .filter(|n| !n.tombstoned)
            .map(|n| (n.doc_id.clone(), n.vector.clone(), n.level))
            .collect();
        let mut fresh = HnswIndex::new(self.config.clone());
        for (doc_id, vector, level) in live {
            fresh.insert(vector, doc_id, Some(level), None);
        }
        *self = fresh;
    }
}
