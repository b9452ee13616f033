//! Cosine-similarity vector index.
//!
//! Vectors are normalized at insert, so cosine similarity reduces to a dot
//! product. Two backends share the same entry store: a brute-force linear
//! scan (exact, default) and a hierarchical small-world graph (approximate,
//! chosen at index creation).
//!
//! The dimension is auto-detected from the first vector inserted and fixed
//! from then on; changing it means dropping and re-creating the index.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::model::NodeId;
use crate::storage::schema::{VectorBackend, VectorIndexDef};
use crate::{Error, Result};

// ============================================================================
// Accelerator seam
// ============================================================================

/// Batch similarity backend. The default is plain CPU; an offloaded
/// implementation must match it to within 1e-6 — on any failure the index
/// falls back to the CPU path and bumps a counter.
pub trait SimilarityAccelerator: Send + Sync {
    fn batch_cosine(&self, vectors: &[&[f32]], query: &[f32]) -> Result<Vec<f32>>;
}

/// Reference implementation: dot products over pre-normalized vectors.
#[derive(Debug, Default)]
pub struct CpuAccelerator;

impl SimilarityAccelerator for CpuAccelerator {
    fn batch_cosine(&self, vectors: &[&[f32]], query: &[f32]) -> Result<Vec<f32>> {
        Ok(vectors.iter().map(|v| dot(v, query)).collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = dot(&v, &v).sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

// ============================================================================
// Index
// ============================================================================

struct Entry {
    id: NodeId,
    vector: Vec<f32>,
    deleted: bool,
}

/// One named index over (label, property).
pub struct VectorIndex {
    def: VectorIndexDef,
    dimension: Option<usize>,
    entries: Vec<Entry>,
    by_node: HashMap<u64, usize>,
    hnsw: Option<HnswGraph>,
}

impl VectorIndex {
    pub fn new(def: VectorIndexDef) -> Self {
        let hnsw = match def.backend {
            VectorBackend::Brute => None,
            VectorBackend::Hnsw => Some(HnswGraph::new(def.m, def.ef_construction)),
        };
        Self {
            def,
            dimension: None,
            entries: Vec::new(),
            by_node: HashMap::new(),
            hnsw,
        }
    }

    pub fn def(&self) -> &VectorIndexDef {
        &self.def
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Insert or replace a node's vector. The first insert fixes the
    /// dimension; later inserts must match it.
    pub fn insert(&mut self, id: NodeId, vector: Vec<f32>) -> Result<()> {
        match self.dimension {
            None => self.dimension = Some(vector.len()),
            Some(dim) if dim != vector.len() => {
                return Err(Error::ExecutionError(format!(
                    "vector index '{}' has dimension {dim}, got {}",
                    self.def.name,
                    vector.len()
                )));
            }
            Some(_) => {}
        }

        self.remove(id);
        let slot = self.entries.len();
        self.entries.push(Entry { id, vector: normalize(vector), deleted: false });
        self.by_node.insert(id.0, slot);
        if let Some(hnsw) = &mut self.hnsw {
            hnsw.insert(slot, &self.entries);
        }
        Ok(())
    }

    /// Tombstone a node's entry. The HNSW graph keeps the vertex but queries
    /// skip it.
    pub fn remove(&mut self, id: NodeId) {
        if let Some(slot) = self.by_node.remove(&id.0) {
            self.entries[slot].deleted = true;
        }
    }

    /// Top-k by cosine similarity, descending, filtered by `min_similarity`.
    pub fn query(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        accelerator: &dyn SimilarityAccelerator,
        fallback_counter: &AtomicU64,
    ) -> Result<Vec<(NodeId, f32)>> {
        if k == 0 || self.by_node.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dim) = self.dimension {
            if query.len() != dim {
                return Err(Error::ExecutionError(format!(
                    "query vector has dimension {}, index '{}' expects {dim}",
                    query.len(),
                    self.def.name
                )));
            }
        }
        let query = normalize(query.to_vec());

        let mut scored = match &self.hnsw {
            Some(hnsw) => hnsw.search(&query, k, self.def.ef_search, &self.entries),
            None => self.brute_force(&query, accelerator, fallback_counter),
        };

        scored.retain(|(_, score)| *score >= min_similarity);
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn brute_force(
        &self,
        query: &[f32],
        accelerator: &dyn SimilarityAccelerator,
        fallback_counter: &AtomicU64,
    ) -> Vec<(NodeId, f32)> {
        let live: Vec<&Entry> = self.entries.iter().filter(|e| !e.deleted).collect();
        let vectors: Vec<&[f32]> = live.iter().map(|e| e.vector.as_slice()).collect();
        let scores = match accelerator.batch_cosine(&vectors, query) {
            Ok(scores) if scores.len() == vectors.len() => scores,
            other => {
                if let Err(e) = other {
                    warn!(index = %self.def.name, error = %e, "accelerator failed, using CPU path");
                }
                fallback_counter.fetch_add(1, Ordering::Relaxed);
                CpuAccelerator
                    .batch_cosine(&vectors, query)
                    .expect("CPU accelerator is infallible")
            }
        };
        live.iter()
            .zip(scores)
            .map(|(entry, score)| (entry.id, score))
            .collect()
    }
}

// ============================================================================
// HNSW graph
// ============================================================================

/// Hierarchical navigable small-world graph over the entry slots.
///
/// Writers take the index's exclusive lock (one layer up); readers search a
/// consistent view. Deletions tombstone the entry and leave the vertex in
/// place.
struct HnswGraph {
    m: usize,
    ef_construction: usize,
    /// Per entry slot: neighbor lists, one per level (index 0 = base layer).
    vertices: HashMap<usize, Vec<Vec<usize>>>,
    entry_point: Option<usize>,
    rng: SmallRng,
}

impl HnswGraph {
    fn new(m: usize, ef_construction: usize) -> Self {
        Self {
            m: m.max(2),
            ef_construction: ef_construction.max(8),
            vertices: HashMap::new(),
            // Deterministic seed: level draws affect recall, not correctness.
            rng: SmallRng::seed_from_u64(0x6d6e656d),
            entry_point: None,
        }
    }

    fn similarity(&self, a: usize, b: &[f32], entries: &[Entry]) -> f32 {
        dot(&entries[a].vector, b)
    }

    /// Geometric level draw, p = 1/e per level.
    fn draw_level(&mut self) -> usize {
        let mut level = 0;
        while self.rng.gen_range(0.0..1.0f64) < (1.0 / std::f64::consts::E) && level < 16 {
            level += 1;
        }
        level
    }

    fn insert(&mut self, slot: usize, entries: &[Entry]) {
        let level = self.draw_level();
        let mut neighbors: Vec<Vec<usize>> = vec![Vec::new(); level + 1];

        let Some(mut ep) = self.entry_point else {
            self.vertices.insert(slot, neighbors);
            self.entry_point = Some(slot);
            return;
        };

        let query = entries[slot].vector.clone();
        let top_level = self.vertices[&ep].len() - 1;

        // Greedy descent through the levels above the new vertex's level.
        for l in ((level + 1)..=top_level).rev() {
            ep = self.greedy_step(ep, &query, l, entries);
        }

        // Connect on each level from min(level, top_level) down to 0.
        for l in (0..=level.min(top_level)).rev() {
            let candidates = self.search_layer(ep, &query, self.ef_construction, l, entries);
            let selected: Vec<usize> = candidates.iter().take(self.m).map(|&(s, _)| s).collect();
            for &other in &selected {
                if let Some(lists) = self.vertices.get_mut(&other) {
                    if l < lists.len() {
                        lists[l].push(slot);
                        if lists[l].len() > self.m * 2 {
                            Self::shrink(&mut lists[l], other, self.m * 2, entries);
                        }
                    }
                }
            }
            neighbors[l] = selected;
            if let Some(&(best, _)) = candidates.first() {
                ep = best;
            }
        }

        let new_top = level;
        self.vertices.insert(slot, neighbors);
        if new_top > top_level {
            self.entry_point = Some(slot);
        }
    }

    /// Keep the closest `cap` neighbors of `vertex`.
    fn shrink(list: &mut Vec<usize>, vertex: usize, cap: usize, entries: &[Entry]) {
        let anchor = entries[vertex].vector.clone();
        list.sort_by(|&a, &b| {
            let da = dot(&entries[a].vector, &anchor);
            let db = dot(&entries[b].vector, &anchor);
            db.partial_cmp(&da).unwrap_or(CmpOrdering::Equal)
        });
        list.truncate(cap);
    }

    fn greedy_step(&self, mut current: usize, query: &[f32], level: usize, entries: &[Entry]) -> usize {
        let mut best = self.similarity(current, query, entries);
        loop {
            let mut improved = false;
            if let Some(lists) = self.vertices.get(&current) {
                if let Some(neighbors) = lists.get(level) {
                    for &n in neighbors {
                        let sim = self.similarity(n, query, entries);
                        if sim > best {
                            best = sim;
                            current = n;
                            improved = true;
                        }
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one level; results sorted by similarity descending.
    fn search_layer(
        &self,
        ep: usize,
        query: &[f32],
        ef: usize,
        level: usize,
        entries: &[Entry],
    ) -> Vec<(usize, f32)> {
        let mut visited: HashSet<usize> = HashSet::from([ep]);
        let ep_sim = self.similarity(ep, query, entries);
        // Max-heap of candidates to expand, min tracking over the result set.
        let mut candidates: BinaryHeap<ScoredSlot> = BinaryHeap::from([ScoredSlot(ep_sim, ep)]);
        let mut results: Vec<(usize, f32)> = vec![(ep, ep_sim)];

        while let Some(ScoredSlot(sim, slot)) = candidates.pop() {
            let worst = results
                .iter()
                .map(|&(_, s)| s)
                .fold(f32::INFINITY, f32::min);
            if results.len() >= ef && sim < worst {
                break;
            }
            if let Some(lists) = self.vertices.get(&slot) {
                if let Some(neighbors) = lists.get(level) {
                    for &n in neighbors {
                        if !visited.insert(n) {
                            continue;
                        }
                        let n_sim = self.similarity(n, query, entries);
                        if results.len() < ef || n_sim > worst {
                            candidates.push(ScoredSlot(n_sim, n));
                            results.push((n, n_sim));
                            if results.len() > ef {
                                results.sort_by(|a, b| {
                                    b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal)
                                });
                                results.truncate(ef);
                            }
                        }
                    }
                }
            }
        }
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(CmpOrdering::Equal));
        results
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        entries: &[Entry],
    ) -> Vec<(NodeId, f32)> {
        let Some(mut ep) = self.entry_point else {
            return Vec::new();
        };
        let top_level = self.vertices[&ep].len() - 1;
        for l in (1..=top_level).rev() {
            ep = self.greedy_step(ep, query, l, entries);
        }
        let ef = ef_search.max(k);
        self.search_layer(ep, query, ef, 0, entries)
            .into_iter()
            .filter(|&(slot, _)| !entries[slot].deleted)
            .take(k)
            .map(|(slot, sim)| (entries[slot].id, sim))
            .collect()
    }
}

/// (similarity, slot) ordered by similarity for the candidate heap.
struct ScoredSlot(f32, usize);

impl PartialEq for ScoredSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ScoredSlot {}
impl PartialOrd for ScoredSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredSlot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.partial_cmp(&other.0).unwrap_or(CmpOrdering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(backend: VectorBackend) -> VectorIndexDef {
        VectorIndexDef {
            name: "embeddings".into(),
            label: "Doc".into(),
            property: "embedding".into(),
            backend,
            m: 8,
            ef_construction: 32,
            ef_search: 32,
        }
    }

    fn counter() -> AtomicU64 {
        AtomicU64::new(0)
    }

    #[test]
    fn test_brute_force_cosine_scores() {
        let mut index = VectorIndex::new(def(VectorBackend::Brute));
        index.insert(NodeId(1), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(NodeId(2), vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(NodeId(3), vec![0.7, 0.7, 0.0]).unwrap();

        let c = counter();
        let hits = index
            .query(&[1.0, 0.0, 0.0], 2, -1.0, &CpuAccelerator, &c)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, NodeId(1));
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, NodeId(3));
        assert!((hits[1].1 - 0.7071).abs() < 1e-3);
    }

    #[test]
    fn test_dimension_fixed_after_first_insert() {
        let mut index = VectorIndex::new(def(VectorBackend::Brute));
        index.insert(NodeId(1), vec![1.0, 0.0]).unwrap();
        let err = index.insert(NodeId(2), vec![1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::ExecutionError(_)));
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_min_similarity_filter() {
        let mut index = VectorIndex::new(def(VectorBackend::Brute));
        index.insert(NodeId(1), vec![1.0, 0.0]).unwrap();
        index.insert(NodeId(2), vec![-1.0, 0.0]).unwrap();

        let c = counter();
        let hits = index.query(&[1.0, 0.0], 10, 0.0, &CpuAccelerator, &c).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, NodeId(1));
    }

    #[test]
    fn test_remove_and_reinsert() {
        let mut index = VectorIndex::new(def(VectorBackend::Brute));
        index.insert(NodeId(1), vec![1.0, 0.0]).unwrap();
        index.remove(NodeId(1));
        let c = counter();
        assert!(index.query(&[1.0, 0.0], 5, -1.0, &CpuAccelerator, &c).unwrap().is_empty());

        index.insert(NodeId(1), vec![0.0, 1.0]).unwrap();
        let hits = index.query(&[0.0, 1.0], 5, -1.0, &CpuAccelerator, &c).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_failing_accelerator_falls_back() {
        struct Broken;
        impl SimilarityAccelerator for Broken {
            fn batch_cosine(&self, _: &[&[f32]], _: &[f32]) -> Result<Vec<f32>> {
                Err(Error::ExecutionError("device lost".into()))
            }
        }

        let mut index = VectorIndex::new(def(VectorBackend::Brute));
        index.insert(NodeId(1), vec![1.0, 0.0]).unwrap();
        let c = counter();
        let hits = index.query(&[1.0, 0.0], 1, -1.0, &Broken, &c).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(c.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hnsw_matches_brute_force_on_top_hit() {
        let mut brute = VectorIndex::new(def(VectorBackend::Brute));
        let mut hnsw = VectorIndex::new(def(VectorBackend::Hnsw));

        // A ring of unit vectors in 2D.
        for i in 0..64u64 {
            let angle = (i as f32) * std::f32::consts::TAU / 64.0;
            let v = vec![angle.cos(), angle.sin()];
            brute.insert(NodeId(i), v.clone()).unwrap();
            hnsw.insert(NodeId(i), v).unwrap();
        }

        let c = counter();
        let query = vec![1.0, 0.05];
        let exact = brute.query(&query, 1, -1.0, &CpuAccelerator, &c).unwrap();
        let approx = hnsw.query(&query, 1, -1.0, &CpuAccelerator, &c).unwrap();
        assert_eq!(exact[0].0, approx[0].0);
    }
}
