//! Hybrid search: vector + BM25 fused with Reciprocal Rank Fusion.
//!
//! Both branches run over the in-memory indexes; fusion weights adapt to the
//! query length (short queries lean on keywords, long ones on semantics).
//! MMR diversification and cross-encoder reranking are pluggable
//! post-processors with no-op defaults.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::model::NodeId;
use crate::storage::{DEFAULT_FULLTEXT_INDEX, DEFAULT_VECTOR_INDEX, RecordStore};
use crate::Result;

/// A hybrid search request. At least one of `text` / `vector` must be set;
/// without a vector the engine runs BM25 only.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub text: String,
    pub vector: Option<Vec<f32>>,
    pub label: Option<String>,
    pub k: usize,
    pub min_similarity: f32,
}

/// One fused result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: NodeId,
    pub score: f64,
    pub vector_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
}

/// Post-fusion diversifier (e.g. maximal marginal relevance).
pub trait Diversifier: Send + Sync {
    fn diversify(&self, hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit>;
}

/// Pass-through default.
pub struct NoDiversifier;

impl Diversifier for NoDiversifier {
    fn diversify(&self, mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
        hits.truncate(k);
        hits
    }
}

/// Post-fusion reranker (e.g. a cross-encoder).
pub trait Reranker: Send + Sync {
    fn rerank(&self, hits: Vec<SearchHit>) -> Vec<SearchHit>;
}

/// Pass-through default.
pub struct NoReranker;

impl Reranker for NoReranker {
    fn rerank(&self, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        hits
    }
}

/// Composes the vector and full-text branches.
pub struct SearchService {
    config: SearchConfig,
    diversifier: Arc<dyn Diversifier>,
    reranker: Arc<dyn Reranker>,
}

impl SearchService {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            diversifier: Arc::new(NoDiversifier),
            reranker: Arc::new(NoReranker),
        }
    }

    pub fn with_diversifier(mut self, diversifier: Arc<dyn Diversifier>) -> Self {
        self.diversifier = diversifier;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn search(&self, store: &RecordStore, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let k = if request.k == 0 { 10 } else { request.k };
        // Each branch over-fetches so fusion has candidates to work with.
        let branch_k = (k * 4).max(20);

        let bm25: Vec<NodeId> = if request.text.is_empty() {
            Vec::new()
        } else {
            store
                .fulltext_query(
                    DEFAULT_FULLTEXT_INDEX,
                    &request.text,
                    branch_k,
                    request.label.as_deref(),
                )?
                .into_iter()
                .map(|(id, _)| id)
                .collect()
        };

        let vector: Vec<NodeId> = match &request.vector {
            Some(query) => store
                .vector_query(DEFAULT_VECTOR_INDEX, query, branch_k, request.min_similarity)?
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            None => Vec::new(),
        };

        // Fallback chain: a single live branch is returned as-is (rank-only
        // scoring), so missing embeddings degrade to keyword search and an
        // empty keyword result degrades to semantic search.
        let (w_vector, w_bm25) = self.weights(&request.text);
        let fused = fuse_rrf(
            &vector,
            &bm25,
            self.config.rrf_k,
            w_vector,
            w_bm25,
            self.config.rrf_min_score,
        );

        let diversified = self.diversifier.diversify(fused, k);
        Ok(self.reranker.rerank(diversified))
    }

    /// Adaptive branch weights by whitespace token count.
    fn weights(&self, text: &str) -> (f64, f64) {
        if !self.config.rrf_adaptive {
            return (1.0, 1.0);
        }
        match text.split_whitespace().count() {
            0..=2 => (0.5, 1.5),
            3..=5 => (1.0, 1.0),
            _ => (1.5, 0.5),
        }
    }
}

/// Reciprocal Rank Fusion over two ranked lists. Pure function of the input
/// ranks: identical inputs always produce identical output order.
pub fn fuse_rrf(
    vector: &[NodeId],
    bm25: &[NodeId],
    k_rrf: f64,
    w_vector: f64,
    w_bm25: f64,
    min_score: f64,
) -> Vec<SearchHit> {
    let mut hits: HashMap<u64, SearchHit> = HashMap::new();

    for (rank, id) in vector.iter().enumerate() {
        let hit = hits.entry(id.0).or_insert(SearchHit {
            id: *id,
            score: 0.0,
            vector_rank: None,
            bm25_rank: None,
        });
        hit.vector_rank = Some(rank + 1);
        hit.score += w_vector / (k_rrf + (rank + 1) as f64);
    }
    for (rank, id) in bm25.iter().enumerate() {
        let hit = hits.entry(id.0).or_insert(SearchHit {
            id: *id,
            score: 0.0,
            vector_rank: None,
            bm25_rank: None,
        });
        hit.bm25_rank = Some(rank + 1);
        hit.score += w_bm25 / (k_rrf + (rank + 1) as f64);
    }

    let mut fused: Vec<SearchHit> = hits
        .into_values()
        .filter(|h| h.score >= min_score)
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

/// Maximal marginal relevance over node embeddings: greedily picks the next
/// hit balancing fused score against similarity to already-picked hits.
pub struct MmrDiversifier {
    pub lambda: f64,
    pub embeddings: HashMap<u64, Vec<f32>>,
}

impl Diversifier for MmrDiversifier {
    fn diversify(&self, hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
        let mut remaining = hits;
        let mut picked: Vec<SearchHit> = Vec::new();

        while picked.len() < k && !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_score = f64::NEG_INFINITY;
            for (i, hit) in remaining.iter().enumerate() {
                let redundancy = picked
                    .iter()
                    .filter_map(|p| {
                        let a = self.embeddings.get(&hit.id.0)?;
                        let b = self.embeddings.get(&p.id.0)?;
                        Some(f64::from(cosine(a, b)))
                    })
                    .fold(0.0f64, f64::max);
                let mmr = self.lambda * hit.score - (1.0 - self.lambda) * redundancy;
                if mmr > best_score {
                    best_score = mmr;
                    best_idx = i;
                }
            }
            picked.push(remaining.remove(best_idx));
        }
        picked
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().map(|&i| NodeId(i)).collect()
    }

    #[test]
    fn test_rrf_both_branches_beat_one() {
        // Node 1 ranks in both branches; node 2 only in bm25.
        let fused = fuse_rrf(&ids(&[1]), &ids(&[2, 1]), 60.0, 1.0, 1.0, 0.0);
        assert_eq!(fused[0].id, NodeId(1));
        assert_eq!(fused[0].vector_rank, Some(1));
        assert_eq!(fused[0].bm25_rank, Some(2));
    }

    #[test]
    fn test_rrf_deterministic() {
        let a = fuse_rrf(&ids(&[3, 1, 2]), &ids(&[2, 3]), 60.0, 1.0, 1.0, 0.0);
        let b = fuse_rrf(&ids(&[3, 1, 2]), &ids(&[2, 3]), 60.0, 1.0, 1.0, 0.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rrf_threshold_drops_weak_hits() {
        let fused = fuse_rrf(&ids(&[1]), &[], 60.0, 1.0, 1.0, 0.1);
        // 1 / (60 + 1) ≈ 0.016 < 0.1
        assert!(fused.is_empty());
    }

    #[test]
    fn test_adaptive_weights() {
        let service = SearchService::new(SearchConfig::default());
        assert_eq!(service.weights("auth"), (0.5, 1.5));
        assert_eq!(service.weights("how to configure tls"), (1.0, 1.0));
        assert_eq!(
            service.weights("why does the login page reject valid passwords"),
            (1.5, 0.5)
        );
    }

    #[test]
    fn test_mmr_prefers_diverse_results() {
        let mut embeddings = HashMap::new();
        embeddings.insert(1, vec![1.0, 0.0]);
        embeddings.insert(2, vec![0.99, 0.1]); // near-duplicate of 1
        embeddings.insert(3, vec![0.0, 1.0]); // orthogonal

        let hits = vec![
            SearchHit { id: NodeId(1), score: 1.0, vector_rank: Some(1), bm25_rank: None },
            SearchHit { id: NodeId(2), score: 0.9, vector_rank: Some(2), bm25_rank: None },
            SearchHit { id: NodeId(3), score: 0.5, vector_rank: Some(3), bm25_rank: None },
        ];
        let mmr = MmrDiversifier { lambda: 0.5, embeddings };
        let picked = mmr.diversify(hits, 2);
        assert_eq!(picked[0].id, NodeId(1));
        // The near-duplicate is penalized; the orthogonal hit wins slot two.
        assert_eq!(picked[1].id, NodeId(3));
    }
}
