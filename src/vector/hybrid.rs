//! Hybrid "predicate AND vector" search strategies and RRF fusion (§4.I).

use crate::vector::hnsw::HnswIndex;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridStrategy {
    PreFilter,
    PostFilter,
    Auto,
}

#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub strategy: HybridStrategy,
    /// Pre-scanned candidate set from a metadata filter, keyed by doc id.
    pub candidate_ids: Option<Vec<String>>,
    pub over_fetch_multiplier: f32,
    pub ef_search: usize,
    pub min_score: Option<f32>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        HybridOptions { strategy: HybridStrategy::Auto, candidate_ids: None, over_fetch_multiplier: 3.0, ef_search: 200, min_score: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyUsed {
    PreFilter,
    PostFilter,
}

#[derive(Debug, Clone)]
pub struct HybridResult {
    pub results: Vec<(String, f32)>,
    pub strategy_used: StrategyUsed,
    pub entries_scanned: usize,
    pub pre_filter_set_size: Option<usize>,
    pub post_filter_fetched_count: Option<usize>,
}

/// Chooses pre-filter when a candidate set exists and is small relative to
/// the index (≤30%); otherwise post-filter (§4.I "auto").
fn resolve_strategy(strategy: HybridStrategy, candidate_ids: &Option<Vec<String>>, index_len: usize) -> StrategyUsed {
    match strategy {
        HybridStrategy::PreFilter => StrategyUsed::PreFilter,
        HybridStrategy::PostFilter => StrategyUsed::PostFilter,
        HybridStrategy::Auto => match candidate_ids {
            Some(ids) if index_len > 0 && (ids.len() as f64 / index_len as f64) <= 0.30 => StrategyUsed::PreFilter,
            _ => StrategyUsed::PostFilter,
        },
    }
}

/// Runs ANN search combined with a metadata predicate per §4.I. `residual`
/// is applied client-side after over-fetching in the post-filter path; in
/// the pre-filter path the candidate set already encodes the predicate, so
/// `residual` is not consulted (it would be redundant work).
pub fn hybrid_search(index: &HnswIndex, query: &[f32], k: usize, opts: &HybridOptions, residual: impl Fn(&str) -> bool) -> HybridResult {
    let strategy = resolve_strategy(opts.strategy, &opts.candidate_ids, index.len());
    match strategy {
        StrategyUsed::PreFilter => {
            let ids = opts.candidate_ids.as_deref().unwrap_or(&[]);
            let allowed: HashSet<usize> = index.resolve_ids(ids.iter().map(|s| s.as_str()));
            let set_size = allowed.len();
            let mut results = index.search(query, k, opts.ef_search, Some(&allowed));
            if let Some(min) = opts.min_score {
                results.retain(|(_, score)| *score >= min);
            }
            HybridResult {
                entries_scanned: results.len(),
                results,
                strategy_used: StrategyUsed::PreFilter,
                pre_filter_set_size: Some(set_size),
                post_filter_fetched_count: None,
            }
        }
        StrategyUsed::PostFilter => {
            let over_fetch = ((k as f32) * opts.over_fetch_multiplier.max(1.0)).ceil() as usize;
            let fetched = index.search(query, over_fetch, opts.ef_search.max(over_fetch), None);
            let fetched_count = fetched.len();
            let mut results: Vec<(String, f32)> = fetched.into_iter().filter(|(id, _)| residual(id)).collect();
            if let Some(min) = opts.min_score {
                results.retain(|(_, score)| *score >= min);
            }
            results.truncate(k);
            HybridResult {
                entries_scanned: fetched_count,
                results,
                strategy_used: StrategyUsed::PostFilter,
                pre_filter_set_size: None,
                post_filter_fetched_count: Some(fetched_count),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusedResult {
    pub doc_id: String,
    pub rrf_score: f64,
    pub fts_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

/// Reciprocal Rank Fusion: `RRF(d) = sum(1 / (k + rank_i(d)))` over each
/// ranking `d` appears in (§4.I). Ranks are 1-based. `k_const` is the RRF
/// smoothing constant (spec default `k≈60`).
pub fn rrf_fuse(fts_ranking: &[(String, f32)], vector_ranking: &[(String, f32)], k_const: f64) -> Vec<FusedResult> {
    use std::collections::HashMap;
    let fts_rank: HashMap<&str, usize> = fts_ranking.iter().enumerate().map(|(i, (id, _))| (id.as_str(), i + 1)).collect();
    let semantic_rank: HashMap<&str, usize> = vector_ranking.iter().enumerate().map(|(i, (id, _))| (id.as_str(), i + 1)).collect();

    let mut doc_ids: Vec<&str> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for id in fts_ranking.iter().map(|(id, _)| id.as_str()).chain(vector_ranking.iter().map(|(id, _)| id.as_str())) {
        if seen.insert(id) {
            doc_ids.push(id);
        }
    }

    let mut fused: Vec<FusedResult> = doc_ids
        .into_iter()
        .map(|id| {
            let ftr = fts_rank.get(id).copied();
            let sem = semantic_rank.get(id).copied();
            let mut score = 0.0;
            if let Some(r) = ftr {
                score += 1.0 / (k_const + r as f64);
            }
            if let Some(r) = sem {
                score += 1.0 / (k_const + r as f64);
            }
            FusedResult { doc_id: id.to_string(), rrf_score: score, fts_rank: ftr, semantic_rank: sem }
        })
        .collect();
    fused.sort_by(|a, b| b.rrf_score.total_cmp(&a.rrf_score));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::hnsw::HnswConfig;

    fn index_with(points: &[(&str, f32, f32)]) -> HnswIndex {
        let mut index = HnswIndex::new(HnswConfig::default());
        for (i, (id, x, y)) in points.iter().enumerate() {
            index.insert(vec![*x, *y], id.to_string(), None, Some(i as u64 + 1));
        }
        index
    }

    #[test]
    fn auto_picks_pre_filter_for_small_candidate_set() {
        let index = index_with(&[("a", 1.0, 0.0), ("b", 0.9, 0.1), ("c", -1.0, 0.0), ("d", 0.0, 1.0)]);
        let opts = HybridOptions { candidate_ids: Some(vec!["a".into()]), ..Default::default() };
        let result = hybrid_search(&index, &[1.0, 0.0], 2, &opts, |_| true);
        assert_eq!(result.strategy_used, StrategyUsed::PreFilter);
        assert_eq!(result.pre_filter_set_size, Some(1));
    }

    #[test]
    fn auto_picks_post_filter_without_candidate_set() {
        let index = index_with(&[("a", 1.0, 0.0), ("b", 0.9, 0.1)]);
        let opts = HybridOptions::default();
        let result = hybrid_search(&index, &[1.0, 0.0], 1, &opts, |_| true);
        assert_eq!(result.strategy_used, StrategyUsed::PostFilter);
        assert!(result.post_filter_fetched_count.unwrap() >= 1);
    }

    #[test]
    fn post_filter_applies_residual_predicate_after_overfetch() {
        let index = index_with(&[("a", 1.0, 0.0), ("b", 0.95, 0.05), ("c", 0.9, 0.1)]);
        let opts = HybridOptions { strategy: HybridStrategy::PostFilter, ..Default::default() };
        let result = hybrid_search(&index, &[1.0, 0.0], 2, &opts, |id| id != "a");
        assert!(result.results.iter().all(|(id, _)| id != "a"));
    }

    #[test]
    fn rrf_fuse_combines_rankings_with_reciprocal_rank() {
        let fts = vec![("a".to_string(), 1.0), ("b".to_string(), 0.5)];
        let vector = vec![("b".to_string(), 0.9), ("a".to_string(), 0.8)];
        let fused = rrf_fuse(&fts, &vector, 60.0);
        assert_eq!(fused.len(), 2);
        // both docs appear in both rankings at ranks {1,2}, so scores are equal;
        // "a" is fts-rank-1 + semantic-rank-2, "b" is fts-rank-2 + semantic-rank-1 --
        // symmetric, so the fused score should tie.
        assert!((fused[0].rrf_score - fused[1].rrf_score).abs() < 1e-9);
    }

    #[test]
    fn rrf_fuse_ranks_doc_present_in_both_lists_above_single_list_doc() {
        let fts = vec![("a".to_string(), 1.0), ("b".to_string(), 0.9)];
        let vector = vec![("a".to_string(), 0.9)];
        let fused = rrf_fuse(&fts, &vector, 60.0);
        assert_eq!(fused[0].doc_id, "a");
    }
}
