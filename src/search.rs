//! Hybrid search fusion: reciprocal-rank fusion over the lexical and vector
//! lanes, plus maximal-marginal-relevance diversification of the fused list.

use serde::Serialize;
use std::collections::HashMap;

/// Which lane produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Lexical,
    Vector,
}

/// A ranked candidate from one lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneHit {
    /// Identity used for fusion: a file path or `path#symbol`.
    pub id: String,
    pub score: f64,
    pub lane: Lane,
}

/// Fused result with per-lane provenance for the score breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct FusedHit {
    pub id: String,
    pub score: f64,
    #[serde(rename = "laneRanks")]
    pub lane_ranks: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Reciprocal rank fusion
// ---------------------------------------------------------------------------

/// Sum `1 / (k + rank)` over the top-`depth` of each lane's list. Ranks are
/// 1-based. Ties break on id for determinism.
pub fn rrf_fuse(lanes: &[Vec<LaneHit>], k: f64, depth: usize) -> Vec<FusedHit> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut ranks: HashMap<String, HashMap<String, usize>> = HashMap::new();

    for lane in lanes {
        for (i, hit) in lane.iter().take(depth).enumerate() {
            let rank = i + 1;
            *scores.entry(hit.id.clone()).or_insert(0.0) += 1.0 / (k + rank as f64);
            let lane_name = match hit.lane {
                Lane::Lexical => "lexical",
                Lane::Vector => "vector",
            };
            ranks
                .entry(hit.id.clone())
                .or_default()
                .entry(lane_name.to_string())
                .or_insert(rank);
        }
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, score)| FusedHit {
            lane_ranks: ranks.remove(&id).unwrap_or_default(),
            id,
            score,
        })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

// ---------------------------------------------------------------------------
// Maximal marginal relevance
// ---------------------------------------------------------------------------

/// Greedy MMR re-ranking: repeatedly take the candidate maximizing
/// `lambda * relevance - (1 - lambda) * max_similarity_to_selected`.
/// `similarity` compares two candidate ids in `[0, 1]`.
pub fn mmr_diversify<F>(hits: &[FusedHit], lambda: f64, limit: usize, similarity: F) -> Vec<FusedHit>
where
    F: Fn(&str, &str) -> f64,
{
    if hits.is_empty() || limit == 0 {
        return Vec::new();
    }
    let max_score = hits.iter().map(|h| h.score).fold(f64::MIN, f64::max).max(f64::EPSILON);

    let mut remaining: Vec<&FusedHit> = hits.iter().collect();
    let mut selected: Vec<FusedHit> = Vec::with_capacity(limit.min(hits.len()));

    while selected.len() < limit && !remaining.is_empty() {
        let mut best_idx = 0usize;
        let mut best_value = f64::MIN;
        for (i, candidate) in remaining.iter().enumerate() {
            let relevance = candidate.score / max_score;
            let redundancy = selected
                .iter()
                .map(|s| similarity(&candidate.id, &s.id))
                .fold(0.0f64, f64::max);
            let value = lambda * relevance - (1.0 - lambda) * redundancy;
            if value > best_value {
                best_value = value;
                best_idx = i;
            }
        }
        selected.push(remaining.remove(best_idx).clone());
    }
    selected
}

/// Default similarity for candidates without vectors: shared directory depth
/// over max depth, 1.0 for the same file.
pub fn path_similarity(a: &str, b: &str) -> f64 {
    let file_a = a.split('#').next().unwrap_or(a);
    let file_b = b.split('#').next().unwrap_or(b);
    if file_a == file_b {
        return 1.0;
    }
    let dirs_a: Vec<&str> = file_a.split('/').collect();
    let dirs_b: Vec<&str> = file_b.split('/').collect();
    let shared = dirs_a
        .iter()
        .zip(dirs_b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    let max_depth = dirs_a.len().max(dirs_b.len()).max(1);
    shared as f64 / max_depth as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(lane: Lane, ids: &[&str]) -> Vec<LaneHit> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| LaneHit { id: id.to_string(), score: 1.0 / (i + 1) as f64, lane })
            .collect()
    }

    #[test]
    fn test_rrf_rewards_agreement() {
        let lexical = lane(Lane::Lexical, &["a.rs", "b.rs", "c.rs"]);
        let vector = lane(Lane::Vector, &["b.rs", "d.rs"]);
        let fused = rrf_fuse(&[lexical, vector], 60.0, 50);
        assert_eq!(fused[0].id, "b.rs", "present in both lanes wins: {fused:?}");
        assert_eq!(fused[0].lane_ranks.get("lexical"), Some(&2));
        assert_eq!(fused[0].lane_ranks.get("vector"), Some(&1));
    }

    #[test]
    fn test_rrf_depth_cuts_tail() {
        let lexical = lane(Lane::Lexical, &["a.rs", "b.rs", "c.rs"]);
        let fused = rrf_fuse(&[lexical], 60.0, 2);
        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|h| h.id != "c.rs"));
    }

    #[test]
    fn test_rrf_deterministic_tiebreak() {
        let a = lane(Lane::Lexical, &["z.rs"]);
        let b = lane(Lane::Vector, &["a.rs"]);
        let fused = rrf_fuse(&[a, b], 60.0, 10);
        // equal scores → id order
        assert_eq!(fused[0].id, "a.rs");
        assert_eq!(fused[1].id, "z.rs");
    }

    #[test]
    fn test_mmr_penalizes_redundancy() {
        let hits = vec![
            FusedHit { id: "src/auth/login.rs".into(), score: 1.0, lane_ranks: HashMap::new() },
            FusedHit { id: "src/auth/token.rs".into(), score: 0.95, lane_ranks: HashMap::new() },
            FusedHit { id: "docs/auth.md".into(), score: 0.9, lane_ranks: HashMap::new() },
        ];
        let picked = mmr_diversify(&hits, 0.5, 2, path_similarity);
        assert_eq!(picked[0].id, "src/auth/login.rs");
        assert_eq!(picked[1].id, "docs/auth.md", "diversification skips the sibling");
    }

    #[test]
    fn test_mmr_lambda_one_keeps_relevance_order() {
        let hits = vec![
            FusedHit { id: "a/x.rs".into(), score: 1.0, lane_ranks: HashMap::new() },
            FusedHit { id: "a/y.rs".into(), score: 0.9, lane_ranks: HashMap::new() },
            FusedHit { id: "b/z.rs".into(), score: 0.8, lane_ranks: HashMap::new() },
        ];
        let picked = mmr_diversify(&hits, 1.0, 3, path_similarity);
        let ids: Vec<&str> = picked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a/x.rs", "a/y.rs", "b/z.rs"]);
    }

    #[test]
    fn test_path_similarity() {
        assert_eq!(path_similarity("a/b/c.rs", "a/b/c.rs"), 1.0);
        assert_eq!(path_similarity("a/b/c.rs#foo", "a/b/c.rs"), 1.0);
        assert!(path_similarity("a/b/c.rs", "a/b/d.rs") > path_similarity("a/b/c.rs", "x/y.rs"));
    }
}
