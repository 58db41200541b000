//! RRF fusion and rerank-depth windowing (§4.5.3).
//!
//! Reciprocal-rank arithmetic grounded in the example pack's
//! `mosuka-iris/src/engine.rs` `fuse_results` RRF branch; reused here as a
//! pure scoring function the coordinator composes with its own fused-score
//! ordering and rerank window, which `fuse_results` does not itself do.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub id: String,
    pub score: f64,
}

/// `score(doc) = 1 / (k + rank(doc))`, rank 1-based. Documents absent from
/// `ranked` get an implicit score of 0 when looked up.
pub fn reciprocal_rank_scores(ranked: &[String], k: i64) -> HashMap<String, f64> {
    ranked
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), 1.0 / (k as f64 + (i + 1) as f64)))
        .collect()
}

/// `fused(doc) = alpha * rrf_tensor(doc) + (1 - alpha) * rrf_lexical(doc)`,
/// ordered by fused score descending, ties broken by id for determinism.
pub fn fuse(lexical_ranked: &[String], tensor_ranked: &[String], alpha: f64, k: i64) -> Vec<ScoredDoc> {
    let lexical_scores = reciprocal_rank_scores(lexical_ranked, k);
    let tensor_scores = reciprocal_rank_scores(tensor_ranked, k);

    let mut ids: Vec<String> = lexical_ranked.iter().chain(tensor_ranked.iter()).cloned().collect();
    ids.sort();
    ids.dedup();

    let mut fused: Vec<ScoredDoc> = ids
        .into_iter()
        .map(|id| {
            let lex = *lexical_scores.get(&id).unwrap_or(&0.0);
            let tensor = *tensor_scores.get(&id).unwrap_or(&0.0);
            let score = alpha * tensor + (1.0 - alpha) * lex;
            ScoredDoc { id, score }
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.id.cmp(&b.id)));
    fused
}

/// Applies the rerank-depth window (§4.5.3): rescore the top `min(R, N)` by
/// `modifier`, leave the remainder in fused order, then take `limit`.
pub fn apply_rerank_window<F>(fused: Vec<ScoredDoc>, rerank_depth: Option<u64>, limit: usize, modifier: F) -> Vec<ScoredDoc>
where
    F: Fn(&str) -> f64,
{
    let n = fused.len();
    let r = rerank_depth.map(|r| r as usize).unwrap_or(n).min(n);

    if r == 0 {
        return fused.into_iter().take(limit).collect();
    }

    let (window, rest) = fused.split_at(r);
    let mut rescored: Vec<ScoredDoc> = window.iter().map(|d| ScoredDoc { id: d.id.clone(), score: d.score + modifier(&d.id) }).collect();
    rescored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.id.cmp(&b.id)));

    rescored.into_iter().chain(rest.iter().cloned()).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reciprocal_rank_follows_formula() {
        let scores = reciprocal_rank_scores(&["a".to_string(), "b".to_string()], 60);
        assert!((scores["a"] - 1.0 / 61.0).abs() < 1e-9);
        assert!((scores["b"] - 1.0 / 62.0).abs() < 1e-9);
    }

    #[test]
    fn alpha_zero_equals_pure_lexical_order() {
        let lexical = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let tensor = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let fused = fuse(&lexical, &tensor, 0.0, 60);
        let order: Vec<&str> = fused.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn alpha_one_equals_pure_tensor_order() {
        let lexical = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let tensor = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let fused = fuse(&lexical, &tensor, 1.0, 60);
        let order: Vec<&str> = fused.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn rerank_depth_zero_leaves_fused_order_untouched() {
        let fused = vec![ScoredDoc { id: "a".into(), score: 0.9 }, ScoredDoc { id: "b".into(), score: 0.5 }];
        let result = apply_rerank_window(fused, Some(0), 2, |_| 100.0);
        assert_eq!(result.iter().map(|d| d.id.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn rerank_window_rescored_and_rest_appended() {
        let fused = vec![
            ScoredDoc { id: "tensor_only".into(), score: 0.6 },
            ScoredDoc { id: "lexical_only".into(), score: 0.5 },
            ScoredDoc { id: "both".into(), score: 0.9 },
        ];
        // rerank the top 2 by a modifier that favors lexical_only
        let result = apply_rerank_window(fused, Some(2), 3, |id| if id == "lexical_only" { 1.0 } else { 0.0 });
        assert_eq!(result[0].id, "lexical_only");
        assert_eq!(result[2].id, "both");
    }
}
