//! Hybrid search parameters and their cross-parameter validation matrix (§4.5.1, §4.5.2).

use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::index::definition::IndexDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMethod {
    Disjunction,
    Lexical,
    Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMethod {
    Rrf,
    Lexical,
    Tensor,
}

#[derive(Debug, Clone, Default)]
pub struct HybridParameters {
    pub retrieval_method: Option<RetrievalMethod>,
    pub ranking_method: Option<RankingMethod>,
    pub alpha: Option<f64>,
    pub rrf_k: Option<i64>,
    pub searchable_attributes_lexical: Option<Vec<String>>,
    pub searchable_attributes_tensor: Option<Vec<String>>,
    pub score_modifiers_lexical: Option<HashMap<String, f64>>,
    pub score_modifiers_tensor: Option<HashMap<String, f64>>,
    pub verbose: bool,
    /// Root-level, only valid with Disjunction+RRF (§4.5.1).
    pub score_modifiers: Option<HashMap<String, f64>>,
    pub rerank_depth: Option<u64>,
}

impl HybridParameters {
    pub fn retrieval_method(&self) -> RetrievalMethod {
        self.retrieval_method.unwrap_or(RetrievalMethod::Disjunction)
    }

    pub fn ranking_method(&self) -> RankingMethod {
        self.ranking_method.unwrap_or(RankingMethod::Rrf)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha.unwrap_or(0.5)
    }

    pub fn rrf_k(&self) -> i64 {
        self.rrf_k.unwrap_or(60)
    }

    /// Validates the whole compatibility matrix (§4.5.2). Returns the
    /// resolved `(retrieval, ranking)` pair on success.
    pub fn validate(&self, index: &IndexDefinition) -> Result<(RetrievalMethod, RankingMethod)> {
        let retrieval = self.retrieval_method();
        let ranking = self.ranking_method();

        let allowed = matches!(
            (retrieval, ranking),
            (RetrievalMethod::Disjunction, RankingMethod::Rrf)
                | (RetrievalMethod::Lexical, RankingMethod::Lexical)
                | (RetrievalMethod::Lexical, RankingMethod::Tensor)
                | (RetrievalMethod::Tensor, RankingMethod::Tensor)
                | (RetrievalMethod::Tensor, RankingMethod::Lexical)
        );
        if !allowed {
            return Err(CoreError::InvalidArgument(format!(
                "retrievalMethod {:?} is not compatible with rankingMethod {:?}",
                retrieval, ranking
            )));
        }

        if let Some(alpha) = self.alpha {
            if ranking != RankingMethod::Rrf {
                return Err(CoreError::InvalidArgument("alpha is only valid when rankingMethod is RRF".to_string()));
            }
            if !(0.0..=1.0).contains(&alpha) {
                return Err(CoreError::InvalidArgument("alpha must be in [0, 1]".to_string()));
            }
        }
        if self.rrf_k.is_some() && ranking != RankingMethod::Rrf {
            return Err(CoreError::InvalidArgument("rrfK is only valid when rankingMethod is RRF".to_string()));
        }
        if let Some(k) = self.rrf_k {
            if k < 0 {
                return Err(CoreError::InvalidArgument("rrfK must be non-negative".to_string()));
            }
        }

        if self.searchable_attributes_lexical.is_some() {
            if matches!(index, IndexDefinition::Unstructured { .. }) {
                return Err(CoreError::UnsupportedFeature("searchableAttributesLexical is not supported on legacy Unstructured indexes".to_string()));
            }
            if !uses_lexical(retrieval, ranking) {
                return Err(CoreError::InvalidArgument("searchableAttributesLexical requires a lexical retrieval/ranking method".to_string()));
            }
        }
        if self.searchable_attributes_tensor.is_some() {
            if matches!(index, IndexDefinition::Unstructured { .. }) {
                return Err(CoreError::UnsupportedFeature("searchableAttributesTensor is not supported on legacy Unstructured indexes".to_string()));
            }
            if !uses_tensor(retrieval, ranking) {
                return Err(CoreError::InvalidArgument("searchableAttributesTensor requires a tensor retrieval/ranking method".to_string()));
            }
        }
        if self.score_modifiers_lexical.is_some() && !ranking_uses(ranking, RankingMethod::Lexical) {
            return Err(CoreError::InvalidArgument("scoreModifiersLexical is only valid when rankingMethod uses Lexical".to_string()));
        }
        if self.score_modifiers_tensor.is_some() && !ranking_uses(ranking, RankingMethod::Tensor) {
            return Err(CoreError::InvalidArgument("scoreModifiersTensor is only valid when rankingMethod uses Tensor".to_string()));
        }

        if (self.score_modifiers.is_some() || self.rerank_depth.is_some())
            && !(retrieval == RetrievalMethod::Disjunction && ranking == RankingMethod::Rrf)
        {
            return Err(CoreError::InvalidArgument(
                "scoreModifiers and rerankDepth are only valid with retrievalMethod=Disjunction and rankingMethod=RRF".to_string(),
            ));
        }

        Ok((retrieval, ranking))
    }
}

fn ranking_uses(ranking: RankingMethod, method: RankingMethod) -> bool {
    ranking == method || ranking == RankingMethod::Rrf
}

fn uses_lexical(retrieval: RetrievalMethod, ranking: RankingMethod) -> bool {
    retrieval == RetrievalMethod::Disjunction || retrieval == RetrievalMethod::Lexical || ranking == RankingMethod::Lexical
}

fn uses_tensor(retrieval: RetrievalMethod, ranking: RankingMethod) -> bool {
    retrieval == RetrievalMethod::Disjunction || retrieval == RetrievalMethod::Tensor || ranking == RankingMethod::Tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;

    fn structured_index() -> IndexDefinition {
        IndexDefinition::Structured {
            common: IndexCommon {
                name: "idx".into(),
                schema_name: "idx".into(),
                index_type: IndexType::Structured,
                model: ModelConfig { name: "m".into(), properties: None, text_query_prefix: None, text_chunk_prefix: None },
                normalize_embeddings: true,
                text_preprocessing: Default::default(),
                image_preprocessing: Default::default(),
                video_preprocessing: Default::default(),
                audio_preprocessing: Default::default(),
                distance_metric: DistanceMetric::Angular,
                vector_numeric_type: VectorNumericType::Float32,
                hnsw_config: HnswConfig { ef_construction: 128, m: 16 },
                embedding_dim: 768,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: StructuredExtra { fields: vec![], tensor_fields: vec![] },
        }
    }

    #[test]
    fn disjunction_with_non_rrf_ranking_is_rejected() {
        let p = HybridParameters { retrieval_method: Some(RetrievalMethod::Disjunction), ranking_method: Some(RankingMethod::Lexical), ..Default::default() };
        assert!(p.validate(&structured_index()).is_err());
    }

    #[test]
    fn lexical_tensor_cross_ranking_is_allowed() {
        let p = HybridParameters { retrieval_method: Some(RetrievalMethod::Lexical), ranking_method: Some(RankingMethod::Tensor), ..Default::default() };
        assert!(p.validate(&structured_index()).is_ok());
    }

    #[test]
    fn rerank_depth_requires_disjunction_rrf() {
        let p = HybridParameters {
            retrieval_method: Some(RetrievalMethod::Lexical),
            ranking_method: Some(RankingMethod::Lexical),
            rerank_depth: Some(5),
            ..Default::default()
        };
        assert!(p.validate(&structured_index()).is_err());
    }

    #[test]
    fn alpha_out_of_range_is_rejected() {
        let p = HybridParameters { alpha: Some(1.5), ..Default::default() };
        assert!(p.validate(&structured_index()).is_err());
    }

    #[test]
    fn defaults_are_disjunction_rrf_alpha_half() {
        let p = HybridParameters::default();
        assert_eq!(p.retrieval_method(), RetrievalMethod::Disjunction);
        assert_eq!(p.ranking_method(), RankingMethod::Rrf);
        assert_eq!(p.alpha(), 0.5);
    }
}
