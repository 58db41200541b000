//! Query vector sourcing and store-side expression assembly (§4.5.5, §4.5.6).

use std::collections::HashMap;

use serde_json::Value;

use crate::embedder::{EmbedInput, Vectoriser};
use crate::error::{CoreError, Result};
use crate::filter::Filter;
use crate::index::definition::IndexDefinition;

use super::fusion;
use super::params::{HybridParameters, RankingMethod, RetrievalMethod};

/// Where the base query vector for a Tensor/Hybrid query comes from (§3.3, §4.5.5).
#[derive(Debug, Clone)]
pub enum QuerySource {
    Text(String),
    Media(String),
    CustomVector { content: Option<String>, vector: Vec<f32> },
}

#[derive(Debug, Clone)]
pub struct ContextTensor {
    pub vector: Vec<f32>,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub enum MarqoQuery {
    Lexical {
        text: String,
        filter: Option<Filter>,
        searchable_attributes: Option<Vec<String>>,
        score_modifiers: Option<HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    },
    Tensor {
        source: QuerySource,
        context: Vec<ContextTensor>,
        filter: Option<Filter>,
        searchable_attributes: Option<Vec<String>>,
        score_modifiers: Option<HashMap<String, f64>>,
        limit: usize,
        offset: usize,
    },
    Hybrid {
        text: String,
        source: QuerySource,
        context: Vec<ContextTensor>,
        filter: Option<Filter>,
        params: HybridParameters,
        limit: usize,
        offset: usize,
    },
}

/// §4.5.5: embed (or take verbatim) the base vector, then weight-average it
/// against any `context.tensor` entries, the base itself always carrying
/// weight 1.
pub async fn resolve_query_vector(vectoriser: &dyn Vectoriser, source: &QuerySource, context: &[ContextTensor]) -> Result<Vec<f32>> {
    let base = match source {
        QuerySource::CustomVector { vector, .. } => vector.clone(),
        QuerySource::Text(text) => vectoriser.embed_batch(&[EmbedInput::Text(text.clone())]).await?.into_iter().next().unwrap(),
        QuerySource::Media(_) => {
            return Err(CoreError::UnsupportedFeature("media query vectors require pre-downloaded bytes, not a bare URL".to_string()));
        }
    };

    if context.is_empty() {
        return Ok(base);
    }

    let dim = base.len();
    let mut sum = vec![0.0f64; dim];
    let mut total_weight = 1.0;
    for (i, v) in base.iter().enumerate() {
        sum[i] += *v as f64;
    }
    for c in context {
        if c.vector.len() != dim {
            return Err(CoreError::InvalidArgument("context tensor dimension does not match the query vector".to_string()));
        }
        total_weight += c.weight;
        for (i, v) in c.vector.iter().enumerate() {
            sum[i] += *v as f64 * c.weight;
        }
    }
    if total_weight == 0.0 {
        return Err(CoreError::InvalidArgument("context tensor weights cancel the query to zero total weight".to_string()));
    }
    Ok(sum.into_iter().map(|v| (v / total_weight) as f32).collect())
}

pub fn lexical_text(query: &MarqoQuery) -> Result<&str> {
    match query {
        MarqoQuery::Lexical { text, .. } => Ok(text),
        MarqoQuery::Hybrid { text, .. } => Ok(text),
        MarqoQuery::Tensor { .. } => Err(CoreError::InvalidArgument("Tensor queries have no lexical text".to_string())),
    }
}

/// §4.5.6: assembles the single RPC body the store expects for a resolved
/// hybrid plan. `query_vector` must already be computed (§4.5.5); `lexical_yql`
/// and `tensor_yql` are the two retrieval predicates (filter + searchable
/// attributes already folded in by the caller).
#[allow(clippy::too_many_arguments)]
pub fn build_hybrid_query_body(
    index: &IndexDefinition,
    retrieval: RetrievalMethod,
    ranking: RankingMethod,
    params: &HybridParameters,
    query_vector: &[f32],
    lexical_yql: &str,
    tensor_yql: &str,
    limit: usize,
    offset: usize,
) -> Value {
    let mut query_features = serde_json::Map::new();
    query_features.insert("marqo__query_embedding".to_string(), serde_json::json!(query_vector));

    if let IndexDefinition::Structured { .. } | IndexDefinition::SemiStructured { .. } = index {
        if let Some(attrs) = &params.searchable_attributes_lexical {
            query_features.insert("marqo__fields_to_rank_lexical".to_string(), fields_to_rank(attrs));
        }
        if let Some(attrs) = &params.searchable_attributes_tensor {
            query_features.insert("marqo__fields_to_rank_tensor".to_string(), fields_to_rank(attrs));
        }
    }

    if let Some(modifiers) = &params.score_modifiers_lexical {
        insert_modifier_weights(&mut query_features, "lexical", modifiers);
    }
    if let Some(modifiers) = &params.score_modifiers_tensor {
        insert_modifier_weights(&mut query_features, "tensor", modifiers);
    }
    if let Some(modifiers) = &params.score_modifiers {
        insert_modifier_weights(&mut query_features, "global", modifiers);
    }

    serde_json::json!({
        "yql": "select * from sources * where true",
        "marqo__yql.lexical": lexical_yql,
        "marqo__yql.tensor": tensor_yql,
        "query_features": Value::Object(query_features),
        "marqo__hybrid.retrievalMethod": format!("{:?}", retrieval),
        "marqo__hybrid.rankingMethod": format!("{:?}", ranking),
        "marqo__hybrid.alpha": params.alpha(),
        "marqo__hybrid.rrf_k": params.rrf_k(),
        "marqo__hybrid.rerankDepthGlobal": params.rerank_depth,
        "ranking.profile": "hybrid_custom_searcher",
        "hits": limit,
        "offset": offset,
    })
}

fn fields_to_rank(attrs: &[String]) -> Value {
    let map: serde_json::Map<String, Value> = attrs.iter().map(|a| (a.clone(), serde_json::json!(1))).collect();
    Value::Object(map)
}

fn insert_modifier_weights(query_features: &mut serde_json::Map<String, Value>, bucket: &str, modifiers: &HashMap<String, f64>) {
    let mult: serde_json::Map<String, Value> = modifiers.iter().filter(|(_, w)| **w >= 0.0).map(|(k, w)| (k.clone(), serde_json::json!(w))).collect();
    let add: serde_json::Map<String, Value> = modifiers.iter().filter(|(_, w)| **w < 0.0).map(|(k, w)| (k.clone(), serde_json::json!(w))).collect();
    query_features.insert(format!("marqo__mult_weights_{}", bucket), Value::Object(mult));
    query_features.insert(format!("marqo__add_weights_{}", bucket), Value::Object(add));
}

pub use fusion::ScoredDoc;

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    #[async_trait::async_trait]
    impl Vectoriser for Stub {
        fn supported_modalities(&self) -> &[crate::embedder::Modality] {
            &[crate::embedder::Modality::Text]
        }
        fn dimension(&self) -> u32 {
            2
        }
        async fn embed_batch(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn context_tensor_is_weight_averaged_with_base_weight_one() {
        let v = Stub;
        let context = vec![ContextTensor { vector: vec![0.0, 1.0], weight: 1.0 }];
        let out = resolve_query_vector(&v, &QuerySource::Text("x".into()), &context).await.unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn custom_vector_source_bypasses_the_model() {
        let v = Stub;
        let out = resolve_query_vector(&v, &QuerySource::CustomVector { content: None, vector: vec![0.3, 0.4] }, &[]).await.unwrap();
        assert_eq!(out, vec![0.3, 0.4]);
    }
}
